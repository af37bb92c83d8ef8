use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::models::{round3, CheckOutcome, Snapshot};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Collects one round of outcomes and persists them as a single document.
pub struct Aggregator {
    snapshot: Mutex<Snapshot>,
    snapshot_path: PathBuf,
    log_dir: PathBuf,
    sinks: Mutex<HashMap<String, File>>,
}

impl Aggregator {
    pub fn new(snapshot_path: impl AsRef<Path>, log_dir: impl AsRef<Path>) -> Self {
        Self {
            snapshot: Mutex::new(Snapshot::default()),
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
            log_dir: log_dir.as_ref().to_path_buf(),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Drops the previous round's outcomes; `last-check-time` survives until the next flush.
    pub async fn begin_round(&self) {
        self.snapshot.lock().await.servers.clear();
    }

    pub async fn record(&self, server: &str, outcome: CheckOutcome, resource: bool) {
        let line = log_line(server, &outcome, resource);
        if let Err(e) = self.append_log(server, &line).await {
            error!("Failed to write check log for {}: {}", server, e);
        }

        self.snapshot
            .lock()
            .await
            .servers
            .entry(server.to_string())
            .or_default()
            .push(outcome);
    }

    async fn append_log(&self, server: &str, line: &str) -> std::io::Result<()> {
        let mut sinks = self.sinks.lock().await;
        if !sinks.contains_key(server) {
            fs::create_dir_all(&self.log_dir).await?;
            let path = self.log_dir.join(format!("{server}_checks.log"));
            let file = OpenOptions::new().create(true).append(true).open(path).await?;
            sinks.insert(server.to_string(), file);
        }
        if let Some(file) = sinks.get_mut(server) {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn current(&self) -> Snapshot {
        self.snapshot.lock().await.clone()
    }

    /// Stamps `last-check-time` and replaces the snapshot file via tmp + rename.
    pub async fn flush(&self) -> Result<Snapshot, PersistenceError> {
        let snapshot = {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.last_check_time = Some(Local::now().format(TIMESTAMP_FORMAT).to_string());
            snapshot.clone()
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let staging = temp_path(&self.snapshot_path);
        fs::write(&staging, json).await?;
        fs::rename(&staging, &self.snapshot_path).await?;

        info!("Snapshot with {} outcomes saved to {:?}", snapshot.outcome_count(), self.snapshot_path);
        Ok(snapshot)
    }
}

pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Snapshot, PersistenceError> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

/// `<snapshot>.tmp` next to the target, never the target itself.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn log_line(server: &str, outcome: &CheckOutcome, resource: bool) -> String {
    let metric = match (outcome.response_time, resource) {
        (Some(v), true) => format!(" | Usage: {}%", round3(v)),
        (Some(v), false) => format!(" | Response Time: {} seconds", round3(v)),
        (None, _) => String::from(" |"),
    };
    format!(
        "{} - {} --- {} --- {}{}\n",
        Local::now().format(TIMESTAMP_FORMAT),
        server,
        outcome.check_name,
        outcome.result,
        metric
    )
}
