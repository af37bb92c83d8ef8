use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate server name: {0}")]
    DuplicateServer(String),
    #[error("failover {role} server {name} is not configured")]
    UnknownFailoverServer { role: &'static str, name: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorConfig {
    pub servers: Vec<ServerConfig>,
    pub response_time_limit: f64,
    #[serde(default)]
    pub resource_limits: HashMap<String, f64>,
    #[serde(default)]
    pub chats: Vec<String>,
    #[serde(default = "default_alert_url")]
    pub alert_url: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_check_deadline")]
    pub check_deadline_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub failover: FailoverConfig,
}

fn default_alert_url() -> String { "http://127.0.0.1:5001/alert".into() }
fn default_check_interval() -> u64 { 60 }
fn default_max_concurrency() -> usize { 64 }
fn default_check_deadline() -> u64 { 30 }
fn default_connect_timeout() -> u64 { 10 }
fn default_ping_timeout() -> u64 { 4000 }
fn default_snapshot_path() -> String { "./aggregate_results.json".into() }
fn default_log_dir() -> String { "logs".into() }
fn default_api_port() -> u16 { 5000 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

fn default_ssh_port() -> u16 { 22 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CheckConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: CheckKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CheckKind {
    #[serde(alias = "ping")]
    Reachability,
    #[serde(alias = "telnet")]
    Port { port: u16 },
    #[serde(alias = "service")]
    RemoteService { service: String },
    Cpu,
    Ram,
    #[serde(alias = "disk_space")]
    Disk {
        #[serde(default = "default_mount")]
        mount: String,
    },
    #[serde(other)]
    Unknown,
}

fn default_mount() -> String { "/".into() }

impl CheckKind {
    /// Resource checks measure local load, never availability.
    pub fn is_resource(&self) -> bool {
        matches!(self, CheckKind::Cpu | CheckKind::Ram | CheckKind::Disk { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckKind::Reachability => "reachability",
            CheckKind::Port { .. } => "port",
            CheckKind::RemoteService { .. } => "remote-service",
            CheckKind::Cpu => "cpu",
            CheckKind::Ram => "ram",
            CheckKind::Disk { .. } => "disk",
            CheckKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FailoverConfig {
    #[serde(default = "default_primary")]
    pub primary: String,
    #[serde(default = "default_secondary")]
    pub secondary: String,
    #[serde(default = "default_failover_services")]
    pub services: Vec<String>,
}

fn default_primary() -> String { "TG1".into() }
fn default_secondary() -> String { "TG2".into() }
fn default_failover_services() -> Vec<String> {
    vec!["adp-client-bot.service".into(), "adp-shop-bot.service".into()]
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            secondary: default_secondary(),
            services: default_failover_services(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateServer(server.name.clone()));
            }
        }
        // Without the primary in the fleet, migration never triggers.
        if seen.contains(self.failover.primary.as_str()) && !seen.contains(self.failover.secondary.as_str()) {
            return Err(ConfigError::UnknownFailoverServer {
                role: "secondary",
                name: self.failover.secondary.clone(),
            });
        }
        if !self.deadline_covers_connect() {
            warn!(
                "check_deadline_secs ({}) is under twice connect_timeout_secs ({}); timed-out connects will lose their elapsed time",
                self.check_deadline_secs, self.connect_timeout_secs
            );
        }
        Ok(())
    }

    /// The check deadline must outlast a timed-out connect plus its follow-up measurement.
    pub fn deadline_covers_connect(&self) -> bool {
        self.check_deadline_secs >= self.connect_timeout_secs.saturating_mul(2)
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn total_checks(&self) -> usize {
        self.servers.iter().map(|s| s.checks.len()).sum()
    }
}
