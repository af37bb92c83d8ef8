use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::alert::{AlertTransport, Notifier};
use crate::checks::{Check, CheckContext};
use crate::config::{CheckConfig, MonitorConfig, ServerConfig};
use crate::escalation::Strategy;
use crate::handlers::Handlers;
use crate::models::{CheckOutcome, Severity, Status};
use crate::remote::RemoteShell;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundSummary {
    pub executed: usize,
    pub skipped: usize,
    pub aborted: usize,
}

pub struct Monitor {
    pub config: Arc<MonitorConfig>,
    pub aggregator: Arc<Aggregator>,
    context: CheckContext,
    handlers: Handlers,
    concurrency_limiter: Arc<Semaphore>,
}

impl Monitor {
    pub fn new(config: Arc<MonitorConfig>, shell: Arc<dyn RemoteShell>, transport: Arc<dyn AlertTransport>) -> Self {
        let notifier = Notifier::new(transport, config.chats.clone());
        Self {
            aggregator: Arc::new(Aggregator::new(&config.snapshot_path, &config.log_dir)),
            context: CheckContext::new(&config, shell.clone()),
            handlers: Handlers::new(config.clone(), notifier, shell),
            concurrency_limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            "Monitoring {} servers / {} checks, max concurrency {}",
            self.config.servers.len(),
            self.config.total_checks(),
            self.config.max_concurrency
        );

        loop {
            let start_time = Instant::now();
            let summary = self.run_round().await;

            if let Err(e) = self.aggregator.flush().await {
                error!("PERSISTENCE FAILURE, round results lost ({:?}): {}", self.aggregator.snapshot_path(), e);
            }

            info!(
                "Round completed {} checks ({} skipped, {} aborted) in {:.2}s.",
                summary.executed,
                summary.skipped,
                summary.aborted,
                start_time.elapsed().as_secs_f64()
            );

            tokio::time::sleep(Duration::from_secs(self.config.check_interval_secs)).await;
        }
    }

    /// Runs every configured check once and waits for all of them.
    pub async fn run_round(self: &Arc<Self>) -> RoundSummary {
        self.aggregator.begin_round().await;
        let mut tasks = FuturesUnordered::new();

        for (server_idx, server) in self.config.servers.iter().enumerate() {
            for check_idx in 0..server.checks.len() {
                let monitor_ref = Arc::clone(self);
                tasks.push(tokio::spawn(async move {
                    let _permit = monitor_ref.concurrency_limiter.acquire().await.ok();
                    let server = &monitor_ref.config.servers[server_idx];
                    monitor_ref.execute_check(server, &server.checks[check_idx]).await
                }));
            }
        }

        let mut summary = RoundSummary::default();
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(true) => summary.executed += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    summary.aborted += 1;
                    error!("Check task aborted: {}", e);
                }
            }
        }
        summary
    }

    /// Returns false when the check type is not recognised.
    pub async fn execute_check(&self, server: &ServerConfig, check: &CheckConfig) -> bool {
        let Some(runnable) = Check::from_config(server, check) else {
            debug!("{}: skipping {} with unknown check type", server.name, check.name);
            return false;
        };

        let deadline = Duration::from_secs(self.config.check_deadline_secs);
        let measured = tokio::time::timeout(deadline, async {
            let passed = runnable.check(&self.context).await;
            let value = runnable.response_time(&self.context).await;
            (passed, value)
        })
        .await;

        match measured {
            Ok((passed, value)) => {
                self.settle(server, check, passed, value).await;
            }
            Err(_) => {
                error!("{}: {} exceeded the {:?} check deadline", server.name, check.name, deadline);
                self.aggregator
                    .record(&server.name, overrun_outcome(check), check.kind.is_resource())
                    .await;
                if !check.kind.is_resource() {
                    self.handlers
                        .escalate(&server.name, &check.name, &check.kind, Severity::Failure, -1.0)
                        .await;
                }
            }
        }
        true
    }

    /// Records a measured check and escalates it when classification demands.
    pub async fn settle(&self, server: &ServerConfig, check: &CheckConfig, passed: bool, value: f64) -> Option<Strategy> {
        let resource = check.kind.is_resource();
        let status = Status::from(passed || resource);
        self.aggregator
            .record(&server.name, CheckOutcome::new(&check.name, status, Some(value)), resource)
            .await;

        let severity = classify(&self.config, check, passed, value)?;
        Some(self.handlers.escalate(&server.name, &check.name, &check.kind, severity, value).await)
    }
}

/// A check cut off by the deadline has no metric; resource checks still report Success.
fn overrun_outcome(check: &CheckConfig) -> CheckOutcome {
    let status = if check.kind.is_resource() { Status::Success } else { Status::Failure };
    CheckOutcome::new(&check.name, status, None)
}

/// Resource checks only warn; network checks fail when down and warn when slow.
pub fn classify(config: &MonitorConfig, check: &CheckConfig, passed: bool, value: f64) -> Option<Severity> {
    if check.kind.is_resource() {
        let limit = config.resource_limits.get(&check.name)?;
        (value >= *limit).then_some(Severity::Warning)
    } else if !passed {
        Some(Severity::Failure)
    } else if value >= config.response_time_limit {
        Some(Severity::Warning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::tests::RecordingTransport;
    use crate::config::CheckKind;
    use crate::remote::tests::FakeShell;
    use tempfile::TempDir;

    const FLEET: &str = r#"
        response_time_limit = 1.0
        chats = ["42"]
        check_deadline_secs = 1
        connect_timeout_secs = 5

        [resource_limits]
        CPU = 80.0
        RAM = 1000.0

        [[servers]]
        name = "TG1"
        host = "10.0.0.1"
        user = "root"
        password = "pw"

        [[servers.checks]]
        name = "PING"
        type = "reachability"

        [[servers.checks]]
        name = "bot"
        type = "remote-service"
        service = "adp-client-bot.service"

        [[servers]]
        name = "TG2"
        host = "10.0.0.2"
        user = "root"
        password = "pw"

        [[servers]]
        name = "WEB1"
        host = "10.0.0.3"
        user = "root"
        password = "pw"

        [[servers.checks]]
        name = "CPU"
        type = "cpu"

        [[servers.checks]]
        name = "RAM"
        type = "ram"

        [[servers.checks]]
        name = "TELNET"
        type = "port"
        port = 23

        [[servers]]
        name = "DB1"
        host = "10.0.0.4"
        user = "root"
        password = "pw"

        [[servers.checks]]
        name = "SSH"
        type = "port"
        port = 22

        [[servers.checks]]
        name = "GPU"
        type = "gpu"

        [[servers.checks]]
        name = "api"
        type = "remote-service"
        service = "api.service"
    "#;

    struct Fixture {
        monitor: Arc<Monitor>,
        transport: Arc<RecordingTransport>,
        shell: FakeShell,
        _dir: TempDir,
    }

    fn fixture(raw: &str) -> Fixture {
        fixture_with(raw, FakeShell::default())
    }

    fn fixture_with(raw: &str, shell: FakeShell) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = MonitorConfig::from_toml(raw).unwrap();
        config.snapshot_path = dir.path().join("aggregate_results.json").display().to_string();
        config.log_dir = dir.path().join("logs").display().to_string();

        let transport = Arc::new(RecordingTransport::default());
        let monitor = Arc::new(Monitor::new(Arc::new(config), Arc::new(shell.clone()), transport.clone()));
        Fixture { monitor, transport, shell, _dir: dir }
    }

    fn check<'a>(monitor: &'a Monitor, server: &str, name: &str) -> (&'a ServerConfig, &'a CheckConfig) {
        let server = monitor.config.server(server).unwrap();
        let check = server.checks.iter().find(|c| c.name == name).unwrap();
        (server, check)
    }

    #[test]
    fn classification_policy() {
        let config = MonitorConfig::from_toml(FLEET).unwrap();
        let ping = CheckConfig { name: "PING".into(), kind: CheckKind::Reachability };
        let cpu = CheckConfig { name: "CPU".into(), kind: CheckKind::Cpu };
        let disk = CheckConfig { name: "DISK".into(), kind: CheckKind::Disk { mount: "/".into() } };

        assert_eq!(classify(&config, &ping, false, 0.2), Some(Severity::Failure));
        assert_eq!(classify(&config, &ping, false, 5.0), Some(Severity::Failure));
        assert_eq!(classify(&config, &ping, true, 1.0), Some(Severity::Warning));
        assert_eq!(classify(&config, &ping, true, 0.9), None);

        assert_eq!(classify(&config, &cpu, true, 80.0), Some(Severity::Warning));
        assert_eq!(classify(&config, &cpu, true, 79.9), None);
        // no configured threshold, never warns
        assert_eq!(classify(&config, &disk, true, 99.0), None);
    }

    #[tokio::test]
    async fn primary_failure_triggers_migration() {
        let f = fixture(FLEET);
        let (server, ping) = check(&f.monitor, "TG1", "PING");

        let strategy = f.monitor.settle(server, ping, false, -1.0).await;
        assert_eq!(strategy, Some(Strategy::MigrateServices));

        let snapshot = f.monitor.aggregator.current().await;
        assert_eq!(snapshot.servers["TG1"][0].result, Status::Failure);

        let text = &f.transport.messages()[0].message;
        assert!(text.contains("NOT RESPONDING"));
        assert!(text.contains("Services stopped on TG1"));
        assert!(text.contains("Services started on TG2"));
        assert!(f.shell.commands().iter().any(|(host, cmd)| host == "10.0.0.1" && cmd.starts_with("systemctl stop")));
    }

    #[tokio::test]
    async fn resource_breach_warns_but_succeeds() {
        let f = fixture(FLEET);
        let (server, cpu) = check(&f.monitor, "WEB1", "CPU");

        let strategy = f.monitor.settle(server, cpu, true, 92.0).await;
        assert_eq!(strategy, Some(Strategy::NotifyWarning));

        let snapshot = f.monitor.aggregator.current().await;
        assert_eq!(snapshot.servers["WEB1"][0], CheckOutcome::new("CPU", Status::Success, Some(92.0)));
        assert!(f.transport.messages()[0].message.contains("WEB1: CPU = 92"));
    }

    #[tokio::test]
    async fn simultaneous_failures_escalate_independently() {
        let f = fixture(FLEET);
        let (web, telnet) = check(&f.monitor, "WEB1", "TELNET");
        let (db, ssh) = check(&f.monitor, "DB1", "SSH");

        let (a, b) = tokio::join!(
            f.monitor.settle(web, telnet, false, 10.0),
            f.monitor.settle(db, ssh, false, 10.0)
        );
        assert_eq!(a, Some(Strategy::NotifyFailure));
        assert_eq!(b, Some(Strategy::NotifyFailure));

        let snapshot = f.monitor.aggregator.current().await;
        assert_eq!(snapshot.servers["WEB1"][0].result, Status::Failure);
        assert_eq!(snapshot.servers["DB1"][0].result, Status::Failure);

        let texts: Vec<String> = f.transport.messages().into_iter().map(|m| m.message).collect();
        assert_eq!(texts.len(), 2);
        assert!(texts.iter().any(|t| t.contains("WEB1: TELNET NOT RESPONDING")));
        assert!(texts.iter().any(|t| t.contains("DB1: SSH NOT RESPONDING")));
    }

    #[tokio::test]
    async fn round_records_one_outcome_per_recognised_check() {
        let raw = r#"
            response_time_limit = 1.0

            [resource_limits]
            CPU = 100000.0
            RAM = 100000.0

            [[servers]]
            name = "LOCAL1"
            host = "127.0.0.1"
            user = "u"
            password = "p"

            [[servers.checks]]
            name = "CPU"
            type = "cpu"

            [[servers.checks]]
            name = "RAM"
            type = "ram"

            [[servers.checks]]
            name = "GPU"
            type = "gpu"

            [[servers]]
            name = "LOCAL2"
            host = "127.0.0.1"
            user = "u"
            password = "p"

            [[servers.checks]]
            name = "DISK SPACE"
            type = "disk"
            mount = "/"
        "#;
        let f = fixture(raw);

        let summary = f.monitor.run_round().await;
        assert_eq!(summary, RoundSummary { executed: 3, skipped: 1, aborted: 0 });

        let snapshot = f.monitor.aggregator.current().await;
        assert_eq!(snapshot.outcome_count(), 3);
        assert!(snapshot.servers.values().flatten().all(|o| o.result == Status::Success));
        assert!(f.transport.messages().is_empty());

        // the next round replaces rather than accumulates
        f.monitor.run_round().await;
        assert_eq!(f.monitor.aggregator.current().await.outcome_count(), 3);

        f.monitor.aggregator.flush().await.unwrap();
        let persisted = crate::aggregator::load_snapshot(&f.monitor.config.snapshot_path).await.unwrap();
        assert_eq!(persisted.outcome_count(), 3);
        assert!(persisted.last_check_time.is_some());
    }

    #[tokio::test]
    async fn refused_port_is_failure_with_elapsed_time() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let raw = format!(
            r#"
            response_time_limit = 1.0

            [[servers]]
            name = "WEB1"
            host = "127.0.0.1"
            user = "u"
            password = "p"

            [[servers.checks]]
            name = "APP"
            type = "port"
            port = {port}
            "#
        );
        let f = fixture(&raw);
        let (server, app) = check(&f.monitor, "WEB1", "APP");

        assert!(f.monitor.execute_check(server, app).await);
        let outcome = &f.monitor.aggregator.current().await.servers["WEB1"][0];
        assert_eq!(outcome.result, Status::Failure);
        assert!(outcome.response_time.is_some_and(|t| t >= 0.0));
        assert!(f.transport.messages().is_empty(), "no chats configured");
    }

    #[tokio::test]
    async fn check_past_deadline_fails_without_metric() {
        let shell = FakeShell { delay: Some(Duration::from_secs(3)), ..FakeShell::default() };
        let f = fixture_with(FLEET, shell);
        let (server, api) = check(&f.monitor, "DB1", "api");

        let started = Instant::now();
        assert!(f.monitor.execute_check(server, api).await);
        assert!(started.elapsed() < Duration::from_secs(3));

        let snapshot = f.monitor.aggregator.current().await;
        assert_eq!(snapshot.servers["DB1"], vec![CheckOutcome::new("api", Status::Failure, None)]);

        let texts: Vec<String> = f.transport.messages().into_iter().map(|m| m.message).collect();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("DB1: api NOT RESPONDING"));
        assert!(f.shell.commands().is_empty());
    }

    #[test]
    fn overrun_keeps_resource_checks_successful() {
        let cpu = CheckConfig { name: "CPU".into(), kind: CheckKind::Cpu };
        let ssh = CheckConfig { name: "SSH".into(), kind: CheckKind::Port { port: 22 } };

        assert_eq!(overrun_outcome(&cpu), CheckOutcome::new("CPU", Status::Success, None));
        assert_eq!(overrun_outcome(&ssh), CheckOutcome::new("SSH", Status::Failure, None));
    }
}
