use std::sync::Arc;
use tracing::{error, info, warn};

use crate::alert::Notifier;
use crate::config::{CheckKind, MonitorConfig, ServerConfig};
use crate::escalation::{Dispatcher, Strategy};
use crate::models::Severity;
use crate::remote::{exec_logged, RemoteShell, SshTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Stop,
    Start,
}

impl ServiceAction {
    fn verb(self) -> &'static str {
        match self {
            ServiceAction::Stop => "stop",
            ServiceAction::Start => "start",
        }
    }
}

/// Outcome of one migration, one flag per host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub primary_stopped: bool,
    pub secondary_started: bool,
}

pub struct Handlers {
    config: Arc<MonitorConfig>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    shell: Arc<dyn RemoteShell>,
}

impl Handlers {
    pub fn new(config: Arc<MonitorConfig>, notifier: Notifier, shell: Arc<dyn RemoteShell>) -> Self {
        let dispatcher = Dispatcher::new(config.failover.primary.clone());
        Self { config, dispatcher, notifier, shell }
    }

    /// Selects and runs the strategy for one classified check. Never fails.
    pub async fn escalate(&self, server: &str, check: &str, kind: &CheckKind, severity: Severity, value: f64) -> Strategy {
        let strategy = self.dispatcher.select_strategy(server, kind, severity);
        match strategy {
            Strategy::NotifyWarning => self.notify_warning(server, check, value).await,
            Strategy::NotifyFailure => self.notify_failure(server, check).await,
            Strategy::MigrateServices => {
                let report = self.migrate_services(server, check).await;
                info!(
                    "Migration after {} failure finished: primary stopped={}, secondary started={}",
                    server, report.primary_stopped, report.secondary_started
                );
            }
        }
        strategy
    }

    pub async fn notify_failure(&self, server: &str, check: &str) {
        warn!("{}: {} NOT RESPONDING", server, check);
        self.notifier.broadcast(&format!("❗❗❗ALERT\n\n{server}: {check} NOT RESPONDING")).await;
    }

    pub async fn notify_warning(&self, server: &str, check: &str, value: f64) {
        warn!("{}: {} = {}", server, check, value);
        self.notifier.broadcast(&format!("⚠️WARNING\n\n{server}: {check} = {value}")).await;
    }

    /// Stops the primary's monitored services, starts the failover set on the
    /// secondary, then reports both steps in a single alert.
    pub async fn migrate_services(&self, server: &str, check: &str) -> MigrationReport {
        let failover = &self.config.failover;
        error!("{} --- {} NOT RESPONDING, migrating services {} -> {}", server, check, failover.primary, failover.secondary);

        let mut message = format!("❗❗❗ALERT\n\n{server} --- {check} NOT RESPONDING\n\n");

        let primary_stopped = match self.config.server(&failover.primary) {
            Some(primary) => {
                let services: Vec<String> = primary
                    .checks
                    .iter()
                    .filter_map(|c| match &c.kind {
                        CheckKind::RemoteService { service } => Some(service.clone()),
                        _ => None,
                    })
                    .collect();
                self.manage_services(primary, &services, ServiceAction::Stop).await
            }
            None => false,
        };
        message.push_str(&if primary_stopped {
            format!("Services stopped on {}\n", failover.primary)
        } else {
            format!("Failed to connect to {}\n", failover.primary)
        });

        let secondary_started = match self.config.server(&failover.secondary) {
            Some(secondary) => self.manage_services(secondary, &failover.services, ServiceAction::Start).await,
            None => false,
        };
        message.push_str(&if secondary_started {
            format!("Services started on {}\n", failover.secondary)
        } else {
            format!("Failed to connect to {}\n", failover.secondary)
        });

        self.notifier.broadcast(&message).await;
        MigrationReport { primary_stopped, secondary_started }
    }

    /// True once a session was opened; individual command errors are only logged.
    async fn manage_services(&self, server: &ServerConfig, services: &[String], action: ServiceAction) -> bool {
        let session = match self.shell.connect(&SshTarget::from(server)).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to connect to {} via SSH: {}", server.name, e);
                return false;
            }
        };

        for service in services {
            let command = format!("systemctl {} {}", action.verb(), service);
            if exec_logged(session.as_ref(), &command).await.is_ok() {
                info!("{} {} on {}", action.verb(), service, server.name);
            }
        }
        session.close().await;
        true
    }
}
