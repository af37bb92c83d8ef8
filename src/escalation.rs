use tracing::debug;

use crate::config::CheckKind;
use crate::models::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NotifyFailure,
    NotifyWarning,
    MigrateServices,
}

/// Picks a handler from severity and server identity. No I/O.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    failover_primary: String,
}

impl Dispatcher {
    pub fn new(failover_primary: impl Into<String>) -> Self {
        Self { failover_primary: failover_primary.into() }
    }

    pub fn select_strategy(&self, server_name: &str, kind: &CheckKind, severity: Severity) -> Strategy {
        let strategy = match severity {
            Severity::Warning => Strategy::NotifyWarning,
            Severity::Failure if server_name == self.failover_primary => Strategy::MigrateServices,
            Severity::Failure => Strategy::NotifyFailure,
        };
        debug!("{} ({}, {:?}) -> {:?}", server_name, kind.label(), severity, strategy);
        strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_always_notify() {
        let d = Dispatcher::new("TG1");
        assert_eq!(d.select_strategy("TG1", &CheckKind::Cpu, Severity::Warning), Strategy::NotifyWarning);
        assert_eq!(d.select_strategy("WEB1", &CheckKind::Reachability, Severity::Warning), Strategy::NotifyWarning);
    }

    #[test]
    fn primary_failure_migrates() {
        let d = Dispatcher::new("TG1");
        assert_eq!(d.select_strategy("TG1", &CheckKind::Reachability, Severity::Failure), Strategy::MigrateServices);
        assert_eq!(
            d.select_strategy("TG1", &CheckKind::Port { port: 443 }, Severity::Failure),
            Strategy::MigrateServices
        );
    }

    #[test]
    fn other_failures_notify() {
        let d = Dispatcher::new("TG1");
        assert_eq!(d.select_strategy("TG2", &CheckKind::Reachability, Severity::Failure), Strategy::NotifyFailure);
        assert_eq!(d.select_strategy("tg1", &CheckKind::Reachability, Severity::Failure), Strategy::NotifyFailure);
    }
}
