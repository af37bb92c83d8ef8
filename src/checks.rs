use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use surge_ping::{Client as PingClient, Config as PingConfig, PingIdentifier, PingSequence};
use sysinfo::{Disks, System};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::config::{CheckConfig, CheckKind, MonitorConfig, ServerConfig};
use crate::remote::{RemoteShell, SshTarget};

/// Returned by the reachability check when no round-trip time is available.
pub const NO_RTT: f64 = -1.0;

/// Shared, long-lived handles the checks run against.
pub struct CheckContext {
    ping_client: Option<PingClient>,
    dns_resolver: TokioResolver,
    shell: Arc<dyn RemoteShell>,
    ping_timeout: Duration,
    connect_timeout: Duration,
}

impl CheckContext {
    pub fn new(config: &MonitorConfig, shell: Arc<dyn RemoteShell>) -> Self {
        let ping_client = PingClient::new(&PingConfig::default())
            .inspect_err(|e| warn!("ICMP unavailable, reachability checks will fail: {}", e))
            .ok();

        let dns_resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                warn!("System resolver config unavailable ({}), using Cloudflare", e);
                TokioResolver::builder_with_config(ResolverConfig::cloudflare(), TokioConnectionProvider::default())
                    .build()
            }
        };

        Self {
            ping_client,
            dns_resolver,
            shell,
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    async fn resolve(&self, address: &str) -> Result<IpAddr, String> {
        if let Ok(ip) = address.parse::<IpAddr>() { return Ok(ip); }
        match self.dns_resolver.lookup_ip(address).await {
            Ok(lookup) => lookup.iter().next().ok_or_else(|| "No IP Address Found".into()),
            Err(e) => Err(format!("DNS Resolution Failed: {}", e)),
        }
    }

    /// One ICMP echo; round-trip in milliseconds.
    async fn ping_once(&self, address: &str) -> Result<f64, String> {
        let client = self.ping_client.as_ref().ok_or("ICMP client unavailable")?;
        let ip = self.resolve(address).await?;

        let payload = [0u8; 56];
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(self.ping_timeout);
        match pinger.ping(PingSequence(0), &payload).await {
            Ok((_, rtt)) => Ok(rtt.as_secs_f64() * 1000.0),
            Err(e) => Err(format!("Request Timeout: {}", e)),
        }
    }

    /// Bare TCP connect; elapsed seconds are reported whatever the outcome.
    async fn connect(&self, address: &str, port: u16) -> (bool, f64) {
        let addr = format!("{}:{}", address, port);
        timed_connect(&addr, self.connect_timeout, TcpStream::connect(&addr)).await
    }
}

async fn timed_connect<T>(
    addr: &str,
    limit: Duration,
    attempt: impl Future<Output = std::io::Result<T>>,
) -> (bool, f64) {
    let start = Instant::now();
    let connected = match tokio::time::timeout(limit, attempt).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            error!("Error connecting to {}: {}", addr, e);
            false
        }
        Err(_) => {
            error!("Timed out connecting to {}", addr);
            false
        }
    };
    (connected, start.elapsed().as_secs_f64())
}

/// A runnable check built from one config entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Reachability { host: String },
    Port { host: String, port: u16 },
    RemoteService { target: SshTarget, service: String },
    Cpu,
    Ram,
    Disk { mount: String },
}

impl Check {
    /// `None` for check types this build does not know.
    pub fn from_config(server: &ServerConfig, check: &CheckConfig) -> Option<Self> {
        let host = server.host.clone();
        Some(match &check.kind {
            CheckKind::Reachability => Check::Reachability { host },
            CheckKind::Port { port } => Check::Port { host, port: *port },
            CheckKind::RemoteService { service } => Check::RemoteService {
                target: SshTarget::from(server),
                service: service.clone(),
            },
            CheckKind::Cpu => Check::Cpu,
            CheckKind::Ram => Check::Ram,
            CheckKind::Disk { mount } => Check::Disk { mount: mount.clone() },
            CheckKind::Unknown => return None,
        })
    }

    pub async fn check(&self, ctx: &CheckContext) -> bool {
        match self {
            Check::Reachability { host } => match ctx.ping_once(host).await {
                Ok(_) => true,
                Err(e) => {
                    debug!("Ping {} failed: {}", host, e);
                    false
                }
            },
            Check::Port { host, port } => ctx.connect(host, *port).await.0,
            Check::RemoteService { target, service } => {
                let command = format!("systemctl is-active {}", service);
                match ctx.shell.run_once(target, &command).await {
                    Ok(output) => output.stdout.trim() == "active",
                    Err(e) => {
                        error!("Service check of {} on {} failed: {}", service, target.host, e);
                        false
                    }
                }
            }
            Check::Cpu | Check::Ram | Check::Disk { .. } => true,
        }
    }

    /// Latency for network checks, utilisation percentage for resource checks.
    pub async fn response_time(&self, ctx: &CheckContext) -> f64 {
        match self {
            Check::Reachability { host } => ctx.ping_once(host).await.unwrap_or(NO_RTT),
            Check::Port { host, port } => ctx.connect(host, *port).await.1,
            Check::RemoteService { .. } => 0.0,
            Check::Cpu => cpu_percent(),
            Check::Ram => ram_percent(),
            Check::Disk { mount } => disk_percent(Path::new(mount)).unwrap_or_else(|| {
                warn!("No disk mounted at {}", mount);
                -1.0
            }),
        }
    }
}

/// One-minute load average relative to the logical CPU count.
fn cpu_percent() -> f64 {
    let mut sys = System::new();
    sys.refresh_cpu();
    let cpus = sys.cpus().len().max(1) as f64;
    System::load_average().one / cpus * 100.0
}

fn ram_percent() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(sys.available_memory()) as f64 / total as f64 * 100.0
}

fn disk_percent(mount: &Path) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks.list().iter().find(|d| d.mount_point() == mount)?;
    let total = disk.total_space();
    if total == 0 {
        return Some(0.0);
    }
    Some(total.saturating_sub(disk.available_space()) as f64 / total as f64 * 100.0)
}
