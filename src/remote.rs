use async_trait::async_trait;
use ssh2::Session;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::ServerConfig;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication rejected for {user}@{host}")]
    AuthRejected { user: String, host: String },
    #[error("remote task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where and as whom to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl From<&ServerConfig> for SshTarget {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.ssh_port,
            user: server.user.clone(),
            password: server.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn peer(&self) -> String;
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError>;
    async fn close(&self);
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError>;

    /// Open a session, run one command, close the session.
    async fn run_once(&self, target: &SshTarget, command: &str) -> Result<CommandOutput, RemoteError> {
        let session = self.connect(target).await?;
        let output = session.exec(command).await;
        session.close().await;
        output
    }
}

/// Runs `command` on the session and routes its output streams to the log,
/// attributed to the session's peer.
pub async fn exec_logged(session: &dyn RemoteSession, command: &str) -> Result<CommandOutput, RemoteError> {
    let peer = session.peer();
    let output = session.exec(command).await.inspect_err(|e| {
        error!("Failed to run `{}` on {}: {}", command, peer, e);
    })?;
    if !output.stdout.trim().is_empty() {
        info!("Output of `{}` on {}: {}", command, peer, output.stdout.trim());
    }
    if !output.stderr.trim().is_empty() {
        error!("Error in `{}` on {}: {}", command, peer, output.stderr.trim());
    }
    if output.exit_status != 0 {
        error!("`{}` on {} exited with status {}", command, peer, output.exit_status);
    }
    Ok(output)
}

/// libssh2-backed client. Host keys are never verified; only for a closed fleet.
pub struct SshShell {
    timeout: Duration,
}

impl SshShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn open_blocking(target: SshTarget, timeout: Duration) -> Result<SshSession, RemoteError> {
        let addr = format!("{}:{}", target.host, target.port);
        let socket: SocketAddr = addr
            .to_socket_addrs()
            .map_err(|source| RemoteError::Connect { addr: addr.clone(), source })?
            .next()
            .ok_or_else(|| RemoteError::Resolve(addr.clone()))?;

        let tcp = TcpStream::connect_timeout(&socket, timeout)
            .map_err(|source| RemoteError::Connect { addr: addr.clone(), source })?;
        let peer = tcp.peer_addr().map(|a| a.ip().to_string()).unwrap_or_else(|_| target.host.clone());

        let mut session = Session::new()?;
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_password(&target.user, &target.password)?;
        if !session.authenticated() {
            return Err(RemoteError::AuthRejected { user: target.user, host: target.host });
        }

        debug!("SSH session established with {}", peer);
        Ok(SshSession { session, peer })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let target = target.clone();
        let timeout = self.timeout;
        let session = tokio::task::spawn_blocking(move || Self::open_blocking(target, timeout)).await??;
        Ok(Box::new(session))
    }
}

pub struct SshSession {
    session: Session,
    peer: String,
}

impl SshSession {
    fn exec_blocking(session: Session, command: String) -> Result<CommandOutput, RemoteError> {
        let mut channel = session.channel_session()?;
        channel.exec(&command)?;

        let deadline = match session.timeout() {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(u64::from(ms))),
        };
        session.set_blocking(false);
        let drained = {
            let mut stdout = channel.stream(0);
            let mut stderr = channel.stderr();
            drain_streams(&mut stdout, &mut stderr, || channel.eof(), deadline)
        };
        session.set_blocking(true);
        let (stdout, stderr) = drained?;

        channel.wait_close()?;
        let exit_status = channel.exit_status()?;
        Ok(CommandOutput { stdout, stderr, exit_status })
    }
}

const DRAIN_IDLE: Duration = Duration::from_millis(10);

/// Alternates between both output streams so a chatty stderr cannot stall stdout.
/// Readers are expected to be non-blocking; `finished` reports remote EOF.
fn drain_streams(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    finished: impl Fn() -> bool,
    deadline: Option<Instant>,
) -> io::Result<(String, String)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        // EOF is sampled before reading so data queued ahead of it is never dropped.
        let done = finished();
        let progressed = read_available(stdout, &mut buf, &mut out)? | read_available(stderr, &mut buf, &mut err)?;
        if progressed {
            continue;
        }
        if done {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "remote command output timed out"));
        }
        std::thread::sleep(DRAIN_IDLE);
    }

    Ok((String::from_utf8_lossy(&out).into_owned(), String::from_utf8_lossy(&err).into_owned()))
}

fn read_available(source: &mut impl Read, buf: &mut [u8], sink: &mut Vec<u8>) -> io::Result<bool> {
    match source.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || Self::exec_blocking(session, command)).await?
    }

    async fn close(&self) {
        let session = self.session.clone();
        let peer = self.peer.clone();
        let closed = tokio::task::spawn_blocking(move || session.disconnect(None, "closing", None)).await;
        if let Ok(Err(e)) = closed {
            debug!("Unclean SSH disconnect from {}: {}", peer, e);
        }
    }
}
