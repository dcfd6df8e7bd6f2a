use std::{
    net::IpAddr,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::config::{ProbeConfig, ProbeMethod};

/// Payload size used by iputils `ping`.
const PAYLOAD: [u8; 56] = [0; 56];

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("cannot open ICMP socket: {0}")]
    Socket(std::io::Error),

    #[error("echo request failed: {0}")]
    Icmp(#[from] surge_ping::SurgeError),

    #[error("cannot run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
    },

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Send echo requests to `addr`; Ok as soon as one reply came back.
    async fn ping(&self, addr: IpAddr) -> Result<(), ProbeError>;

    /// Whether `addr` answered. Every failure counts as unreachable.
    async fn probe(&self, addr: IpAddr) -> bool {
        match self.ping(addr).await {
            Ok(()) => {
                tracing::debug!("Ping to {addr} was successful");
                true
            }
            Err(why) => {
                tracing::debug!("Ping to {addr} failed: {why}");
                false
            }
        }
    }
}

pub fn from_config(config: &ProbeConfig) -> Arc<dyn Prober> {
    match config.method {
        ProbeMethod::Command => Arc::new(CommandProber::new(config.count, config.timeout())),
        ProbeMethod::Icmp => Arc::new(IcmpProber::new(config.count, config.timeout())),
    }
}

/// Runs the host's `ping` binary and trusts its exit status.
pub struct CommandProber {
    program: String,
    count: u16,
    timeout: Duration,
}

impl CommandProber {
    pub fn new(count: u16, timeout: Duration) -> Self {
        Self::with_program("ping", count, timeout)
    }

    pub fn with_program(program: impl Into<String>, count: u16, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            count,
            timeout,
        }
    }

    fn command(&self, addr: IpAddr) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        if addr.is_ipv6() {
            cmd.arg("-6");
        }
        cmd.arg("-n")
            .arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg(addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Prober for CommandProber {
    async fn ping(&self, addr: IpAddr) -> Result<(), ProbeError> {
        // ping waits up to `timeout` per request; give it one extra second
        // before we stop waiting on the process ourselves.
        let deadline = self
            .timeout
            .saturating_mul(u32::from(self.count))
            .saturating_add(Duration::from_secs(1));

        let status = tokio::time::timeout(deadline, self.command(addr).status())
            .await
            .map_err(|_| ProbeError::Timeout(deadline))?
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ProbeError::Exit {
                program: self.program.clone(),
                status,
            })
        }
    }
}

/// Sends echo requests from an ICMP socket owned by the process.
/// Needs CAP_NET_RAW, or a `net.ipv4.ping_group_range` covering our group.
pub struct IcmpProber {
    count: u16,
    timeout: Duration,
    next_ident: AtomicU16,
}

impl IcmpProber {
    pub fn new(count: u16, timeout: Duration) -> Self {
        Self {
            count,
            timeout,
            next_ident: AtomicU16::new(std::process::id() as u16),
        }
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn ping(&self, addr: IpAddr) -> Result<(), ProbeError> {
        let config = match addr {
            IpAddr::V4(_) => surge_ping::Config::default(),
            IpAddr::V6(_) => surge_ping::Config::builder()
                .kind(surge_ping::ICMP::V6)
                .build(),
        };
        let client = surge_ping::Client::new(&config).map_err(ProbeError::Socket)?;

        let ident = surge_ping::PingIdentifier(self.next_ident.fetch_add(1, Ordering::Relaxed));
        let mut pinger = client.pinger(addr, ident).await;
        pinger.timeout(self.timeout);

        let mut last_error = None;
        for seq in 0..self.count {
            match pinger.ping(surge_ping::PingSequence(seq), &PAYLOAD).await {
                Ok((_, rtt)) => {
                    tracing::trace!("Reply from {addr} in {rtt:?}");
                    return Ok(());
                }
                Err(why) => last_error = Some(why),
            }
        }

        Err(last_error
            .map(ProbeError::Icmp)
            .unwrap_or(ProbeError::Timeout(self.timeout)))
    }
}
