//! Protocol probes: one verified sample of one address per call.
//!
//! Each probe climbs the verification ladder up to the section's `level`:
//! handshake, then certificate identity, then an HTTP request, then the response
//! body. A sample that fails at any rung yields `None`; the reason is logged at
//! debug level and goes no further.
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;
use tokio::time;

use crate::icmp;
use crate::input::{Operation, ScanConfig};

mod http;
mod quic;
mod sni;
mod tls;
mod verify;

pub use quic::QuicProbe;
pub use sni::SniProbe;
pub use tls::TlsProbe;
pub use verify::{check_common_name, check_pin, common_name, spki_digest, DEFAULT_PINS};

/// Port every probe connects to unless overridden.
pub const HTTPS_PORT: u16 = 443;

/// Certificates are checked against pins or names from this level on.
pub const LEVEL_IDENTITY: i32 = 2;
/// An HTTP request is made from this level on.
pub const LEVEL_SERVICE: i32 = 3;
/// The response body is compared against the negative marker from this level on.
pub const LEVEL_CONTENT: i32 = 4;

/// One sample of one address.
///
/// `Some(elapsed)` means every check up to the configured level passed. The
/// engine applies the RTT gate and the per-address sample loop on top.
pub trait Probe: Send + Sync {
    /// Runs one sample against `ip`. Every connection opened is closed before the
    /// future resolves or when it is dropped.
    fn sample(&self, ip: Ipv4Addr) -> impl Future<Output = Option<Duration>> + Send;
}

/// Why a sample did not qualify. Only ever logged.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// TCP connect or UDP endpoint setup failed.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    /// The TLS or QUIC handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The handshake did not finish within `handshake_timeout`.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// The server name cannot be sent as SNI.
    #[error("invalid server name {0:?}")]
    ServerName(String),
    /// Too few certificates for the level.
    #[error("peer presented {0} certificate(s)")]
    Certificates(usize),
    /// The pinned chain position carries an unknown key.
    #[error("certificate #{0} matches no pinned key")]
    PinMismatch(usize),
    /// The leaf CommonName is not the requested server name.
    #[error("leaf CommonName {found:?} is not {expected:?}")]
    CommonName {
        /// The server name sent.
        expected: String,
        /// What the leaf certificate carried.
        found: Option<String>,
    },
    /// The HTTP exchange failed.
    #[error("http: {0}")]
    Http(String),
    /// The status is outside `[200, 400)`.
    #[error("http status {0}")]
    Status(u16),
    /// No `Alt-Svc` advertisement of QUIC on port 443.
    #[error("response does not advertise quic on :443")]
    AltSvc,
    /// The body is the storage service's `NoSuchBucket` error.
    #[error("response body is the NoSuchBucket error")]
    NegativeBody,
    /// A service-level check with nothing to request.
    #[error("no http verification host configured")]
    NoVerifyHost,
}

/// Bounds `attempt` by `budget` and turns its outcome into a sample.
async fn timed<F>(kind: &str, ip: Ipv4Addr, level: i32, budget: Duration, attempt: F) -> Option<Duration>
where
    F: Future<Output = Result<(), ProbeError>>,
{
    let start = Instant::now();
    match time::timeout(budget, attempt).await {
        Ok(Ok(())) => Some(start.elapsed()),
        Ok(Err(e)) => {
            debug!("{kind} {ip} failed at level {level}: {e}");
            None
        }
        Err(_) => {
            debug!("{kind} {ip} failed at level {level}: no answer within {budget:?}");
            None
        }
    }
}

/// One ICMP echo per sample.
#[derive(Debug, Clone, Copy)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    /// A probe that waits up to `timeout` for each reply.
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Probe for PingProbe {
    async fn sample(&self, ip: Ipv4Addr) -> Option<Duration> {
        match icmp::ping(IpAddr::V4(ip), self.timeout).await {
            Ok(rtt) => Some(rtt),
            Err(e) => {
                debug!("PING {ip}: {e}");
                None
            }
        }
    }
}

/// The probe selected by `operation`, resolved once at startup.
pub enum Protocol {
    /// QUIC handshake plus HTTP/3.
    Quic(QuicProbe),
    /// TLS over TCP plus HTTP/1.1.
    Tls(TlsProbe),
    /// Every configured front name over TLS.
    Sni(SniProbe),
    /// ICMP echo.
    Ping(PingProbe),
}

impl Protocol {
    /// Builds the probe for `operation` from its configuration section.
    pub fn pick(operation: Operation, config: &ScanConfig) -> anyhow::Result<Self> {
        Ok(match operation {
            Operation::Quic => Self::Quic(QuicProbe::new(config)?),
            Operation::Tls => Self::Tls(TlsProbe::new(config)?),
            Operation::Sni => Self::Sni(SniProbe::new(config)?),
            Operation::Ping => Self::Ping(PingProbe::new(config.max_rtt)),
        })
    }
}

impl Probe for Protocol {
    async fn sample(&self, ip: Ipv4Addr) -> Option<Duration> {
        match self {
            Self::Quic(probe) => probe.sample(ip).await,
            Self::Tls(probe) => probe.sample(ip).await,
            Self::Sni(probe) => probe.sample(ip).await,
            Self::Ping(probe) => probe.sample(ip).await,
        }
    }
}
