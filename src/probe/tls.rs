use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::http::fetch_http1;
use super::verify::{check_pin, client_config, DEFAULT_PINS, PINNED_POSITION};
use super::{timed, Probe, ProbeError, HTTPS_PORT, LEVEL_CONTENT, LEVEL_IDENTITY, LEVEL_SERVICE};
use crate::input::ScanConfig;

const ALPN: &[&[u8]] = &[b"http/1.1"];

pub(super) async fn connect(addr: SocketAddr) -> Result<TcpStream, ProbeError> {
    TcpStream::connect(addr).await.map_err(ProbeError::Connect)
}

/// Runs the client handshake with `server_name` as SNI, bounded by `timeout`.
pub(super) async fn handshake(
    connector: &TlsConnector,
    server_name: &str,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, ProbeError> {
    let name = ServerName::try_from(server_name.to_owned())
        .map_err(|_| ProbeError::ServerName(server_name.to_owned()))?;
    time::timeout(timeout, connector.connect(name, stream))
        .await
        .map_err(|_| ProbeError::HandshakeTimeout(timeout))?
        .map_err(|e| ProbeError::Handshake(e.to_string()))
}

/// TLS over TCP, then HTTP/1.1 on the same stream.
pub struct TlsProbe {
    config: ScanConfig,
    connector: TlsConnector,
    pins: Vec<[u8; 32]>,
    port: u16,
}

impl TlsProbe {
    /// Builds the shared client configuration. Falls back to the built-in pins
    /// when the section configures none.
    pub fn new(config: &ScanConfig) -> anyhow::Result<Self> {
        let mut pins = config.pins()?;
        if pins.is_empty() {
            pins.clone_from(&DEFAULT_PINS);
        }
        let tls = client_config(&[&rustls::version::TLS12], ALPN)?;
        Ok(Self {
            config: config.clone(),
            connector: TlsConnector::from(Arc::new(tls)),
            pins,
            port: HTTPS_PORT,
        })
    }

    /// Probes `port` instead of 443.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn attempt(&self, ip: Ipv4Addr) -> Result<(), ProbeError> {
        let level = self.config.level;
        let stream = connect(SocketAddr::from((ip, self.port))).await?;
        let server_name = self.config.server_name();
        let tls = handshake(
            &self.connector,
            &server_name,
            stream,
            self.config.handshake_timeout,
        )
        .await?;

        let certs = tls.get_ref().1.peer_certificates().unwrap_or_default();
        if certs.is_empty() {
            return Err(ProbeError::Certificates(0));
        }
        if level >= LEVEL_IDENTITY {
            check_pin(certs, PINNED_POSITION, &self.pins)?;
        }
        if level >= LEVEL_SERVICE {
            let host = self.config.verify_host().ok_or(ProbeError::NoVerifyHost)?;
            fetch_http1(tls, Method::GET, host, level >= LEVEL_CONTENT).await?;
        }
        Ok(())
    }
}

impl Probe for TlsProbe {
    async fn sample(&self, ip: Ipv4Addr) -> Option<Duration> {
        timed("TLS", ip, self.config.level, self.config.max_rtt, self.attempt(ip)).await
    }
}
