use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio_rustls::TlsConnector;

use super::http::fetch_http1;
use super::tls::{connect, handshake};
use super::verify::{check_common_name, check_pin, client_config, PINNED_POSITION};
use super::{timed, Probe, ProbeError, HTTPS_PORT, LEVEL_IDENTITY, LEVEL_SERVICE};
use crate::input::{random_host, ScanConfig};

const ALPN: &[&[u8]] = &[b"http/1.1"];

/// Checks that an address answers for every configured front name.
///
/// One sample walks all names, each on its own connection with its own
/// `max_rtt` budget, and reports the summed elapsed time.
pub struct SniProbe {
    config: ScanConfig,
    connector: TlsConnector,
    pins: Vec<[u8; 32]>,
    port: u16,
}

impl SniProbe {
    /// Without configured pins, identity falls back to the leaf CommonName.
    pub fn new(config: &ScanConfig) -> anyhow::Result<Self> {
        let tls = client_config(rustls::DEFAULT_VERSIONS, ALPN)?;
        Ok(Self {
            pins: config.pins()?,
            config: config.clone(),
            connector: TlsConnector::from(Arc::new(tls)),
            port: HTTPS_PORT,
        })
    }

    /// Probes `port` instead of 443.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn attempt(&self, ip: Ipv4Addr, server_name: &str) -> Result<(), ProbeError> {
        let level = self.config.level;
        let stream = connect(SocketAddr::from((ip, self.port))).await?;
        let tls = handshake(
            &self.connector,
            server_name,
            stream,
            self.config.handshake_timeout,
        )
        .await?;

        if level >= LEVEL_IDENTITY {
            let certs = tls.get_ref().1.peer_certificates().unwrap_or_default();
            if self.pins.is_empty() {
                check_common_name(certs, server_name)?;
            } else {
                check_pin(certs, PINNED_POSITION, &self.pins)?;
            }
        }
        if level >= LEVEL_SERVICE {
            fetch_http1(tls, Method::HEAD, server_name, false).await?;
        }
        Ok(())
    }
}

impl Probe for SniProbe {
    async fn sample(&self, ip: Ipv4Addr) -> Option<Duration> {
        let names = if self.config.server_names.is_empty() {
            vec![random_host()]
        } else {
            self.config.server_names.clone()
        };

        let mut total = Duration::ZERO;
        for name in &names {
            let elapsed = timed(
                "SNI",
                ip,
                self.config.level,
                self.config.max_rtt,
                self.attempt(ip, name),
            )
            .await?;
            if elapsed <= self.config.min_rtt {
                return None;
            }
            total += elapsed;
        }
        Some(total)
    }
}
