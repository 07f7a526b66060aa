use std::future::poll_fn;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Connection, Endpoint, IdleTimeout, TransportConfig, VarInt};
use rustls::pki_types::CertificateDer;
use tokio::time;

use super::http::{body_matcher, check_alt_svc, check_status, http_error, BodyMatcher};
use super::verify::{check_pin, client_config, DEFAULT_PINS, PINNED_POSITION};
use super::{timed, Probe, ProbeError, HTTPS_PORT, LEVEL_CONTENT, LEVEL_IDENTITY, LEVEL_SERVICE};
use crate::input::ScanConfig;

const ALPN: &[&[u8]] = &[b"h3", b"h3-29"];

/// QUIC handshake on a fresh ephemeral UDP socket, then HTTP/3 on the same
/// connection.
pub struct QuicProbe {
    config: ScanConfig,
    client: ClientConfig,
    pins: Vec<[u8; 32]>,
    port: u16,
}

impl QuicProbe {
    /// Builds the shared client configuration. The idle timeout equals the
    /// handshake timeout so a silent peer is given up on in time.
    pub fn new(config: &ScanConfig) -> anyhow::Result<Self> {
        let mut pins = config.pins()?;
        if pins.is_empty() {
            pins.clone_from(&DEFAULT_PINS);
        }
        let tls = client_config(&[&rustls::version::TLS13], ALPN)?;
        let mut transport = TransportConfig::default();
        transport
            .max_idle_timeout(Some(IdleTimeout::try_from(config.handshake_timeout)?))
            .keep_alive_interval(None);
        let mut client = ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls)?));
        client.transport_config(Arc::new(transport));

        Ok(Self {
            config: config.clone(),
            client,
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
        let endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(ProbeError::Connect)?;
        let server_name = self.config.server_name();
        let connecting = endpoint
            .connect_with(
                self.client.clone(),
                SocketAddr::from((ip, self.port)),
                &server_name,
            )
            .map_err(|e| ProbeError::Handshake(e.to_string()))?;
        let timeout = self.config.handshake_timeout;
        let connection = time::timeout(timeout, connecting)
            .await
            .map_err(|_| ProbeError::HandshakeTimeout(timeout))?
            .map_err(|e| ProbeError::Handshake(e.to_string()))?;

        let result = self.verify(&connection).await;
        connection.close(VarInt::from_u32(0), b"");
        result
    }

    async fn verify(&self, connection: &Connection) -> Result<(), ProbeError> {
        let level = self.config.level;
        let certs = peer_certificates(connection);
        if certs.len() < 2 {
            return Err(ProbeError::Certificates(certs.len()));
        }
        if level >= LEVEL_IDENTITY {
            check_pin(&certs, PINNED_POSITION, &self.pins)?;
        }
        if level >= LEVEL_SERVICE {
            let host = self.config.verify_host().ok_or(ProbeError::NoVerifyHost)?;
            fetch_h3(connection.clone(), host, level >= LEVEL_CONTENT).await?;
        }
        Ok(())
    }
}

fn peer_certificates(connection: &Connection) -> Vec<CertificateDer<'static>> {
    connection
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
        .map(|certs| *certs)
        .unwrap_or_default()
}

/// One HTTP/3 `GET` for `https://{host}/`, answered with a QUIC advertisement.
async fn fetch_h3(connection: Connection, host: &str, check_content: bool) -> Result<(), ProbeError> {
    let (mut driver, mut sender) = h3::client::new(h3_quinn::Connection::new(connection))
        .await
        .map_err(http_error)?;
    let request = http::Request::get(format!("https://{host}/"))
        .body(())
        .map_err(http_error)?;

    let exchange = async move {
        let mut stream = sender.send_request(request).await.map_err(http_error)?;
        stream.finish().await.map_err(http_error)?;
        let response = stream.recv_response().await.map_err(http_error)?;
        check_status(response.status())?;
        check_alt_svc(response.headers())?;

        let mut matcher = body_matcher(check_content, response.headers());
        while let Some(mut chunk) = stream.recv_data().await.map_err(http_error)? {
            while chunk.has_remaining() {
                let part = chunk.chunk();
                let len = part.len();
                if let Some(matcher) = matcher.as_mut() {
                    matcher.feed(part);
                }
                chunk.advance(len);
            }
        }
        matcher.map_or(Ok(()), BodyMatcher::verdict)
    };

    tokio::select! {
        result = exchange => result,
        closed = poll_fn(|cx| driver.poll_close(cx)) => match closed {
            Ok(()) => Err(ProbeError::Http(String::from("connection closed before the response"))),
            Err(e) => Err(http_error(e)),
        },
    }
}

impl Probe for QuicProbe {
    async fn sample(&self, ip: Ipv4Addr) -> Option<Duration> {
        timed("QUIC", ip, self.config.level, self.config.max_rtt, self.attempt(ip)).await
    }
}
