//! TLS and SNI probes against a local rustls server presenting a two
//! certificate chain.
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use gscan::input::ScanConfig;
use gscan::probe::{spki_digest, Probe, SniProbe, TlsProbe};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const FRONT: &str = "front.example.com";
const NO_SUCH_BUCKET: &str = "<?xml version='1.0' encoding='UTF-8'?><Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist.</Message></Error>";

struct Chain {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

fn self_signed(common_name: &str) -> (CertificateDer<'static>, KeyPair) {
    let mut params = CertificateParams::new(vec![common_name.to_owned()]).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.der().clone(), key)
}

fn chain() -> Chain {
    let (leaf, leaf_key) = self_signed(FRONT);
    let (intermediate, _) = self_signed("Test Intermediate CA");
    Chain {
        certs: vec![leaf, intermediate],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
    }
}

fn intermediate_pin(chain: &Chain) -> String {
    STANDARD.encode(spki_digest(&chain.certs[1]).unwrap())
}

/// Serves every connection with `response` until the test ends.
async fn serve(chain: &Chain, response: String) -> SocketAddr {
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(chain.certs.clone(), chain.key.clone_key())
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    addr
}

fn response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn config(level: i32, pins: Vec<String>) -> ScanConfig {
    ScanConfig {
        server_names: vec![FRONT.to_owned()],
        http_verify_hosts: vec![FRONT.to_owned()],
        handshake_timeout: Duration::from_secs(2),
        max_rtt: Duration::from_secs(3),
        level,
        pinned_spki: pins,
        ..ScanConfig::default()
    }
}

async fn tls_sample(addr: SocketAddr, level: i32, pins: Vec<String>) -> Option<Duration> {
    let probe = TlsProbe::new(&config(level, pins))
        .unwrap()
        .with_port(addr.port());
    probe.sample(Ipv4Addr::LOCALHOST).await
}

#[tokio::test]
async fn tls_levels_pass_with_pinned_intermediate() {
    let chain = chain();
    let pin = intermediate_pin(&chain);
    let addr = serve(&chain, response("200 OK", "text/html", "<html></html>")).await;

    for level in 1..=4 {
        assert!(
            tls_sample(addr, level, vec![pin.clone()]).await.is_some(),
            "level {level}"
        );
    }
}

#[tokio::test]
async fn unknown_intermediate_fails_from_level_two() {
    let chain = chain();
    let addr = serve(&chain, response("200 OK", "text/html", "")).await;
    let stranger = STANDARD.encode([7u8; 32]);

    assert!(tls_sample(addr, 1, vec![stranger.clone()]).await.is_some());
    assert!(tls_sample(addr, 2, vec![stranger.clone()]).await.is_none());
    assert!(tls_sample(addr, 3, vec![stranger]).await.is_none());
}

#[tokio::test]
async fn error_status_fails_from_level_three() {
    let chain = chain();
    let pin = intermediate_pin(&chain);
    let addr = serve(&chain, response("404 Not Found", "text/plain", "gone")).await;

    assert!(tls_sample(addr, 2, vec![pin.clone()]).await.is_some());
    assert!(tls_sample(addr, 3, vec![pin]).await.is_none());
}

#[tokio::test]
async fn redirect_is_an_answer() {
    let chain = chain();
    let pin = intermediate_pin(&chain);
    let addr = serve(&chain, response("302 Found", "text/html", "")).await;

    assert!(tls_sample(addr, 3, vec![pin]).await.is_some());
}

#[tokio::test]
async fn no_such_bucket_fails_at_level_four() {
    let chain = chain();
    let pin = intermediate_pin(&chain);
    let addr = serve(
        &chain,
        response("200 OK", "application/xml; charset=UTF-8", NO_SUCH_BUCKET),
    )
    .await;

    assert!(tls_sample(addr, 3, vec![pin.clone()]).await.is_some());
    assert!(tls_sample(addr, 4, vec![pin]).await.is_none());
}

#[tokio::test]
async fn marker_with_other_content_type_passes_level_four() {
    let chain = chain();
    let pin = intermediate_pin(&chain);
    let addr = serve(&chain, response("200 OK", "text/xml", NO_SUCH_BUCKET)).await;

    assert!(tls_sample(addr, 4, vec![pin]).await.is_some());
}

#[tokio::test]
async fn closed_port_fails() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let probe = TlsProbe::new(&config(1, Vec::new())).unwrap().with_port(port);
    assert!(probe.sample(Ipv4Addr::LOCALHOST).await.is_none());
}

async fn sni_sample(addr: SocketAddr, names: &[&str], level: i32) -> Option<Duration> {
    let config = ScanConfig {
        server_names: names.iter().map(|name| (*name).to_owned()).collect(),
        ..config(level, Vec::new())
    };
    let probe = SniProbe::new(&config).unwrap().with_port(addr.port());
    probe.sample(Ipv4Addr::LOCALHOST).await
}

#[tokio::test]
async fn sni_matches_common_name_without_pins() {
    let chain = chain();
    let addr = serve(&chain, response("200 OK", "text/html", "")).await;

    assert!(sni_sample(addr, &[FRONT], 2).await.is_some());
    assert!(sni_sample(addr, &[FRONT], 3).await.is_some());
    assert!(sni_sample(addr, &["other.example.com"], 1).await.is_some());
    assert!(sni_sample(addr, &["other.example.com"], 2).await.is_none());
}

#[tokio::test]
async fn sni_requires_every_name() {
    let chain = chain();
    let addr = serve(&chain, response("200 OK", "text/html", "")).await;

    assert!(sni_sample(addr, &[FRONT, "other.example.com"], 2).await.is_none());
    let both = sni_sample(addr, &[FRONT, FRONT], 2).await.unwrap();
    assert!(both > Duration::ZERO);
}

#[tokio::test]
async fn sni_head_rejects_error_status() {
    let chain = chain();
    let addr = serve(&chain, response("500 Internal Server Error", "text/html", "")).await;

    assert!(sni_sample(addr, &[FRONT], 2).await.is_some());
    assert!(sni_sample(addr, &[FRONT], 3).await.is_none());
}
