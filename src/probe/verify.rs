//! Certificate identity checks and the rustls client configuration the probes share.
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme, SupportedProtocolVersion};
use sha2::{Digest, Sha256};
use x509_parser::parse_x509_certificate;

use super::ProbeError;
use crate::input::decode_pin;

/// Chain position of the certificate whose key is pinned: the issuing intermediate.
pub const PINNED_POSITION: usize = 1;

/// SHA-256 of the SubjectPublicKeyInfo of the Google Trust Services intermediate.
const BUILTIN_PINS: &[&str] = &["zCTnfLwLKbS9S2sbp+uFz4KZOocFvXxkV06Ce9O5M2w="];

/// Pins used when a section configures none.
pub static DEFAULT_PINS: Lazy<Vec<[u8; 32]>> = Lazy::new(|| {
    BUILTIN_PINS
        .iter()
        .filter_map(|pin| decode_pin(pin).ok())
        .collect()
});

/// SHA-256 of a DER certificate's SubjectPublicKeyInfo.
pub fn spki_digest(der: &[u8]) -> Option<[u8; 32]> {
    let (_, cert) = parse_x509_certificate(der).ok()?;
    Some(Sha256::digest(cert.public_key().raw).into())
}

/// First CommonName of a DER certificate's subject.
pub fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = parse_x509_certificate(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);
    name
}

/// Accepts when the certificate at `position` carries any of `pins`.
pub fn check_pin(
    certs: &[CertificateDer<'_>],
    position: usize,
    pins: &[[u8; 32]],
) -> Result<(), ProbeError> {
    let cert = certs
        .get(position)
        .ok_or(ProbeError::Certificates(certs.len()))?;
    match spki_digest(cert) {
        Some(digest) if pins.contains(&digest) => Ok(()),
        _ => Err(ProbeError::PinMismatch(position)),
    }
}

/// Accepts when the leaf CommonName equals `server_name`.
pub fn check_common_name(
    certs: &[CertificateDer<'_>],
    server_name: &str,
) -> Result<(), ProbeError> {
    let found = certs.first().and_then(|leaf| common_name(leaf));
    if found.as_deref() == Some(server_name) {
        Ok(())
    } else {
        Err(ProbeError::CommonName {
            expected: server_name.to_owned(),
            found,
        })
    }
}

/// Trusts any chain: the probes judge identity through pins and names, not the
/// web PKI. Handshake signatures are still verified so a peer must hold the key
/// it presents.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// A client configuration trusting any chain, built once per probe and shared
/// read-only by every worker. The SNI value travels with each connect call.
pub fn client_config(
    versions: &[&'static SupportedProtocolVersion],
    alpn: &[&[u8]],
) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn certificate(common_name: &str) -> (CertificateDer<'static>, KeyPair) {
        let mut params = CertificateParams::new(vec![common_name.to_owned()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.der().clone(), key)
    }

    #[test]
    fn builtin_pin_decodes() {
        assert_eq!(DEFAULT_PINS.len(), BUILTIN_PINS.len());
    }

    #[test]
    fn digest_covers_subject_public_key_info() {
        let (cert, key) = certificate("leaf.example.com");
        let expected: [u8; 32] = Sha256::digest(key.public_key_der()).into();
        assert_eq!(spki_digest(&cert), Some(expected));
    }

    #[test]
    fn pin_matches_any_of_several() {
        let (leaf, _) = certificate("leaf.example.com");
        let (intermediate, _) = certificate("ca.example.com");
        let pin = spki_digest(&intermediate).unwrap();
        let chain = [leaf, intermediate];

        assert!(check_pin(&chain, 1, &[[0u8; 32], pin]).is_ok());
        assert!(matches!(
            check_pin(&chain, 1, &[[0u8; 32]]),
            Err(ProbeError::PinMismatch(1))
        ));
        assert!(matches!(
            check_pin(&chain[..1], 1, &[pin]),
            Err(ProbeError::Certificates(1))
        ));
    }

    #[test]
    fn common_name_must_equal_server_name() {
        let (leaf, _) = certificate("front.example.com");
        assert_eq!(common_name(&leaf).as_deref(), Some("front.example.com"));
        assert!(check_common_name(&[leaf.clone()], "front.example.com").is_ok());
        assert!(check_common_name(&[leaf], "other.example.com").is_err());
        assert!(check_common_name(&[], "front.example.com").is_err());
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(spki_digest(b"not der").is_none());
        assert!(common_name(b"not der").is_none());
    }

    #[test]
    fn client_config_sets_alpn() {
        const ALPN: &[&[u8]] = &[b"h3", b"h3-29"];
        let config = client_config(rustls::DEFAULT_VERSIONS, ALPN).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec(), b"h3-29".to_vec()]);
    }
}
