//! Server certificate pinning
//!
//! vCenter and ESXi usually run with self-signed certificates. Instead of
//! turning verification off, a connection can be pinned to the fingerprint
//! of the expected end-entity certificate, the way the vSphere tooling
//! prints it: SHA-1 (20 bytes) or SHA-256 (32 bytes) hex, with or without
//! colons.

use crate::error::VSphereError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const SHA1_LEN: usize = 20;
const SHA256_LEN: usize = 32;

/// Decode a thumbprint such as `AB:CD:...`
///
/// # Errors
/// `InvalidRequest` when the value is not hex or has neither SHA-1 nor
/// SHA-256 length.
pub fn parse_thumbprint(thumbprint: &str) -> Result<Vec<u8>, VSphereError> {
    let hex: String = thumbprint
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect();
    let invalid = || VSphereError::InvalidRequest(format!("invalid certificate thumbprint {:?}", thumbprint));

    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err(invalid());
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| invalid())?;
    match bytes.len() {
        SHA1_LEN | SHA256_LEN => Ok(bytes),
        _ => Err(invalid()),
    }
}

/// Colon-separated upper-case hex, as vCenter displays fingerprints
pub fn format_thumbprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// TLS client configuration trusting only the pinned certificate
///
/// # Arguments
/// * `thumbprint` - Expected fingerprint of the server's end-entity certificate
///
/// # Returns
/// A rustls configuration for `reqwest::ClientBuilder::use_preconfigured_tls`
pub fn pinned_client_config(thumbprint: &str) -> Result<ClientConfig, VSphereError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = ThumbprintVerifier::new(parse_thumbprint(thumbprint)?, Arc::clone(&provider));
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| VSphereError::InvalidRequest(format!("TLS configuration: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// Accepts the one certificate whose fingerprint matches
#[derive(Debug)]
pub struct ThumbprintVerifier {
    expected: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ThumbprintVerifier {
    pub fn new(expected: Vec<u8>, provider: Arc<CryptoProvider>) -> Self {
        Self { expected, provider }
    }

    fn fingerprint(&self, certificate: &[u8]) -> Vec<u8> {
        if self.expected.len() == SHA1_LEN {
            Sha1::digest(certificate).to_vec()
        } else {
            Sha256::digest(certificate).to_vec()
        }
    }
}

impl ServerCertVerifier for ThumbprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = self.fingerprint(end_entity.as_ref());
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "server certificate thumbprint {} does not match pinned {}",
                format_thumbprint(&actual),
                format_thumbprint(&self.expected)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
