//! Public-key-pinned TLS for the control-plane hosts.
//!
//! Pinning augments normal WebPKI validation: after the chain verifies, at
//! least one presented certificate's SubjectPublicKeyInfo hash must appear
//! in the host class's baked-in pin set, otherwise the handshake fails.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{error, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use x509_parser::prelude::*;

/// base64(SHA-256(DER(SubjectPublicKeyInfo))) of a certificate.
pub fn spki_sha256_base64(cert: &CertificateDer<'_>) -> Result<String, String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| format!("failed to parse peer certificate: {e}"))?;
    let spki = parsed.public_key().raw;
    Ok(BASE64.encode(Sha256::digest(spki)))
}

fn find_pinned_key(pins: &[&str], hash: &str) -> bool {
    pins.iter().any(|pin| *pin == hash)
}

/// Certificate verifier combining WebPKI validation with SPKI pinning.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: &'static [&'static str],
    skip_ca: bool,
}

impl PinnedCertVerifier {
    pub fn new(pins: &'static [&'static str], skip_ca: bool) -> Result<Self, rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let inner =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::new(ring::default_provider()))
                .build()
                .map_err(|e| rustls::Error::General(e.to_string()))?;

        Ok(PinnedCertVerifier { inner, pins, skip_ca })
    }

    fn check_pins(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut last_err = None;

        for cert in std::iter::once(end_entity).chain(intermediates.iter()) {
            match spki_sha256_base64(cert) {
                Ok(hash) if find_pinned_key(self.pins, &hash) => {
                    return Ok(ServerCertVerified::assertion());
                }
                Ok(_) => {}
                Err(e) => last_err = Some(e),
            }
        }

        let detail = last_err.map(|e| format!(": {e}")).unwrap_or_default();
        Err(rustls::Error::General(format!(
            "certificate check error: pinned certificate key not found{detail}"
        )))
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // The peer certificate is untrusted input; a fault while inspecting
        // it must fail the handshake, not take down the daemon.
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if !self.skip_ca {
                self.inner
                    .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
            }

            // Degraded configuration without pins: CA-only validation.
            if self.pins.is_empty() {
                return Ok(ServerCertVerified::assertion());
            }

            self.check_pins(end_entity, intermediates)
        }));

        match outcome {
            Ok(result) => result,
            Err(_) => {
                error!("panic while verifying peer certificate");
                Err(rustls::Error::General(
                    "peer certificate verification fault".to_string(),
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Builds the rustls configuration for one host class.
pub fn client_config(
    pins: &'static [&'static str],
    skip_ca: bool,
    host: &str,
) -> Result<ClientConfig, rustls::Error> {
    if pins.is_empty() {
        warn!("No pinned certificate keys for {host}; falling back to CA-only validation");
    }

    let verifier = PinnedCertVerifier::new(pins, skip_ca)?;

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| rustls::Error::General(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_cert() -> CertificateDer<'static> {
        let certified = rcgen::generate_simple_self_signed(vec!["api.vantagevpn.net".to_string()])
            .expect("certificate generation");
        certified.cert.der().clone()
    }

    fn leak_pins(pins: Vec<String>) -> &'static [&'static str] {
        let leaked: Vec<&'static str> = pins
            .into_iter()
            .map(|p| Box::leak(p.into_boxed_str()) as &'static str)
            .collect();
        Box::leak(leaked.into_boxed_slice())
    }

    #[test]
    fn spki_hash_is_stable_and_base64_shaped() {
        let cert = self_signed_cert();
        let first = spki_sha256_base64(&cert).unwrap();
        let second = spki_sha256_base64(&cert).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 44);
        assert!(first.ends_with('='));
    }

    #[test]
    fn pin_lookup_matches_exactly() {
        assert!(find_pinned_key(&["aaa=", "bbb="], "bbb="));
        assert!(!find_pinned_key(&["aaa=", "bbb="], "ccc="));
        assert!(!find_pinned_key(&[], "aaa="));
    }

    #[test]
    fn matching_pin_accepts_the_certificate() {
        let cert = self_signed_cert();
        let hash = spki_sha256_base64(&cert).unwrap();
        let pins = leak_pins(vec![hash]);

        // skip_ca: the test certificate is self-signed; only the pin check
        // is under test here.
        let verifier = PinnedCertVerifier::new(pins, true).unwrap();
        let name = ServerName::try_from("api.vantagevpn.net").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn pin_miss_refuses_the_certificate() {
        let cert = self_signed_cert();
        let pins = leak_pins(vec!["TcyaOmkcgYCSCv1BxJk1aywWfOTKKgd/qAiIQMjRzPk=".to_string()]);

        let verifier = PinnedCertVerifier::new(pins, true).unwrap();
        let name = ServerName::try_from("api.vantagevpn.net").unwrap();
        let err = verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert!(err.to_string().contains("pinned certificate key not found"));
    }

    #[test]
    fn empty_pin_set_degrades_to_ca_only() {
        let cert = self_signed_cert();
        let verifier = PinnedCertVerifier::new(&[], true).unwrap();
        let name = ServerName::try_from("api.vantagevpn.net").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn garbage_certificate_reports_a_marshalling_error() {
        let garbage = CertificateDer::from(vec![0u8; 16]);
        assert!(spki_sha256_base64(&garbage).is_err());
    }
}
