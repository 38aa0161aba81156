//! Upstream certificate validation routed through the certificate hook.
//!
//! The webpki verifier does the actual chain and name checks; its verdict is
//! handed to the hook as an error list, and the hook has the final say.

use std::sync::Arc;

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};

use detour_core::{CertificateCheck, HookSet};

use crate::error::{ProxyError, Result};

/// Verifier that consults the certificate hook with webpki's findings.
#[derive(Debug)]
pub struct HookedCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    hooks: HookSet,
}

impl HookedCertVerifier {
    /// Builds a verifier over the bundled Mozilla root set.
    pub fn new(hooks: HookSet, provider: Arc<CryptoProvider>) -> Result<Self> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        Ok(Self { inner, hooks })
    }
}

impl ServerCertVerifier for HookedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        let verdict = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let errors = match &verdict {
            Ok(_) => Vec::new(),
            Err(e) => vec![e.to_string()],
        };

        let name = server_name.to_str();
        let check = CertificateCheck {
            server_name: &name,
            certificate_der: end_entity.as_ref(),
            errors: &errors,
        };

        if self.hooks.accept_certificate(&check) {
            Ok(ServerCertVerified::assertion())
        } else {
            verdict.and(Err(TlsError::General(format!(
                "certificate for {} rejected",
                name
            ))))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client TLS settings for upstream connections, verified through
/// [`HookedCertVerifier`]. Shared by the HTTP and websocket connectors.
pub fn upstream_tls_config(hooks: HookSet) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(default_provider());
    let verifier = Arc::new(HookedCertVerifier::new(hooks, Arc::clone(&provider))?);

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Builds the upstream HTTP connector: HTTPS with `config`, plain HTTP as-is.
pub fn https_connector(config: &ClientConfig) -> HttpsConnector<HttpConnector> {
    HttpsConnectorBuilder::new()
        .with_tls_config(config.clone())
        .https_or_http()
        .enable_http1()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn verifier(hooks: HookSet) -> HookedCertVerifier {
        HookedCertVerifier::new(hooks, Arc::new(default_provider())).unwrap()
    }

    #[test]
    fn garbage_certificate_reaches_hook_with_errors() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let hook: detour_core::CertValidationHook = Arc::new(move |check: &CertificateCheck<'_>| {
            assert_eq!(check.server_name, "game.example.com");
            assert!(!check.errors.is_empty());
            seen_clone.fetch_add(1, Ordering::SeqCst);
            false
        });
        let hooks = HookSet {
            cert_validation: Some(hook),
            ..HookSet::default()
        };

        let cert = CertificateDer::from(vec![0x30, 0x00]);
        let name = ServerName::try_from("game.example.com").unwrap();
        let result = verifier(hooks).verify_server_cert(&cert, &[], &name, &[], UnixTime::now());

        assert!(result.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_can_accept_despite_errors() {
        let hook: detour_core::CertValidationHook = Arc::new(|_: &CertificateCheck<'_>| true);
        let hooks = HookSet {
            cert_validation: Some(hook),
            ..HookSet::default()
        };

        let cert = CertificateDer::from(vec![0x30, 0x00]);
        let name = ServerName::try_from("game.example.com").unwrap();
        let result = verifier(hooks).verify_server_cert(&cert, &[], &name, &[], UnixTime::now());

        assert!(result.is_ok());
    }

    #[test]
    fn default_hooks_reject_invalid_certificate() {
        let cert = CertificateDer::from(vec![0x30, 0x00]);
        let name = ServerName::try_from("game.example.com").unwrap();
        let result =
            verifier(HookSet::default()).verify_server_cert(&cert, &[], &name, &[], UnixTime::now());

        assert!(result.is_err());
    }

    #[test]
    fn upstream_connector_builds() {
        let config = upstream_tls_config(HookSet::default()).unwrap();
        let _connector = https_connector(&config);
    }
}
