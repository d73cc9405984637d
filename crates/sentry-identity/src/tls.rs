//! Transport security for the connection to sentry.
//!
//! With [`ChannelSecurity::Mtls`] the requester presents its own workload
//! certificate and accepts the server only if it chains to the trust bundle
//! and carries exactly the configured CA SPIFFE ID. DNS names are not checked.
//!
//! # Example
//!
//! ```ignore
//! use sentry_identity::{ChannelSecurity, MtlsCredentials, SpiffeId};
//!
//! let creds = MtlsCredentials::from_paths("tls.crt", "tls.key", "ca.crt").await?;
//! let ca_id = SpiffeId::parse("spiffe://cluster.local/ns/dapr-system/dapr-sentry")?;
//! let config = creds.client_config(&ca_id)?;
//! ```

use crate::certificate::{parse_cert_chain_pem, parse_pem_block, spiffe_id_from_cert};
use crate::csr::PRIVATE_KEY_PEM_LABEL;
use crate::identity::SpiffeId;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

const EC_PRIVATE_KEY_PEM_LABEL: &str = "EC PRIVATE KEY";

/// How the channel to sentry is secured.
#[derive(Debug, Clone, Default)]
pub enum ChannelSecurity {
    /// Plaintext HTTP/2. Only for tests and local development.
    #[default]
    Insecure,
    /// Mutual TLS with SPIFFE peer verification.
    Mtls(MtlsCredentials),
}

/// Client certificate, key and trust bundle for mutual TLS.
#[derive(Clone)]
pub struct MtlsCredentials {
    cert_chain_pem: String,
    key_pem: Zeroizing<String>,
    trust_bundle_pem: String,
}

impl MtlsCredentials {
    /// Creates credentials from PEM text.
    pub fn new(
        cert_chain_pem: impl Into<String>,
        key_pem: impl Into<String>,
        trust_bundle_pem: impl Into<String>,
    ) -> Self {
        Self {
            cert_chain_pem: cert_chain_pem.into(),
            key_pem: Zeroizing::new(key_pem.into()),
            trust_bundle_pem: trust_bundle_pem.into(),
        }
    }

    /// Reads credentials from PEM files.
    pub async fn from_paths(
        cert_chain: impl AsRef<Path>,
        key: impl AsRef<Path>,
        trust_bundle: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_chain_pem = read_pem_file(cert_chain.as_ref()).await?;
        let key_pem = Zeroizing::new(read_pem_file(key.as_ref()).await?);
        let trust_bundle_pem = read_pem_file(trust_bundle.as_ref()).await?;

        Ok(Self {
            cert_chain_pem,
            key_pem,
            trust_bundle_pem,
        })
    }

    /// Builds a rustls client config that authenticates with these
    /// credentials and only accepts a server presenting `ca_id`.
    pub fn client_config(&self, ca_id: &SpiffeId) -> Result<ClientConfig> {
        let provider = Arc::new(default_provider());

        let mut roots = RootCertStore::empty();
        let bundle = parse_cert_chain_pem(self.trust_bundle_pem.as_bytes())?;
        if bundle.is_empty() {
            return Err(Error::Certificate(
                "no certificates found in trust bundle".to_string(),
            ));
        }
        for der in bundle {
            roots
                .add(CertificateDer::from(der))
                .map_err(|e| Error::Certificate(format!("failed to add root cert: {e}")))?;
        }

        let cert_chain: Vec<CertificateDer<'static>> =
            parse_cert_chain_pem(self.cert_chain_pem.as_bytes())?
                .into_iter()
                .map(CertificateDer::from)
                .collect();
        if cert_chain.is_empty() {
            return Err(Error::Certificate(
                "no certificates found in client certificate chain".to_string(),
            ));
        }
        let private_key = parse_private_key(&self.key_pem)?;

        let verifier = SpiffeServerCertVerifier::new(roots, ca_id.clone(), provider.clone());

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Certificate(format!("unsupported protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(cert_chain, private_key)
            .map_err(|e| Error::Certificate(format!("failed to build client config: {e}")))?;
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(config)
    }
}

impl std::fmt::Debug for MtlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsCredentials")
            .field("cert_chain_pem_len", &self.cert_chain_pem.len())
            .field("key_pem", &"[REDACTED]")
            .field("trust_bundle_pem_len", &self.trust_bundle_pem.len())
            .finish()
    }
}

/// TLS server name for the CA. The verifier ignores it, but rustls needs one
/// for SNI and session resumption.
pub(crate) fn server_name_for(ca_id: &SpiffeId) -> Result<ServerName<'static>> {
    ServerName::try_from(ca_id.trust_domain().to_string()).map_err(|e| {
        Error::InvalidConfig(format!(
            "invalid server name '{}': {e}",
            ca_id.trust_domain()
        ))
    })
}

/// Accepts a server certificate that chains to the trust bundle and whose
/// URI SAN is exactly the expected SPIFFE ID.
#[derive(Debug)]
struct SpiffeServerCertVerifier {
    roots: RootCertStore,
    expected: SpiffeId,
    provider: Arc<CryptoProvider>,
}

impl SpiffeServerCertVerifier {
    fn new(roots: RootCertStore, expected: SpiffeId, provider: Arc<CryptoProvider>) -> Self {
        Self {
            roots,
            expected,
            provider,
        }
    }
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = webpki::EndEntityCert::try_from(end_entity).map_err(|_| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;

        cert.verify_for_usage(
            self.provider.signature_verification_algorithms.all,
            &self.roots.roots,
            intermediates,
            now,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| {
            tracing::debug!(error = ?e, "sentry certificate chain verification failed");
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer)
        })?;

        let presented = spiffe_id_from_cert(end_entity.as_ref())
            .ok()
            .flatten()
            .ok_or_else(|| {
                tracing::debug!("sentry certificate has no SPIFFE URI SAN");
                rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                )
            })?;

        if presented != self.expected {
            tracing::debug!(
                expected = %self.expected,
                presented = %presented,
                "sentry presented an unexpected identity"
            );
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(crate) fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    if pem.contains(EC_PRIVATE_KEY_PEM_LABEL) {
        let der = parse_pem_block(pem.as_bytes(), EC_PRIVATE_KEY_PEM_LABEL)?;
        return Ok(PrivateKeyDer::Sec1(der.into()));
    }
    let der = parse_pem_block(pem.as_bytes(), PRIVATE_KEY_PEM_LABEL)?;
    Ok(PrivateKeyDer::Pkcs8(der.into()))
}

async fn read_pem_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::InvalidConfig(format!("failed to read '{}': {e}", path.display()))
    })
}
