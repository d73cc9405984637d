//! X.509 and PEM handling for issued workload certificates.

use crate::identity::{Identity, SpiffeId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use zeroize::Zeroizing;

const CERTIFICATE_PEM_LABEL: &str = "CERTIFICATE";

/// A certificate chain issued by sentry and the private key it was issued for.
///
/// The chain is kept exactly as the CA returned it. The key is the one
/// generated for the same request; the two are never mixed across requests.
#[derive(Clone)]
pub struct IssuedCertificate {
    chain_pem: Vec<u8>,
    private_key_pem: Zeroizing<Vec<u8>>,
}

impl IssuedCertificate {
    pub(crate) fn new(chain_pem: Vec<u8>, private_key_pem: Zeroizing<Vec<u8>>) -> Self {
        Self {
            chain_pem,
            private_key_pem,
        }
    }

    /// Returns the PEM-encoded certificate chain, leaf first.
    pub fn chain_pem(&self) -> &[u8] {
        &self.chain_pem
    }

    /// Returns the PEM-encoded PKCS#8 private key.
    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    /// Consumes self and returns `(chain_pem, private_key_pem)`.
    pub fn into_parts(self) -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        (self.chain_pem, self.private_key_pem)
    }

    /// Returns the DER-encoded certificates of the chain.
    pub fn chain_der(&self) -> Result<Vec<Vec<u8>>> {
        parse_cert_chain_pem(&self.chain_pem)
    }

    /// Returns the identity sentry assigned in the leaf certificate.
    pub fn identity(&self) -> Result<Identity> {
        let chain = self.chain_der()?;
        let id = leaf(&chain)
            .and_then(spiffe_id_from_cert)?
            .ok_or_else(|| Error::Certificate("no SPIFFE URI found in leaf SAN".to_string()))?;
        Identity::from_spiffe_id(&id)
    }

    /// Returns the leaf certificate's not-after time.
    pub fn expiry(&self) -> Result<DateTime<Utc>> {
        let chain = self.chain_der()?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf(&chain)?)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

        DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::Certificate("invalid not_after timestamp".to_string()))
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_pem_len", &self.chain_pem.len())
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Checks that a chain returned by the CA is usable with the generated key:
/// at least one certificate, and the leaf's public key equals `public_key_der`.
pub(crate) fn verify_chain_matches_key(chain_pem: &[u8], public_key_der: &[u8]) -> Result<()> {
    let chain = parse_cert_chain_pem(chain_pem)
        .map_err(|e| Error::InvalidResponse(format!("unparseable certificate chain: {e}")))?;
    let leaf = leaf(&chain).map_err(|e| Error::InvalidResponse(e.to_string()))?;

    let leaf_key = leaf_public_key_der(leaf)
        .map_err(|e| Error::InvalidResponse(format!("unparseable leaf certificate: {e}")))?;
    if leaf_key != public_key_der {
        return Err(Error::InvalidResponse(
            "leaf certificate public key does not match the requested key".to_string(),
        ));
    }
    Ok(())
}

/// Returns the DER SubjectPublicKeyInfo of a DER certificate.
pub fn leaf_public_key_der(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
    Ok(cert.public_key().raw.to_vec())
}

/// Returns the first SPIFFE URI SAN of a DER certificate, if any.
pub fn spiffe_id_from_cert(cert_der: &[u8]) -> Result<Option<SpiffeId>> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::URI(uri) = name {
                    if uri.starts_with("spiffe://") {
                        return SpiffeId::parse(uri).map(Some);
                    }
                }
            }
        }
    }
    Ok(None)
}

/// Parses a PEM bundle into DER certificates. Non-certificate blocks are
/// skipped.
pub fn parse_cert_chain_pem(pem_bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let blocks = pem::parse_many(pem_bytes)
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;

    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_PEM_LABEL)
        .map(|block| block.into_contents())
        .collect())
}

/// Parses a single PEM block with the given label into DER.
pub fn parse_pem_block(pem_bytes: &[u8], label: &str) -> Result<Vec<u8>> {
    let block = pem::parse(pem_bytes)
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
    if block.tag() != label {
        return Err(Error::Certificate(format!(
            "expected PEM block {label}, found {}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

/// Encodes DER bytes as a PEM block with LF line endings.
pub(crate) fn encode_pem(label: &str, der: &[u8]) -> String {
    let block = pem::Pem::new(label, der);
    pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

fn leaf(chain: &[Vec<u8>]) -> Result<&[u8]> {
    chain
        .first()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Certificate("empty certificate chain".to_string()))
}
