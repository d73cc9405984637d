//! SPIFFE identity types and parsing.
//!
//! A SPIFFE ID is a URI with the scheme `spiffe://` followed by a trust
//! domain and a workload path. Sentry issues workload identities of the form:
//!
//! ```text
//! spiffe://trust-domain/ns/namespace/app-id
//! ```
//!
//! The requester never asserts this identity itself; it only reads back what
//! the CA put into the issued certificate.
//!
//! # Example
//!
//! ```
//! use sentry_identity::{Identity, SpiffeId};
//!
//! let id = Identity::try_new("cluster.local", "default", "checkout").unwrap();
//! assert_eq!(id.to_spiffe_uri(), "spiffe://cluster.local/ns/default/checkout");
//!
//! let sentry: SpiffeId = "spiffe://cluster.local/ns/control-plane/sentry".parse().unwrap();
//! assert_eq!(sentry.trust_domain(), "cluster.local");
//! ```

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

const SPIFFE_SCHEME: &str = "spiffe://";
const MAX_SPIFFE_ID_LEN: usize = 2048;
const MAX_TRUST_DOMAIN_LEN: usize = 255;

/// A parsed and validated SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: String,
    path: String,
}

impl SpiffeId {
    /// Parses a SPIFFE URI.
    ///
    /// Trust domains are lowercased; the path keeps its case. An ID without a
    /// path (`spiffe://example.org`) is valid and identifies the trust domain.
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.len() > MAX_SPIFFE_ID_LEN {
            return Err(Error::InvalidSpiffeId(format!(
                "exceeds maximum length ({MAX_SPIFFE_ID_LEN} bytes): {} bytes",
                uri.len()
            )));
        }

        let rest = uri
            .strip_prefix(SPIFFE_SCHEME)
            .ok_or_else(|| Error::InvalidSpiffeId(format!("must start with spiffe://: {uri}")))?;

        let (trust_domain, path) = match rest.split_once('/') {
            Some((td, path)) => (td, Some(path)),
            None => (rest, None),
        };

        let trust_domain = trust_domain.to_ascii_lowercase();
        validate_trust_domain(&trust_domain)?;

        let path = match path {
            None => String::new(),
            Some(path) => {
                for segment in path.split('/') {
                    validate_path_segment(segment, "path segment")?;
                }
                format!("/{path}")
            }
        };

        Ok(Self { trust_domain, path })
    }

    /// Builds a SPIFFE ID from a trust domain and path segments.
    pub fn from_segments<'a>(
        trust_domain: &str,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let trust_domain = trust_domain.to_ascii_lowercase();
        validate_trust_domain(&trust_domain)?;

        let mut path = String::new();
        for segment in segments {
            validate_path_segment(segment, "path segment")?;
            path.push('/');
            path.push_str(segment);
        }

        Ok(Self { trust_domain, path })
    }

    /// Returns the trust domain.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the path, including its leading slash, or an empty string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SPIFFE_SCHEME}{}{}", self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A workload identity assigned by sentry.
///
/// Contains the trust domain, namespace and app id of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    trust_domain: String,
    namespace: String,
    app_id: String,
}

impl Identity {
    /// Creates a new identity, validating every component.
    ///
    /// # Errors
    ///
    /// Returns an error if any component is empty or contains characters not
    /// permitted in a SPIFFE ID.
    pub fn try_new(
        trust_domain: impl Into<String>,
        namespace: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Result<Self> {
        let trust_domain = trust_domain.into().to_ascii_lowercase();
        let namespace = namespace.into();
        let app_id = app_id.into();

        validate_trust_domain(&trust_domain)?;
        validate_path_segment(&namespace, "namespace")?;
        validate_path_segment(&app_id, "app id")?;

        Ok(Self {
            trust_domain,
            namespace,
            app_id,
        })
    }

    /// Interprets a SPIFFE ID of the form `spiffe://td/ns/<namespace>/<app-id>`.
    pub fn from_spiffe_id(id: &SpiffeId) -> Result<Self> {
        let segments: Vec<&str> = id.segments().collect();
        match segments.as_slice() {
            ["ns", namespace, app_id] => Self::try_new(id.trust_domain(), *namespace, *app_id),
            _ => Err(Error::InvalidSpiffeId(format!(
                "expected /ns/<namespace>/<app-id>, got: {id}"
            ))),
        }
    }

    /// Parses a workload identity from a SPIFFE URI.
    pub fn from_spiffe_uri(uri: &str) -> Result<Self> {
        Self::from_spiffe_id(&SpiffeId::parse(uri)?)
    }

    /// Returns the SPIFFE ID of this identity.
    pub fn to_spiffe_id(&self) -> SpiffeId {
        SpiffeId {
            trust_domain: self.trust_domain.clone(),
            path: format!("/ns/{}/{}", self.namespace, self.app_id),
        }
    }

    /// Returns the SPIFFE URI of this identity.
    pub fn to_spiffe_uri(&self) -> String {
        self.to_spiffe_id().to_string()
    }

    /// Returns the trust domain.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the app id.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SPIFFE_SCHEME}{}/ns/{}/{}",
            self.trust_domain, self.namespace, self.app_id
        )
    }
}

/// Validates a trust domain name.
///
/// Trust domains are lowercase letters, digits, dots, dashes and underscores.
fn validate_trust_domain(trust_domain: &str) -> Result<()> {
    if trust_domain.is_empty() {
        return Err(Error::InvalidSpiffeId("empty trust domain".to_string()));
    }
    if trust_domain.len() > MAX_TRUST_DOMAIN_LEN {
        return Err(Error::InvalidSpiffeId(format!(
            "trust domain exceeds maximum length ({MAX_TRUST_DOMAIN_LEN} bytes)"
        )));
    }
    if !trust_domain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
    {
        return Err(Error::InvalidSpiffeId(format!(
            "invalid trust domain characters: {trust_domain}"
        )));
    }
    Ok(())
}

/// Validates a single path segment.
///
/// Segments MUST contain only letters, numbers, dots, dashes and underscores,
/// and cannot be empty or a relative path modifier.
fn validate_path_segment(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidSpiffeId(format!("empty {name}")));
    }

    if value == "." || value == ".." {
        return Err(Error::InvalidSpiffeId(format!(
            "{name} cannot be a relative path modifier: {value}"
        )));
    }

    for c in value.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(Error::InvalidSpiffeId(format!(
                "{name} contains invalid character '{}' (only a-zA-Z0-9.-_ allowed): {value}",
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                }
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_spiffe_id() {
        let id = SpiffeId::parse("spiffe://Cluster.Local/ns/control-plane/sentry").unwrap();
        assert_eq!(id.trust_domain(), "cluster.local");
        assert_eq!(id.path(), "/ns/control-plane/sentry");
        assert_eq!(
            id.to_string(),
            "spiffe://cluster.local/ns/control-plane/sentry"
        );
    }

    #[test]
    fn test_parse_trust_domain_only() {
        let id = SpiffeId::parse("spiffe://example.org").unwrap();
        assert_eq!(id.path(), "");
        assert_eq!(id.segments().count(), 0);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for uri in [
            "https://example.org/ns/default/app",
            "spiffe://",
            "spiffe:///ns/default",
            "spiffe://example.org/",
            "spiffe://example.org//app",
            "spiffe://example.org/ns/../app",
            "spiffe://example.org/ns/%2e%2e/app",
            "spiffe://exa mple.org/app",
            "spiffe://example.org/app?query",
        ] {
            assert!(SpiffeId::parse(uri).is_err(), "should reject {uri}");
        }
    }

    #[test]
    fn test_parse_rejects_oversized() {
        let uri = format!("spiffe://example.org/{}", "a".repeat(MAX_SPIFFE_ID_LEN));
        assert!(SpiffeId::parse(&uri).is_err());
    }

    #[test]
    fn test_from_segments() {
        let id = SpiffeId::from_segments("example.org", ["ns", "default", "app"]).unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/ns/default/app");
        assert!(SpiffeId::from_segments("example.org", ["ns", ""]).is_err());
    }

    #[test]
    fn test_identity_roundtrip() {
        let identity = Identity::try_new("cluster.local", "payments", "ledger").unwrap();
        let parsed = Identity::from_spiffe_uri(&identity.to_spiffe_uri()).unwrap();
        assert_eq!(parsed, identity);
        assert_eq!(parsed.namespace(), "payments");
        assert_eq!(parsed.app_id(), "ledger");
        assert_eq!(identity.to_string(), identity.to_spiffe_uri());
    }

    #[test]
    fn test_identity_requires_namespaced_path() {
        assert!(Identity::from_spiffe_uri("spiffe://cluster.local/ledger").is_err());
        assert!(Identity::from_spiffe_uri("spiffe://cluster.local/ns/payments").is_err());
        assert!(Identity::from_spiffe_uri("spiffe://cluster.local/sa/payments/ledger").is_err());
    }

    #[test]
    fn test_identity_rejects_injection() {
        for payload in ["'; DROP TABLE certs; --", "a/b", "..", "ns\0", "*)(uid=*"] {
            assert!(
                Identity::try_new("cluster.local", payload, "app").is_err(),
                "should reject namespace {payload:?}"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = SpiffeId::parse(&s);
        }

        #[test]
        fn prop_valid_identity_roundtrips(
            td in "[a-z0-9][a-z0-9.-]{0,30}",
            ns in "[A-Za-z0-9_-][A-Za-z0-9._-]{0,30}",
            app in "[A-Za-z0-9_-][A-Za-z0-9._-]{0,30}",
        ) {
            let identity = Identity::try_new(td, ns, app).unwrap();
            let parsed = Identity::from_spiffe_uri(&identity.to_spiffe_uri()).unwrap();
            prop_assert_eq!(parsed, identity);
        }
    }
}
