//! Workload identity bootstrap against the sentry certificate authority.
//!
//! Before a sidecar can take part in the mTLS mesh it needs a short-lived
//! X.509 certificate, signed by sentry, binding a freshly generated key to a
//! SPIFFE identity. This crate is the requester side of that exchange.
//!
//! # Components
//!
//! - [`identity`] - SPIFFE ID and workload identity types
//! - [`csr`] - Ephemeral P-256 key and certificate request generation
//! - [`platform`] - Deployment mode detection
//! - [`token`] - Bootstrap token sources
//! - [`tls`] - Dial security for the CA channel (insecure or SPIFFE mTLS)
//! - [`connection`] - The long-lived channel to the CA
//! - [`retry`] - Bounded retry with per-attempt timeouts
//! - [`requester`] - Orchestrates the above into `request_certificate`
//! - [`certificate`] - PEM/X.509 helpers and the issued certificate type
//!
//! # Example
//!
//! ```ignore
//! use sentry_identity::{EnvPlatformDetector, FileTokenSource, Requester, RequesterOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let opts = RequesterOptions::new("sentry.control-plane.svc:443", ca_id);
//! let requester = Requester::new(opts, &EnvPlatformDetector, FileTokenSource::default()).await?;
//!
//! let issued = requester
//!     .request_certificate(&CancellationToken::new(), "default")
//!     .await?;
//! println!("issued {}", issued.identity()?);
//! ```

pub mod certificate;
pub mod connection;
pub mod csr;
pub mod identity;
pub mod platform;
pub mod requester;
pub mod retry;
pub mod tls;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use certificate::IssuedCertificate;
pub use connection::CaChannel;
pub use csr::{CertSign, PLACEHOLDER_ID};
pub use identity::{Identity, SpiffeId};
pub use platform::{DeploymentMode, EnvPlatformDetector, FixedPlatform, PlatformDetector};
pub use requester::{Requester, RequesterOptions};
pub use retry::RetryPolicy;
pub use tls::{ChannelSecurity, MtlsCredentials};
pub use token::{BootstrapToken, FileTokenSource, StaticTokenSource, TokenSource};

/// Errors that can occur while bootstrapping a workload identity.
///
/// Each variant belongs to exactly one phase of the exchange; see
/// [`Error::phase`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The ephemeral key pair could not be generated.
    #[error("failed to generate private key: {0}")]
    KeyGeneration(String),

    /// The certificate signing request could not be built or encoded.
    #[error("failed to create sidecar csr: {0}")]
    CsrBuild(String),

    /// No bootstrap token could be obtained for the deployment mode.
    #[error("error obtaining token: {0}")]
    TokenUnavailable(String),

    /// The channel to the CA could not be established before the deadline.
    #[error("error establishing connection to sentry: {0}")]
    Connection(String),

    /// The CA answered and refused to sign. Never retried.
    #[error("sentry rejected SignCertificate ({code:?}): {message}")]
    SigningRejected {
        /// gRPC status code returned by the CA.
        code: tonic::Code,
        /// Status message returned by the CA.
        message: String,
    },

    /// Every attempt failed with a transient transport error.
    #[error("sentry unavailable after {attempts} attempts: {last_error}")]
    SigningUnavailable {
        /// Number of attempts made.
        attempts: u32,
        /// The last transient failure observed.
        last_error: String,
    },

    /// The CA answered with a chain that cannot be used with the generated key.
    #[error("invalid response from sentry: {0}")]
    InvalidResponse(String),

    /// The caller cancelled the request.
    #[error("certificate request cancelled")]
    Cancelled,

    /// Malformed SPIFFE ID.
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// Certificate or key material could not be parsed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Invalid requester configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The phase of a certificate request an [`Error`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Key pair generation.
    KeyGeneration,
    /// CSR construction.
    CsrBuild,
    /// Bootstrap token fetch.
    TokenFetch,
    /// Channel establishment at construction.
    Connect,
    /// The signing RPC and its response.
    CaExchange,
    /// Caller cancellation.
    Cancelled,
    /// Anything outside a request (parsing, configuration, I/O).
    Setup,
}

impl Error {
    /// Returns the phase this error belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            Error::KeyGeneration(_) => Phase::KeyGeneration,
            Error::CsrBuild(_) => Phase::CsrBuild,
            Error::TokenUnavailable(_) => Phase::TokenFetch,
            Error::Connection(_) => Phase::Connect,
            Error::SigningRejected { .. }
            | Error::SigningUnavailable { .. }
            | Error::InvalidResponse(_) => Phase::CaExchange,
            Error::Cancelled => Phase::Cancelled,
            Error::InvalidSpiffeId(_)
            | Error::Certificate(_)
            | Error::InvalidConfig(_)
            | Error::Io(_) => Phase::Setup,
        }
    }
}

/// Result type for sentry-identity operations.
pub type Result<T> = std::result::Result<T, Error>;
