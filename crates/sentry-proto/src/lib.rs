//! Generated gRPC types for the sentry certificate authority.
//!
//! # Example
//!
//! ```ignore
//! use sentry_proto::sentry::certificate_authority_client::CertificateAuthorityClient;
//!
//! let mut client = CertificateAuthorityClient::new(channel);
//! let response = client.sign_certificate(request).await?;
//! ```

#![allow(missing_docs)]
#![allow(clippy::doc_overindented_list_items)]

/// Generated types for `sentry.v1`.
pub mod sentry {
    tonic::include_proto!("sentry.v1");
}

pub use sentry::certificate_authority_client::CertificateAuthorityClient;
pub use sentry::certificate_authority_server::{CertificateAuthority, CertificateAuthorityServer};
pub use sentry::sign_certificate_request::TokenValidator;
pub use sentry::{SignCertificateRequest, SignCertificateResponse};

