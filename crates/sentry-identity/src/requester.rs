//! The certificate requester.
//!
//! A [`Requester`] owns one channel to sentry for its whole lifetime and
//! turns each call to [`Requester::request_certificate`] into a fresh key, a
//! CSR, a bootstrap token and a bounded-retry `SignCertificate` exchange.
//! Concurrent requests share only the channel; keys, CSRs and tokens are
//! never shared between calls.

use crate::certificate::{verify_chain_matches_key, IssuedCertificate};
use crate::connection::{CaChannel, DEFAULT_CONNECT_TIMEOUT};
use crate::csr::{CertSign, PLACEHOLDER_ID};
use crate::identity::SpiffeId;
use crate::platform::{DeploymentMode, PlatformDetector};
use crate::retry::{call_with_retry, is_retryable_status, RetryError, RetryPolicy};
use crate::tls::ChannelSecurity;
use crate::token::TokenSource;
use crate::{Error, Result};
use sentry_proto::SignCertificateRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings for [`Requester::new`].
#[derive(Debug, Clone)]
pub struct RequesterOptions {
    /// `host:port` of the sentry service.
    pub ca_address: String,
    /// SPIFFE ID the CA must present when dialing with mTLS.
    pub ca_id: SpiffeId,
    /// Dial security.
    pub security: ChannelSecurity,
    /// How long construction waits for the CA to become reachable.
    pub connect_timeout: Duration,
    /// Retry policy for the signing call.
    pub retry: RetryPolicy,
}

impl RequesterOptions {
    /// Options with an insecure channel and default timeouts.
    pub fn new(ca_address: impl Into<String>, ca_id: SpiffeId) -> Self {
        Self {
            ca_address: ca_address.into(),
            ca_id,
            security: ChannelSecurity::Insecure,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the dial security.
    pub fn with_security(mut self, security: ChannelSecurity) -> Self {
        self.security = security;
        self
    }

    /// Sets the construction deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the signing retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Requests workload certificates from sentry over a shared channel.
///
/// Safe to share across tasks; `request_certificate` takes `&self`.
pub struct Requester {
    channel: CaChannel,
    mode: DeploymentMode,
    token_source: Arc<dyn TokenSource>,
    retry: RetryPolicy,
}

impl Requester {
    /// Connects to sentry and returns a ready requester.
    ///
    /// The deployment mode is detected once, here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the CA is not reachable within
    /// `opts.connect_timeout`. No requester exists in that case.
    pub async fn new(
        opts: RequesterOptions,
        detector: &dyn PlatformDetector,
        token_source: impl TokenSource + 'static,
    ) -> Result<Self> {
        let mode = detector.detect();
        let channel = CaChannel::connect(
            &opts.ca_address,
            &opts.ca_id,
            &opts.security,
            opts.connect_timeout,
        )
        .await?;

        info!(ca_address = %opts.ca_address, mode = %mode, "sentry requester ready");

        Ok(Self {
            channel,
            mode,
            token_source: Arc::new(token_source),
            retry: opts.retry,
        })
    }

    /// Returns the deployment mode detected at construction.
    pub fn deployment_mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Returns the CA address.
    pub fn ca_address(&self) -> &str {
        self.channel.address()
    }

    /// Requests a certificate for a workload in `namespace`.
    ///
    /// On success the returned chain is sentry's response, unmodified, and
    /// the key is the PKCS#8 PEM of the key pair generated for this call.
    ///
    /// # Errors
    ///
    /// - [`Error::KeyGeneration`] / [`Error::CsrBuild`] before anything is sent
    /// - [`Error::TokenUnavailable`] if no token could be obtained; no RPC is made
    /// - [`Error::SigningRejected`] on the first non-transient CA error
    /// - [`Error::SigningUnavailable`] when every attempt failed transiently
    /// - [`Error::InvalidResponse`] if the chain does not match the key
    /// - [`Error::Cancelled`] if `cancel` fires first
    pub async fn request_certificate(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<IssuedCertificate> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let cert_sign = CertSign::generate()?;

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            token = self.token_source.token(self.mode) => token?,
        };
        debug!(
            namespace = %namespace,
            validator = ?token.validator(),
            mode = %self.mode,
            "requesting certificate from sentry"
        );

        let request = SignCertificateRequest {
            id: PLACEHOLDER_ID.to_string(),
            token: token.token().to_string(),
            namespace: namespace.to_string(),
            certificate_signing_request: cert_sign.csr_pem().into_bytes(),
            token_validator: token.validator() as i32,
        };

        let client = self.channel.client();
        let outcome = call_with_retry(
            &self.retry,
            cancel,
            "sign_certificate",
            || {
                let mut client = client.clone();
                let request = tonic::Request::new(request.clone());
                async move { client.sign_certificate(request).await }
            },
            is_retryable_status,
        )
        .await;

        let (response, attempts) = match outcome {
            Ok(ok) => ok,
            Err(RetryError::Rejected { error, .. }) => {
                warn!(
                    namespace = %namespace,
                    code = ?error.code(),
                    "sentry rejected certificate request"
                );
                return Err(Error::SigningRejected {
                    code: error.code(),
                    message: error.message().to_string(),
                });
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                return Err(Error::SigningUnavailable {
                    attempts,
                    last_error,
                })
            }
            Err(RetryError::Cancelled { attempts }) => {
                debug!(namespace = %namespace, attempts, "certificate request cancelled");
                return Err(Error::Cancelled);
            }
        };

        let chain_pem = response.into_inner().workload_certificate;
        verify_chain_matches_key(&chain_pem, &cert_sign.public_key_der())?;

        info!(namespace = %namespace, attempts, "received workload certificate");
        Ok(IssuedCertificate::new(
            chain_pem,
            cert_sign.into_private_key_pem(),
        ))
    }

    /// Closes the channel to sentry.
    ///
    /// Equivalent to dropping the requester: the channel is torn down once
    /// the last clone held by an in-flight request is released.
    pub fn close(self) {
        debug!(ca_address = %self.channel.address(), "closing sentry requester");
    }
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("ca_address", &self.channel.address())
            .field("mode", &self.mode)
            .field("retry", &self.retry)
            .finish()
    }
}
