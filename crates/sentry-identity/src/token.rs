//! Bootstrap token sources.
//!
//! A bootstrap token proves the workload's platform identity to sentry. The
//! requester treats it as opaque: it is read, passed through unmodified with
//! its validator discriminator, and never logged.
//!
//! [`FileTokenSource`] resolves a token in this order:
//!
//! 1. An explicit token file (`SENTRY_TOKEN_FILE`), validated with JWKS.
//! 2. In Kubernetes, the projected sentry token, falling back to the legacy
//!    service account token.
//! 3. Self-hosted without a token file: no token, `INSECURE` validator.

use crate::platform::DeploymentMode;
use crate::{Error, Result};
use async_trait::async_trait;
use sentry_proto::TokenValidator;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Environment variable naming an explicit token file.
pub const SENTRY_TOKEN_FILE_ENV: &str = "SENTRY_TOKEN_FILE";

/// Projected service account token with the sentry audience.
pub const DEFAULT_KUBERNETES_TOKEN_PATH: &str = "/var/run/secrets/sentry/token";

/// Default service account token mounted into every pod.
pub const DEFAULT_LEGACY_KUBERNETES_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// A bootstrap token and the validator sentry should apply to it.
#[derive(Clone)]
pub struct BootstrapToken {
    token: Zeroizing<String>,
    validator: TokenValidator,
}

impl BootstrapToken {
    /// Creates a token.
    pub fn new(token: impl Into<String>, validator: TokenValidator) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
            validator,
        }
    }

    /// A request without a token; the CA decides whether to accept it.
    pub fn insecure() -> Self {
        Self::new(String::new(), TokenValidator::Insecure)
    }

    /// Returns the opaque token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the validator discriminator.
    pub fn validator(&self) -> TokenValidator {
        self.validator
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("token", &"[REDACTED]")
            .field("validator", &self.validator)
            .finish()
    }
}

/// Supplies a bootstrap token for a deployment mode.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns the token to present to the CA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenUnavailable`] if no usable token exists.
    async fn token(&self, mode: DeploymentMode) -> Result<BootstrapToken>;
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(BootstrapToken);

impl StaticTokenSource {
    /// Creates a source returning `token`.
    pub fn new(token: BootstrapToken) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _mode: DeploymentMode) -> Result<BootstrapToken> {
        Ok(self.0.clone())
    }
}

/// Reads bootstrap tokens from the filesystem.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    token_file: Option<PathBuf>,
    kubernetes_path: PathBuf,
    legacy_kubernetes_path: PathBuf,
}

impl Default for FileTokenSource {
    fn default() -> Self {
        Self {
            token_file: None,
            kubernetes_path: PathBuf::from(DEFAULT_KUBERNETES_TOKEN_PATH),
            legacy_kubernetes_path: PathBuf::from(DEFAULT_LEGACY_KUBERNETES_TOKEN_PATH),
        }
    }
}

impl FileTokenSource {
    /// Default paths, with the token file taken from `SENTRY_TOKEN_FILE`.
    pub fn from_env() -> Self {
        Self {
            token_file: std::env::var_os(SENTRY_TOKEN_FILE_ENV).map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Sets an explicit token file. An empty path is an error at fetch time.
    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = Some(path.into());
        self
    }

    /// Overrides the projected Kubernetes token path.
    pub fn with_kubernetes_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubernetes_path = path.into();
        self
    }

    /// Overrides the legacy service account token path.
    pub fn with_legacy_kubernetes_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_kubernetes_path = path.into();
        self
    }

    async fn read_token_file(path: &Path) -> Result<BootstrapToken> {
        if path.as_os_str().is_empty() {
            return Err(Error::TokenUnavailable(format!(
                "{SENTRY_TOKEN_FILE_ENV} is set with an empty value"
            )));
        }

        let token = read_to_zeroizing(path).await.map_err(|e| {
            Error::TokenUnavailable(format!(
                "failed to read token at path '{}': {e}",
                path.display()
            ))
        })?;
        if token.is_empty() {
            return Err(Error::TokenUnavailable(format!(
                "token found at path '{}' is empty",
                path.display()
            )));
        }

        debug!(path = %path.display(), "using token file with JWKS validator");
        Ok(BootstrapToken {
            token,
            validator: TokenValidator::Jwks,
        })
    }

    async fn read_kubernetes_token(&self) -> Result<BootstrapToken> {
        let token = match read_to_zeroizing(&self.kubernetes_path).await {
            Ok(token) => token,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let legacy = read_to_zeroizing(&self.legacy_kubernetes_path)
                    .await
                    .unwrap_or_default();
                if !legacy.is_empty() {
                    warn!(
                        path = %self.legacy_kubernetes_path.display(),
                        "initializing with the legacy service account token, which grants access to Kubernetes APIs; mount a projected sentry token instead"
                    );
                }
                legacy
            }
            Err(e) => {
                return Err(Error::TokenUnavailable(format!(
                    "failed to read Kubernetes token at path '{}': {e}",
                    self.kubernetes_path.display()
                )))
            }
        };

        if token.is_empty() {
            return Err(Error::TokenUnavailable(format!(
                "no service account token found at '{}' or '{}'",
                self.kubernetes_path.display(),
                self.legacy_kubernetes_path.display()
            )));
        }

        Ok(BootstrapToken {
            token,
            validator: TokenValidator::Kubernetes,
        })
    }
}

#[async_trait]
impl TokenSource for FileTokenSource {
    async fn token(&self, mode: DeploymentMode) -> Result<BootstrapToken> {
        if let Some(path) = &self.token_file {
            return Self::read_token_file(path).await;
        }

        match mode {
            DeploymentMode::Kubernetes => self.read_kubernetes_token().await,
            DeploymentMode::SelfHosted => Ok(BootstrapToken::insecure()),
        }
    }
}

async fn read_to_zeroizing(path: &Path) -> std::io::Result<Zeroizing<String>> {
    tokio::fs::read_to_string(path).await.map(Zeroizing::new)
}
