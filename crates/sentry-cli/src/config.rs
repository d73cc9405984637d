//! Configuration handling

use anyhow::{Context, Result};
use sentry_identity::{
    ChannelSecurity, DeploymentMode, EnvPlatformDetector, FileTokenSource, FixedPlatform,
    MtlsCredentials, PlatformDetector, RequesterOptions, RetryPolicy, SpiffeId,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration file
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    /// Deployment mode; `auto` detects Kubernetes from the environment
    #[serde(default)]
    pub mode: ModeSetting,

    /// Sentry endpoint settings
    #[serde(default)]
    pub ca: CaConfig,

    /// Signing retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// mTLS material for the channel to sentry
    #[serde(default)]
    pub tls: TlsConfig,

    /// Bootstrap token locations
    #[serde(default)]
    pub token: TokenConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ModeSetting {
    #[default]
    Auto,
    Kubernetes,
    SelfHosted,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CaConfig {
    /// Sentry `host:port`
    #[serde(default = "default_ca_address")]
    pub address: String,

    /// SPIFFE ID sentry must present
    #[serde(default = "default_ca_id")]
    pub id: String,

    /// How long to wait for sentry to become reachable
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            address: default_ca_address(),
            id: default_ca_id(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_ca_address() -> String {
    "localhost:50001".to_string()
}
fn default_ca_id() -> String {
    "spiffe://cluster.local/ns/dapr-system/dapr-sentry".to_string()
}
fn default_connect_timeout() -> u64 {
    60
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total signing attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout of a single attempt in milliseconds
    #[serde(default = "default_per_attempt_timeout")]
    pub per_attempt_timeout_ms: u64,

    /// Pause between attempts in milliseconds
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            per_attempt_timeout_ms: default_per_attempt_timeout(),
            backoff_ms: default_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}
fn default_per_attempt_timeout() -> u64 {
    3000
}
fn default_backoff() -> u64 {
    50
}

/// All three files enable mTLS; none means a plaintext channel.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,

    #[serde(default)]
    pub trust_bundle_file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Explicit token file; falls back to `SENTRY_TOKEN_FILE`
    #[serde(default)]
    pub file: Option<String>,

    /// Projected sentry token
    #[serde(default = "default_kubernetes_path")]
    pub kubernetes_path: String,

    /// Default service account token
    #[serde(default = "default_legacy_kubernetes_path")]
    pub legacy_kubernetes_path: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            file: None,
            kubernetes_path: default_kubernetes_path(),
            legacy_kubernetes_path: default_legacy_kubernetes_path(),
        }
    }
}

fn default_kubernetes_path() -> String {
    sentry_identity::token::DEFAULT_KUBERNETES_TOKEN_PATH.to_string()
}
fn default_legacy_kubernetes_path() -> String {
    sentry_identity::token::DEFAULT_LEGACY_KUBERNETES_TOKEN_PATH.to_string()
}

impl Config {
    /// Load config from a file path
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let path = Path::new(&expanded);

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Platform detector for the configured mode
    pub fn detector(&self) -> Box<dyn PlatformDetector> {
        match self.mode {
            ModeSetting::Auto => Box::new(EnvPlatformDetector),
            ModeSetting::Kubernetes => Box::new(FixedPlatform(DeploymentMode::Kubernetes)),
            ModeSetting::SelfHosted => Box::new(FixedPlatform(DeploymentMode::SelfHosted)),
        }
    }

    /// Token source with the configured paths
    pub fn token_source(&self) -> FileTokenSource {
        let source = FileTokenSource::from_env()
            .with_kubernetes_path(expand(&self.token.kubernetes_path))
            .with_legacy_kubernetes_path(expand(&self.token.legacy_kubernetes_path));

        match &self.token.file {
            Some(file) => source.with_token_file(expand(file)),
            None => source,
        }
    }

    /// Signing retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            per_attempt_timeout: Duration::from_millis(self.retry.per_attempt_timeout_ms),
            backoff: Duration::from_millis(self.retry.backoff_ms),
            ..RetryPolicy::default()
        }
    }

    /// Dial security; reads the mTLS files when configured
    pub async fn channel_security(&self) -> Result<ChannelSecurity> {
        let tls = &self.tls;
        match (&tls.cert_file, &tls.key_file, &tls.trust_bundle_file) {
            (None, None, None) => Ok(ChannelSecurity::Insecure),
            (Some(cert), Some(key), Some(bundle)) => {
                let creds =
                    MtlsCredentials::from_paths(expand(cert), expand(key), expand(bundle)).await?;
                Ok(ChannelSecurity::Mtls(creds))
            }
            _ => Err(sentry_identity::Error::InvalidConfig(
                "[tls] needs cert_file, key_file and trust_bundle_file together".to_string(),
            )
            .into()),
        }
    }

    /// Requester options built from this config
    pub async fn requester_options(&self) -> Result<RequesterOptions> {
        let ca_id = SpiffeId::parse(&self.ca.id)
            .with_context(|| format!("invalid [ca] id '{}'", self.ca.id))?;

        Ok(RequesterOptions::new(self.ca.address.clone(), ca_id)
            .with_security(self.channel_security().await?)
            .with_connect_timeout(Duration::from_secs(self.ca.connect_timeout_secs))
            .with_retry_policy(self.retry_policy()))
    }
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}

/// Print the effective configuration
pub fn show(config_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    println!("# {config_path}");
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
