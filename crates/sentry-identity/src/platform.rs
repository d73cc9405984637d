//! Deployment mode detection.
//!
//! The mode decides how a bootstrap token is obtained. It is resolved once,
//! when a [`Requester`](crate::Requester) is built, and stays fixed for the
//! requester's lifetime.

use std::fmt;

/// Environment variable whose presence marks an in-cluster Kubernetes pod.
pub const KUBERNETES_SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";

/// The platform the workload runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentMode {
    /// Orchestrated by Kubernetes; a projected service account token is available.
    Kubernetes,
    /// Self-hosted process outside a cluster.
    SelfHosted,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Kubernetes => f.write_str("kubernetes"),
            DeploymentMode::SelfHosted => f.write_str("self-hosted"),
        }
    }
}

/// Resolves the deployment mode.
pub trait PlatformDetector: Send + Sync {
    /// Returns the mode of the current process.
    fn detect(&self) -> DeploymentMode;
}

/// Detects Kubernetes by the presence of `KUBERNETES_SERVICE_HOST`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvPlatformDetector;

impl PlatformDetector for EnvPlatformDetector {
    fn detect(&self) -> DeploymentMode {
        mode_from_env(std::env::var_os(KUBERNETES_SERVICE_HOST_ENV).is_some())
    }
}

/// A detector that always reports the same mode.
#[derive(Debug, Clone, Copy)]
pub struct FixedPlatform(pub DeploymentMode);

impl PlatformDetector for FixedPlatform {
    fn detect(&self) -> DeploymentMode {
        self.0
    }
}

fn mode_from_env(has_service_host: bool) -> DeploymentMode {
    if has_service_host {
        DeploymentMode::Kubernetes
    } else {
        DeploymentMode::SelfHosted
    }
}
