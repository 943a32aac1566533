//! Workflow-level error type.
//!
//! Each component reports its own error enum; [`AgentError`] wraps them so
//! the binary can print one source chain and pick an exit code.

use crate::cluster::ClusterError;
use crate::compat::CompatError;
use crate::config::ConfigError;
use crate::fetch::FetchError;
use crate::manifest::ManifestError;
use crate::service::ServiceError;
use crate::store::StoreError;
use crate::strategy::StrategyError;
use crate::torcx::TorcxError;
use crate::update_engine::UpdateEngineError;
use camino::Utf8PathBuf;
use nodeprep_common::CommonError;
use thiserror::Error;

/// Exit code for configuration and usage failures.
pub const EXIT_CONFIG: i32 = 2;

/// Exit code for failures while acting on the node.
pub const EXIT_RUNTIME: i32 = 1;

/// Errors that end a workflow.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The configuration was rejected before any side effect.
    #[error("configuration error")]
    Config(#[from] ConfigError),

    /// Host metadata could not be read.
    #[error("failed to read host metadata")]
    Host(#[from] CommonError),

    /// No source yielded a cluster version.
    #[error("cluster version unknown: not forced, not reported by the API server, and not in {env_file}")]
    ClusterVersionUnknown {
        /// The env file consulted last.
        env_file: Utf8PathBuf,
    },

    /// The compatibility map could not be read or has no entry.
    #[error("failed to determine compatible runtime versions")]
    Compat(#[from] CompatError),

    /// A cluster call failed.
    #[error("cluster request failed")]
    Cluster(#[from] ClusterError),

    /// The OS update daemon failed.
    #[error("OS update failed")]
    UpdateEngine(#[from] UpdateEngineError),

    /// No add-on version could be selected.
    #[error("add-on version selection failed")]
    Strategy(#[from] StrategyError),

    /// A package manifest was unusable.
    #[error("package manifest error")]
    Manifest(#[from] ManifestError),

    /// An add-on archive could not be fetched or verified.
    #[error("add-on fetch failed")]
    Fetch(#[from] FetchError),

    /// The add-on store could not be updated.
    #[error("add-on store error")]
    Store(#[from] StoreError),

    /// The package manager failed.
    #[error("package manager error")]
    Torcx(#[from] TorcxError),

    /// The kubelet environment file could not be written.
    #[error("failed to write kubelet environment {path}")]
    KubeletEnv {
        /// Destination of the env file.
        path: Utf8PathBuf,
        /// The underlying failure.
        #[source]
        source: CommonError,
    },

    /// The service manager refused a request.
    #[error("service manager error")]
    Service(#[from] ServiceError),
}

impl AgentError {
    /// Returns `true` for configuration and usage failures.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Process exit code for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use nodeprep_agent::config::ConfigError;
    /// use nodeprep_agent::error::AgentError;
    ///
    /// assert_eq!(AgentError::from(ConfigError::MissingNodeName).exit_code(), 2);
    /// ```
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.is_config() {
            EXIT_CONFIG
        } else {
            EXIT_RUNTIME
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_failures_exit_with_one() {
        let err = AgentError::ClusterVersionUnknown {
            env_file: Utf8PathBuf::from("/etc/kubernetes/kubelet.env"),
        };
        assert!(!err.is_config());
        assert_eq!(err.exit_code(), EXIT_RUNTIME);
    }

    #[test]
    fn config_failures_exit_with_two() {
        let err = AgentError::from(ConfigError::ZeroTimeout);
        assert!(err.is_config());
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }
}
