//! The cluster API as seen by this agent.
//!
//! Only three calls are needed: the control-plane version, one config map
//! value, and a node annotation. [`KubectlClient`] implements them by
//! running `kubectl`; [`retry`] adds the fixed-backoff retries those calls
//! get at the workflow level.

use crate::exec::{CommandExecutor, ExecError, stderr_text};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Default kubeconfig used by the node's kubelet.
pub const DEFAULT_KUBECONFIG: &str = "/etc/kubernetes/kubeconfig";

/// Default location of `kubectl`.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Errors raised by cluster calls.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// `kubectl` could not be run.
    #[error("failed to {action}")]
    Command {
        /// What was being attempted.
        action: String,
        /// The subprocess failure.
        #[source]
        source: ExecError,
    },

    /// `kubectl` exited unsuccessfully.
    #[error("failed to {action}: {stderr}")]
    Failed {
        /// What was being attempted.
        action: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A reply could not be decoded.
    #[error("unexpected reply while trying to {action}")]
    Parse {
        /// What was being attempted.
        action: String,
        /// The decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// A reply lacked a required field.
    #[error("reply to {action} has no {field}")]
    MissingField {
        /// What was being attempted.
        action: String,
        /// The absent field.
        field: String,
    },
}

/// Cluster operations used by the workflows.
pub trait ClusterClient {
    /// Returns the API server's `gitVersion`, for example `v1.8.4+coreos.0`.
    ///
    /// # Errors
    ///
    /// Returns a [`ClusterError`] when the version cannot be read.
    fn server_version(&self) -> Result<String, ClusterError>;

    /// Returns `key` from config map `namespace/name`.
    ///
    /// # Errors
    ///
    /// Returns a [`ClusterError`] when the config map or key is missing.
    fn config_map_value(&self, namespace: &str, name: &str, key: &str)
    -> Result<String, ClusterError>;

    /// Sets annotation `key=true` on `node`, overwriting any old value.
    ///
    /// # Errors
    ///
    /// Returns a [`ClusterError`] when the node cannot be annotated.
    fn annotate_node(&self, node: &str, key: &str) -> Result<(), ClusterError>;
}

/// Fixed-backoff retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Schedule for read-only lookups: 3 attempts, 10 seconds apart.
    pub const LOOKUP: Self = Self {
        attempts: 3,
        delay: Duration::from_secs(10),
    };

    /// Schedule for the completion annotation: 5 attempts, a minute apart.
    pub const ANNOTATE: Self = Self {
        attempts: 5,
        delay: Duration::from_secs(60),
    };

    /// The same number of attempts with no pause.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
        }
    }
}

/// Runs `op` until it succeeds or `policy` is exhausted.
///
/// # Errors
///
/// Returns the last error once every attempt has failed.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::cluster::{ClusterError, RetryPolicy, retry};
///
/// let mut calls = 0;
/// let value = retry(RetryPolicy::immediate(3), "read a value", || {
///     calls += 1;
///     if calls < 2 {
///         Err(ClusterError::MissingField { action: "read".into(), field: "x".into() })
///     } else {
///         Ok(calls)
///     }
/// })?;
/// assert_eq!(value, 2);
/// # Ok::<(), ClusterError>(())
/// ```
pub fn retry<T>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, ClusterError>,
) -> Result<T, ClusterError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                log::warn!("attempt {attempt}/{attempts} to {what} failed: {err}");
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
        }
    }
}

#[derive(Deserialize)]
struct VersionReply {
    #[serde(rename = "serverVersion")]
    server_version: Option<ServerVersion>,
}

#[derive(Deserialize)]
struct ServerVersion {
    #[serde(rename = "gitVersion")]
    git_version: String,
}

#[derive(Deserialize)]
struct ConfigMapReply {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

/// [`ClusterClient`] that runs `kubectl` against a kubeconfig.
pub struct KubectlClient<'a> {
    executor: &'a dyn CommandExecutor,
    binary: Utf8PathBuf,
    kubeconfig: Utf8PathBuf,
}

impl<'a> KubectlClient<'a> {
    /// Creates a client using `kubeconfig`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, binary: &Utf8Path, kubeconfig: &Utf8Path) -> Self {
        Self {
            executor,
            binary: binary.to_owned(),
            kubeconfig: kubeconfig.to_owned(),
        }
    }

    fn run(&self, action: &str, args: &[&str]) -> Result<Vec<u8>, ClusterError> {
        let mut full = vec!["--kubeconfig", self.kubeconfig.as_str()];
        full.extend_from_slice(args);
        let output = self
            .executor
            .run(self.binary.as_str(), &full)
            .map_err(|source| ClusterError::Command {
                action: action.to_owned(),
                source,
            })?;
        if !output.status.success() {
            return Err(ClusterError::Failed {
                action: action.to_owned(),
                stderr: stderr_text(&output),
            });
        }
        Ok(output.stdout)
    }
}

impl ClusterClient for KubectlClient<'_> {
    fn server_version(&self) -> Result<String, ClusterError> {
        let action = "read the API server version";
        let stdout = self.run(action, &["version", "-o", "json"])?;
        let reply: VersionReply =
            serde_json::from_slice(&stdout).map_err(|source| ClusterError::Parse {
                action: action.to_owned(),
                source,
            })?;
        reply
            .server_version
            .map(|version| version.git_version)
            .filter(|version| !version.is_empty())
            .ok_or_else(|| ClusterError::MissingField {
                action: action.to_owned(),
                field: "serverVersion.gitVersion".to_owned(),
            })
    }

    fn config_map_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<String, ClusterError> {
        let action = format!("read config map {namespace}/{name}");
        let stdout = self.run(
            &action,
            &["get", "configmap", name, "-n", namespace, "-o", "json"],
        )?;
        let mut reply: ConfigMapReply =
            serde_json::from_slice(&stdout).map_err(|source| ClusterError::Parse {
                action: action.clone(),
                source,
            })?;
        reply
            .data
            .remove(key)
            .ok_or_else(|| ClusterError::MissingField {
                action,
                field: format!("data.{key}"),
            })
    }

    fn annotate_node(&self, node: &str, key: &str) -> Result<(), ClusterError> {
        let annotation = format!("{key}=true");
        self.run(
            &format!("annotate node {node}"),
            &["annotate", "node", node, &annotation, "--overwrite"],
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, stdout_output};
    use std::cell::Cell;

    const KUBECONFIG: &str = "/etc/kubernetes/kubeconfig";

    fn client(executor: &StubExecutor) -> KubectlClient<'_> {
        KubectlClient::new(executor, Utf8Path::new("kubectl"), Utf8Path::new(KUBECONFIG))
    }

    #[test]
    fn server_version_reads_git_version() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "kubectl",
            args: vec!["--kubeconfig", KUBECONFIG, "version", "-o", "json"],
            result: Ok(stdout_output(
                r#"{"clientVersion":{"gitVersion":"v1.9.0"},"serverVersion":{"gitVersion":"v1.8.4+coreos.0"}}"#,
            )),
        }]);

        assert_eq!(
            client(&executor).server_version().expect("version"),
            "v1.8.4+coreos.0"
        );
        executor.assert_finished();
    }

    #[test]
    fn missing_server_version_is_reported() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "kubectl",
            args: vec!["--kubeconfig", KUBECONFIG, "version", "-o", "json"],
            result: Ok(stdout_output(r#"{"clientVersion":{"gitVersion":"v1.9.0"}}"#)),
        }]);

        assert!(matches!(
            client(&executor).server_version(),
            Err(ClusterError::MissingField { .. })
        ));
    }

    #[test]
    fn config_map_value_extracts_key() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "kubectl",
            args: vec![
                "--kubeconfig",
                KUBECONFIG,
                "get",
                "configmap",
                "tectonic-torcx-runtime-mappings",
                "-n",
                "tectonic-system",
                "-o",
                "json",
            ],
            result: Ok(stdout_output(
                r#"{"kind":"ConfigMap","data":{"runtime-mappings.yaml":"kind: VersionManifestV1\n"}}"#,
            )),
        }]);

        let value = client(&executor)
            .config_map_value(
                "tectonic-system",
                "tectonic-torcx-runtime-mappings",
                "runtime-mappings.yaml",
            )
            .expect("value");

        assert_eq!(value, "kind: VersionManifestV1\n");
    }

    #[test]
    fn annotate_overwrites_with_true() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "kubectl",
            args: vec![
                "--kubeconfig",
                KUBECONFIG,
                "annotate",
                "node",
                "worker-1",
                "example.com/torcx-hook=true",
                "--overwrite",
            ],
            result: Ok(stdout_output("node/worker-1 annotated\n")),
        }]);

        client(&executor)
            .annotate_node("worker-1", "example.com/torcx-hook")
            .expect("annotated");
        executor.assert_finished();
    }

    #[test]
    fn retry_returns_last_error_when_exhausted() {
        let calls = Cell::new(0);
        let executor = StubExecutor::new(
            (0..3)
                .map(|_| ExpectedCall {
                    cmd: "kubectl",
                    args: vec!["--kubeconfig", KUBECONFIG, "version", "-o", "json"],
                    result: Ok(failure_output("connection refused")),
                })
                .collect(),
        );
        let kubectl = client(&executor);

        let err = retry(RetryPolicy::immediate(3), "read the version", || {
            calls.set(calls.get() + 1);
            kubectl.server_version()
        })
        .expect_err("exhausted");

        assert_eq!(calls.get(), 3);
        assert!(matches!(err, ClusterError::Failed { .. }));
        executor.assert_finished();
    }

    #[test]
    fn retry_stops_at_first_success() {
        let calls = Cell::new(0);
        let value = retry(RetryPolicy::immediate(5), "count", || {
            calls.set(calls.get() + 1);
            Ok::<_, ClusterError>(calls.get())
        })
        .expect("success");
        assert_eq!(value, 1);
    }
}
