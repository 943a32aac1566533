//! Validated agent configuration.
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional TOML file, and command-line flags. [`AgentConfig::resolve`]
//! merges and validates them before either workflow touches the host, so
//! a bad setting never leaves a half-updated node behind.

use crate::cluster::{DEFAULT_KUBECONFIG, DEFAULT_KUBECTL, RetryPolicy};
use crate::compat::{DOCKER, HOOK_RUNTIME_MAPPINGS_PATH, INSTALLER_RUNTIME_MAPPINGS_PATH};
use crate::exec::DEFAULT_COMMAND_TIMEOUT;
use crate::kubelet_env::{INSTALLER_ENV_PATH, KUBELET_ENV_PATH};
use crate::manifest::{DEFAULT_MANIFEST_URL_TEMPLATE, ManifestError, UrlTemplate};
use crate::service::RUNTIME_UNIT_DIR;
use crate::signature::{DEFAULT_KEYRING_PATH, SignaturePolicy};
use crate::store::{DEFAULT_STORE_ROOT, VENDOR_STORE_ROOT};
use crate::strategy::DEFAULT_EPOCH;
use crate::torcx::{DEFAULT_PROFILE_NAME, DEFAULT_TORCX_BIN, VENDOR_PROFILE_NAME};
use crate::update_engine::DEFAULT_UPDATE_ENGINE_CLIENT;
use camino::{Utf8Path, Utf8PathBuf};
use nodeprep_common::CommonError;
use nodeprep_common::os_release::{OS_RELEASE_PATH, default_update_conf_paths};
use nodeprep_common::os_version::OsVersion;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}")]
    Read {
        /// The configuration file.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML of the expected shape.
    #[error("invalid configuration file {path}")]
    Parse {
        /// The configuration file.
        path: Utf8PathBuf,
        /// The decoding failure.
        #[source]
        source: Box<toml::de::Error>,
    },

    /// The manifest URL template is malformed.
    #[error("invalid manifest URL")]
    ManifestUrl(#[source] ManifestError),

    /// The epoch is not an OS version.
    #[error("invalid epoch {value:?}")]
    Epoch {
        /// The rejected value.
        value: String,
        /// The parse failure.
        #[source]
        source: CommonError,
    },

    /// A setting that must not be empty was empty.
    #[error("{setting} must not be empty")]
    Empty {
        /// Name of the setting.
        setting: &'static str,
    },

    /// The configured profile is the read-only profile shipped with the OS.
    #[error("profile {name:?} is reserved for the OS image")]
    ReservedProfile {
        /// The rejected profile name.
        name: String,
    },

    /// A node annotation was requested without naming the node.
    #[error("--node-annotation requires --node-name or the NODE environment variable")]
    MissingNodeName,

    /// The subprocess timeout was zero.
    #[error("command timeout must be at least one second")]
    ZeroTimeout,
}

/// Which workflow an invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    /// First-boot preparation of a node.
    Bootstrap,
    /// Preparation run by the update operator before a node reboots.
    PreRebootHook,
}

/// Settings accepted from a TOML configuration file.
///
/// Every field is optional; unknown keys are rejected.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::config::FileConfig;
///
/// let file = FileConfig::parse("profile = \"site\"\nverify-signatures = false\n")?;
/// assert_eq!(file.profile.as_deref(), Some("site"));
/// assert!(FileConfig::parse("colour = \"blue\"\n").is_err());
/// # Ok::<(), toml::de::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    /// Path of the `torcx` binary.
    pub torcx_bin: Option<Utf8PathBuf>,
    /// Profile to install into.
    pub profile: Option<String>,
    /// Manifest URL template.
    pub manifest_url: Option<String>,
    /// First OS version with remotely published add-ons.
    pub epoch: Option<String>,
    /// Whether detached signatures are checked.
    pub verify_signatures: Option<bool>,
    /// Keyring used for signature checks.
    pub keyring: Option<Utf8PathBuf>,
    /// Kubeconfig for cluster calls.
    pub kubeconfig: Option<Utf8PathBuf>,
    /// Path of `kubectl`.
    pub kubectl: Option<Utf8PathBuf>,
    /// Path of the update-engine client.
    pub update_engine_client: Option<Utf8PathBuf>,
    /// Root of the user add-on store.
    pub store_root: Option<Utf8PathBuf>,
    /// Destination of the kubelet environment file.
    pub kubelet_env_path: Option<Utf8PathBuf>,
    /// Whether bootstrap applies OS updates.
    pub do_os_upgrade: Option<bool>,
    /// Annotation set on the node when the hook succeeds.
    pub node_annotation: Option<String>,
    /// Subprocess timeout in seconds.
    pub command_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns the TOML error for malformed input or unknown keys.
    pub fn parse(document: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(document)
    }

    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&document).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source: Box::new(source),
        })
    }
}

/// Settings given on the command line. `None` defers to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Path of the `torcx` binary.
    pub torcx_bin: Option<Utf8PathBuf>,
    /// Profile to install into.
    pub profile: Option<String>,
    /// Manifest URL template.
    pub manifest_url: Option<String>,
    /// Epoch OS version.
    pub epoch: Option<String>,
    /// `Some(false)` disables signature checks.
    pub verify_signatures: Option<bool>,
    /// Keyring used for signature checks.
    pub keyring: Option<Utf8PathBuf>,
    /// Kubeconfig for cluster calls.
    pub kubeconfig: Option<Utf8PathBuf>,
    /// Root of the user add-on store.
    pub store_root: Option<Utf8PathBuf>,
    /// Cluster version to use instead of discovering one.
    pub force_kube_version: Option<String>,
    /// Whether bootstrap applies OS updates.
    pub do_os_upgrade: Option<bool>,
    /// Skip the add-on phase of bootstrap.
    pub skip_torcx_setup: bool,
    /// Destination of the kubelet environment file.
    pub kubelet_env_path: Option<Utf8PathBuf>,
    /// Node to annotate.
    pub node_name: Option<String>,
    /// Annotation to set when the hook succeeds.
    pub node_annotation: Option<String>,
}

/// Files and directories the agent reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// The os-release record.
    pub os_release: Utf8PathBuf,
    /// Update configuration files, lowest precedence first.
    pub update_conf: Vec<Utf8PathBuf>,
    /// Writable add-on store.
    pub store_root: Utf8PathBuf,
    /// Read-only store shipped with the OS image.
    pub vendor_store_root: Utf8PathBuf,
    /// Installer env file: kubelet env template and bootstrap version source.
    pub installer_env: Utf8PathBuf,
    /// Kubelet env file: bootstrap output and hook version source.
    pub kubelet_env: Utf8PathBuf,
    /// Local compatibility map used by bootstrap.
    pub installer_runtime_mappings: Utf8PathBuf,
    /// Local compatibility map used by the hook.
    pub hook_runtime_mappings: Utf8PathBuf,
    /// Directory for runtime systemd units.
    pub unit_dir: Utf8PathBuf,
    /// Directory for download scratch files; the system default when unset.
    pub scratch_dir: Option<Utf8PathBuf>,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            os_release: Utf8PathBuf::from(OS_RELEASE_PATH),
            update_conf: default_update_conf_paths(),
            store_root: Utf8PathBuf::from(DEFAULT_STORE_ROOT),
            vendor_store_root: Utf8PathBuf::from(VENDOR_STORE_ROOT),
            installer_env: Utf8PathBuf::from(INSTALLER_ENV_PATH),
            kubelet_env: Utf8PathBuf::from(KUBELET_ENV_PATH),
            installer_runtime_mappings: Utf8PathBuf::from(INSTALLER_RUNTIME_MAPPINGS_PATH),
            hook_runtime_mappings: Utf8PathBuf::from(HOOK_RUNTIME_MAPPINGS_PATH),
            unit_dir: Utf8PathBuf::from(RUNTIME_UNIT_DIR),
            scratch_dir: None,
        }
    }
}

/// Complete, validated configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Workflow to run.
    pub workflow: Workflow,
    /// Host files and directories.
    pub paths: HostPaths,
    /// Path of the `torcx` binary.
    pub torcx_bin: Utf8PathBuf,
    /// Path of the update-engine client.
    pub update_engine_client: Utf8PathBuf,
    /// Path of `kubectl`.
    pub kubectl: Utf8PathBuf,
    /// Kubeconfig for cluster calls.
    pub kubeconfig: Utf8PathBuf,
    /// Keyring used for signature checks.
    pub keyring: Utf8PathBuf,
    /// Manifest URL template.
    pub manifest_url: UrlTemplate,
    /// First OS version with remotely published add-ons.
    pub epoch: OsVersion,
    /// Add-on package managed by the agent.
    pub package: String,
    /// Profile the add-on is activated in.
    pub profile: String,
    /// Whether signatures are checked.
    pub signatures: SignaturePolicy,
    /// Cluster version overriding discovery.
    pub force_kube_version: Option<String>,
    /// Whether bootstrap applies OS updates.
    pub do_os_upgrade: bool,
    /// Skip the add-on phase of bootstrap.
    pub skip_torcx_setup: bool,
    /// Node to annotate.
    pub node_name: Option<String>,
    /// Annotation to set when the hook succeeds.
    pub node_annotation: Option<String>,
    /// Timeout for each subprocess.
    pub command_timeout: Duration,
    /// Retries for cluster lookups.
    pub lookup_retry: RetryPolicy,
    /// Retries for the completion annotation.
    pub annotate_retry: RetryPolicy,
}

impl AgentConfig {
    /// Merges defaults, `file`, and `overrides` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first invalid setting.
    pub fn resolve(
        workflow: Workflow,
        file: FileConfig,
        overrides: Overrides,
    ) -> Result<Self, ConfigError> {
        let manifest_url = overrides
            .manifest_url
            .or(file.manifest_url)
            .unwrap_or_else(|| DEFAULT_MANIFEST_URL_TEMPLATE.to_owned());
        let manifest_url = UrlTemplate::new(&manifest_url).map_err(ConfigError::ManifestUrl)?;

        let epoch = overrides
            .epoch
            .or(file.epoch)
            .unwrap_or_else(|| DEFAULT_EPOCH.to_owned());
        let epoch = epoch
            .parse::<OsVersion>()
            .map_err(|source| ConfigError::Epoch {
                value: epoch.clone(),
                source,
            })?;

        let profile = overrides
            .profile
            .or(file.profile)
            .unwrap_or_else(|| DEFAULT_PROFILE_NAME.to_owned());
        if profile.trim().is_empty() {
            return Err(ConfigError::Empty { setting: "profile" });
        }
        if profile == VENDOR_PROFILE_NAME {
            return Err(ConfigError::ReservedProfile { name: profile });
        }

        let timeout_secs = file
            .command_timeout_secs
            .unwrap_or_else(|| DEFAULT_COMMAND_TIMEOUT.as_secs());
        if timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let force_kube_version = non_empty(overrides.force_kube_version);
        let node_name = non_empty(overrides.node_name);
        let node_annotation = match workflow {
            Workflow::Bootstrap => None,
            Workflow::PreRebootHook => non_empty(overrides.node_annotation.or(file.node_annotation)),
        };
        if node_annotation.is_some() && node_name.is_none() {
            return Err(ConfigError::MissingNodeName);
        }

        let signatures = if overrides
            .verify_signatures
            .or(file.verify_signatures)
            .unwrap_or(true)
        {
            SignaturePolicy::Required
        } else {
            SignaturePolicy::Disabled
        };

        let mut paths = HostPaths::default();
        if let Some(store_root) = overrides.store_root.or(file.store_root) {
            paths.store_root = store_root;
        }
        if let Some(kubelet_env) = overrides.kubelet_env_path.or(file.kubelet_env_path) {
            paths.kubelet_env = kubelet_env;
        }

        Ok(Self {
            workflow,
            paths,
            torcx_bin: overrides
                .torcx_bin
                .or(file.torcx_bin)
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_TORCX_BIN)),
            update_engine_client: file
                .update_engine_client
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_UPDATE_ENGINE_CLIENT)),
            kubectl: file
                .kubectl
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_KUBECTL)),
            kubeconfig: overrides
                .kubeconfig
                .or(file.kubeconfig)
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_KUBECONFIG)),
            keyring: overrides
                .keyring
                .or(file.keyring)
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_KEYRING_PATH)),
            manifest_url,
            epoch,
            package: DOCKER.to_owned(),
            profile,
            signatures,
            force_kube_version,
            do_os_upgrade: overrides.do_os_upgrade.or(file.do_os_upgrade).unwrap_or(true),
            skip_torcx_setup: overrides.skip_torcx_setup,
            node_name,
            node_annotation,
            command_timeout: Duration::from_secs(timeout_secs),
            lookup_retry: RetryPolicy::LOOKUP,
            annotate_retry: RetryPolicy::ANNOTATE,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::utf8_temp_dir;
    use rstest::rstest;

    fn resolve(workflow: Workflow, file: FileConfig, overrides: Overrides) -> AgentConfig {
        AgentConfig::resolve(workflow, file, overrides).expect("valid configuration")
    }

    #[test]
    fn defaults_match_the_node_layout() {
        let config = resolve(Workflow::Bootstrap, FileConfig::default(), Overrides::default());

        assert_eq!(config.torcx_bin, "/usr/bin/torcx");
        assert_eq!(config.profile, "tectonic");
        assert_eq!(config.package, "docker");
        assert_eq!(config.epoch.to_string(), "1520.2.0");
        assert_eq!(config.signatures, SignaturePolicy::Required);
        assert_eq!(config.paths.store_root, "/var/lib/torcx/store");
        assert_eq!(config.paths.kubelet_env, "/etc/kubernetes/kubelet.env");
        assert_eq!(config.command_timeout, Duration::from_secs(300));
        assert!(config.do_os_upgrade);
        assert!(!config.skip_torcx_setup);
    }

    #[test]
    fn flags_override_the_file() {
        let file = FileConfig::parse(
            "profile = \"site\"\nverify-signatures = true\ntorcx-bin = \"/opt/bin/torcx\"\nkubectl = \"/opt/bin/kubectl\"\n",
        )
        .expect("file");
        let overrides = Overrides {
            profile: Some("override".to_owned()),
            verify_signatures: Some(false),
            ..Overrides::default()
        };

        let config = resolve(Workflow::Bootstrap, file, overrides);

        assert_eq!(config.profile, "override");
        assert_eq!(config.signatures, SignaturePolicy::Disabled);
        assert_eq!(config.torcx_bin, "/opt/bin/torcx");
        assert_eq!(config.kubectl, "/opt/bin/kubectl");
    }

    #[test]
    fn file_is_loaded_from_disk() {
        let (_guard, dir) = utf8_temp_dir();
        let path = dir.join("nodeprep.toml");
        std::fs::write(&path, "store-root = \"/srv/store\"\ncommand-timeout-secs = 30\n")
            .expect("config");

        let file = FileConfig::load(&path).expect("loaded");
        let config = resolve(Workflow::PreRebootHook, file, Overrides::default());

        assert_eq!(config.paths.store_root, "/srv/store");
        assert_eq!(config.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let (_guard, dir) = utf8_temp_dir();
        let path = dir.join("nodeprep.toml");
        std::fs::write(&path, "store_dir = \"/srv/store\"\n").expect("config");

        assert!(matches!(FileConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[rstest]
    #[case::template(Overrides { manifest_url: Some("https://m.test/{arch}".to_owned()), ..Overrides::default() })]
    #[case::epoch(Overrides { epoch: Some("soon".to_owned()), ..Overrides::default() })]
    #[case::empty_profile(Overrides { profile: Some(" ".to_owned()), ..Overrides::default() })]
    #[case::vendor_profile(Overrides { profile: Some("vendor".to_owned()), ..Overrides::default() })]
    #[case::annotation_without_node(Overrides { node_annotation: Some("example.com/done".to_owned()), ..Overrides::default() })]
    fn invalid_settings_are_rejected(#[case] overrides: Overrides) {
        assert!(AgentConfig::resolve(Workflow::PreRebootHook, FileConfig::default(), overrides).is_err());
    }

    #[test]
    fn bootstrap_ignores_node_annotation() {
        let file = FileConfig {
            node_annotation: Some("example.com/done".to_owned()),
            ..FileConfig::default()
        };

        let config = resolve(Workflow::Bootstrap, file, Overrides::default());

        assert_eq!(config.node_annotation, None);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let file = FileConfig {
            command_timeout_secs: Some(0),
            ..FileConfig::default()
        };
        assert!(matches!(
            AgentConfig::resolve(Workflow::Bootstrap, file, Overrides::default()),
            Err(ConfigError::ZeroTimeout)
        ));
    }
}
