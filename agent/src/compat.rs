//! The runtime compatibility map.
//!
//! A YAML `VersionManifestV1` document maps an upstream component and its
//! `major.minor` release to the dependent versions it supports, most
//! preferred first.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Expected document kind.
pub const VERSION_MANIFEST_KIND: &str = "VersionManifestV1";

/// Namespace of the config map that publishes the map.
pub const RUNTIME_MAPPINGS_NAMESPACE: &str = "tectonic-system";

/// Name of the config map that publishes the map.
pub const RUNTIME_MAPPINGS_CONFIGMAP: &str = "tectonic-torcx-runtime-mappings";

/// Config map key holding the document.
pub const RUNTIME_MAPPINGS_KEY: &str = "runtime-mappings.yaml";

/// Local copy shipped by the installer, used during bootstrap.
pub const INSTALLER_RUNTIME_MAPPINGS_PATH: &str = "/etc/kubernetes/installer/runtime-mappings.yaml";

/// Local copy mounted into the pre-reboot hook.
pub const HOOK_RUNTIME_MAPPINGS_PATH: &str = "/etc/runtime-mappings.yaml";

/// Upstream key for the control plane.
pub const KUBERNETES: &str = "k8s";

/// Dependent key for the container runtime.
pub const DOCKER: &str = "docker";

/// Errors raised while reading or querying the map.
#[derive(Debug, Error)]
pub enum CompatError {
    /// The local copy could not be read.
    #[error("failed to read version map {path}")]
    Read {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML of the expected shape.
    #[error("invalid version map")]
    Yaml(#[from] serde_yaml::Error),

    /// The document has a different kind.
    #[error("expected a {VERSION_MANIFEST_KIND} document, found {found:?}")]
    UnexpectedKind {
        /// The kind that was found.
        found: String,
    },

    /// The upstream component is not listed.
    #[error("version map has no entry for {upstream}")]
    UnknownUpstream {
        /// The requested component.
        upstream: String,
    },

    /// The upstream release is not listed.
    #[error("version map has no entry for {upstream} {version}")]
    UnknownVersion {
        /// The requested component.
        upstream: String,
        /// The requested release.
        version: String,
    },

    /// The dependent component is not listed or has no versions.
    #[error("version map lists no {dependent} versions for {upstream} {version}")]
    UnknownDependent {
        /// The requested component.
        upstream: String,
        /// The requested release.
        version: String,
        /// The dependent component.
        dependent: String,
    },

    /// A cluster version could not be reduced to `major.minor`.
    #[error("cannot interpret cluster version {value:?}")]
    InvalidClusterVersion {
        /// The rejected string.
        value: String,
        /// The parse failure.
        #[source]
        source: semver::Error,
    },
}

type Releases = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Deserialize)]
struct RawVersionManifest {
    kind: String,
    #[serde(default)]
    versions: BTreeMap<String, Releases>,
}

/// A parsed compatibility map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionManifest {
    versions: BTreeMap<String, Releases>,
}

impl VersionManifest {
    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`CompatError::Yaml`] for malformed input and
    /// [`CompatError::UnexpectedKind`] for a foreign kind.
    ///
    /// # Examples
    ///
    /// ```
    /// use nodeprep_agent::compat::VersionManifest;
    ///
    /// let map = VersionManifest::parse(
    ///     "kind: VersionManifestV1\nversions:\n  k8s:\n    \"1.8\":\n      docker: [\"17.09\", \"1.12\"]\n",
    /// )?;
    /// assert_eq!(map.version_for("k8s", "1.8", "docker")?, ["17.09", "1.12"]);
    /// # Ok::<(), nodeprep_agent::compat::CompatError>(())
    /// ```
    pub fn parse(document: &str) -> Result<Self, CompatError> {
        let raw: RawVersionManifest = serde_yaml::from_str(document)?;
        if raw.kind != VERSION_MANIFEST_KIND {
            return Err(CompatError::UnexpectedKind { found: raw.kind });
        }
        Ok(Self {
            versions: raw.versions,
        })
    }

    /// Reads and parses a local copy.
    ///
    /// # Errors
    ///
    /// Returns [`CompatError::Read`] when the file cannot be read, and the
    /// errors of [`VersionManifest::parse`] otherwise.
    pub fn read(path: &Utf8Path) -> Result<Self, CompatError> {
        let document = std::fs::read_to_string(path).map_err(|source| CompatError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&document)
    }

    /// Returns the `dependent` versions supported by `upstream` `version`.
    ///
    /// # Errors
    ///
    /// Names the first missing level, or reports an empty list as
    /// [`CompatError::UnknownDependent`].
    pub fn version_for(
        &self,
        upstream: &str,
        version: &str,
        dependent: &str,
    ) -> Result<&[String], CompatError> {
        let releases = self
            .versions
            .get(upstream)
            .ok_or_else(|| CompatError::UnknownUpstream {
                upstream: upstream.to_owned(),
            })?;
        let dependents = releases
            .get(version)
            .ok_or_else(|| CompatError::UnknownVersion {
                upstream: upstream.to_owned(),
                version: version.to_owned(),
            })?;
        dependents
            .get(dependent)
            .filter(|versions| !versions.is_empty())
            .map(Vec::as_slice)
            .ok_or_else(|| CompatError::UnknownDependent {
                upstream: upstream.to_owned(),
                version: version.to_owned(),
                dependent: dependent.to_owned(),
            })
    }
}

/// Reduces a cluster version such as `v1.6.7+coreos.0` to `1.6`.
///
/// # Errors
///
/// Returns [`CompatError::InvalidClusterVersion`] when the value is not a
/// semantic version after stripping a leading `v`.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::compat::major_minor;
///
/// assert_eq!(major_minor("v1.6.7+coreos.0")?, "1.6");
/// assert!(major_minor("latest").is_err());
/// # Ok::<(), nodeprep_agent::compat::CompatError>(())
/// ```
pub fn major_minor(cluster_version: &str) -> Result<String, CompatError> {
    let trimmed = cluster_version.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let parsed =
        semver::Version::parse(bare).map_err(|source| CompatError::InvalidClusterVersion {
            value: cluster_version.to_owned(),
            source,
        })?;
    Ok(format!("{}.{}", parsed.major, parsed.minor))
}
