//! Ordering of OS image versions.
//!
//! OS releases are numbered `build.branch.patch`, which orders correctly as
//! semantic versions.

use crate::error::{CommonError, Result};
use std::fmt;
use std::str::FromStr;

/// A parsed OS image version.
///
/// # Examples
///
/// ```
/// use nodeprep_common::os_version::OsVersion;
///
/// let epoch: OsVersion = "1520.2.0".parse()?;
/// let current: OsVersion = "1576.4.0".parse()?;
/// assert!(epoch < current);
/// # Ok::<(), nodeprep_common::CommonError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion(semver::Version);

impl OsVersion {
    /// Returns the underlying semantic version.
    #[must_use]
    pub const fn as_semver(&self) -> &semver::Version {
        &self.0
    }
}

impl FromStr for OsVersion {
    type Err = CommonError;

    fn from_str(value: &str) -> Result<Self> {
        semver::Version::parse(value.trim())
            .map(Self)
            .map_err(|source| CommonError::InvalidVersion {
                value: value.to_owned(),
                source,
            })
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Returns `true` when `candidate` is older than `epoch`.
///
/// A candidate that does not parse counts as older, so callers treat an
/// unrecognisable image like one that predates remote packages.
///
/// # Examples
///
/// ```
/// use nodeprep_common::os_version::{OsVersion, predates};
///
/// let epoch: OsVersion = "1520.2.0".parse()?;
/// assert!(predates("1465.7.0", &epoch));
/// assert!(!predates("1520.2.0", &epoch));
/// assert!(predates("not-a-version", &epoch));
/// # Ok::<(), nodeprep_common::CommonError>(())
/// ```
#[must_use]
pub fn predates(candidate: &str, epoch: &OsVersion) -> bool {
    match candidate.parse::<OsVersion>() {
        Ok(version) => version < *epoch,
        Err(err) => {
            log::warn!("treating OS version {candidate:?} as pre-epoch: {err}");
            true
        }
    }
}
