//! Add-on version selection across the current and upcoming OS image.
//!
//! The upcoming image is the primary target: the node will boot it next,
//! so the chosen version must exist there. The running image is staged as
//! well when it offers the same version, covering a rolled-back update.

use crate::manifest::{ManifestError, ManifestSource};
use crate::state::{OsState, Selection, TargetSet};
use nodeprep_common::os_version::{OsVersion, predates};
use thiserror::Error;

/// First OS release whose add-ons are published remotely.
pub const DEFAULT_EPOCH: &str = "1520.2.0";

/// Errors raised by version selection.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// None of the preferred versions is offered for the primary OS.
    #[error("no suitable {package} version for OS {os_version} among {preferred:?}")]
    NoSuitableVersion {
        /// Package being selected.
        package: String,
        /// The primary OS version.
        os_version: String,
        /// The versions that were acceptable.
        preferred: Vec<String>,
    },

    /// A manifest needed for the decision could not be obtained.
    #[error("could not get package manifest for OS {os_version}")]
    Manifest {
        /// OS version whose manifest failed.
        os_version: String,
        /// The manifest failure.
        #[source]
        source: ManifestError,
    },
}

/// Chooses the add-on version and the OS versions to stage it for.
///
/// `preferred` is ordered most preferred first; manifest order is ignored.
///
/// # Errors
///
/// Returns [`StrategyError::NoSuitableVersion`] when the primary OS offers
/// none of the preferred versions, and [`StrategyError::Manifest`] when a
/// required manifest cannot be obtained.
pub fn pick_version(
    manifests: &mut dyn ManifestSource,
    os: &OsState,
    epoch: &OsVersion,
    package: &str,
    preferred: &[String],
) -> Result<Selection, StrategyError> {
    let (primary, secondary) = os.next.as_deref().map_or((os.current.as_str(), None), |next| {
        (next, Some(os.current.as_str()).filter(|current| *current != next))
    });
    log::info!("determining {package} version for OS {primary}");

    if predates(primary, epoch) {
        log::warn!("OS {primary} predates remote packages ({epoch}); nothing to install");
        return Ok(Selection::Skip);
    }

    let primary_manifest = manifests
        .manifest(primary)
        .map_err(|source| StrategyError::Manifest {
            os_version: primary.to_owned(),
            source,
        })?;
    let version = preferred
        .iter()
        .find(|candidate| primary_manifest.is_installable(package, candidate))
        .ok_or_else(|| StrategyError::NoSuitableVersion {
            package: package.to_owned(),
            os_version: primary.to_owned(),
            preferred: preferred.to_vec(),
        })?;

    let also = match secondary {
        Some(other) if predates(other, epoch) => {
            log::debug!("OS {other} predates remote packages; not staging for it");
            None
        }
        Some(other) => {
            let other_manifest =
                manifests
                    .manifest(other)
                    .map_err(|source| StrategyError::Manifest {
                        os_version: other.to_owned(),
                        source,
                    })?;
            if other_manifest.is_installable(package, version) {
                Some(other)
            } else {
                log::info!("{package} {version} is not offered for OS {other}");
                None
            }
        }
        None => None,
    };

    let targets = TargetSet::new(primary, also);
    log::info!("selected {package} {version} for OS versions {targets}");
    Ok(Selection::Install {
        version: version.clone(),
        targets,
    })
}
