//! JSON parsing of `torcx-package-list-v0` documents.

use super::error::ManifestError;
use super::model::{Location, ManifestBuilder, PackageManifest};
use crate::digest::ContentDigest;
use camino::Utf8PathBuf;
use serde::Deserialize;

/// Envelope kind of a package list.
pub const PACKAGE_LIST_KIND: &str = "torcx-package-list-v0";

#[derive(Deserialize)]
struct Envelope {
    kind: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct RawPackageList {
    #[serde(default)]
    packages: Vec<RawPackage>,
}

#[derive(Deserialize)]
struct RawPackage {
    name: String,
    #[serde(default, rename = "DefaultVersion", alias = "defaultVersion")]
    default_version: Option<String>,
    #[serde(default)]
    versions: Vec<RawVersion>,
}

#[derive(Deserialize)]
struct RawVersion {
    version: String,
    hash: String,
    #[serde(default)]
    locations: Vec<RawLocation>,
}

#[derive(Deserialize)]
struct RawLocation {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Parses a package-list document.
///
/// The envelope kind is checked before the body is interpreted, so a
/// document from a newer schema fails with
/// [`ManifestError::UnexpectedKind`] rather than a shape error.
///
/// # Errors
///
/// Returns an error for malformed JSON, a foreign kind, duplicate
/// packages or versions, invalid hashes, or empty locations.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::manifest::parse_manifest;
///
/// let doc = br#"{"kind":"torcx-package-list-v0","value":{"packages":[]}}"#;
/// let manifest = parse_manifest(doc)?;
/// assert_eq!(manifest.packages().count(), 0);
/// # Ok::<(), nodeprep_agent::manifest::ManifestError>(())
/// ```
pub fn parse_manifest(data: &[u8]) -> Result<PackageManifest, ManifestError> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    if envelope.kind != PACKAGE_LIST_KIND {
        return Err(ManifestError::UnexpectedKind {
            expected: PACKAGE_LIST_KIND,
            found: envelope.kind,
        });
    }
    let list: RawPackageList = serde_json::from_value(envelope.value)?;

    let mut builder = ManifestBuilder::default();
    for package in list.packages {
        let package_key = builder.add_package(&package.name, package.default_version.as_deref())?;
        for version in package.versions {
            let digest: ContentDigest =
                version
                    .hash
                    .parse()
                    .map_err(|source| ManifestError::InvalidDigest {
                        name: package.name.clone(),
                        version: version.version.clone(),
                        source,
                    })?;
            let version_key = builder.add_version(package_key, &version.version, digest)?;
            for raw in version.locations {
                let location =
                    into_location(raw).ok_or_else(|| ManifestError::EmptyLocation {
                        name: package.name.clone(),
                        version: version.version.clone(),
                    })?;
                builder.add_location(version_key, location)?;
            }
        }
    }

    Ok(builder.build())
}

fn into_location(raw: RawLocation) -> Option<Location> {
    let path = raw.path.filter(|value| !value.is_empty());
    let url = raw.url.filter(|value| !value.is_empty());
    match (path, url) {
        (Some(path), _) => Some(Location::Path(Utf8PathBuf::from(path))),
        (None, Some(url)) => Some(Location::Url(url)),
        (None, None) => None,
    }
}
