//! Arena model of a parsed package manifest.
//!
//! The manifest owns three slabs (packages, versions, locations). Each
//! entry records the key of its owner once, at insertion, and resolution
//! hands out keys rather than references into other entries.

use super::error::ManifestError;
use crate::digest::ContentDigest;
use camino::Utf8PathBuf;
use std::fmt;

/// Key of a [`Package`] within its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageKey(usize);

/// Key of a [`PackageVersion`] within its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionKey(usize);

/// Key of a [`LocationEntry`] within its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationKey(usize);

/// Where an archive can be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A file already present on the node, usually in the vendor store
    /// shipped with the OS image.
    Path(Utf8PathBuf),
    /// A remote archive that must be downloaded.
    Url(String),
}

impl Location {
    /// Returns `true` for on-disk locations.
    #[must_use]
    pub const fn is_path(&self) -> bool {
        matches!(self, Self::Path(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{path}"),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

/// A named add-on and its published versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    name: String,
    default_version: Option<String>,
    versions: Vec<VersionKey>,
}

impl Package {
    /// Package name, for example `docker`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version the OS image activates when no profile overrides it.
    #[must_use]
    pub fn default_version(&self) -> Option<&str> {
        self.default_version.as_deref()
    }

    /// Versions in document order.
    #[must_use]
    pub fn versions(&self) -> &[VersionKey] {
        &self.versions
    }
}

/// One published version of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageVersion {
    package: PackageKey,
    version: String,
    digest: ContentDigest,
    locations: Vec<LocationKey>,
}

impl PackageVersion {
    /// Key of the owning package.
    #[must_use]
    pub const fn package(&self) -> PackageKey {
        self.package
    }

    /// Version string, for example `17.09`.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Declared digest of the archive.
    #[must_use]
    pub const fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    /// Locations in document order.
    #[must_use]
    pub fn locations(&self) -> &[LocationKey] {
        &self.locations
    }
}

/// A location together with the key of the version it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationEntry {
    version: VersionKey,
    location: Location,
}

impl LocationEntry {
    /// Key of the owning version.
    #[must_use]
    pub const fn version(&self) -> VersionKey {
        self.version
    }

    /// The location itself.
    #[must_use]
    pub const fn location(&self) -> &Location {
        &self.location
    }
}

/// Everything needed to fetch and check one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Artefact<'m> {
    /// Package name.
    pub name: &'m str,
    /// Package version.
    pub version: &'m str,
    /// Declared digest.
    pub digest: &'m ContentDigest,
    /// Chosen location.
    pub location: &'m Location,
}

impl Artefact<'_> {
    /// Store file name for this archive: `<name>:<version>.torcx.tgz`.
    #[must_use]
    pub fn file_name(&self) -> String {
        archive_file_name(self.name, self.version)
    }
}

/// Store file name for an archive.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::manifest::archive_file_name;
///
/// assert_eq!(archive_file_name("docker", "17.09"), "docker:17.09.torcx.tgz");
/// ```
#[must_use]
pub fn archive_file_name(name: &str, version: &str) -> String {
    format!("{name}:{version}.torcx.tgz")
}

/// The add-on packages available for one OS version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageManifest {
    packages: Vec<Package>,
    versions: Vec<PackageVersion>,
    locations: Vec<LocationEntry>,
}

impl PackageManifest {
    /// Packages in document order.
    pub fn packages(&self) -> impl Iterator<Item = (PackageKey, &Package)> {
        self.packages
            .iter()
            .enumerate()
            .map(|(index, package)| (PackageKey(index), package))
    }

    /// Looks up a package by key.
    #[must_use]
    pub fn package(&self, key: PackageKey) -> Option<&Package> {
        self.packages.get(key.0)
    }

    /// Looks up a version by key.
    #[must_use]
    pub fn version(&self, key: VersionKey) -> Option<&PackageVersion> {
        self.versions.get(key.0)
    }

    /// Looks up a location by key.
    #[must_use]
    pub fn location(&self, key: LocationKey) -> Option<&LocationEntry> {
        self.locations.get(key.0)
    }

    /// Finds a package by name.
    #[must_use]
    pub fn find_package(&self, name: &str) -> Option<PackageKey> {
        self.packages()
            .find(|(_, package)| package.name == name)
            .map(|(key, _)| key)
    }

    /// Finds an exact version of a named package.
    #[must_use]
    pub fn find_version(&self, name: &str, version: &str) -> Option<VersionKey> {
        let package = self.package(self.find_package(name)?)?;
        package
            .versions
            .iter()
            .copied()
            .find(|key| self.version(*key).is_some_and(|entry| entry.version == version))
    }

    /// Returns `true` if `name` at `version` has at least one location.
    #[must_use]
    pub fn is_installable(&self, name: &str, version: &str) -> bool {
        self.find_version(name, version)
            .and_then(|key| self.version(key))
            .is_some_and(|entry| !entry.locations.is_empty())
    }

    /// Picks the best location for `name` at `version`.
    ///
    /// On-disk paths are preferred over URLs; among equals the first in
    /// document order wins.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::PackageNotFound`],
    /// [`ManifestError::VersionNotFound`], or [`ManifestError::NoLocation`].
    pub fn location_for(&self, name: &str, version: &str) -> Result<LocationKey, ManifestError> {
        let package = self
            .find_package(name)
            .ok_or_else(|| ManifestError::PackageNotFound {
                name: name.to_owned(),
            })?;
        let version_key =
            self.find_version(name, version)
                .ok_or_else(|| ManifestError::VersionNotFound {
                    name: name.to_owned(),
                    version: version.to_owned(),
                })?;
        let entry = self
            .version(version_key)
            .filter(|entry| entry.package == package);

        let candidates = entry.map(|entry| entry.locations.as_slice()).unwrap_or_default();
        let on_disk = candidates.iter().copied().find(|key| {
            self.location(*key)
                .is_some_and(|location| location.location.is_path())
        });

        on_disk
            .or_else(|| candidates.first().copied())
            .ok_or_else(|| ManifestError::NoLocation {
                name: name.to_owned(),
                version: version.to_owned(),
            })
    }

    /// Follows the owner keys of a location back to its version and
    /// package.
    #[must_use]
    pub fn artefact(&self, key: LocationKey) -> Option<Artefact<'_>> {
        let entry = self.location(key)?;
        let version = self.version(entry.version)?;
        let package = self.package(version.package)?;
        Some(Artefact {
            name: &package.name,
            version: &version.version,
            digest: &version.digest,
            location: &entry.location,
        })
    }
}

/// Incremental construction of a [`PackageManifest`].
///
/// Owner keys are assigned here and never change afterwards. Duplicate
/// package names and duplicate versions within a package are rejected.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    manifest: PackageManifest,
}

impl ManifestBuilder {
    /// Adds a package.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::DuplicatePackage`] if the name is taken.
    pub fn add_package(
        &mut self,
        name: &str,
        default_version: Option<&str>,
    ) -> Result<PackageKey, ManifestError> {
        if self.manifest.find_package(name).is_some() {
            return Err(ManifestError::DuplicatePackage {
                name: name.to_owned(),
            });
        }
        let key = PackageKey(self.manifest.packages.len());
        self.manifest.packages.push(Package {
            name: name.to_owned(),
            default_version: default_version
                .filter(|value| !value.is_empty())
                .map(str::to_owned),
            versions: Vec::new(),
        });
        Ok(key)
    }

    /// Adds a version to a package.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::DuplicateVersion`] if the package already
    /// lists `version`, or [`ManifestError::UnknownKey`] for a foreign key.
    pub fn add_version(
        &mut self,
        package: PackageKey,
        version: &str,
        digest: ContentDigest,
    ) -> Result<VersionKey, ManifestError> {
        let key = VersionKey(self.manifest.versions.len());
        let name = self
            .manifest
            .package(package)
            .map(|entry| entry.name.clone())
            .ok_or(ManifestError::UnknownKey)?;
        if self.manifest.find_version(&name, version).is_some() {
            return Err(ManifestError::DuplicateVersion {
                name,
                version: version.to_owned(),
            });
        }

        self.manifest.versions.push(PackageVersion {
            package,
            version: version.to_owned(),
            digest,
            locations: Vec::new(),
        });
        if let Some(entry) = self.manifest.packages.get_mut(package.0) {
            entry.versions.push(key);
        }
        Ok(key)
    }

    /// Adds a location to a version.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnknownKey`] for a foreign key.
    pub fn add_location(
        &mut self,
        version: VersionKey,
        location: Location,
    ) -> Result<LocationKey, ManifestError> {
        let key = LocationKey(self.manifest.locations.len());
        let entry = self
            .manifest
            .versions
            .get_mut(version.0)
            .ok_or(ManifestError::UnknownKey)?;
        entry.locations.push(key);
        self.manifest
            .locations
            .push(LocationEntry { version, location });
        Ok(key)
    }

    /// Finishes construction.
    #[must_use]
    pub fn build(self) -> PackageManifest {
        self.manifest
    }
}
