//! Package manifests: the signed list of add-on versions and their
//! locations published for each OS version.
//!
//! - [`parser`] reads `torcx-package-list-v0` documents into the arena
//!   [`model`].
//! - [`store`] renders manifest URLs, verifies signatures, and caches one
//!   manifest per OS version.
//! - [`PackageManifest::location_for`] resolves a package version to its
//!   preferred location.

pub mod error;
pub mod model;
pub mod parser;
pub mod store;

pub use error::ManifestError;
pub use model::{
    Artefact, Location, LocationEntry, LocationKey, ManifestBuilder, Package, PackageKey,
    PackageManifest, PackageVersion, VersionKey, archive_file_name,
};
pub use parser::{PACKAGE_LIST_KIND, parse_manifest};
pub use store::{DEFAULT_MANIFEST_URL_TEMPLATE, ManifestSource, ManifestStore, UrlTemplate};

#[cfg(test)]
mod tests;
