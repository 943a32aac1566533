//! Error types for manifest resolution.

use crate::digest::DigestError;
use crate::download::DownloadError;
use crate::signature::SignatureError;
use thiserror::Error;

/// Errors raised while fetching, parsing, or querying a package manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest URL template is malformed.
    #[error("invalid manifest URL template {template:?}: {reason}")]
    InvalidTemplate {
        /// The configured template.
        template: String,
        /// Description of the problem.
        reason: String,
    },

    /// The manifest or its signature could not be downloaded.
    #[error("could not fetch {url}")]
    Fetch {
        /// The URL that failed.
        url: String,
        /// The download failure.
        #[source]
        source: DownloadError,
    },

    /// The manifest signature did not verify.
    #[error("signature verification failed for {url}")]
    Signature {
        /// The manifest URL.
        url: String,
        /// The verifier failure.
        #[source]
        source: SignatureError,
    },

    /// The manifest document was rejected.
    #[error("invalid manifest at {url}")]
    Document {
        /// The manifest URL.
        url: String,
        /// What was wrong with the document.
        #[source]
        source: Box<ManifestError>,
    },

    /// The document is not JSON of the expected shape.
    #[error("malformed manifest document")]
    Json(#[from] serde_json::Error),

    /// The envelope carries a kind other than the package list.
    #[error("unexpected manifest kind {found:?}, expected {expected:?}")]
    UnexpectedKind {
        /// The kind this agent understands.
        expected: &'static str,
        /// The kind found in the document.
        found: String,
    },

    /// Two packages share a name.
    #[error("package {name} is listed more than once")]
    DuplicatePackage {
        /// The repeated package name.
        name: String,
    },

    /// A package lists the same version twice.
    #[error("package {name} lists version {version} more than once")]
    DuplicateVersion {
        /// Package name.
        name: String,
        /// The repeated version.
        version: String,
    },

    /// A version declares an unusable digest.
    #[error("package {name} version {version} has an invalid hash")]
    InvalidDigest {
        /// Package name.
        name: String,
        /// Package version.
        version: String,
        /// The digest parse failure.
        #[source]
        source: DigestError,
    },

    /// A location entry names neither a path nor a URL.
    #[error("package {name} version {version} has an empty location")]
    EmptyLocation {
        /// Package name.
        name: String,
        /// Package version.
        version: String,
    },

    /// A key from another manifest was used.
    #[error("manifest key does not belong to this manifest")]
    UnknownKey,

    /// The OS image does not list the package at all.
    #[error("OS does not include package {name}")]
    PackageNotFound {
        /// Package name.
        name: String,
    },

    /// The package exists but not at the requested version.
    #[error("could not find version {version} for package {name}")]
    VersionNotFound {
        /// Package name.
        name: String,
        /// Requested version.
        version: String,
    },

    /// The version exists but lists no locations.
    #[error("package {name} version {version} has no locations")]
    NoLocation {
        /// Package name.
        name: String,
        /// Package version.
        version: String,
    },
}
