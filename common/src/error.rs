//! Error types for host metadata parsing.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing host metadata files.
#[derive(Debug, Error)]
pub enum CommonError {
    /// A metadata file could not be read.
    #[error("failed to read {path}")]
    Read {
        /// Path of the file that could not be read.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A metadata file could not be written.
    #[error("failed to write {path}")]
    Write {
        /// Path of the file that could not be written.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A required key was absent from every consulted file.
    #[error("{path}: missing required key {key}")]
    MissingKey {
        /// The last file consulted.
        path: Utf8PathBuf,
        /// Name of the missing key.
        key: &'static str,
    },

    /// No board key was present and the host architecture has no default.
    #[error("no board recorded and no default board for architecture {arch}")]
    UnknownArchitecture {
        /// The host architecture name.
        arch: String,
    },

    /// A string could not be parsed as an OS version.
    #[error("invalid OS version {value:?}")]
    InvalidVersion {
        /// The offending input.
        value: String,
        /// The parser error.
        #[source]
        source: semver::Error,
    },
}

/// Result type for host metadata operations.
pub type Result<T> = std::result::Result<T, CommonError>;
