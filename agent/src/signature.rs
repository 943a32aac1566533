//! Detached-signature verification.
//!
//! Manifests and add-on archives are published next to an armoured
//! detached signature at `<url>.asc`. [`SignaturePolicy`] decides whether
//! signatures are checked at all; [`GpgvVerifier`] checks them against a
//! keyring with `gpgv`.

use crate::exec::{CommandExecutor, ExecError, stderr_text};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

/// Suffix of the detached signature published next to each artefact.
pub const SIGNATURE_SUFFIX: &str = ".asc";

/// Default keyring holding the release signing keys.
pub const DEFAULT_KEYRING_PATH: &str = "/usr/share/torcx/release-keyring.gpg";

/// Errors raised while checking a signature.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The signature did not validate against the keyring.
    #[error("signature rejected by keyring {keyring}: {message}")]
    Rejected {
        /// Keyring the signature was checked against.
        keyring: Utf8PathBuf,
        /// Verifier output.
        message: String,
    },

    /// The verifier could not be run.
    #[error("signature verifier failed to run")]
    Exec(#[from] ExecError),

    /// Preparing the verifier input failed.
    #[error("failed to prepare signature verification input")]
    Io(#[from] std::io::Error),
}

/// Capability for validating detached signatures.
pub trait SignatureVerifier {
    /// Checks `signature` over everything `data` yields.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Rejected`] when the signature is invalid.
    fn verify(&self, data: &mut dyn Read, signature: &[u8]) -> Result<(), SignatureError>;

    /// Checks `signature` over the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Rejected`] when the signature is invalid,
    /// or [`SignatureError::Io`] when the file cannot be read.
    fn verify_file(&self, path: &Utf8Path, signature: &[u8]) -> Result<(), SignatureError> {
        let mut file = std::fs::File::open(path)?;
        self.verify(&mut file, signature)
    }
}

/// Whether artefact signatures are checked.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::signature::SignaturePolicy;
///
/// assert!(SignaturePolicy::default().is_required());
/// assert_eq!(SignaturePolicy::Disabled.to_string(), "signature verification disabled");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// Fetch and verify `<url>.asc` for every download.
    #[default]
    Required,
    /// Skip signature checks; digests are still enforced.
    Disabled,
}

impl SignaturePolicy {
    /// Returns `true` when signatures must be verified.
    #[must_use]
    pub const fn is_required(self) -> bool {
        matches!(self, Self::Required)
    }
}

impl fmt::Display for SignaturePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "signature verification required"),
            Self::Disabled => write!(f, "signature verification disabled"),
        }
    }
}

/// Returns the signature URL for an artefact URL.
#[must_use]
pub fn signature_url(url: &str) -> String {
    format!("{url}{SIGNATURE_SUFFIX}")
}

/// Verifies signatures by running `gpgv` against a keyring.
pub struct GpgvVerifier<'a> {
    executor: &'a dyn CommandExecutor,
    keyring: Utf8PathBuf,
}

impl<'a> GpgvVerifier<'a> {
    /// Creates a verifier that trusts the keys in `keyring`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, keyring: &Utf8Path) -> Self {
        Self {
            executor,
            keyring: keyring.to_owned(),
        }
    }
}

impl SignatureVerifier for GpgvVerifier<'_> {
    fn verify(&self, data: &mut dyn Read, signature: &[u8]) -> Result<(), SignatureError> {
        let mut data_file = tempfile::NamedTempFile::new()?;
        std::io::copy(data, &mut data_file)?;
        data_file.as_file().sync_all()?;

        let data_path = Utf8PathBuf::try_from(data_file.path().to_path_buf())
            .map_err(camino::FromPathBufError::into_io_error)?;
        self.verify_file(&data_path, signature)
    }

    fn verify_file(&self, path: &Utf8Path, signature: &[u8]) -> Result<(), SignatureError> {
        let mut signature_file = tempfile::Builder::new().suffix(SIGNATURE_SUFFIX).tempfile()?;
        signature_file.write_all(signature)?;
        signature_file.as_file().sync_all()?;

        let signature_path = signature_file.path().to_string_lossy().into_owned();
        let output = self.executor.run(
            "gpgv",
            &[
                "--keyring",
                self.keyring.as_str(),
                signature_path.as_str(),
                path.as_str(),
            ],
        )?;

        if output.status.success() {
            log::debug!("signature accepted by {}", self.keyring);
            Ok(())
        } else {
            Err(SignatureError::Rejected {
                keyring: self.keyring.clone(),
                message: stderr_text(&output),
            })
        }
    }
}
