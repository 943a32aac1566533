//! Obtaining add-on archives before they are staged.
//!
//! Local stores are searched first so that an archive already present for
//! another OS version is reused rather than downloaded again. Content is
//! trusted by digest alone; file names and directories carry no weight.

use crate::digest::DigestError;
use crate::download::{DownloadError, HttpFetcher};
use crate::manifest::{Artefact, Location};
use crate::signature::{SignatureError, SignaturePolicy, SignatureVerifier, signature_url};
use camino::{Utf8Path, Utf8PathBuf};
use std::io::{Seek, SeekFrom};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors raised while obtaining an archive.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The archive could not be downloaded.
    #[error("failed to download {url}")]
    Download {
        /// The archive URL.
        url: String,
        /// The transport failure.
        #[source]
        source: DownloadError,
    },

    /// The archive content does not match the manifest.
    #[error("{name} {version} from {location} failed verification")]
    Digest {
        /// Package name.
        name: String,
        /// Package version.
        version: String,
        /// Where the content came from.
        location: String,
        /// The digest failure.
        #[source]
        source: DigestError,
    },

    /// The detached signature was missing or rejected.
    #[error("signature check failed for {url}")]
    Signature {
        /// The archive URL.
        url: String,
        /// The signature failure.
        #[source]
        source: SignatureError,
    },

    /// The signature file could not be downloaded.
    #[error("failed to download signature {url}")]
    SignatureDownload {
        /// The signature URL.
        url: String,
        /// The transport failure.
        #[source]
        source: DownloadError,
    },

    /// A scratch file could not be created or read.
    #[error("scratch file error")]
    Scratch(#[source] std::io::Error),
}

/// A verified archive ready to be staged.
#[derive(Debug)]
pub enum FetchedAddon {
    /// An archive that already exists on disk.
    Existing(Utf8PathBuf),
    /// A downloaded archive, removed when dropped.
    Downloaded {
        /// Scratch file holding the archive.
        file: NamedTempFile,
        /// Location of `file`.
        path: Utf8PathBuf,
    },
}

impl FetchedAddon {
    /// Location of the archive on disk.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        match self {
            Self::Existing(path) | Self::Downloaded { path, .. } => path,
        }
    }

    /// Returns `true` when no network transfer was needed.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

/// Searches local stores and falls back to downloading.
pub struct AddonFetcher<'a> {
    fetcher: &'a dyn HttpFetcher,
    verifier: &'a dyn SignatureVerifier,
    policy: SignaturePolicy,
    search_roots: Vec<Utf8PathBuf>,
    scratch_dir: Option<Utf8PathBuf>,
}

impl<'a> AddonFetcher<'a> {
    /// Creates a fetcher that searches `search_roots` in order.
    #[must_use]
    pub fn new(
        fetcher: &'a dyn HttpFetcher,
        verifier: &'a dyn SignatureVerifier,
        policy: SignaturePolicy,
        search_roots: Vec<Utf8PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            verifier,
            policy,
            search_roots,
            scratch_dir: None,
        }
    }

    /// Downloads into `dir` instead of the system temporary directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: &Utf8Path) -> Self {
        self.scratch_dir = Some(dir.to_owned());
        self
    }

    /// Returns a verified copy of the archive described by `artefact`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] when no local copy matches and the archive
    /// cannot be downloaded or fails its digest or signature checks. A
    /// rejected download is deleted before the error is returned.
    pub fn fetch_addon(&self, artefact: &Artefact<'_>) -> Result<FetchedAddon, FetchError> {
        if let Some(found) = self.find_local(artefact) {
            log::info!(
                "reusing {} {} from {found}",
                artefact.name,
                artefact.version
            );
            return Ok(FetchedAddon::Existing(found));
        }

        match artefact.location {
            Location::Path(path) => {
                artefact
                    .digest
                    .verify_file(path)
                    .map_err(|source| digest_error(artefact, source))?;
                Ok(FetchedAddon::Existing(path.clone()))
            }
            Location::Url(url) => self.download(artefact, url),
        }
    }

    fn find_local(&self, artefact: &Artefact<'_>) -> Option<Utf8PathBuf> {
        let file_name = artefact.file_name();
        self.search_roots
            .iter()
            .flat_map(|root| candidate_dirs(root))
            .map(|dir| dir.join(&file_name))
            .filter(|candidate| candidate.is_file())
            .find(|candidate| match artefact.digest.verify_file(candidate) {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("ignoring {candidate}: {err}");
                    false
                }
            })
    }

    fn download(&self, artefact: &Artefact<'_>, url: &str) -> Result<FetchedAddon, FetchError> {
        let mut scratch = self
            .scratch_dir
            .as_ref()
            .map_or_else(NamedTempFile::new, NamedTempFile::new_in)
            .map_err(FetchError::Scratch)?;
        let path = Utf8PathBuf::try_from(scratch.path().to_path_buf())
            .map_err(|err| FetchError::Scratch(err.into_io_error()))?;

        log::info!("downloading {} {} from {url}", artefact.name, artefact.version);
        self.fetcher
            .fetch_to_file(url, path.as_std_path())
            .map_err(|source| FetchError::Download {
                url: url.to_owned(),
                source,
            })?;

        rewind(&mut scratch)?;
        artefact
            .digest
            .verify(scratch.as_file_mut())
            .map_err(|source| digest_error(artefact, source))?;

        if self.policy.is_required() {
            let sig_url = signature_url(url);
            let signature =
                self.fetcher
                    .fetch_bytes(&sig_url)
                    .map_err(|source| FetchError::SignatureDownload {
                        url: sig_url.clone(),
                        source,
                    })?;
            self.verifier
                .verify_file(&path, &signature)
                .map_err(|source| FetchError::Signature {
                    url: url.to_owned(),
                    source,
                })?;
        }

        Ok(FetchedAddon::Downloaded {
            file: scratch,
            path,
        })
    }
}

fn rewind(scratch: &mut NamedTempFile) -> Result<(), FetchError> {
    scratch
        .as_file_mut()
        .seek(SeekFrom::Start(0))
        .map(|_| ())
        .map_err(FetchError::Scratch)
}

fn digest_error(artefact: &Artefact<'_>, source: DigestError) -> FetchError {
    FetchError::Digest {
        name: artefact.name.to_owned(),
        version: artefact.version.to_owned(),
        location: artefact.location.to_string(),
        source,
    }
}

/// The root itself followed by its immediate subdirectories, sorted.
fn candidate_dirs(root: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut dirs = vec![root.to_owned()];
    let Ok(entries) = root.read_dir_utf8() else {
        return dirs;
    };
    let mut children: Vec<Utf8PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .map(|entry| entry.path().to_owned())
        .collect();
    children.sort();
    dirs.extend(children);
    dirs
}
