//! HTTP retrieval of manifests, signatures, and add-on archives.
//!
//! Provides a trait-based abstraction so manifest resolution and the
//! fetch pipeline can be tested without network access.

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Overall timeout for small documents such as manifests and signatures.
const DOCUMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for connecting and for the response headers of an archive.
/// The body is not bounded, so slow links can still finish large transfers.
const ARCHIVE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for fetching remote documents and files.
#[cfg_attr(test, mockall::automock)]
pub trait HttpFetcher {
    /// Downloads `url` into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server answers with a
    /// non-success status.
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, DownloadError>;

    /// Streams `url` into the file at `dest` and syncs it to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the request or the file write fails.
    fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<(), DownloadError>;
}

/// Errors arising from HTTP retrieval.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// HTTP request failed.
    #[error("download failed for {url}: {reason}")]
    HttpError {
        /// The URL that was requested.
        url: String,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// The requested document was not found (HTTP 404).
    #[error("not found: {url}")]
    NotFound {
        /// The URL that returned 404.
        url: String,
    },

    /// I/O error writing the downloaded file.
    #[error("I/O error writing download: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP fetcher backed by a shared `ureq` agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct UreqFetcher;

impl HttpFetcher for UreqFetcher {
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        log::debug!("GET {url}");
        let response = document_agent()
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, &e))?;
        response
            .into_body()
            .read_to_vec()
            .map_err(|e| DownloadError::HttpError {
                url: url.to_owned(),
                reason: e.to_string(),
            })
    }

    fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        log::debug!("GET {url} > {}", dest.display());
        let response = archive_agent()
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, &e))?;
        let mut file = std::fs::File::create(dest)?;
        std::io::copy(&mut response.into_body().as_reader(), &mut file).map_err(|e| {
            DownloadError::HttpError {
                url: url.to_owned(),
                reason: e.to_string(),
            }
        })?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// Shared agent for documents, bounded end to end.
fn document_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| ureq::Agent::new_with_config(document_config()))
}

/// Shared agent for archives, bounded only until the body starts.
fn archive_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| ureq::Agent::new_with_config(archive_config()))
}

fn document_config() -> ureq::config::Config {
    ureq::Agent::config_builder()
        .timeout_global(Some(DOCUMENT_TIMEOUT))
        .build()
}

fn archive_config() -> ureq::config::Config {
    ureq::Agent::config_builder()
        .timeout_connect(Some(ARCHIVE_RESPONSE_TIMEOUT))
        .timeout_recv_response(Some(ARCHIVE_RESPONSE_TIMEOUT))
        .build()
}

/// Map a ureq error to a [`DownloadError`].
fn map_ureq_error(url: &str, err: &ureq::Error) -> DownloadError {
    match err {
        ureq::Error::StatusCode(404) => DownloadError::NotFound {
            url: url.to_owned(),
        },
        other => DownloadError::HttpError {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}
