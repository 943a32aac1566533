//! Per-OS-version manifest retrieval and caching.

use super::error::ManifestError;
use super::model::PackageManifest;
use super::parser::parse_manifest;
use crate::download::HttpFetcher;
use crate::signature::{SignaturePolicy, SignatureVerifier, signature_url};
use std::collections::HashMap;
use std::sync::Arc;

/// Published location of the package manifests.
pub const DEFAULT_MANIFEST_URL_TEMPLATE: &str =
    "https://tectonic-torcx.release.core-os.net/manifests/{board}/{os_version}/torcx_manifest.json";

const PLACEHOLDERS: [&str; 2] = ["board", "os_version"];

/// A manifest URL with `{board}` and `{os_version}` placeholders.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::manifest::UrlTemplate;
///
/// let template = UrlTemplate::new("https://m.test/{board}/{os_version}.json")?;
/// assert_eq!(template.render("amd64-usr", "1576.4.0"), "https://m.test/amd64-usr/1576.4.0.json");
/// assert!(UrlTemplate::new("https://m.test/{arch}.json").is_err());
/// # Ok::<(), nodeprep_agent::manifest::ManifestError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    template: String,
}

impl UrlTemplate {
    /// Validates a template.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::InvalidTemplate`] for unknown placeholders
    /// or unbalanced braces.
    pub fn new(template: &str) -> Result<Self, ManifestError> {
        let invalid = |reason: String| ManifestError::InvalidTemplate {
            template: template.to_owned(),
            reason,
        };

        let mut rest = template;
        while let Some(open) = rest.find(['{', '}']) {
            let tail = rest.get(open..).unwrap_or_default();
            if tail.starts_with('}') {
                return Err(invalid("unmatched '}'".to_owned()));
            }
            let body = tail.get(1..).unwrap_or_default();
            let close = body
                .find('}')
                .ok_or_else(|| invalid("unterminated placeholder".to_owned()))?;
            let (name, after) = body.split_at(close);
            if !PLACEHOLDERS.contains(&name) {
                return Err(invalid(format!("unknown placeholder {{{name}}}")));
            }
            rest = after.get(1..).unwrap_or_default();
        }

        Ok(Self {
            template: template.to_owned(),
        })
    }

    /// Substitutes the placeholders.
    #[must_use]
    pub fn render(&self, board: &str, os_version: &str) -> String {
        self.template
            .replace("{board}", board)
            .replace("{os_version}", os_version)
    }
}

/// Anything that can produce the manifest for an OS version.
pub trait ManifestSource {
    /// Returns the manifest for `os_version`.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] when the manifest cannot be produced.
    fn manifest(&mut self, os_version: &str) -> Result<Arc<PackageManifest>, ManifestError>;
}

/// Fetches, verifies, and caches manifests for the lifetime of a run.
///
/// Only manifests that passed signature and kind checks enter the cache;
/// failures are never cached, so each call retries from scratch.
pub struct ManifestStore<'a> {
    template: UrlTemplate,
    board: String,
    fetcher: &'a dyn HttpFetcher,
    verifier: &'a dyn SignatureVerifier,
    policy: SignaturePolicy,
    cache: HashMap<String, Arc<PackageManifest>>,
}

impl<'a> ManifestStore<'a> {
    /// Creates an empty store.
    #[must_use]
    pub fn new(
        template: UrlTemplate,
        board: &str,
        fetcher: &'a dyn HttpFetcher,
        verifier: &'a dyn SignatureVerifier,
        policy: SignaturePolicy,
    ) -> Self {
        Self {
            template,
            board: board.to_owned(),
            fetcher,
            verifier,
            policy,
            cache: HashMap::new(),
        }
    }

    /// Returns the manifest for `os_version`, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or its signature cannot be
    /// downloaded, the signature is rejected, or the document is invalid.
    pub fn get_manifest(&mut self, os_version: &str) -> Result<Arc<PackageManifest>, ManifestError> {
        if let Some(cached) = self.cache.get(os_version) {
            return Ok(Arc::clone(cached));
        }

        let url = self.template.render(&self.board, os_version);
        log::info!("fetching package manifest for OS {os_version} from {url}");
        let body = self
            .fetcher
            .fetch_bytes(&url)
            .map_err(|source| ManifestError::Fetch {
                url: url.clone(),
                source,
            })?;

        if self.policy.is_required() {
            self.verify(&url, &body)?;
        }

        let manifest = parse_manifest(&body)
            .map(Arc::new)
            .map_err(|source| ManifestError::Document {
                url,
                source: Box::new(source),
            })?;
        self.cache
            .insert(os_version.to_owned(), Arc::clone(&manifest));
        Ok(manifest)
    }

    fn verify(&self, url: &str, body: &[u8]) -> Result<(), ManifestError> {
        let sig_url = signature_url(url);
        let signature = self
            .fetcher
            .fetch_bytes(&sig_url)
            .map_err(|source| ManifestError::Fetch {
                url: sig_url,
                source,
            })?;
        let mut reader = body;
        self.verifier
            .verify(&mut reader, &signature)
            .map_err(|source| ManifestError::Signature {
                url: url.to_owned(),
                source,
            })
    }
}

impl ManifestSource for ManifestStore<'_> {
    fn manifest(&mut self, os_version: &str) -> Result<Arc<PackageManifest>, ManifestError> {
        self.get_manifest(os_version)
    }
}
