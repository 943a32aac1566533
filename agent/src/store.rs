//! The OS-version-partitioned add-on store.
//!
//! Archives live at `<root>/<os_version>/<name>:<version>.torcx.tgz`.
//! Buckets are created on first install and removed by [`AddonStore::gc`]
//! once no retained OS version refers to them.

use crate::digest::DigestError;
use crate::fetch::FetchedAddon;
use crate::manifest::Artefact;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use thiserror::Error;

/// Default user store root.
pub const DEFAULT_STORE_ROOT: &str = "/var/lib/torcx/store";

/// Read-only store shipped inside the OS image.
pub const VENDOR_STORE_ROOT: &str = "/usr/share/torcx/store";

/// Errors raised while writing to or pruning the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A directory could not be created.
    #[error("failed to create store directory {path}")]
    CreateDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Copying an archive into the store failed.
    #[error("failed to stage {from} into {to}")]
    Copy {
        /// Source file.
        from: Utf8PathBuf,
        /// Destination file.
        to: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The staged content does not match the declared digest.
    #[error("refusing to stage {path}")]
    Digest {
        /// Destination that was not written.
        path: Utf8PathBuf,
        /// The digest failure.
        #[source]
        source: DigestError,
    },

    /// The store root could not be listed.
    #[error("failed to list store {path}")]
    List {
        /// The store root.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A stale bucket could not be removed.
    #[error("failed to remove store bucket {path}")]
    Remove {
        /// The bucket.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// The writable add-on store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonStore {
    root: Utf8PathBuf,
}

impl AddonStore {
    /// Wraps the store rooted at `root`.
    #[must_use]
    pub fn new(root: &Utf8Path) -> Self {
        Self {
            root: root.to_owned(),
        }
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The bucket for `os_version`.
    #[must_use]
    pub fn bucket(&self, os_version: &str) -> Utf8PathBuf {
        self.root.join(os_version)
    }

    /// Copies a verified archive into the bucket for `os_version`.
    ///
    /// The copy goes through a temporary file in the bucket that is
    /// checked against the declared digest, synced, and renamed into
    /// place. An existing archive with the right digest is left alone.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the bucket cannot be created, the copy
    /// fails, or the content does not match the digest. Nothing is left at
    /// the destination on failure.
    pub fn stage(
        &self,
        fetched: FetchedAddon,
        artefact: &Artefact<'_>,
        os_version: &str,
    ) -> Result<Utf8PathBuf, StoreError> {
        let bucket = self.bucket(os_version);
        std::fs::create_dir_all(&bucket).map_err(|source| StoreError::CreateDir {
            path: bucket.clone(),
            source,
        })?;
        let destination = bucket.join(artefact.file_name());

        if destination.is_file() && artefact.digest.verify_file(&destination).is_ok() {
            log::info!("{destination} already staged");
            return Ok(destination);
        }

        let source = fetched.path().to_owned();
        let copy_err = |err: std::io::Error| StoreError::Copy {
            from: source.clone(),
            to: destination.clone(),
            source: err,
        };

        let mut staged = tempfile::NamedTempFile::new_in(&bucket).map_err(copy_err)?;
        let mut input = std::fs::File::open(&source).map_err(copy_err)?;
        std::io::copy(&mut input, &mut staged).map_err(copy_err)?;
        staged.as_file().sync_all().map_err(copy_err)?;

        let mut written = staged.reopen().map_err(copy_err)?;
        artefact
            .digest
            .verify(&mut written)
            .map_err(|err| StoreError::Digest {
                path: destination.clone(),
                source: err,
            })?;

        staged
            .persist(&destination)
            .map_err(|err| copy_err(err.error))?;
        sync_dir(&bucket);
        drop(fetched);
        log::info!("staged {} {} at {destination}", artefact.name, artefact.version);
        Ok(destination)
    }

    /// Removes every bucket whose OS version is not in `retain`.
    ///
    /// Loose files at the root are left alone. Fewer than two distinct
    /// retained versions make this a no-op. The first removal failure
    /// stops the sweep.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::List`] or [`StoreError::Remove`].
    pub fn gc(&self, retain: &[String]) -> Result<Vec<String>, StoreError> {
        let retained: BTreeSet<&str> = retain.iter().map(String::as_str).collect();
        if retained.len() < 2 {
            log::debug!("retaining {} OS version(s); skipping store GC", retained.len());
            return Ok(Vec::new());
        }

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::List {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::List {
                path: self.root.clone(),
                source,
            })?;
            let is_dir = entry.file_type().is_ok_and(|kind| kind.is_dir());
            let Ok(name) = entry.file_name().into_string() else {
                log::debug!("skipping non UTF-8 store entry {:?}", entry.file_name());
                continue;
            };
            if is_dir && !retained.contains(name.as_str()) {
                stale.push(name);
            }
        }
        stale.sort();

        for name in &stale {
            let path = self.root.join(name);
            log::info!("removing stale store bucket {path}");
            std::fs::remove_dir_all(&path).map_err(|source| StoreError::Remove {
                path: path.clone(),
                source,
            })?;
        }
        Ok(stale)
    }
}

fn sync_dir(dir: &Utf8Path) {
    if let Err(err) = std::fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        log::debug!("failed to sync {dir}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{ContentDigest, DigestAlgorithm};
    use crate::manifest::Location;
    use crate::test_utils::{archive_bytes, utf8_temp_dir};
    use rstest::rstest;

    fn digest_of(data: &[u8]) -> ContentDigest {
        ContentDigest::compute(DigestAlgorithm::Sha512, &mut &data[..]).expect("hash")
    }

    fn artefact<'a>(digest: &'a ContentDigest, location: &'a Location) -> Artefact<'a> {
        Artefact {
            name: "docker",
            version: "17.09",
            digest,
            location,
        }
    }

    #[test]
    fn stage_places_verified_archive_in_bucket() {
        let (_guard, root) = utf8_temp_dir();
        let store = AddonStore::new(&root.join("store"));
        let content = archive_bytes("docker", "17.09");
        let source = root.join("download");
        std::fs::write(&source, &content).expect("write");
        let digest = digest_of(&content);
        let location = Location::Url("https://pkgs.test/docker:17.09.torcx.tgz".to_owned());

        let staged = store
            .stage(
                FetchedAddon::Existing(source),
                &artefact(&digest, &location),
                "1576.4.0",
            )
            .expect("staged");

        assert_eq!(staged, root.join("store/1576.4.0/docker:17.09.torcx.tgz"));
        assert_eq!(std::fs::read(&staged).expect("read"), content);
        let leftovers = std::fs::read_dir(root.join("store/1576.4.0"))
            .expect("bucket")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn stage_consumes_downloaded_scratch_file() {
        let (_guard, root) = utf8_temp_dir();
        let store = AddonStore::new(&root.join("store"));
        let content = archive_bytes("docker", "17.09");
        let mut file = tempfile::NamedTempFile::new_in(&root).expect("scratch");
        std::io::Write::write_all(&mut file, &content).expect("write");
        let path = Utf8PathBuf::try_from(file.path().to_path_buf()).expect("UTF-8 scratch");
        let digest = digest_of(&content);
        let location = Location::Url("https://pkgs.test/docker:17.09.torcx.tgz".to_owned());

        let staged = store
            .stage(
                FetchedAddon::Downloaded {
                    file,
                    path: path.clone(),
                },
                &artefact(&digest, &location),
                "1576.4.0",
            )
            .expect("staged");

        assert_eq!(std::fs::read(&staged).expect("read"), content);
        assert!(!path.exists(), "scratch file should be removed");
    }

    #[test]
    fn stage_rejects_mismatched_content_and_leaves_nothing() {
        let (_guard, root) = utf8_temp_dir();
        let store = AddonStore::new(&root.join("store"));
        let source = root.join("download");
        std::fs::write(&source, b"tampered").expect("write");
        let digest = digest_of(b"genuine");
        let location = Location::Url("https://pkgs.test/docker:17.09.torcx.tgz".to_owned());

        let err = store
            .stage(
                FetchedAddon::Existing(source),
                &artefact(&digest, &location),
                "1576.4.0",
            )
            .expect_err("mismatch");

        assert!(matches!(err, StoreError::Digest { .. }));
        let leftovers = std::fs::read_dir(root.join("store/1576.4.0"))
            .expect("bucket")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn restaging_identical_archive_is_a_no_op() {
        let (_guard, root) = utf8_temp_dir();
        let store = AddonStore::new(&root.join("store"));
        let content = archive_bytes("docker", "17.09");
        let source = root.join("download");
        std::fs::write(&source, &content).expect("write");
        let digest = digest_of(&content);
        let location = Location::Url("https://pkgs.test/docker:17.09.torcx.tgz".to_owned());

        let first = store
            .stage(
                FetchedAddon::Existing(source.clone()),
                &artefact(&digest, &location),
                "1576.4.0",
            )
            .expect("first");
        std::fs::remove_file(&source).expect("remove source");
        let second = store
            .stage(
                FetchedAddon::Existing(source),
                &artefact(&digest, &location),
                "1576.4.0",
            )
            .expect("second");
        assert_eq!(first, second);
    }

    fn seeded_store(buckets: &[&str]) -> (tempfile::TempDir, AddonStore) {
        let (guard, root) = utf8_temp_dir();
        for bucket in buckets {
            std::fs::create_dir_all(root.join(bucket)).expect("bucket");
            std::fs::write(root.join(bucket).join("docker:1.12.torcx.tgz"), b"x").expect("file");
        }
        std::fs::write(root.join("loose.torcx.tgz"), b"x").expect("loose file");
        (guard, AddonStore::new(&root))
    }

    fn remaining(store: &AddonStore) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(store.root())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().into_string().expect("utf8"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn gc_removes_exactly_the_unretained_buckets() {
        let (_guard, store) = seeded_store(&["v0", "v1", "v2", "v3"]);

        let removed = store
            .gc(&["v2".to_owned(), "v3".to_owned()])
            .expect("gc");

        assert_eq!(removed, ["v0", "v1"]);
        assert_eq!(remaining(&store), ["loose.torcx.tgz", "v2", "v3"]);
    }

    #[rstest]
    #[case::single(vec!["v3"])]
    #[case::duplicate(vec!["v3", "v3"])]
    #[case::empty(vec![])]
    fn gc_with_fewer_than_two_retained_is_a_no_op(#[case] retain: Vec<&str>) {
        let (_guard, store) = seeded_store(&["v0", "v1", "v2", "v3"]);
        let retain: Vec<String> = retain.into_iter().map(str::to_owned).collect();

        let removed = store.gc(&retain).expect("gc");

        assert!(removed.is_empty());
        assert_eq!(remaining(&store).len(), 5);
    }

    #[test]
    fn gc_on_missing_store_is_a_no_op() {
        let (_guard, root) = utf8_temp_dir();
        let store = AddonStore::new(&root.join("absent"));
        assert!(store.gc(&["a".to_owned(), "b".to_owned()]).expect("gc").is_empty());
    }
}
