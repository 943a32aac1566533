//! Unit tests for manifest parsing, resolution, and caching.

use super::*;
use crate::download::{DownloadError, MockHttpFetcher};
use crate::signature::SignaturePolicy;
use crate::test_utils::{
    AcceptingVerifier, FixtureLocation, RejectingVerifier, package_entry, package_list,
    version_entry,
};
use mockall::predicate::eq;
use rstest::{fixture, rstest};

const TEMPLATE: &str = "https://manifests.test/{board}/{os_version}/torcx_manifest.json";
const URL_9999: &str = "https://manifests.test/amd64-usr/9999.0.0/torcx_manifest.json";

#[fixture]
fn docker_manifest() -> Vec<u8> {
    package_list(vec![package_entry(
        "docker",
        Some("1.12"),
        vec![
            version_entry(
                "1.12",
                b"docker 1.12",
                &[
                    FixtureLocation::Url("https://pkgs.test/docker:1.12.torcx.tgz"),
                    FixtureLocation::Path("/usr/share/torcx/store/docker:1.12.torcx.tgz"),
                ],
            ),
            version_entry(
                "17.06",
                b"docker 17.06",
                &[FixtureLocation::Url("https://pkgs.test/docker:17.06.torcx.tgz")],
            ),
            version_entry("17.09", b"docker 17.09", &[]),
        ],
    )])
}

#[rstest]
fn parses_packages_and_back_references(docker_manifest: Vec<u8>) {
    let manifest = parse_manifest(&docker_manifest).expect("valid manifest");

    let package_key = manifest.find_package("docker").expect("docker listed");
    let package = manifest.package(package_key).expect("package");
    assert_eq!(package.default_version(), Some("1.12"));
    assert_eq!(package.versions().len(), 3);

    let location = manifest.location_for("docker", "17.06").expect("location");
    let artefact = manifest.artefact(location).expect("artefact");
    assert_eq!(artefact.name, "docker");
    assert_eq!(artefact.version, "17.06");
    assert_eq!(artefact.file_name(), "docker:17.06.torcx.tgz");
    assert_eq!(
        artefact.location,
        &Location::Url("https://pkgs.test/docker:17.06.torcx.tgz".to_owned())
    );

    let entry = manifest.location(location).expect("entry");
    let version = manifest.version(entry.version()).expect("version");
    assert_eq!(version.package(), package_key);
}

#[rstest]
fn location_for_prefers_paths_over_urls(docker_manifest: Vec<u8>) {
    let manifest = parse_manifest(&docker_manifest).expect("valid manifest");
    let key = manifest.location_for("docker", "1.12").expect("location");
    let entry = manifest.location(key).expect("entry");
    assert_eq!(
        entry.location(),
        &Location::Path("/usr/share/torcx/store/docker:1.12.torcx.tgz".into())
    );
}

#[test]
fn location_for_prefers_paths_regardless_of_document_order() {
    for locations in [
        [
            FixtureLocation::Path("/srv/a.tgz"),
            FixtureLocation::Url("https://pkgs.test/a.tgz"),
        ],
        [
            FixtureLocation::Url("https://pkgs.test/a.tgz"),
            FixtureLocation::Path("/srv/a.tgz"),
        ],
    ] {
        let doc = package_list(vec![package_entry(
            "docker",
            None,
            vec![version_entry("1.13", b"a", &locations)],
        )]);
        let manifest = parse_manifest(&doc).expect("valid manifest");
        let key = manifest.location_for("docker", "1.13").expect("location");
        assert!(manifest.location(key).expect("entry").location().is_path());
    }
}

#[rstest]
#[case::unknown_package("pants", "1.12")]
#[case::unknown_version("docker", "0")]
#[case::empty_version("docker", "")]
#[case::no_locations("docker", "17.09")]
fn location_for_reports_missing_entries(
    docker_manifest: Vec<u8>,
    #[case] name: &str,
    #[case] version: &str,
) {
    let manifest = parse_manifest(&docker_manifest).expect("valid manifest");
    let err = manifest.location_for(name, version).expect_err("missing");
    assert!(matches!(
        err,
        ManifestError::PackageNotFound { .. }
            | ManifestError::VersionNotFound { .. }
            | ManifestError::NoLocation { .. }
    ));
}

#[test]
fn installable_requires_a_location() {
    let doc = package_list(vec![package_entry(
        "docker",
        None,
        vec![
            version_entry("1.12", b"a", &[FixtureLocation::Url("https://pkgs.test/a")]),
            version_entry("1.13", b"b", &[]),
        ],
    )]);
    let manifest = parse_manifest(&doc).expect("valid manifest");
    assert!(manifest.is_installable("docker", "1.12"));
    assert!(!manifest.is_installable("docker", "1.13"));
    assert!(!manifest.is_installable("rkt", "1.12"));
}

#[test]
fn rejects_foreign_kind() {
    let doc = br#"{"kind":"torcx-package-list-v1","value":{"packages":{}}}"#;
    let err = parse_manifest(doc).expect_err("foreign kind");
    assert!(matches!(
        err,
        ManifestError::UnexpectedKind { ref found, .. } if found == "torcx-package-list-v1"
    ));
}

#[test]
fn rejects_duplicate_packages() {
    let doc = package_list(vec![
        package_entry("docker", None, vec![]),
        package_entry("docker", None, vec![]),
    ]);
    let err = parse_manifest(&doc).expect_err("duplicate");
    assert!(matches!(err, ManifestError::DuplicatePackage { ref name } if name == "docker"));
}

#[test]
fn rejects_duplicate_versions() {
    let doc = package_list(vec![package_entry(
        "docker",
        None,
        vec![version_entry("1.12", b"a", &[]), version_entry("1.12", b"b", &[])],
    )]);
    let err = parse_manifest(&doc).expect_err("duplicate");
    assert!(matches!(err, ManifestError::DuplicateVersion { ref version, .. } if version == "1.12"));
}

#[rstest]
#[case::bad_hash(
    br#"{"kind":"torcx-package-list-v0","value":{"packages":[{"name":"docker","versions":[{"version":"1","hash":"sha512-xyz","locations":[]}]}]}}"#
)]
#[case::empty_location(
    br#"{"kind":"torcx-package-list-v0","value":{"packages":[{"name":"docker","versions":[{"version":"1","hash":"sha256-ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad","locations":[{"path":""}]}]}]}}"#
)]
#[case::not_json(b"<html>")]
fn rejects_malformed_documents(#[case] doc: &[u8]) {
    assert!(parse_manifest(doc).is_err());
}

#[test]
fn builder_rejects_foreign_keys() {
    let mut other = ManifestBuilder::default();
    let mut first = ManifestBuilder::default();
    first.add_package("docker", None).expect("package");
    let foreign = first.add_package("rkt", None).expect("package");
    let digest = "sha256-ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        .parse()
        .expect("digest");
    let err = other
        .add_version(foreign, "1", digest)
        .expect_err("foreign key");
    assert!(matches!(err, ManifestError::UnknownKey));
}

#[rstest]
#[case::unknown("https://m.test/{arch}")]
#[case::unterminated("https://m.test/{board")]
#[case::unmatched("https://m.test/board}")]
fn url_template_rejects_bad_placeholders(#[case] template: &str) {
    let err = UrlTemplate::new(template).expect_err("invalid");
    assert!(matches!(err, ManifestError::InvalidTemplate { .. }));
}

#[rstest]
fn store_fetches_verifies_and_caches(docker_manifest: Vec<u8>) {
    let mut fetcher = MockHttpFetcher::new();
    let body = docker_manifest.clone();
    fetcher
        .expect_fetch_bytes()
        .with(eq(URL_9999))
        .times(1)
        .returning(move |_| Ok(body.clone()));
    fetcher
        .expect_fetch_bytes()
        .with(eq(format!("{URL_9999}.asc")))
        .times(1)
        .returning(|_| Ok(b"signature".to_vec()));
    let verifier = AcceptingVerifier::default();
    let template = UrlTemplate::new(TEMPLATE).expect("template");
    let mut store = ManifestStore::new(
        template,
        "amd64-usr",
        &fetcher,
        &verifier,
        SignaturePolicy::Required,
    );

    let first = store.get_manifest("9999.0.0").expect("manifest");
    let second = store.get_manifest("9999.0.0").expect("cached manifest");
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(verifier.calls(), 1);
    assert_eq!(verifier.last_data(), Some(docker_manifest));
}

#[rstest]
fn store_skips_signature_when_disabled(docker_manifest: Vec<u8>) {
    let mut fetcher = MockHttpFetcher::new();
    fetcher
        .expect_fetch_bytes()
        .with(eq(URL_9999))
        .times(1)
        .returning(move |_| Ok(docker_manifest.clone()));
    let verifier = RejectingVerifier;
    let template = UrlTemplate::new(TEMPLATE).expect("template");
    let mut store = ManifestStore::new(
        template,
        "amd64-usr",
        &fetcher,
        &verifier,
        SignaturePolicy::Disabled,
    );

    assert!(store.get_manifest("9999.0.0").is_ok());
}

#[rstest]
fn store_does_not_cache_rejected_manifests(docker_manifest: Vec<u8>) {
    let mut fetcher = MockHttpFetcher::new();
    fetcher
        .expect_fetch_bytes()
        .with(eq(URL_9999))
        .times(2)
        .returning(move |_| Ok(docker_manifest.clone()));
    fetcher
        .expect_fetch_bytes()
        .with(eq(format!("{URL_9999}.asc")))
        .times(2)
        .returning(|_| Ok(b"forged".to_vec()));
    let verifier = RejectingVerifier;
    let template = UrlTemplate::new(TEMPLATE).expect("template");
    let mut store = ManifestStore::new(
        template,
        "amd64-usr",
        &fetcher,
        &verifier,
        SignaturePolicy::Required,
    );

    for _ in 0..2 {
        let err = store.get_manifest("9999.0.0").expect_err("rejected");
        assert!(matches!(err, ManifestError::Signature { .. }));
    }
}

#[test]
fn store_wraps_kind_mismatch_with_url() {
    let mut fetcher = MockHttpFetcher::new();
    fetcher
        .expect_fetch_bytes()
        .returning(|_| Ok(br#"{"kind":"something-else","value":{}}"#.to_vec()));
    let verifier = AcceptingVerifier::default();
    let template = UrlTemplate::new(TEMPLATE).expect("template");
    let mut store = ManifestStore::new(
        template,
        "amd64-usr",
        &fetcher,
        &verifier,
        SignaturePolicy::Disabled,
    );

    let err = store.get_manifest("9999.0.0").expect_err("wrong kind");
    match err {
        ManifestError::Document { url, source } => {
            assert_eq!(url, URL_9999);
            assert!(matches!(*source, ManifestError::UnexpectedKind { .. }));
        }
        other => panic!("expected Document error, got {other:?}"),
    }
}

#[test]
fn store_surfaces_fetch_failures() {
    let mut fetcher = MockHttpFetcher::new();
    fetcher.expect_fetch_bytes().returning(|url| {
        Err(DownloadError::NotFound {
            url: url.to_owned(),
        })
    });
    let verifier = AcceptingVerifier::default();
    let template = UrlTemplate::new(TEMPLATE).expect("template");
    let mut store = ManifestStore::new(
        template,
        "amd64-usr",
        &fetcher,
        &verifier,
        SignaturePolicy::Required,
    );

    let err = store.get_manifest("9999.0.0").expect_err("missing");
    assert!(matches!(err, ManifestError::Fetch { ref url, .. } if url == URL_9999));
}
