//! Shared test utilities for the agent crate.
//!
//! Test doubles for every seam the workflows cross, builders for manifest
//! documents, and [`NodeFixture`], a throwaway host tree with a matching
//! [`AgentConfig`].
#![expect(
    clippy::expect_used,
    reason = "test doubles fail loudly when a test misuses them"
)]

use crate::cluster::{ClusterClient, ClusterError, RetryPolicy};
use crate::config::{AgentConfig, FileConfig, HostPaths, Overrides, Workflow};
use crate::digest::{ContentDigest, DigestAlgorithm};
use crate::download::{DownloadError, HttpFetcher};
use crate::exec::{CommandExecutor, ExecError};
use crate::error::AgentError;
use crate::manifest::{
    ManifestError, ManifestSource, PACKAGE_LIST_KIND, PackageManifest, parse_manifest,
};
use crate::orchestrator::{Collaborators, Orchestrator, Outcome};
use crate::service::{ServiceError, ServiceManager};
use crate::signature::{SignatureError, SignatureVerifier};
use crate::update_engine::{
    STATUS_QUEUE_CAPACITY, StatusStream, StreamCloser, UpdateEngine, UpdateEngineError,
    UpdateStatus,
};
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Creates an `ExitStatus` from an exit code (Unix implementation).
#[cfg(unix)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    ExitStatus::from_raw(code << 8)
}

/// Creates an `ExitStatus` from an exit code (Windows implementation).
#[cfg(windows)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;

    ExitStatus::from_raw(code.unsigned_abs())
}

/// Creates a successful command `Output` with empty stdout and stderr.
pub fn success_output() -> Output {
    stdout_output("")
}

/// Creates a successful command `Output` with the given stdout.
pub fn stdout_output(stdout: &str) -> Output {
    Output {
        status: exit_status(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Creates a failed command `Output` with the given stderr message.
pub fn failure_output(stderr: &str) -> Output {
    Output {
        status: exit_status(1),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Represents an expected command invocation for testing.
#[derive(Debug)]
pub struct ExpectedCall {
    /// The command to execute (e.g., "systemctl").
    pub cmd: &'static str,
    /// The arguments to pass to the command.
    pub args: Vec<&'static str>,
    /// The result to return when this command is invoked.
    pub result: Result<Output, ExecError>,
}

/// A stub implementation of `CommandExecutor` for testing.
///
/// Records expected command invocations and returns predefined results,
/// allowing tests to verify command execution without side effects.
#[derive(Debug)]
pub struct StubExecutor {
    expected: RefCell<VecDeque<ExpectedCall>>,
}

impl StubExecutor {
    /// Creates a new `StubExecutor` with the given expected calls.
    pub fn new(expected: Vec<ExpectedCall>) -> Self {
        Self {
            expected: RefCell::new(expected.into()),
        }
    }

    /// Asserts that all expected command invocations have been consumed.
    ///
    /// # Panics
    ///
    /// Panics if there are remaining expected calls that were not invoked.
    pub fn assert_finished(&self) {
        assert!(
            self.expected.borrow().is_empty(),
            "expected no further command invocations, {} left",
            self.expected.borrow().len()
        );
    }
}

impl CommandExecutor for StubExecutor {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Output, ExecError> {
        let mut expected = self.expected.borrow_mut();
        let call = expected
            .pop_front()
            .expect("unexpected command invocation");

        assert_eq!(call.cmd, cmd);
        assert_eq!(call.args.as_slice(), args);

        call.result
    }
}

/// Path of the package manager used by fixture configurations.
pub const TORCX: &str = "/usr/bin/torcx";

/// An expected `torcx` call answering with `stdout`.
pub fn torcx_call(args: Vec<&'static str>, stdout: &str) -> ExpectedCall {
    ExpectedCall {
        cmd: TORCX,
        args,
        result: Ok(stdout_output(stdout)),
    }
}

/// An expected `torcx image list` call reporting `images` as
/// `(name, reference)` pairs.
pub fn torcx_image_list(os_version: &'static str, images: &[(&str, &str)]) -> ExpectedCall {
    let value: Vec<Value> = images
        .iter()
        .map(|(name, reference)| {
            json!({
                "name": name,
                "reference": reference,
                "filepath": format!("/var/lib/torcx/store/{os_version}/{name}:{reference}.torcx.tgz"),
            })
        })
        .collect();
    torcx_call(
        vec!["image", "list", "-n", os_version, "docker"],
        &json!({ "kind": "image-manifest-v0", "value": value }).to_string(),
    )
}

/// The `torcx` calls that activate `docker:<version>` in a fresh
/// `tectonic` profile.
pub fn torcx_activation(image: &'static str) -> Vec<ExpectedCall> {
    vec![
        torcx_call(
            vec!["profile", "list"],
            r#"{"kind":"profile-list-v0","value":{"next_profile_name":"vendor","profiles":["vendor"]}}"#,
        ),
        torcx_call(vec!["profile", "new", "--name", "tectonic"], ""),
        torcx_call(
            vec!["profile", "use-image", "--allow=missing", "--name", "tectonic", image],
            "",
        ),
        torcx_call(vec!["profile", "set-next", "tectonic"], ""),
    ]
}

/// A verifier that accepts every signature and records what it saw.
#[derive(Debug, Default)]
pub struct AcceptingVerifier {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl AcceptingVerifier {
    /// Number of signatures checked.
    pub fn calls(&self) -> usize {
        self.seen.lock().expect("verifier lock").len()
    }

    /// The data covered by the most recent check.
    pub fn last_data(&self) -> Option<Vec<u8>> {
        self.seen.lock().expect("verifier lock").last().cloned()
    }
}

impl SignatureVerifier for AcceptingVerifier {
    fn verify(&self, data: &mut dyn Read, _signature: &[u8]) -> Result<(), SignatureError> {
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer)?;
        self.seen.lock().expect("verifier lock").push(buffer);
        Ok(())
    }
}

/// A verifier that rejects every signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectingVerifier;

impl SignatureVerifier for RejectingVerifier {
    fn verify(&self, _data: &mut dyn Read, _signature: &[u8]) -> Result<(), SignatureError> {
        Err(SignatureError::Rejected {
            keyring: Utf8PathBuf::from("test-keyring.gpg"),
            message: "BAD signature".to_owned(),
        })
    }
}

/// HTTP fetcher serving fixed documents and recording requests.
#[derive(Debug, Default)]
pub struct StaticHttp {
    documents: HashMap<String, Vec<u8>>,
    requests: RefCell<Vec<String>>,
}

impl StaticHttp {
    /// Serves `body` at `url`.
    #[must_use]
    pub fn with(mut self, url: &str, body: &[u8]) -> Self {
        self.documents.insert(url.to_owned(), body.to_vec());
        self
    }

    /// Every URL requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }

    fn lookup(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        self.requests.borrow_mut().push(url.to_owned());
        self.documents
            .get(url)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound {
                url: url.to_owned(),
            })
    }
}

impl HttpFetcher for StaticHttp {
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        self.lookup(url)
    }

    fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        let body = self.lookup(url)?;
        std::fs::write(dest, body)?;
        Ok(())
    }
}

/// Serves a manifest offering `versions` of Docker for each OS in
/// `os_versions`, plus every offered archive.
pub fn serving_addons(os_versions: &[&str], versions: &[&str]) -> StaticHttp {
    let document = offering("docker", versions);
    let http = os_versions
        .iter()
        .fold(StaticHttp::default(), |http, os_version| {
            http.with(&manifest_url(os_version), &document)
        });
    versions.iter().fold(http, |http, version| {
        http.with(&addon_url("docker", version), &archive_bytes("docker", version))
    })
}

/// Where a fixture version can be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureLocation {
    /// A download URL.
    Url(&'static str),
    /// A local path.
    Path(&'static str),
}

/// Builds one package entry of a package list.
pub fn package_entry(name: &str, default_version: Option<&str>, versions: Vec<Value>) -> Value {
    let mut entry = json!({ "name": name, "versions": versions });
    if let (Some(version), Some(object)) = (default_version, entry.as_object_mut()) {
        object.insert("defaultVersion".to_owned(), json!(version));
    }
    entry
}

/// Builds one version entry whose hash matches `content`.
pub fn version_entry(version: &str, content: &[u8], locations: &[FixtureLocation]) -> Value {
    let locations = locations
        .iter()
        .map(|location| match location {
            FixtureLocation::Url(url) => json!({ "url": url }),
            FixtureLocation::Path(path) => json!({ "path": path }),
        })
        .collect();
    version_value(version, content, locations)
}

fn version_value(version: &str, content: &[u8], locations: Vec<Value>) -> Value {
    json!({
        "version": version,
        "hash": format!("sha512-{}", sha512_hex(content)),
        "locations": locations,
    })
}

/// Wraps package entries in a `torcx-package-list-v0` envelope.
pub fn package_list(packages: Vec<Value>) -> Vec<u8> {
    json!({ "kind": PACKAGE_LIST_KIND, "value": { "packages": packages } })
        .to_string()
        .into_bytes()
}

/// A package list offering `versions` of `package` for download.
///
/// Each version's archive is [`archive_bytes`] served from
/// [`addon_url`].
pub fn offering(package: &str, versions: &[&str]) -> Vec<u8> {
    let entries = versions
        .iter()
        .map(|version| {
            version_value(
                version,
                &archive_bytes(package, version),
                vec![json!({ "url": addon_url(package, version) })],
            )
        })
        .collect();
    package_list(vec![package_entry(package, versions.first().copied(), entries)])
}

/// Download URL used for fixture archives.
pub fn addon_url(package: &str, version: &str) -> String {
    format!("https://pkgs.test/{package}:{version}.torcx.tgz")
}

/// Deterministic archive content for `package` `version`.
pub fn archive_bytes(package: &str, version: &str) -> Vec<u8> {
    format!("archive {package}:{version}\n").repeat(64).into_bytes()
}

fn sha512_hex(content: &[u8]) -> String {
    let mut reader = content;
    ContentDigest::compute(DigestAlgorithm::Sha512, &mut reader)
        .expect("hashing a slice cannot fail")
        .hex()
        .to_owned()
}

/// Creates a temporary directory and returns it with its UTF-8 path.
pub fn utf8_temp_dir() -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().expect("temporary directory");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("UTF-8 temp path");
    (dir, path)
}

/// In-memory manifests keyed by OS version.
#[derive(Debug, Default)]
pub struct StaticManifests {
    manifests: HashMap<String, Arc<PackageManifest>>,
    requests: Vec<String>,
}

impl StaticManifests {
    /// Serves the package list `document` for `os_version`.
    #[must_use]
    pub fn with(mut self, os_version: &str, document: &[u8]) -> Self {
        let manifest = parse_manifest(document).expect("fixture manifest parses");
        self.manifests
            .insert(os_version.to_owned(), Arc::new(manifest));
        self
    }

    /// OS versions requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.clone()
    }
}

impl ManifestSource for StaticManifests {
    fn manifest(&mut self, os_version: &str) -> Result<Arc<PackageManifest>, ManifestError> {
        self.requests.push(os_version.to_owned());
        self.manifests
            .get(os_version)
            .cloned()
            .ok_or_else(|| {
                let url = format!("static://{os_version}");
                ManifestError::Fetch {
                    url: url.clone(),
                    source: DownloadError::NotFound { url },
                }
            })
    }
}

/// Longest a fake stream waits for the other side before giving up.
const FEED_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between the snapshot and the first live status, so the marker
/// is queued ahead of it.
const MARKER_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct FeedState {
    polls: usize,
    subscribed: bool,
    snapshot_taken: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct Feed {
    state: Mutex<FeedState>,
    changed: Condvar,
}

impl Feed {
    fn update(&self, change: impl FnOnce(&mut FeedState)) {
        change(&mut self.state.lock().expect("feed lock"));
        self.changed.notify_all();
    }

    fn read<T>(&self, view: impl FnOnce(&FeedState) -> T) -> T {
        view(&self.state.lock().expect("feed lock"))
    }

    fn wait_until(&self, ready: impl Fn(&FeedState) -> bool) {
        let guard = self.state.lock().expect("feed lock");
        let (_guard, _timeout) = self
            .changed
            .wait_timeout_while(guard, FEED_TIMEOUT, |state| !ready(state))
            .expect("feed lock");
    }
}

/// Scripted update daemon.
///
/// `backlog` statuses are delivered before the snapshot is taken, so the
/// wait logic must discard them. `stream` statuses arrive after the
/// snapshot. An open stream then blocks until closed; otherwise it ends.
#[derive(Debug)]
pub struct FakeUpdateEngine {
    snapshot: UpdateStatus,
    backlog: Vec<UpdateStatus>,
    stream: Vec<UpdateStatus>,
    open: bool,
    fail_attempt: bool,
    attempts: Cell<usize>,
    feed: Arc<Feed>,
}

impl FakeUpdateEngine {
    /// A daemon whose status snapshot is `snapshot` and whose stream ends
    /// immediately.
    pub fn new(snapshot: UpdateStatus) -> Self {
        Self {
            snapshot,
            backlog: Vec::new(),
            stream: Vec::new(),
            open: false,
            fail_attempt: false,
            attempts: Cell::new(0),
            feed: Arc::default(),
        }
    }

    /// Statuses delivered after the snapshot, then the stream ends.
    #[must_use]
    pub fn with_stream(mut self, statuses: Vec<UpdateStatus>) -> Self {
        self.stream = statuses;
        self.open = false;
        self
    }

    /// Statuses delivered after the snapshot, then the stream stays open
    /// until closed.
    #[must_use]
    pub fn with_open_stream(mut self, statuses: Vec<UpdateStatus>) -> Self {
        self.stream = statuses;
        self.open = true;
        self
    }

    /// Statuses already queued when the update is triggered.
    #[must_use]
    pub fn with_backlog(mut self, statuses: Vec<UpdateStatus>) -> Self {
        self.backlog = statuses;
        self
    }

    /// Rejects the update trigger.
    #[must_use]
    pub const fn failing_attempt(mut self) -> Self {
        self.fail_attempt = true;
        self
    }

    /// Number of update triggers received.
    pub fn attempts(&self) -> usize {
        self.attempts.get()
    }

    /// Whether the subscription was closed.
    pub fn stream_closed(&self) -> bool {
        self.feed.read(|state| state.closed)
    }
}

impl UpdateEngine for FakeUpdateEngine {
    fn attempt_update(&self) -> Result<(), UpdateEngineError> {
        self.attempts.set(self.attempts.get() + 1);
        if self.fail_attempt {
            return Err(UpdateEngineError::Failed {
                action: "request an OS update",
                stderr: "update engine is busy".to_owned(),
            });
        }
        Ok(())
    }

    fn get_status(&self) -> Result<UpdateStatus, UpdateEngineError> {
        if self.feed.read(|state| state.subscribed) {
            let queued = self.backlog.len().min(STATUS_QUEUE_CAPACITY) + 1;
            self.feed.wait_until(|state| state.polls >= queued || state.closed);
            self.feed.update(|state| state.snapshot_taken = true);
        }
        Ok(self.snapshot.clone())
    }

    fn subscribe(&self) -> Result<Box<dyn StatusStream>, UpdateEngineError> {
        self.feed.update(|state| state.subscribed = true);
        Ok(Box::new(FakeStream {
            feed: Arc::clone(&self.feed),
            backlog: self.backlog.clone().into(),
            live: self.stream.clone().into(),
            open: self.open,
            live_started: false,
        }))
    }
}

struct FakeStream {
    feed: Arc<Feed>,
    backlog: VecDeque<UpdateStatus>,
    live: VecDeque<UpdateStatus>,
    open: bool,
    live_started: bool,
}

impl StatusStream for FakeStream {
    fn next_status(&mut self) -> Result<Option<UpdateStatus>, UpdateEngineError> {
        self.feed.update(|state| state.polls += 1);
        if let Some(status) = self.backlog.pop_front() {
            return Ok(Some(status));
        }

        if !self.live_started {
            self.feed
                .wait_until(|state| state.snapshot_taken || state.closed);
            std::thread::sleep(MARKER_GRACE);
            self.live_started = true;
        }
        if self.feed.read(|state| state.closed) {
            return Ok(None);
        }
        if let Some(status) = self.live.pop_front() {
            return Ok(Some(status));
        }
        if self.open {
            self.feed.wait_until(|state| state.closed);
        }
        Ok(None)
    }

    fn closer(&self) -> StreamCloser {
        let feed = Arc::clone(&self.feed);
        StreamCloser::new(move || feed.update(|state| state.closed = true))
    }
}

/// Service manager that records requests.
#[derive(Debug, Default)]
pub struct FakeServices {
    cleanup_installs: Cell<usize>,
    reboots: Cell<usize>,
    fail_cleanup: bool,
}

impl FakeServices {
    /// Fails every cleanup-unit installation.
    #[must_use]
    pub const fn failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    /// Number of cleanup-unit installations attempted.
    pub fn cleanup_installs(&self) -> usize {
        self.cleanup_installs.get()
    }

    /// Number of reboots requested.
    pub fn reboots(&self) -> usize {
        self.reboots.get()
    }
}

impl ServiceManager for FakeServices {
    fn install_cleanup_unit(&self) -> Result<(), ServiceError> {
        self.cleanup_installs.set(self.cleanup_installs.get() + 1);
        if self.fail_cleanup {
            return Err(ServiceError::Failed {
                args: "daemon-reload".to_owned(),
                stderr: "read-only file system".to_owned(),
            });
        }
        Ok(())
    }

    fn reboot(&self) -> Result<(), ServiceError> {
        self.reboots.set(self.reboots.get() + 1);
        Ok(())
    }
}

/// Cluster API double.
#[derive(Debug, Default)]
pub struct FakeCluster {
    server_version: Option<String>,
    runtime_mappings: Option<String>,
    annotate_failures: Cell<u32>,
    version_requests: Cell<usize>,
    config_map_requests: Cell<usize>,
    annotations: RefCell<Vec<(String, String)>>,
}

impl FakeCluster {
    /// Reports `version` as the API server version.
    #[must_use]
    pub fn with_server_version(mut self, version: &str) -> Self {
        self.server_version = Some(version.to_owned());
        self
    }

    /// Publishes `document` as the runtime mappings config map.
    #[must_use]
    pub fn with_runtime_mappings(mut self, document: &str) -> Self {
        self.runtime_mappings = Some(document.to_owned());
        self
    }

    /// Fails the first `failures` annotation attempts.
    #[must_use]
    pub fn failing_annotations(self, failures: u32) -> Self {
        self.annotate_failures.set(failures);
        self
    }

    /// Number of version lookups.
    pub fn version_requests(&self) -> usize {
        self.version_requests.get()
    }

    /// Number of config map lookups.
    pub fn config_map_requests(&self) -> usize {
        self.config_map_requests.get()
    }

    /// Annotations written, as `(node, key)` pairs.
    pub fn annotations(&self) -> Vec<(String, String)> {
        self.annotations.borrow().clone()
    }

    fn unreachable(action: &str) -> ClusterError {
        ClusterError::Failed {
            action: action.to_owned(),
            stderr: "The connection to the server was refused".to_owned(),
        }
    }
}

impl ClusterClient for FakeCluster {
    fn server_version(&self) -> Result<String, ClusterError> {
        self.version_requests.set(self.version_requests.get() + 1);
        self.server_version
            .clone()
            .ok_or_else(|| Self::unreachable("read the API server version"))
    }

    fn config_map_value(
        &self,
        namespace: &str,
        name: &str,
        _key: &str,
    ) -> Result<String, ClusterError> {
        self.config_map_requests
            .set(self.config_map_requests.get() + 1);
        self.runtime_mappings
            .clone()
            .ok_or_else(|| Self::unreachable(&format!("read config map {namespace}/{name}")))
    }

    fn annotate_node(&self, node: &str, key: &str) -> Result<(), ClusterError> {
        let remaining = self.annotate_failures.get();
        if remaining > 0 {
            self.annotate_failures.set(remaining - 1);
            return Err(Self::unreachable(&format!("annotate node {node}")));
        }
        self.annotations
            .borrow_mut()
            .push((node.to_owned(), key.to_owned()));
        Ok(())
    }
}

/// Manifest URL template used by fixture configurations.
pub const FIXTURE_MANIFEST_TEMPLATE: &str =
    "https://manifests.test/{board}/{os_version}/torcx_manifest.json";

/// Rendered fixture manifest URL for an `amd64-usr` node.
pub fn manifest_url(os_version: &str) -> String {
    format!("https://manifests.test/amd64-usr/{os_version}/torcx_manifest.json")
}

/// Compatibility map mapping Kubernetes 1.8 to Docker 17.09, then 1.12.
pub const RUNTIME_MAPPINGS: &str = r#"kind: VersionManifestV1
versions:
  k8s:
    "1.8":
      docker: ["17.09", "1.12"]
"#;

/// A throwaway host tree with a configuration pointing into it.
///
/// The tree holds an os-release record, update configuration, the
/// installer and kubelet env files, both local compatibility maps, and
/// empty user and vendor stores. Signature checks are disabled and
/// cluster retries are immediate.
#[derive(Debug)]
pub struct NodeFixture {
    _dir: TempDir,
    root: Utf8PathBuf,
    /// Configuration for the fixture host; adjust before use.
    pub config: AgentConfig,
}

impl NodeFixture {
    /// Creates a host running OS `os_version` in cluster `v1.8.4+coreos.0`.
    pub fn new(workflow: Workflow, os_version: &str) -> Self {
        let (dir, root) = utf8_temp_dir();
        let paths = HostPaths {
            os_release: root.join("usr/lib/os-release"),
            update_conf: vec![
                root.join("usr/share/coreos/update.conf"),
                root.join("etc/coreos/update.conf"),
            ],
            store_root: root.join("var/lib/torcx/store"),
            vendor_store_root: root.join("usr/share/torcx/store"),
            installer_env: root.join("etc/kubernetes/installer/kubelet.env"),
            kubelet_env: root.join("etc/kubernetes/kubelet.env"),
            installer_runtime_mappings: root.join("etc/kubernetes/installer/runtime-mappings.yaml"),
            hook_runtime_mappings: root.join("etc/runtime-mappings.yaml"),
            unit_dir: root.join("run/systemd/system"),
            scratch_dir: Some(root.join("tmp")),
        };

        write(
            &paths.os_release,
            &format!("NAME=\"Container Linux by CoreOS\"\nVERSION={os_version}\nCOREOS_BOARD=\"amd64-usr\"\n"),
        );
        write(&paths.update_conf.first().cloned().expect("vendor update.conf"), "GROUP=stable\n");
        write(
            &paths.installer_env,
            "KUBELET_IMAGE_URL=quay.io/coreos/hyperkube\nKUBELET_IMAGE_TAG=v1.8.4_coreos.0\n",
        );
        write(
            &paths.kubelet_env,
            "KUBELET_IMAGE_URL=quay.io/coreos/hyperkube\nKUBELET_IMAGE_TAG=v1.8.4_coreos.0\n",
        );
        write(&paths.installer_runtime_mappings, RUNTIME_MAPPINGS);
        write(&paths.hook_runtime_mappings, RUNTIME_MAPPINGS);
        for dir in [&paths.store_root, &paths.vendor_store_root, &paths.unit_dir]
            .into_iter()
            .chain(paths.scratch_dir.as_ref())
        {
            std::fs::create_dir_all(dir).expect("fixture directory");
        }

        let overrides = Overrides {
            manifest_url: Some(FIXTURE_MANIFEST_TEMPLATE.to_owned()),
            verify_signatures: Some(false),
            node_name: Some("worker-1".to_owned()),
            ..Overrides::default()
        };
        let mut config = AgentConfig::resolve(workflow, FileConfig::default(), overrides)
            .expect("fixture configuration");
        config.paths = paths;
        config.lookup_retry = RetryPolicy::immediate(3);
        config.annotate_retry = RetryPolicy::immediate(5);

        Self {
            _dir: dir,
            root,
            config,
        }
    }

    /// Root of the host tree.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The store bucket for `os_version`.
    pub fn bucket(&self, os_version: &str) -> Utf8PathBuf {
        self.config.paths.store_root.join(os_version)
    }

    /// Names of the store buckets, sorted.
    pub fn buckets(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.config.paths.store_root)
            .expect("store root")
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    /// Reads a file below the root.
    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.root.join(relative)).expect("fixture file")
    }

    /// Writes a file below the root, creating parents.
    pub fn write(&self, relative: &str, contents: &str) {
        write(&self.root.join(relative), contents);
    }
}

fn write(path: &Utf8Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("fixture parent directory");
    }
    std::fs::write(path, contents).expect("fixture file");
}

/// Doubles for every collaborator of a workflow.
pub struct Doubles {
    /// Package manager calls, in order.
    pub executor: StubExecutor,
    /// Published manifests and archives.
    pub http: StaticHttp,
    /// Signature checks.
    pub verifier: AcceptingVerifier,
    /// The update daemon.
    pub engine: FakeUpdateEngine,
    /// The cluster API.
    pub cluster: FakeCluster,
    /// The service manager.
    pub services: FakeServices,
}

impl Doubles {
    /// Doubles with `engine` and the expected `torcx` calls; nothing is
    /// published and the cluster is unreachable.
    pub fn new(engine: FakeUpdateEngine, torcx_calls: Vec<ExpectedCall>) -> Self {
        Self {
            executor: StubExecutor::new(torcx_calls),
            http: StaticHttp::default(),
            verifier: AcceptingVerifier::default(),
            engine,
            cluster: FakeCluster::default(),
            services: FakeServices::default(),
        }
    }

    /// Borrows the doubles as workflow collaborators.
    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            executor: &self.executor,
            fetcher: &self.http,
            verifier: &self.verifier,
            update_engine: &self.engine,
            cluster: &self.cluster,
            services: &self.services,
        }
    }

    /// Runs the workflow named by `config`.
    ///
    /// # Errors
    ///
    /// Returns whatever the workflow returns.
    pub fn run(&self, config: &AgentConfig) -> Result<Outcome, AgentError> {
        Orchestrator::new(config, self.collaborators()).run()
    }
}
