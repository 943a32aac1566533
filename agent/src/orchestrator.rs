//! The bootstrap and pre-reboot hook workflows.
//!
//! Both workflows run the same phases in order, each returning an
//! immutable snapshot for the next:
//!
//! 1. gather: [`HostFacts`] from host files and the cluster;
//! 2. OS update: an [`OsState`] from the update daemon;
//! 3. selection and install: an [`InstallReport`];
//! 4. store garbage collection.
//!
//! Bootstrap then writes the kubelet environment and reboots when owed.
//! The hook never triggers an OS update and finishes by annotating the
//! node.

use crate::cluster::{ClusterClient, retry};
use crate::compat::{
    KUBERNETES, RUNTIME_MAPPINGS_CONFIGMAP, RUNTIME_MAPPINGS_KEY, RUNTIME_MAPPINGS_NAMESPACE,
    VersionManifest, major_minor,
};
use crate::config::{AgentConfig, ConfigError, Workflow};
use crate::download::HttpFetcher;
use crate::error::AgentError;
use crate::exec::CommandExecutor;
use crate::fetch::AddonFetcher;
use crate::kubelet_env::{cluster_version_from_env, write_kubelet_env};
use crate::manifest::{ManifestError, ManifestStore};
use crate::service::ServiceManager;
use crate::signature::SignatureVerifier;
use crate::state::{HostFacts, InstallReport, OsState, Selection};
use crate::store::AddonStore;
use crate::strategy::pick_version;
use crate::torcx::TorcxClient;
use crate::update_engine::{UpdateEngine, pending_os_version, run_os_update};
use camino::Utf8Path;
use nodeprep_common::os_release::{OsRelease, read_channel};

/// The external systems a workflow talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Runs the package manager.
    pub executor: &'a dyn CommandExecutor,
    /// Downloads manifests, signatures, and archives.
    pub fetcher: &'a dyn HttpFetcher,
    /// Checks detached signatures.
    pub verifier: &'a dyn SignatureVerifier,
    /// The OS update daemon.
    pub update_engine: &'a dyn UpdateEngine,
    /// The cluster API.
    pub cluster: &'a dyn ClusterClient,
    /// The service manager.
    pub services: &'a dyn ServiceManager,
}

/// What a workflow did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Facts gathered at the start.
    pub facts: HostFacts,
    /// OS state after the update phase.
    pub os: OsState,
    /// Result of the install phase.
    pub install: InstallReport,
    /// Whether a reboot was requested; the caller should then block.
    pub reboot_requested: bool,
}

/// Runs the workflows against a configuration and collaborators.
pub struct Orchestrator<'a> {
    config: &'a AgentConfig,
    deps: Collaborators<'a>,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(config: &'a AgentConfig, deps: Collaborators<'a>) -> Self {
        Self { config, deps }
    }

    /// Runs the workflow named by the configuration.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::bootstrap`] and [`Orchestrator::pre_reboot_hook`].
    pub fn run(&self) -> Result<Outcome, AgentError> {
        match self.config.workflow {
            Workflow::Bootstrap => self.bootstrap(),
            Workflow::PreRebootHook => self.pre_reboot_hook(),
        }
    }

    /// Prepares a node on first boot.
    ///
    /// Applies OS updates (unless disabled), installs and activates the
    /// runtime for the current and next OS, prunes the store, writes the
    /// kubelet environment, and requests a reboot when one is owed.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] from the first phase that fails. Store
    /// pruning and cleanup-unit failures are logged, not returned.
    pub fn bootstrap(&self) -> Result<Outcome, AgentError> {
        let config = self.config;
        let add_ons = !config.skip_torcx_setup;
        let torcx = self.torcx();
        if add_ons {
            torcx.check_available()?;
        }

        let facts = self.gather(Workflow::Bootstrap, add_ons)?;
        let os = self.update_os(&facts, config.do_os_upgrade)?;
        let install = if add_ons {
            self.install(&torcx, &facts, &os)?
        } else {
            log::info!("skipping add-on setup");
            InstallReport::default()
        };
        self.collect_garbage(&os);

        let paths = &config.paths;
        write_kubelet_env(&paths.installer_env, &paths.kubelet_env, &facts.cluster_version)
            .map_err(|source| AgentError::KubeletEnv {
                path: paths.kubelet_env.clone(),
                source,
            })?;

        let reboot_requested = os.reboot_needed() || install.runtime_reboot_needed;
        if reboot_requested {
            if install.runtime_reboot_needed
                && let Err(err) = self.deps.services.install_cleanup_unit()
            {
                log::warn!("continuing without runtime cleanup unit: {err}");
            }
            self.deps.services.reboot()?;
        } else {
            log::info!("node is up to date; no reboot needed");
        }

        Ok(Outcome {
            facts,
            os,
            install,
            reboot_requested,
        })
    }

    /// Prepares the runtime for an OS update that is about to be applied.
    ///
    /// Uses only local cluster data, never triggers an OS update, and
    /// annotates the node on success.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] from the first phase that fails, including
    /// the annotation once its retries are exhausted.
    pub fn pre_reboot_hook(&self) -> Result<Outcome, AgentError> {
        let torcx = self.torcx();
        torcx.check_available()?;

        let facts = self.gather(Workflow::PreRebootHook, true)?;
        let os = self.update_os(&facts, false)?;
        let install = self.install(&torcx, &facts, &os)?;
        self.collect_garbage(&os);
        self.annotate()?;

        Ok(Outcome {
            facts,
            os,
            install,
            reboot_requested: false,
        })
    }

    fn torcx(&self) -> TorcxClient<'a> {
        TorcxClient::new(self.deps.executor, &self.config.torcx_bin)
    }

    fn gather(&self, workflow: Workflow, add_ons: bool) -> Result<HostFacts, AgentError> {
        let paths = &self.config.paths;
        let release = OsRelease::read(&paths.os_release)?;
        let channel = read_channel(&paths.update_conf).unwrap_or_else(|err| {
            log::warn!("cannot determine OS channel: {err}");
            String::new()
        });
        let cluster_version = self.cluster_version(workflow)?;
        let preferred_versions = if add_ons {
            self.preferred_versions(workflow, &cluster_version)?
        } else {
            Vec::new()
        };

        log::info!(
            "OS {} ({}, channel {channel:?}) in cluster {cluster_version}",
            release.version,
            release.board
        );
        Ok(HostFacts {
            os_version: release.version,
            board: release.board,
            channel,
            cluster_version,
            preferred_versions,
        })
    }

    fn cluster_version(&self, workflow: Workflow) -> Result<String, AgentError> {
        if let Some(forced) = &self.config.force_kube_version {
            log::info!("using forced cluster version {forced}");
            return Ok(forced.clone());
        }

        if workflow == Workflow::Bootstrap {
            match retry(self.config.lookup_retry, "read the API server version", || {
                self.deps.cluster.server_version()
            }) {
                Ok(version) => return Ok(version),
                Err(err) => log::warn!("falling back to the local cluster version: {err}"),
            }
        }

        let env_file = self.version_env_file(workflow);
        cluster_version_from_env(env_file)?.ok_or_else(|| AgentError::ClusterVersionUnknown {
            env_file: env_file.to_owned(),
        })
    }

    fn version_env_file(&self, workflow: Workflow) -> &Utf8Path {
        match workflow {
            Workflow::Bootstrap => &self.config.paths.installer_env,
            Workflow::PreRebootHook => &self.config.paths.kubelet_env,
        }
    }

    fn preferred_versions(
        &self,
        workflow: Workflow,
        cluster_version: &str,
    ) -> Result<Vec<String>, AgentError> {
        let release = major_minor(cluster_version)?;
        let map = self.version_map(workflow)?;
        let versions = map.version_for(KUBERNETES, &release, &self.config.package)?;
        log::info!(
            "Kubernetes {release} supports {} versions {versions:?}",
            self.config.package
        );
        Ok(versions.to_vec())
    }

    fn version_map(&self, workflow: Workflow) -> Result<VersionManifest, AgentError> {
        let paths = &self.config.paths;
        if workflow == Workflow::Bootstrap {
            let published = retry(self.config.lookup_retry, "read the runtime mappings", || {
                self.deps.cluster.config_map_value(
                    RUNTIME_MAPPINGS_NAMESPACE,
                    RUNTIME_MAPPINGS_CONFIGMAP,
                    RUNTIME_MAPPINGS_KEY,
                )
            });
            match published.map(|document| VersionManifest::parse(&document)) {
                Ok(Ok(map)) => return Ok(map),
                Ok(Err(err)) => log::warn!("ignoring published runtime mappings: {err}"),
                Err(err) => log::warn!("cannot read published runtime mappings: {err}"),
            }
        }

        let local = match workflow {
            Workflow::Bootstrap => &paths.installer_runtime_mappings,
            Workflow::PreRebootHook => &paths.hook_runtime_mappings,
        };
        log::info!("using runtime mappings from {local}");
        Ok(VersionManifest::read(local)?)
    }

    fn update_os(&self, facts: &HostFacts, apply: bool) -> Result<OsState, AgentError> {
        let engine = self.deps.update_engine;
        let next = if apply {
            run_os_update(engine)?
        } else {
            pending_os_version(engine)?
        };
        let next = next.filter(|next| *next != facts.os_version);
        if let Some(next) = &next {
            log::info!("OS {next} is staged for the next boot");
        }

        Ok(OsState {
            current: facts.os_version.clone(),
            os_reboot_needed: apply && next.is_some(),
            next,
            channel: facts.channel.clone(),
            board: facts.board.clone(),
        })
    }

    fn install(
        &self,
        torcx: &TorcxClient<'_>,
        facts: &HostFacts,
        os: &OsState,
    ) -> Result<InstallReport, AgentError> {
        let config = self.config;
        let package = config.package.as_str();
        let mut manifests = ManifestStore::new(
            config.manifest_url.clone(),
            &os.board,
            self.deps.fetcher,
            self.deps.verifier,
            config.signatures,
        );
        let selection = pick_version(
            &mut manifests,
            os,
            &config.epoch,
            package,
            &facts.preferred_versions,
        )?;
        let Selection::Install { version, targets } = selection else {
            log::info!("the OS image provides {package}; nothing to install");
            return Ok(InstallReport::default());
        };
        log::info!("installing {package}:{version} for OS {targets}");

        let store = AddonStore::new(&config.paths.store_root);
        let fetcher = self.addon_fetcher();
        let mut staged = 0;
        for os_version in targets.iter() {
            if torcx.has_image(os_version, package, &version) {
                log::info!("{package}:{version} already available for OS {os_version}");
                continue;
            }

            let manifest = manifests.get_manifest(os_version)?;
            let key = manifest.location_for(package, &version)?;
            let artefact = manifest
                .artefact(key)
                .ok_or_else(|| ManifestError::NoLocation {
                    name: package.to_owned(),
                    version: version.clone(),
                })?;
            let fetched = fetcher.fetch_addon(&artefact)?;
            if artefact.location.is_path() {
                log::info!("{package}:{version} for OS {os_version} is provided at {}", artefact.location);
                continue;
            }
            store.stage(fetched, &artefact, os_version)?;
            staged += 1;
        }

        torcx.activate(&config.profile, package, &version)?;
        Ok(InstallReport {
            staged,
            runtime_reboot_needed: true,
        })
    }

    fn addon_fetcher(&self) -> AddonFetcher<'a> {
        let paths = &self.config.paths;
        let mut fetcher = AddonFetcher::new(
            self.deps.fetcher,
            self.deps.verifier,
            self.config.signatures,
            vec![paths.store_root.clone(), paths.vendor_store_root.clone()],
        );
        if let Some(dir) = &paths.scratch_dir {
            fetcher = fetcher.with_scratch_dir(dir);
        }
        fetcher
    }

    fn collect_garbage(&self, os: &OsState) {
        let store = AddonStore::new(&self.config.paths.store_root);
        match store.gc(&os.retained_versions()) {
            Ok(removed) if removed.is_empty() => log::debug!("no stale store buckets"),
            Ok(removed) => log::info!("removed stale store buckets {removed:?}"),
            Err(err) => log::warn!("store garbage collection failed: {err}"),
        }
    }

    fn annotate(&self) -> Result<(), AgentError> {
        let Some(key) = &self.config.node_annotation else {
            return Ok(());
        };
        let node = self
            .config
            .node_name
            .as_deref()
            .ok_or(ConfigError::MissingNodeName)?;
        retry(
            self.config.annotate_retry,
            &format!("annotate node {node}"),
            || self.deps.cluster.annotate_node(node, key),
        )?;
        log::info!("annotated node {node} with {key}=true");
        Ok(())
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
