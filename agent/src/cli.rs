//! CLI argument definitions for the nodeprep agent.
//!
//! Flags map onto [`Overrides`], the top layer of the configuration. They
//! are kept apart from the entrypoint so they can be parsed in tests.

use crate::config::{Overrides, Workflow};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Host file that keeps the hook's log across reboots.
pub const DEFAULT_HOOK_LOG_PATH: &str = "/var/log/nodeprep/hook-pre.log";

/// Keep a node's container runtime matched to its cluster across OS updates.
#[derive(Parser, Debug)]
#[command(name = "nodeprep")]
#[command(version, about)]
#[command(long_about = concat!(
    "Keep a node's container runtime matched to its cluster across OS updates.\n\n",
    "`bootstrap` runs on first boot: it applies pending OS updates, installs the ",
    "runtime version the control plane supports for both the running and the next ",
    "OS, writes the kubelet environment, and reboots when needed.\n\n",
    "`hook-pre` runs from the update operator before a reboot: it stages the ",
    "runtime for the OS about to boot and annotates the node when done.",
))]
#[command(after_help = concat!(
    "EXAMPLES:\n",
    "  First boot without OS updates:\n",
    "    $ nodeprep bootstrap --do-os-upgrade=false\n\n",
    "  Pre-reboot hook with completion annotation:\n",
    "    $ NODE=worker-1 nodeprep hook-pre --node-annotation example.com/runtime-ready\n\n",
    "  Settings from a file, with more logging:\n",
    "    $ nodeprep -v --config /etc/nodeprep.toml bootstrap",
))]
pub struct Cli {
    /// Workflow to run.
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file; flags override its values.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(
        short,
        long = "verbose",
        action = clap::ArgAction::Count,
        global = true
    )]
    pub verbosity: u8,
}

/// Available workflows.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Prepare a node on first boot.
    Bootstrap(BootstrapArgs),

    /// Prepare the runtime before the node reboots into a new OS.
    #[command(name = "hook-pre")]
    HookPre(HookArgs),
}

/// Flags accepted by both workflows.
#[derive(Args, Debug, Clone, Default)]
pub struct SharedArgs {
    /// Path of the torcx binary.
    #[arg(long, value_name = "PATH")]
    pub torcx_bin: Option<Utf8PathBuf>,

    /// Profile to activate the runtime in.
    #[arg(long, value_name = "NAME")]
    pub profile: Option<String>,

    /// Manifest URL template with {board} and {os_version} placeholders.
    #[arg(long, value_name = "TEMPLATE")]
    pub manifest_url: Option<String>,

    /// First OS version with remotely published packages.
    #[arg(long, value_name = "VERSION")]
    pub epoch: Option<String>,

    /// Keyring for signature checks.
    #[arg(long, value_name = "FILE")]
    pub keyring: Option<Utf8PathBuf>,

    /// Skip manifest and archive signature checks.
    #[arg(long)]
    pub no_verify_signatures: bool,

    /// Kubeconfig for cluster API calls.
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<Utf8PathBuf>,

    /// Use this cluster version instead of discovering it.
    #[arg(long, value_name = "VERSION")]
    pub force_kube_version: Option<String>,

    /// Root of the writable add-on store.
    #[arg(long, value_name = "DIR")]
    pub store_root: Option<Utf8PathBuf>,
}

/// Arguments for `bootstrap`.
#[derive(Args, Debug, Clone, Default)]
pub struct BootstrapArgs {
    /// Flags shared with `hook-pre`.
    #[command(flatten)]
    pub shared: SharedArgs,

    /// Apply OS updates before installing the runtime [default: true].
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub do_os_upgrade: Option<bool>,

    /// Skip runtime installation and only write the kubelet environment.
    #[arg(long)]
    pub skip_torcx_setup: bool,

    /// Destination of the kubelet environment file.
    #[arg(long, value_name = "FILE")]
    pub kubelet_env_path: Option<Utf8PathBuf>,
}

/// Arguments for `hook-pre`.
#[derive(Args, Debug, Clone, Default)]
pub struct HookArgs {
    /// Flags shared with `bootstrap`.
    #[command(flatten)]
    pub shared: SharedArgs,

    /// Annotation set to `true` on the node when the hook succeeds.
    #[arg(long, value_name = "KEY")]
    pub node_annotation: Option<String>,

    /// Name of this node.
    #[arg(long, env = "NODE", value_name = "NAME")]
    pub node_name: Option<String>,

    /// After success, stay alive sleeping in steps of this many seconds.
    #[arg(long, value_name = "SECONDS")]
    pub sleep: Option<u64>,

    /// Append a copy of the log to this host file [default: /var/log/nodeprep/hook-pre.log].
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<Utf8PathBuf>,

    /// Log to standard error only.
    #[arg(long, conflicts_with = "log_file")]
    pub no_log_file: bool,
}

impl Cli {
    /// The workflow selected by the subcommand.
    #[must_use]
    pub const fn workflow(&self) -> Workflow {
        match self.command {
            Command::Bootstrap(_) => Workflow::Bootstrap,
            Command::HookPre(_) => Workflow::PreRebootHook,
        }
    }

    /// Sleep step requested for after a successful hook.
    #[must_use]
    pub fn sleep_step(&self) -> Option<Duration> {
        match &self.command {
            Command::HookPre(args) => args.sleep.map(Duration::from_secs),
            Command::Bootstrap(_) => None,
        }
    }

    /// File that receives a persistent copy of the log.
    ///
    /// Only the hook keeps one: its container output is lost when the
    /// node reboots.
    #[must_use]
    pub fn log_file(&self) -> Option<Utf8PathBuf> {
        match &self.command {
            Command::HookPre(args) if !args.no_log_file => Some(
                args.log_file
                    .clone()
                    .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_HOOK_LOG_PATH)),
            ),
            Command::HookPre(_) | Command::Bootstrap(_) => None,
        }
    }

    /// Configuration overrides given by flags.
    #[must_use]
    pub fn overrides(&self) -> Overrides {
        match &self.command {
            Command::Bootstrap(args) => Overrides {
                do_os_upgrade: args.do_os_upgrade,
                skip_torcx_setup: args.skip_torcx_setup,
                kubelet_env_path: args.kubelet_env_path.clone(),
                ..args.shared.overrides()
            },
            Command::HookPre(args) => Overrides {
                node_name: args.node_name.clone(),
                node_annotation: args.node_annotation.clone(),
                ..args.shared.overrides()
            },
        }
    }
}

impl SharedArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            torcx_bin: self.torcx_bin.clone(),
            profile: self.profile.clone(),
            manifest_url: self.manifest_url.clone(),
            epoch: self.epoch.clone(),
            verify_signatures: self.no_verify_signatures.then_some(false),
            keyring: self.keyring.clone(),
            kubeconfig: self.kubeconfig.clone(),
            store_root: self.store_root.clone(),
            force_kube_version: self.force_kube_version.clone(),
            ..Overrides::default()
        }
    }
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
