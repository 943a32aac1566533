//! nodeprep agent library.
//!
//! Keeps a node's container runtime add-on matched to the control plane
//! across OS updates. The `nodeprep` binary runs one of two workflows:
//! `bootstrap` on first boot, and `hook-pre` from the update operator
//! before a node reboots into a new OS.
//!
//! # Modules
//!
//! - [`cli`] - Command-line argument definitions
//! - [`cluster`] - Cluster API client and retry schedules
//! - [`compat`] - Control-plane to runtime compatibility map
//! - [`config`] - Layered, validated configuration
//! - [`digest`] - Content digests for add-on archives
//! - [`download`] - HTTP fetching
//! - [`error`] - Workflow-level error type and exit codes
//! - [`exec`] - Subprocess execution under a timeout
//! - [`fetch`] - Locating, downloading, and verifying add-on archives
//! - [`kubelet_env`] - The kubelet environment file
//! - [`logging`] - Log subscriber setup for the binary
//! - [`manifest`] - Package manifests and their cache
//! - [`orchestrator`] - The bootstrap and pre-reboot hook workflows
//! - [`service`] - Service manager integration
//! - [`signature`] - Detached signature checks
//! - [`state`] - Snapshots passed between workflow phases
//! - [`store`] - The per-OS-version add-on store
//! - [`strategy`] - Add-on version selection
//! - [`torcx`] - The local package manager
//! - [`update_engine`] - The OS auto-update daemon

pub mod cli;
pub mod cluster;
pub mod compat;
pub mod config;
pub mod digest;
pub mod download;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod kubelet_env;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod service;
pub mod signature;
pub mod state;
pub mod store;
pub mod strategy;
pub mod torcx;
pub mod update_engine;

#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
