//! Immutable snapshots handed from one workflow phase to the next.
//!
//! Gathering produces [`HostFacts`], the OS update phase turns them into an
//! [`OsState`], version selection yields a [`Selection`], and installation
//! reports an [`InstallReport`]. Each value is complete when constructed.

use std::fmt;

/// What the node knows about itself before anything changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    /// Running OS version.
    pub os_version: String,
    /// Board identifier used in manifest URLs.
    pub board: String,
    /// Update channel the node follows.
    pub channel: String,
    /// Control-plane version, for example `v1.8.4+coreos.0`.
    pub cluster_version: String,
    /// Runtime versions compatible with the control plane, most preferred
    /// first.
    pub preferred_versions: Vec<String>,
}

/// OS versions after the update phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsState {
    /// Running OS version.
    pub current: String,
    /// Version staged for the next boot, if an update is pending.
    pub next: Option<String>,
    /// Update channel the node follows.
    pub channel: String,
    /// Board identifier used in manifest URLs.
    pub board: String,
    /// Whether this run applied an OS update that only a reboot activates.
    ///
    /// A pending version found by a read-only query does not set this.
    pub os_reboot_needed: bool,
}

impl OsState {
    /// Returns `true` when this run left an OS update awaiting a reboot.
    #[must_use]
    pub const fn reboot_needed(&self) -> bool {
        self.os_reboot_needed
    }

    /// OS versions whose store buckets must survive garbage collection.
    #[must_use]
    pub fn retained_versions(&self) -> Vec<String> {
        let mut retained = vec![self.current.clone()];
        if let Some(next) = self.next.as_ref().filter(|next| **next != self.current) {
            retained.push(next.clone());
        }
        retained
    }
}

/// The OS versions an add-on must be staged for.
///
/// Holds one or two distinct versions, primary first.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::state::TargetSet;
///
/// let targets = TargetSet::new("9999.0.0", Some("9998.0.0"));
/// assert_eq!(targets.iter().collect::<Vec<_>>(), ["9999.0.0", "9998.0.0"]);
///
/// let same = TargetSet::new("9999.0.0", Some("9999.0.0"));
/// assert_eq!(same.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSet {
    primary: String,
    secondary: Option<String>,
}

impl TargetSet {
    /// Builds a target set; a secondary equal to the primary is dropped.
    #[must_use]
    pub fn new(primary: &str, secondary: Option<&str>) -> Self {
        Self {
            primary: primary.to_owned(),
            secondary: secondary
                .filter(|version| *version != primary)
                .map(str::to_owned),
        }
    }

    /// The version the node boots next.
    #[must_use]
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// The fallback version, if distinct.
    #[must_use]
    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    /// Number of targets, one or two.
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.secondary.is_some() { 2 } else { 1 }
    }

    /// Always `false`; a target set holds at least one version.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Iterates primary first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.secondary.as_deref())
    }
}

impl fmt::Display for TargetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secondary {
            Some(secondary) => write!(f, "[{}, {secondary}]", self.primary),
            None => write!(f, "[{}]", self.primary),
        }
    }
}

/// Outcome of version selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The OS image predates remote packages and provides the add-on.
    Skip,
    /// Install `version` for every OS version in `targets`.
    Install {
        /// Chosen add-on version.
        version: String,
        /// OS versions to stage it for.
        targets: TargetSet,
    },
}

/// Outcome of the install phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstallReport {
    /// Archives written into the store.
    pub staged: usize,
    /// Whether a new runtime was activated and needs a reboot.
    pub runtime_reboot_needed: bool,
}
