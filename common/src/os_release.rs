//! OS identity: version, board, and update channel.

use crate::env_file::EnvFile;
use crate::error::{CommonError, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// Default location of the os-release file.
pub const OS_RELEASE_PATH: &str = "/usr/lib/os-release";

/// Update configuration shipped inside the OS image.
pub const VENDOR_UPDATE_CONF_PATH: &str = "/usr/share/coreos/update.conf";

/// Update configuration overrides written by the administrator.
pub const UPDATE_CONF_PATH: &str = "/etc/coreos/update.conf";

const VERSION_KEY: &str = "VERSION";
const VERSION_ID_KEY: &str = "VERSION_ID";
const BOARD_KEY: &str = "COREOS_BOARD";
const CHANNEL_KEY: &str = "GROUP";

/// Version and board of the running OS image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    /// OS version string, for example `1520.3.0`.
    pub version: String,
    /// Board identifier, for example `amd64-usr`.
    pub board: String,
}

impl OsRelease {
    /// Reads the os-release file at `path`, falling back to the host
    /// architecture when the file records no board.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, holds neither
    /// `VERSION` nor `VERSION_ID`, or names no board on an architecture
    /// without a default.
    pub fn read(path: &Utf8Path) -> Result<Self> {
        let env = EnvFile::read(path)?;
        Self::from_env(path, &env, std::env::consts::ARCH)
    }

    /// Builds the release record from parsed os-release entries.
    ///
    /// # Errors
    ///
    /// See [`OsRelease::read`].
    ///
    /// # Examples
    ///
    /// ```
    /// use camino::Utf8Path;
    /// use nodeprep_common::env_file::EnvFile;
    /// use nodeprep_common::os_release::OsRelease;
    ///
    /// let env = EnvFile::parse("VERSION=1520.3.0\n");
    /// let release = OsRelease::from_env(Utf8Path::new("os-release"), &env, "x86_64")?;
    /// assert_eq!(release.board, "amd64-usr");
    /// # Ok::<(), nodeprep_common::CommonError>(())
    /// ```
    pub fn from_env(path: &Utf8Path, env: &EnvFile, arch: &str) -> Result<Self> {
        let version = non_empty(env, VERSION_KEY)
            .or_else(|| non_empty(env, VERSION_ID_KEY))
            .ok_or_else(|| CommonError::MissingKey {
                path: path.to_owned(),
                key: VERSION_KEY,
            })?;

        let board = match non_empty(env, BOARD_KEY) {
            Some(board) => board.to_owned(),
            None => board_for_arch(arch)
                .ok_or_else(|| CommonError::UnknownArchitecture {
                    arch: arch.to_owned(),
                })?
                .to_owned(),
        };

        Ok(Self {
            version: version.to_owned(),
            board,
        })
    }
}

/// Maps a Rust architecture name to the board name used in manifest URLs.
///
/// # Examples
///
/// ```
/// use nodeprep_common::os_release::board_for_arch;
///
/// assert_eq!(board_for_arch("aarch64"), Some("arm64-usr"));
/// assert_eq!(board_for_arch("riscv64"), None);
/// ```
#[must_use]
pub fn board_for_arch(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("amd64-usr"),
        "aarch64" => Some("arm64-usr"),
        _ => None,
    }
}

/// Reads the update channel from a sequence of update configuration files.
///
/// Later files override earlier ones; missing files are skipped.
///
/// # Errors
///
/// Returns [`CommonError::MissingKey`] when no file assigns `GROUP`, or a
/// read error for files that exist but cannot be read.
pub fn read_channel(paths: &[Utf8PathBuf]) -> Result<String> {
    let mut channel = None;
    for path in paths {
        let Some(env) = EnvFile::read_optional(path)? else {
            log::debug!("update configuration {path} not present");
            continue;
        };
        if let Some(group) = non_empty(&env, CHANNEL_KEY) {
            channel = Some(group.to_owned());
        }
    }

    channel.ok_or_else(|| CommonError::MissingKey {
        path: paths
            .last()
            .cloned()
            .unwrap_or_else(|| Utf8PathBuf::from(UPDATE_CONF_PATH)),
        key: CHANNEL_KEY,
    })
}

/// Default update configuration search order.
#[must_use]
pub fn default_update_conf_paths() -> Vec<Utf8PathBuf> {
    vec![
        Utf8PathBuf::from(VENDOR_UPDATE_CONF_PATH),
        Utf8PathBuf::from(UPDATE_CONF_PATH),
    ]
}

fn non_empty<'a>(env: &'a EnvFile, key: &str) -> Option<&'a str> {
    env.get(key).filter(|value| !value.is_empty())
}
