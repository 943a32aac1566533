//! Service-manager actions: the runtime cleanup unit and the reboot.

use crate::exec::{CommandExecutor, ExecError, stderr_text};
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory for units that last until the next boot.
pub const RUNTIME_UNIT_DIR: &str = "/run/systemd/system";

/// Name of the unit that wipes runtime data during shutdown.
pub const CLEANUP_UNIT_NAME: &str = "torcx-docker-cleanup.service";

/// Contents of the cleanup unit.
///
/// A runtime change can leave data the new version cannot read, so the old
/// data directory is removed on the way down.
pub const CLEANUP_UNIT: &str = "\
[Unit]
Description=Remove container runtime data after a runtime change
DefaultDependencies=no
Before=docker.service

[Service]
Type=oneshot
ExecStart=/usr/bin/rm -rf /var/lib/docker

[Install]
RequiredBy=umount.target
";

/// Errors raised by service-manager actions.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// `systemctl` could not be run.
    #[error("failed to run systemctl {args}")]
    Command {
        /// The arguments.
        args: String,
        /// The subprocess failure.
        #[source]
        source: ExecError,
    },

    /// `systemctl` exited unsuccessfully.
    #[error("systemctl {args} failed: {stderr}")]
    Failed {
        /// The arguments.
        args: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The unit file could not be written.
    #[error("failed to write unit {path}")]
    WriteUnit {
        /// The unit file.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Service-manager operations used by the workflows.
pub trait ServiceManager {
    /// Installs and enables the runtime-data cleanup unit for this boot.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] when the unit cannot be installed.
    fn install_cleanup_unit(&self) -> Result<(), ServiceError>;

    /// Starts a reboot. Returns once the request is accepted.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] when the reboot is refused.
    fn reboot(&self) -> Result<(), ServiceError>;
}

/// [`ServiceManager`] backed by `systemctl`.
pub struct Systemd<'a> {
    executor: &'a dyn CommandExecutor,
    unit_dir: Utf8PathBuf,
}

impl<'a> Systemd<'a> {
    /// Creates a manager that writes runtime units to `unit_dir`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, unit_dir: &Utf8Path) -> Self {
        Self {
            executor,
            unit_dir: unit_dir.to_owned(),
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<(), ServiceError> {
        let joined = args.join(" ");
        let output = self
            .executor
            .run("systemctl", args)
            .map_err(|source| ServiceError::Command {
                args: joined.clone(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Failed {
                args: joined,
                stderr: stderr_text(&output),
            })
        }
    }
}

impl ServiceManager for Systemd<'_> {
    fn install_cleanup_unit(&self) -> Result<(), ServiceError> {
        let path = self.unit_dir.join(CLEANUP_UNIT_NAME);
        std::fs::create_dir_all(&self.unit_dir)
            .and_then(|()| std::fs::write(&path, CLEANUP_UNIT))
            .map_err(|source| ServiceError::WriteUnit {
                path: path.clone(),
                source,
            })?;
        self.systemctl(&["enable", "--runtime", "--force", CLEANUP_UNIT_NAME])?;
        self.systemctl(&["daemon-reload"])?;
        log::debug!("installed {path}");
        Ok(())
    }

    fn reboot(&self) -> Result<(), ServiceError> {
        log::info!("node updated; rebooting to apply changes");
        self.systemctl(&["isolate", "reboot.target"])
    }
}

/// Sleeps in `step` increments until the process is killed.
pub fn block_forever(step: Duration) -> ! {
    let step = step.max(Duration::from_secs(1));
    loop {
        std::thread::sleep(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, success_output, utf8_temp_dir};

    #[test]
    fn cleanup_unit_is_written_enabled_and_loaded() {
        let (_guard, dir) = utf8_temp_dir();
        let unit_dir = dir.join("run/systemd/system");
        let executor = StubExecutor::new(vec![
            ExpectedCall {
                cmd: "systemctl",
                args: vec!["enable", "--runtime", "--force", CLEANUP_UNIT_NAME],
                result: Ok(success_output()),
            },
            ExpectedCall {
                cmd: "systemctl",
                args: vec!["daemon-reload"],
                result: Ok(success_output()),
            },
        ]);

        Systemd::new(&executor, &unit_dir)
            .install_cleanup_unit()
            .expect("installed");

        let unit = std::fs::read_to_string(unit_dir.join(CLEANUP_UNIT_NAME)).expect("unit");
        assert!(unit.contains("ExecStart=/usr/bin/rm -rf /var/lib/docker"));
        assert!(unit.contains("RequiredBy=umount.target"));
        assert!(unit.contains("Type=oneshot"));
        executor.assert_finished();
    }

    #[test]
    fn reboot_isolates_reboot_target() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "systemctl",
            args: vec!["isolate", "reboot.target"],
            result: Ok(success_output()),
        }]);

        Systemd::new(&executor, Utf8Path::new(RUNTIME_UNIT_DIR))
            .reboot()
            .expect("reboot requested");
        executor.assert_finished();
    }

    #[test]
    fn refused_reboot_is_an_error() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: "systemctl",
            args: vec!["isolate", "reboot.target"],
            result: Ok(failure_output("Access denied")),
        }]);

        let err = Systemd::new(&executor, Utf8Path::new(RUNTIME_UNIT_DIR))
            .reboot()
            .expect_err("refused");
        assert!(matches!(err, ServiceError::Failed { ref stderr, .. } if stderr.contains("denied")));
    }
}
