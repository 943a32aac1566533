//! [`UpdateEngine`] backed by `update_engine_client`.
//!
//! Status snapshots come from `-status`, which prints `KEY=VALUE` lines.
//! Subscriptions run `-watch_for_updates` as a child process and parse the
//! status lines it logs until the child is killed.

use super::{StatusStream, StreamCloser, UpdateEngine, UpdateEngineError, UpdateOperation, UpdateStatus};
use crate::exec::{CommandExecutor, stderr_text};
use camino::{Utf8Path, Utf8PathBuf};
use std::io::{BufRead, BufReader, Lines};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{Arc, Mutex};

/// Default location of the daemon client.
pub const DEFAULT_UPDATE_ENGINE_CLIENT: &str = "update_engine_client";

/// Drives the daemon through its command-line client.
pub struct UpdateEngineClient<'a> {
    executor: &'a dyn CommandExecutor,
    binary: Utf8PathBuf,
}

impl<'a> UpdateEngineClient<'a> {
    /// Creates a client that runs `binary`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, binary: &Utf8Path) -> Self {
        Self {
            executor,
            binary: binary.to_owned(),
        }
    }

    fn run(&self, action: &'static str, flag: &str) -> Result<String, UpdateEngineError> {
        let output = self
            .executor
            .run(self.binary.as_str(), &[flag])
            .map_err(|source| UpdateEngineError::Command { action, source })?;
        if !output.status.success() {
            return Err(UpdateEngineError::Failed {
                action,
                stderr: stderr_text(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl UpdateEngine for UpdateEngineClient<'_> {
    fn attempt_update(&self) -> Result<(), UpdateEngineError> {
        self.run("trigger an OS update", "-check_for_update")
            .map(|_| ())
    }

    fn get_status(&self) -> Result<UpdateStatus, UpdateEngineError> {
        let stdout = self.run("query update status", "-status")?;
        parse_status_report(&stdout)
    }

    fn subscribe(&self) -> Result<Box<dyn StatusStream>, UpdateEngineError> {
        let mut child = Command::new(self.binary.as_std_path())
            .arg("-watch_for_updates")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(UpdateEngineError::Subscribe)?;
        let Some(stderr) = child.stderr.take() else {
            reap(&mut child);
            return Err(UpdateEngineError::Subscribe(std::io::Error::other(
                "watcher stderr was not captured",
            )));
        };
        Ok(Box::new(WatchStream {
            child: Arc::new(Mutex::new(child)),
            lines: BufReader::new(stderr).lines(),
        }))
    }
}

/// Parses `-status` output.
///
/// # Errors
///
/// Returns [`UpdateEngineError::Malformed`] when `CURRENT_OP` is missing or
/// `NEW_SIZE` is not a number.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::update_engine::client::parse_status_report;
/// use nodeprep_agent::update_engine::UpdateOperation;
///
/// let status = parse_status_report(
///     "LAST_CHECKED_TIME=0\nCURRENT_OP=UPDATE_STATUS_IDLE\nNEW_VERSION=0.0.0\nNEW_SIZE=0\n",
/// )?;
/// assert_eq!(status.operation, UpdateOperation::Idle);
/// # Ok::<(), nodeprep_agent::update_engine::UpdateEngineError>(())
/// ```
pub fn parse_status_report(report: &str) -> Result<UpdateStatus, UpdateEngineError> {
    let mut operation = None;
    let mut new_version = String::new();
    let mut new_size = 0;

    for (key, value) in report.lines().filter_map(|line| line.split_once('=')) {
        match key.trim() {
            "CURRENT_OP" => operation = Some(UpdateOperation::parse(value)),
            "NEW_VERSION" => value.trim().clone_into(&mut new_version),
            "NEW_SIZE" => new_size = parse_size(value, report)?,
            _ => {}
        }
    }

    let operation = operation.ok_or_else(|| UpdateEngineError::Malformed {
        output: report.to_owned(),
    })?;
    Ok(UpdateStatus {
        operation,
        new_version,
        new_size,
    })
}

/// Extracts a status from one watcher log line.
///
/// Lines without a `current_operation:` field yield `None`.
#[must_use]
pub fn parse_watch_line(line: &str) -> Option<UpdateStatus> {
    let field = |name: &str| -> Option<&str> {
        let (_, rest) = line.split_once(name)?;
        rest.split_whitespace().next()
    };

    let operation = UpdateOperation::parse(field("current_operation:")?);
    Some(UpdateStatus {
        operation,
        new_version: field("new_version:").unwrap_or_default().to_owned(),
        new_size: field("new_size:")
            .and_then(|size| size.parse().ok())
            .unwrap_or_default(),
    })
}

fn parse_size(value: &str, report: &str) -> Result<u64, UpdateEngineError> {
    value.trim().parse().map_err(|_| UpdateEngineError::Malformed {
        output: report.to_owned(),
    })
}

struct WatchStream {
    child: Arc<Mutex<Child>>,
    lines: Lines<BufReader<ChildStderr>>,
}

impl StatusStream for WatchStream {
    fn next_status(&mut self) -> Result<Option<UpdateStatus>, UpdateEngineError> {
        for line in self.lines.by_ref() {
            let line = line.map_err(UpdateEngineError::Stream)?;
            if let Some(status) = parse_watch_line(&line) {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    fn closer(&self) -> StreamCloser {
        let child = Arc::clone(&self.child);
        StreamCloser::new(move || kill(&child))
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            reap(&mut child);
        }
    }
}

fn kill(child: &Mutex<Child>) {
    if let Ok(mut child) = child.lock()
        && let Err(err) = child.kill()
    {
        log::debug!("update status watcher already gone: {err}");
    }
}

fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        log::debug!("update status watcher already gone: {err}");
    }
    if let Err(err) = child.wait() {
        log::debug!("failed to reap update status watcher: {err}");
    }
}
