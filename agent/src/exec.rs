//! Subprocess execution for the host tools the agent drives.
//!
//! Every external tool (the package manager, the service manager, the
//! update daemon client, the cluster client, and signature verification)
//! is reached through [`CommandExecutor`], so workflows can be exercised
//! against scripted responses. The system implementation bounds each call
//! with a timeout and kills the child when it expires.

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

/// Default time limit for a single subprocess call (5 minutes).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors raised while running a subprocess.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be started.
    #[error("failed to start {cmd}")]
    Spawn {
        /// The program that failed to start.
        cmd: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the process failed.
    #[error("failed while waiting for {cmd}")]
    Wait {
        /// The program being waited on.
        cmd: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its time limit and was killed.
    #[error("{cmd} did not finish within {} seconds", timeout.as_secs())]
    TimedOut {
        /// The program that was killed.
        cmd: String,
        /// The limit that was exceeded.
        timeout: Duration,
    },
}

/// Abstraction for running external commands.
pub trait CommandExecutor {
    /// Runs a command with arguments and returns the captured output.
    ///
    /// A non-zero exit status is not an error at this layer; callers
    /// inspect [`Output::status`].
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] if the command cannot be spawned, cannot be
    /// waited on, or exceeds the time limit.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use nodeprep_agent::exec::{CommandExecutor, SystemCommandExecutor};
    ///
    /// let executor = SystemCommandExecutor::default();
    /// let output = executor.run("systemctl", &["--version"])?;
    /// assert!(output.status.success());
    /// # Ok::<(), nodeprep_agent::exec::ExecError>(())
    /// ```
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Output, ExecError>;
}

/// Executes commands on the host system under a time limit.
#[derive(Debug, Clone, Copy)]
pub struct SystemCommandExecutor {
    timeout: Duration,
}

impl SystemCommandExecutor {
    /// Creates an executor that kills commands running longer than `timeout`.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandExecutor {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandExecutor for SystemCommandExecutor {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Output, ExecError> {
        log::debug!("running {cmd} {}", args.join(" "));

        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                cmd: cmd.to_owned(),
                source,
            })?;

        // Drain both pipes while waiting so a chatty child cannot fill a
        // pipe buffer and stall.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let waited = child.wait_timeout(self.timeout);
        let status = match waited {
            Ok(Some(status)) => status,
            Ok(None) => {
                kill_and_reap(&mut child, cmd);
                return Err(ExecError::TimedOut {
                    cmd: cmd.to_owned(),
                    timeout: self.timeout,
                });
            }
            Err(source) => {
                kill_and_reap(&mut child, cmd);
                return Err(ExecError::Wait {
                    cmd: cmd.to_owned(),
                    source,
                });
            }
        };

        Ok(Output {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

/// Returns the trimmed standard error of a finished command.
#[must_use]
pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_owned()
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(err) = reader.read_to_end(&mut buffer) {
            log::debug!("failed to read child output: {err}");
        }
        buffer
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut std::process::Child, cmd: &str) {
    if let Err(err) = child.kill() {
        log::debug!("failed to kill {cmd}: {err}");
    }
    if let Err(err) = child.wait() {
        log::debug!("failed to reap {cmd}: {err}");
    }
}
