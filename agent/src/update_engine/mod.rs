//! Integration with the OS auto-update daemon.
//!
//! The daemon is reached through [`UpdateEngine`]. [`wait::run_os_update`]
//! triggers an update and waits for it to settle, while
//! [`wait::pending_os_version`] only asks whether one is already staged.

pub mod client;
pub mod wait;

use crate::exec::ExecError;
use std::fmt;
use thiserror::Error;

pub use client::{DEFAULT_UPDATE_ENGINE_CLIENT, UpdateEngineClient};
pub use wait::{STATUS_QUEUE_CAPACITY, StreamItem, pending_os_version, run_os_update};

/// Operation the daemon reports as current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOperation {
    /// Nothing to do; no update is pending.
    Idle,
    /// Asking the update server for a new image.
    CheckingForUpdate,
    /// An update was found.
    UpdateAvailable,
    /// The payload is being downloaded.
    Downloading,
    /// The payload is being verified.
    Verifying,
    /// The new image is being written.
    Finalizing,
    /// The new image is staged and waits for a reboot.
    UpdatedNeedReboot,
    /// The daemon is reporting a failure to the update server.
    ReportingErrorEvent,
    /// A status string this agent does not recognise.
    Unknown(String),
}

impl UpdateOperation {
    /// Parses a daemon status string such as `UPDATE_STATUS_IDLE`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nodeprep_agent::update_engine::UpdateOperation;
    ///
    /// assert_eq!(
    ///     UpdateOperation::parse("UPDATE_STATUS_UPDATED_NEED_REBOOT"),
    ///     UpdateOperation::UpdatedNeedReboot
    /// );
    /// assert!(matches!(
    ///     UpdateOperation::parse("UPDATE_STATUS_ATTEMPTING_ROLLBACK"),
    ///     UpdateOperation::Unknown(_)
    /// ));
    /// ```
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "UPDATE_STATUS_IDLE" => Self::Idle,
            "UPDATE_STATUS_CHECKING_FOR_UPDATE" => Self::CheckingForUpdate,
            "UPDATE_STATUS_UPDATE_AVAILABLE" => Self::UpdateAvailable,
            "UPDATE_STATUS_DOWNLOADING" => Self::Downloading,
            "UPDATE_STATUS_VERIFYING" => Self::Verifying,
            "UPDATE_STATUS_FINALIZING" => Self::Finalizing,
            "UPDATE_STATUS_UPDATED_NEED_REBOOT" => Self::UpdatedNeedReboot,
            "UPDATE_STATUS_REPORTING_ERROR_EVENT" => Self::ReportingErrorEvent,
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// The daemon's spelling of this operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "UPDATE_STATUS_IDLE",
            Self::CheckingForUpdate => "UPDATE_STATUS_CHECKING_FOR_UPDATE",
            Self::UpdateAvailable => "UPDATE_STATUS_UPDATE_AVAILABLE",
            Self::Downloading => "UPDATE_STATUS_DOWNLOADING",
            Self::Verifying => "UPDATE_STATUS_VERIFYING",
            Self::Finalizing => "UPDATE_STATUS_FINALIZING",
            Self::UpdatedNeedReboot => "UPDATE_STATUS_UPDATED_NEED_REBOOT",
            Self::ReportingErrorEvent => "UPDATE_STATUS_REPORTING_ERROR_EVENT",
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns `true` for states that end a wait.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::UpdatedNeedReboot)
    }
}

impl fmt::Display for UpdateOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status report from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    /// Current operation.
    pub operation: UpdateOperation,
    /// Version of the staged or downloading image; empty when none.
    pub new_version: String,
    /// Payload size in bytes.
    pub new_size: u64,
}

impl UpdateStatus {
    /// A status carrying only an operation.
    #[must_use]
    pub const fn new(operation: UpdateOperation) -> Self {
        Self {
            operation,
            new_version: String::new(),
            new_size: 0,
        }
    }

    /// Sets the reported new version.
    #[must_use]
    pub fn with_version(mut self, version: &str) -> Self {
        self.new_version = version.to_owned();
        self
    }

    /// The staged OS version, when the daemon waits for a reboot.
    #[must_use]
    pub fn staged_version(&self) -> Option<&str> {
        (self.operation == UpdateOperation::UpdatedNeedReboot && !self.new_version.is_empty())
            .then_some(self.new_version.as_str())
    }
}

/// Errors raised while talking to the update daemon.
#[derive(Debug, Error)]
pub enum UpdateEngineError {
    /// The daemon client could not be run.
    #[error("failed to {action}")]
    Command {
        /// What was being attempted.
        action: &'static str,
        /// The subprocess failure.
        #[source]
        source: ExecError,
    },

    /// The daemon client exited unsuccessfully.
    #[error("failed to {action}: {stderr}")]
    Failed {
        /// What was being attempted.
        action: &'static str,
        /// Captured standard error.
        stderr: String,
    },

    /// A status report could not be understood.
    #[error("malformed update status: {output}")]
    Malformed {
        /// The unparsed text.
        output: String,
    },

    /// The status subscription could not be opened.
    #[error("failed to subscribe to update status")]
    Subscribe(#[source] std::io::Error),

    /// Reading the status subscription failed.
    #[error("failed to read update status")]
    Stream(#[source] std::io::Error),

    /// The status stream ended before the update settled.
    #[error("update status stream closed before the update settled")]
    StreamClosed,

    /// The status listener panicked.
    #[error("update status listener panicked")]
    ListenerPanicked,
}

/// Releases a blocked [`StatusStream`] from another thread.
pub struct StreamCloser(Option<Box<dyn FnOnce() + Send>>);

impl StreamCloser {
    /// Wraps the action that unblocks the stream.
    #[must_use]
    pub fn new(close: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(close)))
    }

    /// A closer for streams that never block.
    #[must_use]
    pub const fn noop() -> Self {
        Self(None)
    }

    /// Runs the close action.
    pub fn close(mut self) {
        if let Some(close) = self.0.take() {
            close();
        }
    }
}

impl fmt::Debug for StreamCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamCloser")
            .field(&self.0.is_some())
            .finish()
    }
}

/// A subscription to daemon status changes.
pub trait StatusStream: Send {
    /// Blocks for the next status; `Ok(None)` once the stream has ended.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription cannot be read.
    fn next_status(&mut self) -> Result<Option<UpdateStatus>, UpdateEngineError>;

    /// Returns a handle that ends the stream from another thread.
    fn closer(&self) -> StreamCloser;
}

/// Control surface of the update daemon.
pub trait UpdateEngine {
    /// Asks the daemon to check for and apply an update.
    ///
    /// # Errors
    ///
    /// Returns an error when the request is not accepted.
    fn attempt_update(&self) -> Result<(), UpdateEngineError>;

    /// Returns the daemon's current status.
    ///
    /// # Errors
    ///
    /// Returns an error when the status cannot be obtained.
    fn get_status(&self) -> Result<UpdateStatus, UpdateEngineError>;

    /// Opens a status subscription.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription cannot be opened.
    fn subscribe(&self) -> Result<Box<dyn StatusStream>, UpdateEngineError>;
}
