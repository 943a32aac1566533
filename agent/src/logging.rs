//! Log output for the binary.
//!
//! Library modules log through the `log` facade. The binary installs a
//! `tracing-subscriber` formatter on standard error, which also receives
//! `log` records, filtered by `RUST_LOG` when set and by the `--verbose`
//! count otherwise. A second formatter can append the same records to a
//! file that outlives the process.

use camino::Utf8Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Error returned when a global subscriber is already installed.
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Filter directive for a `--verbose` count.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::logging::default_level;
///
/// assert_eq!(default_level(0), "warn");
/// assert_eq!(default_level(7), "trace");
/// ```
#[must_use]
pub const fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the process-wide subscriber.
///
/// When `log_file` is given, records are also appended to it. A log file
/// that cannot be opened is reported as a warning and skipped.
///
/// # Errors
///
/// Returns an [`InitError`] when a subscriber or `log` logger is already
/// installed.
pub fn init(verbosity: u8, log_file: Option<&Utf8Path>) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)));

    let mut file_error = None;
    let file_layer = log_file
        .map(file_appender)
        .transpose()
        .unwrap_or_else(|err| {
            file_error = Some(err);
            None
        })
        .map(|appender| {
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(false)
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .try_init()?;

    if let Some(err) = file_error {
        log::warn!("not keeping a log file: {err}");
    }
    Ok(())
}

/// Opens `path` for appending, creating its directory.
fn file_appender(path: &Utf8Path) -> Result<RollingFileAppender, InitError> {
    let name = path
        .file_name()
        .ok_or_else(|| format!("log file path {path} names no file"))?;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)?;
    Ok(appender)
}
