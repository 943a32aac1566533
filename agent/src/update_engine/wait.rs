//! Waiting for the update daemon to settle.
//!
//! A scoped listener thread drains the subscription into a bounded queue.
//! The main thread injects a synchronous snapshot as a [`StreamItem::Marker`]
//! and ignores everything queued ahead of it, so only statuses observed
//! after the update was triggered decide the outcome. An `Idle` snapshot
//! is final only once the daemon was seen doing something before it;
//! otherwise the check has not started yet.

use super::{StatusStream, UpdateEngine, UpdateEngineError, UpdateOperation, UpdateStatus};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

/// Capacity of the queue between the listener and the main thread.
pub const STATUS_QUEUE_CAPACITY: usize = 10;

/// An entry in the status queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// The snapshot taken right after the update was triggered.
    Marker(UpdateStatus),
    /// A status delivered by the subscription.
    Status(UpdateStatus),
}

/// Triggers an OS update and blocks until it settles.
///
/// Returns the staged OS version when the daemon ends in
/// `UpdatedNeedReboot`, or `None` when it returns to `Idle`.
///
/// # Errors
///
/// Returns an [`UpdateEngineError`] when the daemon cannot be reached or
/// the status stream ends before a terminal state.
pub fn run_os_update(engine: &dyn UpdateEngine) -> Result<Option<String>, UpdateEngineError> {
    let mut stream = engine.subscribe()?;
    let closer = stream.closer();
    if let Err(err) = engine.attempt_update() {
        closer.close();
        return Err(err);
    }
    log::info!("OS update requested; waiting for the update engine");

    let (tx, rx) = mpsc::sync_channel(STATUS_QUEUE_CAPACITY);
    let marker_tx = tx.clone();

    std::thread::scope(|scope| {
        let listener = scope.spawn(move || listen(stream.as_mut(), &tx));

        let outcome = engine
            .get_status()
            .and_then(|snapshot| inject_marker(&marker_tx, &rx, snapshot))
            .and_then(|dropped_activity| {
                drop(marker_tx);
                settle(&rx, dropped_activity)
            });

        closer.close();
        drop(rx);
        let listened = listener
            .join()
            .unwrap_or(Err(UpdateEngineError::ListenerPanicked));

        match (outcome, listened) {
            (Err(UpdateEngineError::StreamClosed), Err(cause)) => Err(cause),
            (Ok(next), Err(err)) => {
                log::debug!("status listener ended with {err}");
                Ok(next)
            }
            (outcome, _) => outcome,
        }
    })
}

/// Reports an already-staged OS version without triggering anything.
///
/// # Errors
///
/// Returns an [`UpdateEngineError`] when the status cannot be obtained.
pub fn pending_os_version(engine: &dyn UpdateEngine) -> Result<Option<String>, UpdateEngineError> {
    let status = engine.get_status()?;
    log::debug!("update engine reports {}", status.operation);
    Ok(status.staged_version().map(str::to_owned))
}

fn listen(
    stream: &mut dyn StatusStream,
    tx: &SyncSender<StreamItem>,
) -> Result<(), UpdateEngineError> {
    while let Some(status) = stream.next_status()? {
        if tx.send(StreamItem::Status(status)).is_err() {
            break;
        }
    }
    Ok(())
}

/// Queues the marker, draining stale items while the queue is full.
///
/// Returns whether any drained item showed the daemon at work.
fn inject_marker(
    tx: &SyncSender<StreamItem>,
    rx: &Receiver<StreamItem>,
    snapshot: UpdateStatus,
) -> Result<bool, UpdateEngineError> {
    let mut pending = StreamItem::Marker(snapshot);
    let mut activity = false;
    loop {
        match tx.try_send(pending) {
            Ok(()) => return Ok(activity),
            Err(TrySendError::Full(item)) => {
                pending = item;
                // Everything queued now predates the marker.
                match rx.try_recv() {
                    Ok(stale) => activity |= shows_activity(&stale),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => return Err(UpdateEngineError::StreamClosed),
                }
            }
            Err(TrySendError::Disconnected(_)) => return Err(UpdateEngineError::StreamClosed),
        }
    }
}

fn shows_activity(item: &StreamItem) -> bool {
    match item {
        StreamItem::Status(status) | StreamItem::Marker(status) => {
            status.operation != UpdateOperation::Idle
        }
    }
}

fn settle(
    rx: &Receiver<StreamItem>,
    mut activity: bool,
) -> Result<Option<String>, UpdateEngineError> {
    let mut marker_seen = false;
    loop {
        let item = rx.recv().map_err(|_| UpdateEngineError::StreamClosed)?;
        let status = match item {
            StreamItem::Status(_) if !marker_seen => {
                activity |= shows_activity(&item);
                continue;
            }
            StreamItem::Marker(status) => {
                marker_seen = true;
                match status.operation {
                    UpdateOperation::UpdatedNeedReboot => return Ok(Some(status.new_version)),
                    UpdateOperation::Idle if activity => {
                        log::info!("update check finished before the snapshot; no OS update");
                        return Ok(None);
                    }
                    _ => {}
                }
                log::debug!("update engine snapshot: {}", status.operation);
                continue;
            }
            StreamItem::Status(status) => status,
        };

        match status.operation {
            UpdateOperation::Idle => {
                log::info!("no OS update available");
                return Ok(None);
            }
            UpdateOperation::UpdatedNeedReboot => {
                log::info!("OS update to {} staged", status.new_version);
                return Ok(Some(status.new_version));
            }
            UpdateOperation::ReportingErrorEvent => {
                log::warn!("update engine is reporting an error event");
            }
            other => log::debug!("update engine status: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeUpdateEngine;
    use rstest::rstest;
    use UpdateOperation::{
        CheckingForUpdate, Downloading, Finalizing, Idle, ReportingErrorEvent, UpdatedNeedReboot,
        Verifying,
    };

    fn status(operation: UpdateOperation) -> UpdateStatus {
        UpdateStatus::new(operation).with_version("1576.5.0")
    }

    #[test]
    fn returns_staged_version_after_full_update() {
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate)).with_stream(vec![
            status(CheckingForUpdate),
            status(Downloading),
            status(Verifying),
            status(Finalizing),
            status(UpdatedNeedReboot),
        ]);

        let next = run_os_update(&engine).expect("settled");

        assert_eq!(next.as_deref(), Some("1576.5.0"));
        assert_eq!(engine.attempts(), 1);
        assert!(engine.stream_closed());
    }

    #[test]
    fn idle_after_check_means_no_update() {
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate))
            .with_stream(vec![status(CheckingForUpdate), status(Idle)]);

        assert_eq!(run_os_update(&engine).expect("settled"), None);
    }

    #[test]
    fn marker_already_needing_reboot_is_final() {
        let engine = FakeUpdateEngine::new(status(UpdatedNeedReboot)).with_open_stream(vec![]);

        let next = run_os_update(&engine).expect("settled");

        assert_eq!(next.as_deref(), Some("1576.5.0"));
        assert!(engine.stream_closed());
    }

    #[test]
    fn idle_marker_waits_for_later_statuses() {
        let engine = FakeUpdateEngine::new(status(Idle))
            .with_stream(vec![status(CheckingForUpdate), status(UpdatedNeedReboot)]);

        let next = run_os_update(&engine).expect("settled");

        assert_eq!(next.as_deref(), Some("1576.5.0"));
    }

    #[test]
    fn statuses_queued_before_the_marker_are_ignored() {
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate))
            .with_backlog(vec![status(Idle)])
            .with_stream(vec![status(Downloading), status(UpdatedNeedReboot)]);

        let next = run_os_update(&engine).expect("settled");

        assert_eq!(next.as_deref(), Some("1576.5.0"));
    }

    #[test]
    fn idle_marker_after_a_finished_check_is_final() {
        let engine = FakeUpdateEngine::new(status(Idle))
            .with_backlog(vec![status(CheckingForUpdate), status(Idle)])
            .with_open_stream(vec![]);

        assert_eq!(run_os_update(&engine).expect("settled"), None);
        assert!(engine.stream_closed());
    }

    #[test]
    fn idle_marker_after_only_stale_idles_keeps_waiting() {
        let engine = FakeUpdateEngine::new(status(Idle))
            .with_backlog(vec![status(Idle); 3])
            .with_stream(vec![status(Downloading), status(UpdatedNeedReboot)]);

        assert_eq!(
            run_os_update(&engine).expect("settled").as_deref(),
            Some("1576.5.0")
        );
    }

    #[test]
    fn stale_idles_before_a_full_update_are_ignored() {
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate))
            .with_backlog(vec![status(Idle); 3])
            .with_stream(vec![
                status(CheckingForUpdate),
                status(Downloading),
                status(UpdatedNeedReboot),
            ]);

        let next = run_os_update(&engine).expect("settled");

        assert_eq!(next.as_deref(), Some("1576.5.0"));
        assert_eq!(engine.attempts(), 1);
    }

    #[test]
    fn full_queue_at_marker_time_drops_stale_items() {
        let backlog = vec![status(CheckingForUpdate); STATUS_QUEUE_CAPACITY * 3];
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate))
            .with_backlog(backlog)
            .with_stream(vec![status(UpdatedNeedReboot)]);

        let next = run_os_update(&engine).expect("settled");

        assert_eq!(next.as_deref(), Some("1576.5.0"));
    }

    #[test]
    fn error_events_are_not_fatal() {
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate))
            .with_stream(vec![status(ReportingErrorEvent), status(Idle)]);

        assert_eq!(run_os_update(&engine).expect("settled"), None);
    }

    #[test]
    fn unknown_statuses_are_transient() {
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate)).with_stream(vec![
            status(UpdateOperation::Unknown("UPDATE_STATUS_ATTEMPTING_ROLLBACK".to_owned())),
            status(UpdatedNeedReboot),
        ]);

        assert_eq!(
            run_os_update(&engine).expect("settled").as_deref(),
            Some("1576.5.0")
        );
    }

    #[test]
    fn stream_ending_early_is_an_error() {
        let engine = FakeUpdateEngine::new(status(CheckingForUpdate))
            .with_stream(vec![status(Downloading)]);

        let err = run_os_update(&engine).expect_err("stream closed");

        assert!(matches!(err, UpdateEngineError::StreamClosed));
    }

    #[test]
    fn rejected_trigger_closes_the_subscription() {
        let engine = FakeUpdateEngine::new(status(Idle)).failing_attempt();

        let err = run_os_update(&engine).expect_err("trigger rejected");

        assert!(matches!(err, UpdateEngineError::Failed { .. }));
        assert!(engine.stream_closed());
    }

    #[rstest]
    #[case::idle(Idle, None)]
    #[case::downloading(Downloading, None)]
    #[case::staged(UpdatedNeedReboot, Some("1576.5.0"))]
    fn pending_version_only_reports_staged_updates(
        #[case] operation: UpdateOperation,
        #[case] expected: Option<&str>,
    ) {
        let engine = FakeUpdateEngine::new(status(operation));

        let pending = pending_os_version(&engine).expect("status");

        assert_eq!(pending.as_deref(), expected);
        assert_eq!(engine.attempts(), 0);
    }
}
