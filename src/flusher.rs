//! Replays the sync queue against the backend, oldest entry first.
//!
//! A dead-lettered write holds back every later write for the same entity:
//! those are parked behind it instead of being replayed out of order, while
//! writes for other entities keep flowing.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{Result, SyncError};
use crate::network::NetworkMonitor;
use crate::queue::SyncQueue;

/// Why a sweep ended before the queue was empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    NetworkUnavailable { message: String },
    Rejected { id: Uuid, status: u16, message: String },
    /// Head entry does not decrypt under this device's queue key.
    Unreadable { message: String },
    Storage { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub submitted: usize,
    pub dead_lettered: usize,
    /// Parked because an earlier write for the same entity is dead-lettered.
    pub held_back: usize,
    pub remaining: u64,
    pub stopped: Option<StopReason>,
}

impl FlushReport {
    pub fn completed(&self) -> bool {
        self.stopped.is_none()
    }
}

pub struct QueueFlusher<B: Backend> {
    queue: Arc<SyncQueue>,
    backend: Arc<B>,
    monitor: Arc<NetworkMonitor>,
    max_attempts: Option<u32>,
}

impl<B: Backend> QueueFlusher<B> {
    pub fn new(
        queue: Arc<SyncQueue>,
        backend: Arc<B>,
        monitor: Arc<NetworkMonitor>,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            queue,
            backend,
            monitor,
            max_attempts,
        }
    }

    /// One sweep. Callers hold the monitor's flush guard.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let pending = self.queue.count().unwrap_or(0);
        if pending > 0 {
            info!(pending, "flushing offline queue");
        }

        if let Err(e) = self.sweep(&mut report).await {
            warn!(error = %e, "queue flush aborted");
            report.stopped = Some(match e {
                SyncError::EncryptionUnavailable | SyncError::DecryptionFailed => {
                    StopReason::Unreadable {
                        message: e.to_string(),
                    }
                }
                other => StopReason::Storage {
                    message: other.to_string(),
                },
            });
        }

        report.remaining = self.publish_pending();
        if report.submitted > 0
            || report.dead_lettered > 0
            || report.held_back > 0
            || report.stopped.is_some()
        {
            info!(
                submitted = report.submitted,
                dead_lettered = report.dead_lettered,
                held_back = report.held_back,
                remaining = report.remaining,
                completed = report.completed(),
                "queue flush finished"
            );
        }
        report
    }

    async fn sweep(&self, report: &mut FlushReport) -> Result<()> {
        while let Some(entry) = self.queue.peek_next()? {
            if let Some(blocker) = self.queue.blocking_dead_letter(entry.id)? {
                self.queue
                    .dead_letter(entry.id, &format!("held behind dead-lettered write {blocker}"))?;
                report.held_back += 1;
                self.publish_pending();
                continue;
            }

            self.queue.mark_in_flight(entry.id)?;
            debug!(id = %entry.id, operation = entry.operation.kind(), "replaying queued write");

            match self.backend.submit(&entry.operation).await {
                Ok(_) => {
                    self.queue.dequeue(entry.id)?;
                    report.submitted += 1;
                    self.publish_pending();
                }
                Err(e) if e.is_connectivity() => {
                    self.queue.release(entry.id)?;
                    report.stopped = Some(StopReason::NetworkUnavailable {
                        message: e.to_string(),
                    });
                    return Ok(());
                }
                Err(SyncError::BackendRejected { status, message }) => {
                    let attempts = self.queue.mark_failed(entry.id, &message)?;
                    warn!(
                        id = %entry.id,
                        operation = entry.operation.kind(),
                        table = entry.operation.table(),
                        status,
                        attempts,
                        error = %message,
                        "backend rejected queued write"
                    );
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        self.queue.dead_letter(entry.id, &message)?;
                        report.dead_lettered += 1;
                        self.publish_pending();
                        continue;
                    }
                    report.stopped = Some(StopReason::Rejected {
                        id: entry.id,
                        status,
                        message,
                    });
                    return Ok(());
                }
                Err(other) => {
                    self.queue.release(entry.id)?;
                    return Err(other);
                }
            }
        }
        Ok(())
    }

    fn publish_pending(&self) -> u64 {
        match self.queue.count() {
            Ok(n) => {
                self.monitor.set_pending(n);
                n
            }
            Err(e) => {
                warn!(error = %e, "failed to count pending writes");
                self.monitor.state().pending_count
            }
        }
    }
}
