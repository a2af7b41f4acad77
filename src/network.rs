//! Connectivity state and the flush re-entrancy guard.
//!
//! [`NetworkMonitor`] owns the shared `{ is_online, pending_count }` snapshot
//! and publishes it on a `watch` channel for the UI banner. Transitions come
//! from [`ConnectivityEvent`]s pushed by the platform; the monitor never
//! polls. [`spawn_health_probe`] is one such event source.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::Backend;

/// Snapshot shown to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_online: bool,
    pub pending_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
    Unchanged,
}

/// Who asked for a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Offline→Online transition. Dropped while a flush runs.
    Automatic,
    /// User retry. Remembered while a flush runs and replayed after it.
    Manual,
}

pub struct NetworkMonitor {
    status: watch::Sender<NetworkStatus>,
    flushing: AtomicBool,
    rerun_requested: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(is_online: bool, pending_count: u64) -> Self {
        let (status, _) = watch::channel(NetworkStatus {
            is_online,
            pending_count,
        });
        Self {
            status,
            flushing: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online
    }

    /// Apply a platform event and report the resulting transition.
    pub fn apply(&self, event: ConnectivityEvent) -> Transition {
        let online = event == ConnectivityEvent::Online;
        let changed = self.status.send_if_modified(|s| {
            if s.is_online == online {
                return false;
            }
            s.is_online = online;
            true
        });
        match (changed, online) {
            (false, _) => Transition::Unchanged,
            (true, true) => Transition::WentOnline,
            (true, false) => Transition::WentOffline,
        }
    }

    pub(crate) fn set_pending(&self, pending_count: u64) {
        self.status.send_if_modified(|s| {
            if s.pending_count == pending_count {
                return false;
            }
            s.pending_count = pending_count;
            true
        });
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Claim the single flush slot. `None` when a flush is already running.
    pub fn try_begin_flush(self: &Arc<Self>, trigger: Trigger) -> Option<FlushGuard> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(FlushGuard {
                monitor: Arc::clone(self),
            });
        }
        match trigger {
            Trigger::Automatic => debug!("flush already running; automatic trigger ignored"),
            Trigger::Manual => {
                self.rerun_requested.store(true, Ordering::SeqCst);
                debug!("flush already running; manual retry deferred until it completes");
            }
        }
        None
    }

    /// Consume a deferred manual retry, if one was requested.
    pub(crate) fn take_rerun(&self) -> bool {
        self.rerun_requested.swap(false, Ordering::SeqCst)
    }
}

/// Held for the duration of one flush; releases the slot on drop.
pub struct FlushGuard {
    monitor: Arc<NetworkMonitor>,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.monitor.flushing.store(false, Ordering::SeqCst);
    }
}

/// Probe the backend every `interval` and emit an event whenever the
/// reachability result changes (including the first observation).
pub fn spawn_health_probe<B: Backend>(
    backend: Arc<B>,
    events: mpsc::Sender<ConnectivityEvent>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "health probe started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reachable = backend.ping().await;
            if previous == Some(reachable) {
                continue;
            }
            previous = Some(reachable);
            let event = if reachable {
                ConnectivityEvent::Online
            } else {
                ConnectivityEvent::Offline
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
        info!("health probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockBackend;

    #[test]
    fn test_transitions() {
        let monitor = NetworkMonitor::new(false, 0);
        assert_eq!(monitor.apply(ConnectivityEvent::Offline), Transition::Unchanged);
        assert_eq!(monitor.apply(ConnectivityEvent::Online), Transition::WentOnline);
        assert_eq!(monitor.apply(ConnectivityEvent::Online), Transition::Unchanged);
        assert_eq!(monitor.apply(ConnectivityEvent::Offline), Transition::WentOffline);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_state_and_subscribers() {
        let monitor = NetworkMonitor::new(true, 0);
        let mut rx = monitor.subscribe();
        monitor.set_pending(3);
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            *rx.borrow_and_update(),
            NetworkStatus {
                is_online: true,
                pending_count: 3
            }
        );
        monitor.set_pending(3);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_flush_guard_is_exclusive() {
        let monitor = Arc::new(NetworkMonitor::new(true, 0));
        let guard = monitor.try_begin_flush(Trigger::Automatic).expect("first claim");
        assert!(monitor.is_flushing());
        assert!(monitor.try_begin_flush(Trigger::Automatic).is_none());
        assert!(!monitor.take_rerun());

        drop(guard);
        assert!(!monitor.is_flushing());
        assert!(monitor.try_begin_flush(Trigger::Automatic).is_some());
    }

    #[test]
    fn test_manual_trigger_while_busy_is_remembered() {
        let monitor = Arc::new(NetworkMonitor::new(true, 0));
        let _guard = monitor.try_begin_flush(Trigger::Automatic).unwrap();
        assert!(monitor.try_begin_flush(Trigger::Manual).is_none());
        assert!(monitor.take_rerun());
        assert!(!monitor.take_rerun());
    }

    #[test]
    fn test_status_serializes_for_ui() {
        let json = serde_json::to_value(NetworkStatus {
            is_online: false,
            pending_count: 2,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "isOnline": false, "pendingCount": 2 }));
    }

    #[tokio::test]
    async fn test_health_probe_emits_only_changes() {
        let backend = Arc::new(MockBackend::default());
        backend.set_reachable(false);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_health_probe(
            backend.clone(),
            tx,
            Duration::from_millis(10),
            cancel.clone(),
        );

        assert_eq!(rx.recv().await, Some(ConnectivityEvent::Offline));
        backend.set_reachable(true);
        assert_eq!(rx.recv().await, Some(ConnectivityEvent::Online));

        cancel.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
