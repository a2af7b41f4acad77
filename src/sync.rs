//! Offline sync engine.
//!
//! Wires the encrypted store, the write queue, the connectivity monitor, the
//! queue flusher and the cache warmer together. Writes go straight to the
//! backend while online and into the queue otherwise; the queue is replayed
//! in order the moment connectivity returns.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::cipher::{AesGcmCipher, SessionKey};
use crate::config::SyncConfig;
use crate::credentials::{self, CredentialStore, KeyringStore};
use crate::db::{self, DbState};
use crate::error::Result;
use crate::flusher::{FlushReport, QueueFlusher};
use crate::local_store::{CachedRecord, EncryptedStore, EntityType, LocalStore};
use crate::network::{
    spawn_health_probe, ConnectivityEvent, FlushGuard, NetworkMonitor, NetworkStatus, Transition,
    Trigger,
};
use crate::queue::{QueuedWrite, SyncQueue, WriteOperation};
use crate::warmer::CacheWarmer;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const SETTINGS_CATEGORY: &str = "sync";
const LAST_SYNC_KEY: &str = "last_sync";

/// Result of [`SyncEngine::submit_write`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Applied by the backend; carries its representation of the row.
    Submitted(Value),
    /// Stored locally for later replay.
    Queued(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A flush is already running; it is never restarted.
    AlreadyRunning,
}

struct EngineInner<B: Backend> {
    db: Arc<DbState>,
    store: Arc<EncryptedStore>,
    queue: Arc<SyncQueue>,
    monitor: Arc<NetworkMonitor>,
    flusher: QueueFlusher<B>,
    backend: Arc<B>,
    tenant: watch::Sender<Option<String>>,
}

impl<B: Backend> EngineInner<B> {
    fn record_last_sync(&self) {
        let now = Utc::now().to_rfc3339();
        if let Err(e) = self
            .db
            .with_conn(|conn| db::set_setting(conn, SETTINGS_CATEGORY, LAST_SYNC_KEY, &now))
        {
            warn!(error = %e, "failed to record last sync time");
        }
    }

    fn last_sync(&self) -> Option<String> {
        self.db
            .with_conn(|conn| Ok(db::get_setting(conn, SETTINGS_CATEGORY, LAST_SYNC_KEY)))
            .ok()
            .flatten()
    }

    fn refresh_pending(&self) -> Result<u64> {
        let pending = self.queue.count()?;
        self.monitor.set_pending(pending);
        Ok(pending)
    }
}

pub struct SyncEngine<B: Backend> {
    inner: Arc<EngineInner<B>>,
    config: SyncConfig,
    events_tx: mpsc::Sender<ConnectivityEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectivityEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend> SyncEngine<B> {
    /// Open `offline.db` under `config.data_dir`, with the queue key kept in
    /// the OS credential store.
    pub fn open(config: SyncConfig, backend: Arc<B>) -> Result<Self> {
        Self::open_with(config, backend, &KeyringStore)
    }

    pub fn open_with(
        config: SyncConfig,
        backend: Arc<B>,
        secrets: &dyn CredentialStore,
    ) -> Result<Self> {
        config.validate()?;
        let queue_key = credentials::device_queue_key(secrets)?;
        let db = db::init(&config.data_dir)?;
        Self::with_database(config, db, queue_key, backend)
    }

    /// `queue_key` seals the write queue and must be the same on every open
    /// of this database.
    pub fn with_database(
        config: SyncConfig,
        db: DbState,
        queue_key: SessionKey,
        backend: Arc<B>,
    ) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(db);
        let store = Arc::new(EncryptedStore::new(
            db.clone(),
            AesGcmCipher,
            config.key_salt.as_bytes().to_vec(),
        ));
        let queue = Arc::new(SyncQueue::new(db.clone(), AesGcmCipher, queue_key));

        let recovered = queue.recover_in_flight()?;
        if recovered > 0 {
            warn!(recovered, "reset writes left in flight by a previous run");
        }
        let pending = queue.count()?;

        // Offline until the platform reports otherwise.
        let monitor = Arc::new(NetworkMonitor::new(false, pending));
        let flusher = QueueFlusher::new(
            queue.clone(),
            backend.clone(),
            monitor.clone(),
            config.max_attempts,
        );
        let (tenant, _) = watch::channel(config.tenant_id.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        info!(pending, "offline sync engine opened");
        Ok(Self {
            inner: Arc::new(EngineInner {
                db,
                store,
                queue,
                monitor,
                flusher,
                backend,
                tenant,
            }),
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the connectivity event loop and the cache warmer.
    /// Must be called from within a tokio runtime; later calls are no-ops.
    pub fn start(&self) {
        let Some(events_rx) = self.events_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            warn!("sync engine already started");
            return;
        };

        let event_loop = tokio::spawn(run_event_loop(
            Arc::clone(&self.inner),
            events_rx,
            self.cancel.clone(),
        ));
        let warmer = CacheWarmer::new(
            self.inner.backend.clone(),
            self.inner.store.clone(),
            self.inner.db.clone(),
            self.inner.monitor.clone(),
            self.inner.tenant.subscribe(),
            self.config.warm_interval(),
        )
        .spawn(self.cancel.clone());

        self.track(event_loop);
        self.track(warmer);
    }

    /// Poll the backend and feed the results in as connectivity events.
    pub fn start_health_probe(&self) {
        let probe = spawn_health_probe(
            self.inner.backend.clone(),
            self.events_tx.clone(),
            self.config.probe_interval(),
            self.cancel.clone(),
        );
        self.track(probe);
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Stop background tasks. A flush already running is left to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("offline sync engine stopped");
    }

    // -- session ------------------------------------------------------------

    /// Derive the cache key for `user_id` and re-warm the cache under it.
    /// Queued writes are unaffected; they are sealed with the device key.
    pub fn sign_in(&self, user_id: &str) -> Result<()> {
        self.inner.store.sign_in(user_id)?;
        // Wake the warmer so data sealed under a previous user is replaced.
        self.inner.tenant.send_modify(|_| {});
        Ok(())
    }

    pub fn sign_out(&self) -> Result<()> {
        self.inner.store.sign_out()
    }

    pub fn set_tenant(&self, tenant_id: Option<String>) {
        self.inner.tenant.send_if_modified(|current| {
            if *current == tenant_id {
                return false;
            }
            *current = tenant_id;
            true
        });
    }

    // -- connectivity -------------------------------------------------------

    /// Sender for platform connectivity notifications.
    pub fn connectivity_sender(&self) -> mpsc::Sender<ConnectivityEvent> {
        self.events_tx.clone()
    }

    pub fn status(&self) -> NetworkStatus {
        self.inner.monitor.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.monitor.subscribe()
    }

    /// Snapshot for the sync indicator.
    pub fn status_json(&self) -> Value {
        let state = self.inner.monitor.state();
        let dead_letters = self.inner.queue.dead_letter_count().unwrap_or(0);
        let cache: serde_json::Map<String, Value> = EntityType::ALL
            .into_iter()
            .map(|entity_type| {
                let info = self.inner.store.cache_info(entity_type).ok().flatten();
                let value = info
                    .and_then(|i| serde_json::to_value(i).ok())
                    .unwrap_or(Value::Null);
                (entity_type.as_str().to_string(), value)
            })
            .collect();
        serde_json::json!({
            "isOnline": state.is_online,
            "pendingItems": state.pending_count,
            "deadLetters": dead_letters,
            "syncInProgress": self.inner.monitor.is_flushing(),
            "lastSync": self.inner.last_sync(),
            "cache": cache,
        })
    }

    // -- writes -------------------------------------------------------------

    /// Apply `operation` now if possible, otherwise queue it.
    ///
    /// While older writes are still queued, new ones join the queue so the
    /// backend sees them in order.
    pub async fn submit_write(&self, operation: WriteOperation) -> Result<WriteOutcome> {
        let inner = &self.inner;
        let online = inner.monitor.is_online();
        let backlog = inner.queue.count()?;

        if online && backlog == 0 {
            match inner.backend.submit(&operation).await {
                Ok(value) => {
                    inner.record_last_sync();
                    return Ok(WriteOutcome::Submitted(value));
                }
                Err(e) if e.is_connectivity() => {
                    debug!(error = %e, "backend unreachable; queueing write");
                }
                Err(e) => return Err(e),
            }
        }

        let id = inner.queue.enqueue(&operation)?;
        let pending = inner.refresh_pending()?;
        info!(
            %id,
            operation = operation.kind(),
            table = operation.table(),
            pending,
            "write queued for later sync"
        );

        if online && backlog > 0 {
            spawn_flush(inner, Trigger::Automatic);
        }
        Ok(WriteOutcome::Queued(id))
    }

    /// Manual retry. Never interrupts a running flush; a request made during
    /// one is replayed once it completes.
    pub fn trigger_sync(&self) -> TriggerOutcome {
        match spawn_flush(&self.inner, Trigger::Manual) {
            Some(_) => TriggerOutcome::Started,
            None => TriggerOutcome::AlreadyRunning,
        }
    }

    /// Run a flush on the current task and wait for it.
    /// `None` when one is already running.
    pub async fn sync_now(&self) -> Option<FlushReport> {
        let guard = self.inner.monitor.try_begin_flush(Trigger::Manual)?;
        Some(run_flush(Arc::clone(&self.inner), guard).await)
    }

    // -- cache --------------------------------------------------------------

    /// Cached records, or empty when the cache is missing or unreadable.
    pub fn read_cache(&self, entity_type: EntityType) -> Vec<CachedRecord> {
        match self.inner.store.get_all(entity_type) {
            Ok(records) => records,
            Err(e) if e.is_cache_miss() => {
                debug!(entity_type = %entity_type, error = %e, "offline cache unavailable");
                Vec::new()
            }
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "offline cache read failed");
                Vec::new()
            }
        }
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.inner.store
    }

    // -- dead letters -------------------------------------------------------

    pub fn dead_letters(&self) -> Result<Vec<QueuedWrite>> {
        self.inner.queue.dead_letters()
    }

    pub fn requeue_dead_letter(&self, id: Uuid) -> Result<bool> {
        let requeued = self.inner.queue.requeue_dead_letter(id)?;
        if requeued {
            self.inner.refresh_pending()?;
        }
        Ok(requeued)
    }

    pub fn discard_dead_letter(&self, id: Uuid) -> Result<bool> {
        let discarded = self.inner.queue.discard_dead_letter(id)?;
        if discarded {
            info!(%id, "dead-lettered write discarded");
        }
        Ok(discarded)
    }
}

fn spawn_flush<B: Backend>(
    inner: &Arc<EngineInner<B>>,
    trigger: Trigger,
) -> Option<JoinHandle<FlushReport>> {
    let guard = inner.monitor.try_begin_flush(trigger)?;
    Some(tokio::spawn(run_flush(Arc::clone(inner), guard)))
}

async fn run_flush<B: Backend>(inner: Arc<EngineInner<B>>, mut guard: FlushGuard) -> FlushReport {
    loop {
        let report = inner.flusher.flush().await;
        if report.completed() {
            inner.record_last_sync();
        }
        drop(guard);

        if !inner.monitor.take_rerun() {
            return report;
        }
        debug!("running deferred manual sync");
        match inner.monitor.try_begin_flush(Trigger::Manual) {
            Some(next) => guard = next,
            None => return report,
        }
    }
}

async fn run_event_loop<B: Backend>(
    inner: Arc<EngineInner<B>>,
    mut events: mpsc::Receiver<ConnectivityEvent>,
    cancel: CancellationToken,
) {
    info!("connectivity monitor started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match inner.monitor.apply(event) {
            Transition::WentOnline => {
                info!("Network restored; resuming queued sync");
                spawn_flush(&inner, Trigger::Automatic);
            }
            Transition::WentOffline => {
                info!("Network offline; new writes will be queued");
            }
            Transition::Unchanged => {}
        }
    }
    info!("connectivity monitor stopped");
}
