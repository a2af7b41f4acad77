//! Keeps the offline cache populated while the terminal is online.
//!
//! Runs on a fixed interval, immediately when the tenant changes, and again
//! whenever connectivity comes back. Each entity type is overwritten whole
//! with the latest fetch.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::db::{self, DbState};
use crate::error::{Result, SyncError};
use crate::local_store::{CachedRecord, EntityType, LocalStore};
use crate::network::NetworkMonitor;

const SETTINGS_CATEGORY: &str = "cache";

/// Outcome of one warming pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WarmReport {
    pub written: Vec<(EntityType, usize)>,
    pub failed: Vec<(EntityType, String)>,
}

pub struct CacheWarmer<B: Backend, S: LocalStore + 'static> {
    backend: Arc<B>,
    store: Arc<S>,
    db: Arc<DbState>,
    monitor: Arc<NetworkMonitor>,
    tenant: watch::Receiver<Option<String>>,
    interval: Duration,
}

impl<B: Backend, S: LocalStore + 'static> CacheWarmer<B, S> {
    pub fn new(
        backend: Arc<B>,
        store: Arc<S>,
        db: Arc<DbState>,
        monitor: Arc<NetworkMonitor>,
        tenant: watch::Receiver<Option<String>>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            db,
            monitor,
            tenant,
            interval,
        }
    }

    /// Fetch and store every entity type for `tenant_id`.
    ///
    /// A failed fetch is recorded in the report and the remaining types are
    /// still warmed. Missing session aborts the pass since nothing can be
    /// sealed.
    pub async fn warm_once(&self, tenant_id: &str) -> Result<WarmReport> {
        let mut report = WarmReport::default();

        for entity_type in EntityType::ALL {
            let rows = match self.backend.fetch_reference(tenant_id, entity_type).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(entity_type = %entity_type, error = %e, "cache warm fetch failed");
                    report.failed.push((entity_type, e.to_string()));
                    continue;
                }
            };
            let records: Vec<CachedRecord> =
                rows.into_iter().filter_map(CachedRecord::from_row).collect();
            let count = records.len();

            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || store.put(entity_type, &records))
                .await
                .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;

            self.record_warm(entity_type);
            report.written.push((entity_type, count));
        }

        info!(
            written = report.written.len(),
            failed = report.failed.len(),
            "offline cache warmed"
        );
        Ok(report)
    }

    fn record_warm(&self, entity_type: EntityType) {
        let key = format!("last_warm:{}", entity_type.as_str());
        let now = Utc::now().to_rfc3339();
        if let Err(e) = self
            .db
            .with_conn(|conn| db::set_setting(conn, SETTINGS_CATEGORY, &key, &now))
        {
            warn!(entity_type = %entity_type, error = %e, "failed to record warm time");
        }
    }

    async fn warm_if_ready(&self) {
        if !self.monitor.is_online() {
            debug!("cache warm skipped: offline");
            return;
        }
        let Some(tenant_id) = self.tenant.borrow().clone() else {
            debug!("cache warm skipped: tenant unknown");
            return;
        };
        match self.warm_once(&tenant_id).await {
            Ok(_) => {}
            Err(e) if e.is_cache_miss() => debug!("cache warm skipped: no active session"),
            Err(e) => warn!(error = %e, "cache warm failed"),
        }
    }

    /// Run until `cancel` fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "cache warmer started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut status = self.monitor.subscribe();
            let mut was_online = status.borrow_and_update().is_online;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    changed = self.tenant.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("tenant changed; re-warming offline cache");
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = status.borrow_and_update().is_online;
                        let reconnected = online && !was_online;
                        was_online = online;
                        if !reconnected {
                            continue;
                        }
                    }
                }
                self.warm_if_ready().await;
            }
            info!("cache warmer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::EncryptedStore;
    use crate::network::ConnectivityEvent;
    use crate::test_support::{signed_in_store, MockBackend};
    use serde_json::json;

    fn warmer(
        store: Arc<EncryptedStore>,
        db: Arc<DbState>,
        backend: Arc<MockBackend>,
        monitor: Arc<NetworkMonitor>,
        tenant: Option<&str>,
    ) -> (CacheWarmer<MockBackend, EncryptedStore>, watch::Sender<Option<String>>) {
        let (tx, rx) = watch::channel(tenant.map(str::to_string));
        let warmer = CacheWarmer::new(backend, store, db, monitor, rx, Duration::from_secs(3600));
        (warmer, tx)
    }

    fn seeded_backend() -> Arc<MockBackend> {
        let backend = MockBackend::default();
        backend.set_reference(
            EntityType::Tables,
            vec![json!({ "id": "t1", "number": 1 }), json!({ "id": "t2", "number": 2 })],
        );
        backend.set_reference(
            EntityType::MenuItems,
            vec![json!({ "id": 10, "name": "Espresso" }), json!({ "name": "no id" })],
        );
        Arc::new(backend)
    }

    #[tokio::test]
    async fn test_warm_once_writes_every_type() {
        let (db, store) = signed_in_store("cashier-1");
        let monitor = Arc::new(NetworkMonitor::new(true, 0));
        let (warmer, _tx) = warmer(store.clone(), db.clone(), seeded_backend(), monitor, Some("r-1"));

        let report = warmer.warm_once("r-1").await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.written.len(), EntityType::ALL.len());
        assert!(report.written.contains(&(EntityType::MenuItems, 1)));

        let tables = store.get_all(EntityType::Tables).unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].id, "t1");
        assert!(store.get_all(EntityType::Profile).unwrap().is_empty());

        let stamp = db
            .with_conn(|conn| Ok(db::get_setting(conn, "cache", "last_warm:tables")))
            .unwrap();
        assert!(stamp.is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_abort_other_types() {
        let (db, store) = signed_in_store("cashier-1");
        let backend = seeded_backend();
        backend.fail_reference(EntityType::Categories);
        let monitor = Arc::new(NetworkMonitor::new(true, 0));
        let (warmer, _tx) = warmer(store.clone(), db, backend, monitor, Some("r-1"));

        let report = warmer.warm_once("r-1").await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, EntityType::Categories);
        assert_eq!(report.written.len(), EntityType::ALL.len() - 1);
        assert_eq!(store.get_all(EntityType::Tables).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_skips_when_offline_or_tenant_unknown() {
        let (db, store) = signed_in_store("cashier-1");
        let backend = seeded_backend();
        let monitor = Arc::new(NetworkMonitor::new(false, 0));
        let (warmer, tx) = warmer(store.clone(), db, backend.clone(), monitor.clone(), Some("r-1"));

        warmer.warm_if_ready().await;
        assert_eq!(backend.reference_fetches(), 0);

        monitor.apply(ConnectivityEvent::Online);
        tx.send_replace(None);
        warmer.warm_if_ready().await;
        assert_eq!(backend.reference_fetches(), 0);

        tx.send_replace(Some("r-1".into()));
        warmer.warm_if_ready().await;
        assert_eq!(backend.reference_fetches(), EntityType::ALL.len());
    }

    #[tokio::test]
    async fn test_no_session_is_reported_as_cache_miss() {
        let (db, store) = signed_in_store("cashier-1");
        store.sign_out().unwrap();
        let monitor = Arc::new(NetworkMonitor::new(true, 0));
        let (warmer, _tx) = warmer(store, db, seeded_backend(), monitor, Some("r-1"));

        let err = warmer.warm_once("r-1").await.unwrap_err();
        assert!(err.is_cache_miss());
    }

    #[tokio::test]
    async fn test_rewarm_after_user_switch_replaces_unreadable_cache() {
        let (db, store) = signed_in_store("user-a");
        let backend = seeded_backend();
        let monitor = Arc::new(NetworkMonitor::new(true, 0));
        let (warmer, _tx) = warmer(store.clone(), db, backend, monitor, Some("r-1"));
        warmer.warm_once("r-1").await.unwrap();

        store.sign_in("user-b").unwrap();
        assert!(matches!(
            store.get_all(EntityType::Tables),
            Err(SyncError::DecryptionFailed)
        ));

        warmer.warm_once("r-1").await.unwrap();
        assert_eq!(store.get_all(EntityType::Tables).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_loop_warms_on_tenant_change() {
        let (db, store) = signed_in_store("cashier-1");
        let backend = seeded_backend();
        let monitor = Arc::new(NetworkMonitor::new(true, 0));
        let (warmer, tx) = warmer(store.clone(), db, backend.clone(), monitor, None);
        let cancel = CancellationToken::new();
        let handle = warmer.spawn(cancel.clone());

        tx.send_replace(Some("r-1".into()));
        for _ in 0..100 {
            if backend.reference_fetches() >= EntityType::ALL.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.get_all(EntityType::Tables).unwrap().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
