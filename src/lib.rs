//! Offline write queue and encrypted reference-data cache for POS terminals.
//!
//! While the backend is unreachable, writes are appended to a durable FIFO
//! queue in SQLite and replayed in order once connectivity returns. Menu,
//! category, table and restaurant data are cached locally, sealed with a key
//! derived from the signed-in user, so the terminal keeps working offline.
//! Queued writes use a per-device key instead, so they survive a shift
//! change.
//!
//! [`SyncEngine`] is the entry point; the individual pieces are public for
//! hosts that want to wire them differently.

pub mod backend;
pub mod cipher;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod flusher;
pub mod local_store;
pub mod logging;
pub mod network;
pub mod queue;
pub mod sync;
pub mod warmer;

pub use backend::{Backend, HttpBackend};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use flusher::{FlushReport, StopReason};
pub use local_store::{CacheInfo, CachedRecord, EncryptedStore, EntityType, LocalStore};
pub use network::{ConnectivityEvent, NetworkStatus};
pub use queue::{QueuedWrite, WriteOperation};
pub use sync::{SyncEngine, TriggerOutcome, WriteOutcome};
