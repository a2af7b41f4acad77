//! Encrypted local cache for reference data.
//!
//! Each entity type (menu items, categories, tables, restaurant profile) is
//! stored as a single sealed blob in `cache_entries`. The session key lives
//! only in memory inside [`EncryptedStore`]; it is derived on sign-in and
//! wiped on sign-out.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::cipher::{Cipher, SessionKey};
use crate::db::DbState;
use crate::error::{Result, SyncError};

// ---------------------------------------------------------------------------
// Entity types and records
// ---------------------------------------------------------------------------

/// Kinds of reference data kept available offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    MenuItems,
    Categories,
    Tables,
    Profile,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::MenuItems,
        EntityType::Categories,
        EntityType::Tables,
        EntityType::Profile,
    ];

    /// Storage key in `cache_entries`.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::MenuItems => "menu_items",
            EntityType::Categories => "categories",
            EntityType::Tables => "tables",
            EntityType::Profile => "profile",
        }
    }

    /// Backend table holding this entity type.
    pub fn backend_table(self) -> &'static str {
        match self {
            EntityType::MenuItems => "menu_items",
            EntityType::Categories => "menu_categories",
            EntityType::Tables => "restaurant_tables",
            EntityType::Profile => "restaurants",
        }
    }

    /// Column that scopes rows to a tenant. The profile row *is* the tenant.
    pub fn tenant_column(self) -> &'static str {
        match self {
            EntityType::Profile => "id",
            _ => "restaurant_id",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| SyncError::Config(format!("unknown entity type: {s}")))
    }
}

/// A cached reference-data row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub id: String,
    pub data: Value,
}

impl CachedRecord {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Build a record from a backend row, using its `id` column (string or
    /// number). Rows without an id are not cacheable.
    pub fn from_row(row: Value) -> Option<Self> {
        let id = match row.get("id")? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self { id, data: row })
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persistent key-value store for cached reference data.
pub trait LocalStore: Send + Sync {
    /// Replace everything stored for `entity_type` with `records`.
    fn put(&self, entity_type: EntityType, records: &[CachedRecord]) -> Result<()>;
    /// All records for `entity_type`; empty when nothing was stored.
    fn get_all(&self, entity_type: EntityType) -> Result<Vec<CachedRecord>>;
    /// Wipe every entity type and forget the session key.
    fn clear(&self) -> Result<()>;
}

/// Metadata kept next to each sealed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub updated_at: Option<DateTime<Utc>>,
    pub record_count: usize,
}

/// [`LocalStore`] backed by SQLite, sealing every blob with the session key.
pub struct EncryptedStore {
    db: Arc<DbState>,
    cipher: Box<dyn Cipher>,
    salt: Vec<u8>,
    key: RwLock<Option<SessionKey>>,
}

impl EncryptedStore {
    pub fn new(db: Arc<DbState>, cipher: impl Cipher + 'static, salt: impl Into<Vec<u8>>) -> Self {
        Self {
            db,
            cipher: Box::new(cipher),
            salt: salt.into(),
            key: RwLock::new(None),
        }
    }

    /// Derive and install the key for `user_id`. Replaces any previous key.
    pub fn sign_in(&self, user_id: &str) -> Result<()> {
        let key = self.cipher.derive_key(user_id, &self.salt)?;
        *self.key.write()? = Some(key);
        info!(user = %mask_user_id(user_id), "offline cache key derived");
        Ok(())
    }

    /// Sign-out wipes the cache along with the key.
    pub fn sign_out(&self) -> Result<()> {
        self.clear()
    }

    pub fn has_session(&self) -> bool {
        self.key.read().map(|k| k.is_some()).unwrap_or(false)
    }

    /// When `entity_type` was last written and how many records it holds.
    /// Readable without a session.
    pub fn cache_info(&self, entity_type: EntityType) -> Result<Option<CacheInfo>> {
        let row: Option<(String, i64)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT updated_at, record_count FROM cache_entries WHERE entity_type = ?1",
                    params![entity_type.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        Ok(row.map(|(updated_at, record_count)| CacheInfo {
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            record_count: record_count.max(0) as usize,
        }))
    }

    /// Encrypt `plaintext` under the current session key.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let guard = self.key.read()?;
        let key = guard.as_ref().ok_or(SyncError::EncryptionUnavailable)?;
        self.cipher.encrypt(key, plaintext)
    }

    /// Decrypt a blob produced by [`seal`](Self::seal).
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let guard = self.key.read()?;
        let key = guard.as_ref().ok_or(SyncError::EncryptionUnavailable)?;
        self.cipher.decrypt(key, sealed)
    }
}

impl LocalStore for EncryptedStore {
    fn put(&self, entity_type: EntityType, records: &[CachedRecord]) -> Result<()> {
        let json = serde_json::to_vec(records)?;
        let blob = self.seal(&json)?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_entries (entity_type, blob, record_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_type) DO UPDATE SET
                    blob = excluded.blob,
                    record_count = excluded.record_count,
                    updated_at = excluded.updated_at",
                params![entity_type.as_str(), blob, records.len() as i64, now],
            )?;
            Ok(())
        })?;

        debug!(
            entity_type = %entity_type,
            records = records.len(),
            bytes = blob.len(),
            "offline cache written"
        );
        Ok(())
    }

    fn get_all(&self, entity_type: EntityType) -> Result<Vec<CachedRecord>> {
        if !self.has_session() {
            return Err(SyncError::EncryptionUnavailable);
        }

        let blob: Option<Vec<u8>> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT blob FROM cache_entries WHERE entity_type = ?1",
                    params![entity_type.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        let Some(blob) = blob else {
            return Ok(Vec::new());
        };

        let json = match self.open(&blob) {
            Ok(json) => json,
            Err(SyncError::DecryptionFailed) => {
                warn!(
                    entity_type = %entity_type,
                    "offline cache sealed under another key; treating as miss"
                );
                return Err(SyncError::DecryptionFailed);
            }
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_slice(&json)?)
    }

    fn clear(&self) -> Result<()> {
        let removed = self
            .db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM cache_entries", [])?))?;
        *self.key.write()? = None;
        info!(removed, "offline cache cleared and session key dropped");
        Ok(())
    }
}

fn mask_user_id(user_id: &str) -> String {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    let suffix: String = trimmed
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<char>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{suffix}")
}
