//! Backend credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the kernel keyring. Terminals are provisioned
//! with a connection string: base64 (URL-safe or standard) of
//! `{"url": "...", "key": "...", "tid": "..."}`, or that JSON verbatim.
//!
//! The same store holds the per-device key that seals the write queue.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::backend::normalize_backend_url;
use crate::cipher::SessionKey;
use crate::error::{Result, SyncError};

const SERVICE_NAME: &str = "pos-offline-sync";

pub const KEY_BACKEND_URL: &str = "backend_url";
pub const KEY_API_KEY: &str = "backend_api_key";
pub const KEY_TENANT_ID: &str = "tenant_id";
pub const KEY_QUEUE_KEY: &str = "queue_key";

/// Cleared by [`factory_reset`]. The queue key survives so writes still
/// waiting in the queue stay readable.
const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_TENANT_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Credential(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| SyncError::Credential(e.to_string()))
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Credential(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(SyncError::Credential(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Backend settings carried by a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub backend_url: String,
    pub api_key: String,
    pub tenant_id: Option<String>,
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn non_empty_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse a provisioning connection string.
pub fn parse_connection_string(raw: &str) -> Result<ConnectionInfo> {
    let payload = decode_connection_string_payload(raw)
        .ok_or_else(|| SyncError::Config("connection string is not valid".to_string()))?;
    let backend_url = non_empty_str(&payload, &["url", "backendUrl"])
        .map(|u| normalize_backend_url(&u))
        .ok_or_else(|| SyncError::Config("connection string has no url".to_string()))?;
    let api_key = non_empty_str(&payload, &["key", "apiKey"])
        .ok_or_else(|| SyncError::Config("connection string has no key".to_string()))?;
    let tenant_id = non_empty_str(&payload, &["tid", "tenantId", "restaurantId"]);
    Ok(ConnectionInfo {
        backend_url,
        api_key,
        tenant_id,
    })
}

// ---------------------------------------------------------------------------
// Store abstraction
// ---------------------------------------------------------------------------

/// Where secrets live. [`KeyringStore`] is the OS credential store.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Option<String> {
        get_credential(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        set_credential(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        delete_credential(key)
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Backend URL and API key are both present.
pub fn is_configured(store: &dyn CredentialStore) -> bool {
    store.get(KEY_BACKEND_URL).is_some() && store.get(KEY_API_KEY).is_some()
}

/// Store the settings from a connection string.
pub fn provision(store: &dyn CredentialStore, raw: &str) -> Result<ConnectionInfo> {
    let info = parse_connection_string(raw)?;
    store.set(KEY_BACKEND_URL, &info.backend_url)?;
    store.set(KEY_API_KEY, &info.api_key)?;
    match info.tenant_id.as_deref() {
        Some(tenant) => store.set(KEY_TENANT_ID, tenant)?,
        None => store.delete(KEY_TENANT_ID)?,
    }
    info!(backend_url = %info.backend_url, "backend credentials provisioned");
    Ok(info)
}

/// Delete the stored backend settings.
pub fn factory_reset(store: &dyn CredentialStore) -> Result<()> {
    info!("deleting all stored backend credentials");
    for key in ALL_KEYS {
        store.delete(key)?;
    }
    Ok(())
}

/// Key sealing the write queue on this device, created on first use.
///
/// Independent of who is signed in, so a shift change never strands queued
/// writes. A stored value that does not decode is an error rather than being
/// replaced, since replacing it would orphan every queued entry.
pub fn device_queue_key(store: &dyn CredentialStore) -> Result<SessionKey> {
    if let Some(mut encoded) = store.get(KEY_QUEUE_KEY) {
        let decoded = BASE64_STANDARD.decode(encoded.trim());
        encoded.zeroize();
        let mut raw = decoded
            .map_err(|_| SyncError::Crypto("stored queue key is not valid base64".to_string()))?;
        let bytes: Option<[u8; 32]> = raw.as_slice().try_into().ok();
        raw.zeroize();
        return bytes
            .map(SessionKey::from_bytes)
            .ok_or_else(|| SyncError::Crypto("stored queue key has the wrong length".to_string()));
    }

    let key = SessionKey::generate();
    let mut encoded = BASE64_STANDARD.encode(key.as_bytes());
    let stored = store.set(KEY_QUEUE_KEY, &encoded);
    encoded.zeroize();
    stored?;
    info!("generated device queue key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryCredentials;

    #[test]
    fn test_parse_plain_json_connection_string() {
        let info = parse_connection_string(
            r#"{ "url": "demo.supabase.co/rest/v1", "key": "anon-123", "tid": "rest-9" }"#,
        )
        .unwrap();
        assert_eq!(info.backend_url, "https://demo.supabase.co");
        assert_eq!(info.api_key, "anon-123");
        assert_eq!(info.tenant_id.as_deref(), Some("rest-9"));
    }

    #[test]
    fn test_parse_base64_connection_string() {
        let json = r#"{"url":"https://demo.supabase.co","key":"anon-123"}"#;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        let info = parse_connection_string(&encoded).unwrap();
        assert_eq!(info.backend_url, "https://demo.supabase.co");
        assert_eq!(info.tenant_id, None);
    }

    #[test]
    fn test_parse_rejects_incomplete_strings() {
        assert!(parse_connection_string("short").is_err());
        assert!(parse_connection_string(r#"{"url":"x.example.com"}"#).is_err());
        assert!(parse_connection_string(r#"{"key":"k"}"#).is_err());
    }

    #[test]
    fn test_provision_and_factory_reset() {
        let store = MemoryCredentials::default();
        assert!(!is_configured(&store));

        let info = provision(
            &store,
            r#"{ "url": "demo.supabase.co", "key": "anon-123", "tid": "rest-9" }"#,
        )
        .unwrap();
        assert_eq!(info.api_key, "anon-123");
        assert!(is_configured(&store));
        assert_eq!(store.get(KEY_TENANT_ID).as_deref(), Some("rest-9"));
        assert_eq!(
            store.get(KEY_BACKEND_URL).as_deref(),
            Some("https://demo.supabase.co")
        );

        provision(&store, r#"{ "url": "demo.supabase.co", "key": "anon-456" }"#).unwrap();
        assert_eq!(store.get(KEY_TENANT_ID), None);

        store.set(KEY_QUEUE_KEY, "kept").unwrap();
        factory_reset(&store).unwrap();
        assert!(!is_configured(&store));
        assert_eq!(store.get(KEY_QUEUE_KEY).as_deref(), Some("kept"));
    }

    #[test]
    fn test_provision_rejects_bad_string_without_writing() {
        let store = MemoryCredentials::default();
        assert!(provision(&store, "not a connection string").is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_device_queue_key_is_created_once() {
        let store = MemoryCredentials::default();
        let first = device_queue_key(&store).unwrap();
        let second = device_queue_key(&store).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_malformed_queue_key_is_not_replaced() {
        let store = MemoryCredentials::default();
        store.set(KEY_QUEUE_KEY, "c2hvcnQ=").unwrap();
        assert!(matches!(
            device_queue_key(&store),
            Err(SyncError::Crypto(_))
        ));
        assert_eq!(store.get(KEY_QUEUE_KEY).as_deref(), Some("c2hvcnQ="));
    }
}
