//! Runtime configuration.
//!
//! Loaded from an optional JSON file; backend URL, API key and tenant fall
//! back to the OS credential store when the file leaves them out.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::cipher::DEFAULT_KEY_SALT;
use crate::credentials::{self, CredentialStore};
use crate::error::{Result, SyncError};

const MIN_WARM_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding `offline.db`.
    pub data_dir: PathBuf,
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    /// Restaurant the terminal belongs to; the warmer idles until known.
    pub tenant_id: Option<String>,
    pub warm_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Rejections before an entry is dead-lettered. `None` keeps rejected
    /// entries at the head of the queue until resolved by hand.
    pub max_attempts: Option<u32>,
    pub key_salt: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            backend_url: None,
            api_key: None,
            tenant_id: None,
            warm_interval_secs: 300,
            probe_interval_secs: 15,
            request_timeout_secs: 30,
            max_attempts: Some(5),
            key_salt: DEFAULT_KEY_SALT.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "loaded sync config");
        config.validate()?;
        Ok(config)
    }

    /// Fill unset backend settings from the credential store.
    pub fn with_credentials(mut self, store: &dyn CredentialStore) -> Self {
        if self.backend_url.is_none() {
            self.backend_url = store.get(credentials::KEY_BACKEND_URL);
        }
        if self.api_key.is_none() {
            self.api_key = store.get(credentials::KEY_API_KEY);
        }
        if self.tenant_id.is_none() {
            self.tenant_id = store.get(credentials::KEY_TENANT_ID);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_salt.trim().is_empty() {
            return Err(SyncError::Config("key_salt must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(SyncError::Config(
                "max_attempts must be at least 1 (use null to disable)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs.max(MIN_WARM_INTERVAL_SECS))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryCredentials;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::new("/tmp/pos");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pos"));
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.warm_interval(), Duration::from_secs(300));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{ "tenant_id": "rest-1", "warm_interval_secs": 5, "max_attempts": null }"#,
        )
        .unwrap();
        assert_eq!(config.tenant_id.as_deref(), Some("rest-1"));
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.warm_interval(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.max_attempts = Some(0);
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.key_salt = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_fill_only_unset_fields() {
        let store = MemoryCredentials::default();
        credentials::provision(
            &store,
            r#"{ "url": "demo.supabase.co", "key": "anon-1", "tid": "rest-from-keyring" }"#,
        )
        .unwrap();

        let mut config = SyncConfig::default();
        config.tenant_id = Some("rest-from-file".into());
        let config = config.with_credentials(&store);
        assert_eq!(config.backend_url.as_deref(), Some("https://demo.supabase.co"));
        assert_eq!(config.api_key.as_deref(), Some("anon-1"));
        assert_eq!(config.tenant_id.as_deref(), Some("rest-from-file"));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("sync-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "backend_url": "demo.supabase.co", "probe_interval_secs": 0 }"#)
            .unwrap();
        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.backend_url.as_deref(), Some("demo.supabase.co"));
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
        let _ = std::fs::remove_file(&path);
    }
}
