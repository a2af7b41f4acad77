//! Backend REST client.
//!
//! The hosted backend exposes a PostgREST-style API under `/rest/v1/<table>`.
//! Writes from the queue are replayed through [`Backend::submit`]; the cache
//! warmer reads reference data through [`Backend::fetch_reference`].

use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::local_store::EntityType;
use crate::queue::WriteOperation;

const REST_PREFIX: &str = "/rest/v1";

/// Remote side of the sync: row writes and tenant-scoped reads.
pub trait Backend: Send + Sync + 'static {
    /// Apply one queued write. Returns the backend's representation of the row.
    fn submit(&self, operation: &WriteOperation) -> impl Future<Output = Result<Value>> + Send;

    /// All rows of `entity_type` belonging to `tenant_id`.
    fn fetch_reference(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Lightweight reachability check.
    fn ping(&self) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with(REST_PREFIX) {
        url.truncate(url.len() - REST_PREFIX.len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn validate_identifier(value: &str) -> Result<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Config("empty table name".to_string()));
    }
    if trimmed.len() > 63
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SyncError::Config(format!(
            "table name contains unsupported characters: {trimmed}"
        )));
    }
    Ok(trimmed)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Not authorized for this tenant".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Conflicting row already exists".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Timeouts, throttling and server errors are retried later like a lost
/// connection; every other non-success status is a rejection.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn classify_failure(status: StatusCode, body_text: &str) -> SyncError {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            let trimmed = body_text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| status_error(status));

    if is_transient_status(status) {
        SyncError::NetworkUnavailable(format!("{} ({message})", status_error(status)))
    } else {
        SyncError::BackendRejected {
            status: status.as_u16(),
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_backend_url(base_url);
        Url::parse(&base_url)
            .map_err(|e| SyncError::Config(format!("Invalid backend URL {base_url}: {e}")))?;
        if api_key.trim().is_empty() {
            return Err(SyncError::Config("missing backend API key".to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.trim().to_string(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let url = config
            .backend_url
            .as_deref()
            .ok_or_else(|| SyncError::Config("backend URL not configured".to_string()))?;
        let key = config
            .api_key
            .as_deref()
            .ok_or_else(|| SyncError::Config("backend API key not configured".to_string()))?;
        Self::new(url, key, config.request_timeout())
    }

    fn table_url(&self, table: &str, filters: &[(&str, String)]) -> Result<Url> {
        let table = validate_identifier(table)?;
        let mut url = Url::parse(&format!("{}{REST_PREFIX}/{table}", self.base_url))
            .map_err(|e| SyncError::Config(format!("Invalid backend URL: {e}")))?;
        if !filters.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in filters {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::NetworkUnavailable(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_failure(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body_text)?)
    }

    async fn insert(&self, table: &str, row: &Value) -> Result<Value> {
        let url = self.table_url(table, &[])?;
        trace!(%url, "backend insert");
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(row);
        self.send(req).await
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<Value> {
        let url = self.table_url(table, &[("id", format!("eq.{id}"))])?;
        trace!(%url, "backend update");
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=representation")
            .json(patch);
        self.send(req).await
    }
}

impl Backend for HttpBackend {
    async fn submit(&self, operation: &WriteOperation) -> Result<Value> {
        debug!(
            operation = operation.kind(),
            table = operation.table(),
            "submitting write to backend"
        );
        match operation {
            WriteOperation::CreateOrder { order } => self.insert("orders", order).await,
            WriteOperation::UpdateOrderStatus { order_id, status } => {
                let patch = serde_json::json!({
                    "status": status,
                    "updated_at": Utc::now().to_rfc3339(),
                });
                self.update("orders", order_id, &patch).await
            }
            WriteOperation::InsertRow { table, row } => self.insert(table, row).await,
            WriteOperation::UpdateRow { table, id, patch } => {
                self.update(table, id, patch).await
            }
        }
    }

    async fn fetch_reference(&self, tenant_id: &str, entity_type: EntityType) -> Result<Vec<Value>> {
        let url = self.table_url(
            entity_type.backend_table(),
            &[
                ("select", "*".to_string()),
                (entity_type.tenant_column(), format!("eq.{tenant_id}")),
            ],
        )?;
        let body = self.send(self.request(Method::GET, url)).await?;
        match body {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    async fn ping(&self) -> bool {
        let url = format!("{}{REST_PREFIX}/", self.base_url);
        match self
            .client
            .head(&url)
            .header("apikey", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(_) => false,
        }
    }
}
