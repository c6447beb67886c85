//! Collaborator seams for the remote site and the device network state, plus
//! an HTTP implementation of the site client.
//!
//! The one contract everything else depends on: a failed `write` is either
//! [`SyncError::Rejected`] (the server understood the request and refused it;
//! queuing it for retry would fail identically) or [`SyncError::Unreachable`]
//! (transport failure; the action should be queued and retried). The gateway
//! itself never retries; retry policy belongs to the engine.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Authenticated RPC access to one remote site.
#[async_trait]
pub trait SiteClient: Send + Sync {
    fn site_id(&self) -> &str;

    /// Fetch authoritative state. Safe to retry. Implementations that cache
    /// must bypass their cache when `ignore_cache` is set; this is how sync
    /// code guarantees it compares against fresh server state.
    async fn read(&self, endpoint: &str, params: &Value, ignore_cache: bool) -> SyncResult<Value>;

    /// Perform one authoritative mutation. Never cached, never retried here.
    async fn write(&self, endpoint: &str, params: &Value) -> SyncResult<Value>;
}

/// Device network state, consulted before starting automatic syncs.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
    /// Whether network access is metered/limited (mobile data).
    fn is_metered(&self) -> bool;
}

/// Connectivity stub for hosts without a platform probe, and for tests.
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn is_metered(&self) -> bool {
        false
    }
}

/// Configuration for the HTTP site client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSiteConfig {
    /// Site base URL, e.g. `https://campus.example.edu`.
    pub base_url: String,
    pub site_id: String,
    /// Bearer token for the web-service endpoints.
    pub token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpSiteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            site_id: "default".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

/// [`SiteClient`] over the site's JSON web-service API.
///
/// This client does not cache reads; `ignore_cache` only matters for
/// implementations that do.
pub struct HttpSiteClient {
    config: HttpSiteConfig,
    client: reqwest::Client,
}

impl HttpSiteClient {
    pub fn new(config: HttpSiteConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    async fn call(&self, endpoint: &str, params: &Value) -> SyncResult<Value> {
        let url = format!("{}/webservice/{}", self.config.base_url, endpoint);

        let mut request = self.client.post(&url).json(params);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if status.is_server_error() {
            return Err(SyncError::Unreachable(format!(
                "{endpoint} failed with status {status}"
            )));
        }

        if !status.is_success() {
            return Err(SyncError::Rejected(format!(
                "{endpoint} refused with status {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        // The LMS web service reports business errors inside a 200 response.
        if let Some(exception) = body.get("exception") {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| exception.as_str())
                .unwrap_or("web service exception");

            return Err(SyncError::Rejected(message.to_string()));
        }

        Ok(body)
    }
}

#[async_trait]
impl SiteClient for HttpSiteClient {
    fn site_id(&self) -> &str {
        &self.config.site_id
    }

    async fn read(&self, endpoint: &str, params: &Value, ignore_cache: bool) -> SyncResult<Value> {
        tracing::trace!(endpoint, ignore_cache, "site read");
        self.call(endpoint, params).await
    }

    async fn write(&self, endpoint: &str, params: &Value) -> SyncResult<Value> {
        tracing::trace!(endpoint, "site write");
        self.call(endpoint, params).await
    }
}

fn classify_transport(err: reqwest::Error) -> SyncError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SyncError::Unreachable(err.to_string())
    } else {
        SyncError::Internal(err.to_string())
    }
}
