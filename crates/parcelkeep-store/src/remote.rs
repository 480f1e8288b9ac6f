// ABOUTME: The shared remote store capability and the tier adapter that fronts it.
// ABOUTME: Includes an HTTP client implementation; the store is injected, never discovered at call time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::network::NetworkMonitor;
use crate::tier::{StorageTier, TierCapabilities, TierError, TierName, TierScope};

/// Errors surfaced by a remote store implementation.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store unreachable")]
    Unreachable,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote rejected request with status {0}")]
    Status(u16),

    #[error("remote failure: {0}")]
    Other(String),
}

/// A key-value store shared across devices. Only usable while online.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn is_reachable(&self) -> bool;

    async fn put(&self, key: &str, value: &str) -> Result<(), RemoteError>;

    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;
}

/// Remote store spoken to over plain HTTP:
/// `PUT/GET/DELETE {base}/kv/{key}`, `GET {base}/kv?prefix=` and `GET {base}/health`.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, encode_path_segment(key))
    }
}

/// Percent-encode everything outside the unreserved URL set.
fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn is_reachable(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "remote health check failed");
                false
            }
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), RemoteError> {
        let resp = self
            .client
            .put(self.key_url(key))
            .header("content-type", "application/json")
            .body(value.to_string())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RemoteError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError> {
        let resp = self.client.get(self.key_url(key)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.text().await?)),
            status => Err(RemoteError::Status(status.as_u16())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let resp = self.client.delete(self.key_url(key)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(RemoteError::Status(status.as_u16())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let resp = self
            .client
            .get(format!("{}/kv", self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RemoteError::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<Vec<String>>().await?)
    }
}

/// Tier adapter over an optional remote store. With no store configured, or while
/// offline, every call reports the tier as unavailable.
#[derive(Clone)]
pub struct RemoteTier {
    store: Option<Arc<dyn RemoteStore>>,
    network: NetworkMonitor,
}

impl RemoteTier {
    pub fn new(store: Option<Arc<dyn RemoteStore>>, network: NetworkMonitor) -> Self {
        Self { store, network }
    }

    pub fn store(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.store.as_ref()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// The store, if one is configured and the network is up.
    pub fn reachable_store(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.online_store().ok()
    }

    fn online_store(&self) -> Result<&Arc<dyn RemoteStore>, TierError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| TierError::unavailable(TierName::Remote, "no remote store configured"))?;
        if !self.network.is_online() {
            return Err(TierError::unavailable(TierName::Remote, "offline"));
        }
        Ok(store)
    }
}

fn remote_err(e: RemoteError) -> TierError {
    match e {
        RemoteError::Unreachable => TierError::unavailable(TierName::Remote, "unreachable"),
        other => TierError::backend(TierName::Remote, other),
    }
}

#[async_trait]
impl StorageTier for RemoteTier {
    fn name(&self) -> TierName {
        TierName::Remote
    }

    fn capabilities(&self) -> TierCapabilities {
        TierCapabilities {
            synchronous: false,
            max_entry_size_bytes: None,
            scope: TierScope::SharedRemote,
            queryable: false,
        }
    }

    async fn is_ready(&self) -> bool {
        match self.online_store() {
            Ok(store) => store.is_reachable().await,
            Err(_) => false,
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), TierError> {
        self.online_store()?.put(key, value).await.map_err(remote_err)
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TierError> {
        self.online_store()?.get(key).await.map_err(remote_err)
    }

    async fn clear(&self, key: &str) -> Result<(), TierError> {
        self.online_store()?.delete(key).await.map_err(remote_err)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.online_store()?.list(prefix).await.map_err(remote_err)
    }
}
