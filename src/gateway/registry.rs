//! Service name → backend address mapping.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::GatewayError;

/// Where a backend service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub name: String,
    /// JSON-RPC address calls are bridged to
    pub rpc_address: String,
    /// HTTP bridge of the backend, used for introspection
    #[serde(default)]
    pub http_address: Option<String>,
}

/// Thread-safe registry of backends shared by every gateway request.
///
/// Lookups share a read lock; upserts take the write lock. No reachability
/// check is made when an entry is added.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    inner: Arc<RwLock<HashMap<String, BackendEntry>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from configured entries; later duplicates win.
    pub fn from_entries(entries: impl IntoIterator<Item = BackendEntry>) -> Self {
        let map = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Insert or replace the backend registered under `name`.
    pub async fn add_or_update(
        &self,
        name: &str,
        rpc_address: &str,
        http_address: Option<&str>,
    ) -> BackendEntry {
        let entry = BackendEntry {
            name: name.to_string(),
            rpc_address: rpc_address.to_string(),
            http_address: http_address.map(str::to_string),
        };

        info!(
            service = name,
            rpc = rpc_address,
            http = ?http_address,
            "Backend registered"
        );
        let mut map = self.inner.write().await;
        map.insert(name.to_string(), entry.clone());
        entry
    }

    pub async fn lookup(&self, name: &str) -> Result<BackendEntry, GatewayError> {
        let map = self.inner.read().await;
        map.get(name)
            .cloned()
            .ok_or_else(|| GatewayError::ServiceNotFound(name.to_string()))
    }

    /// Unordered snapshot of every backend.
    pub async fn list(&self) -> Vec<BackendEntry> {
        let map = self.inner.read().await;
        map.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
