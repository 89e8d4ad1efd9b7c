//! Topology registry: the persisted list of sidecar endpoints.
//!
//! Mesh discovery reads the registry every sweep; the saga manager resolves
//! step targets through it. Writes come from an external configuration
//! process (or from startup seeds), so this crate exposes the store trait
//! but no HTTP write surface.

mod sqlite;

pub use sqlite::SqliteRegistryStore;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors raised by registry stores.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("sidecar not registered: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// One registered sidecar endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarEntry {
    /// Unique sidecar name.
    pub name: String,
    /// Internal base URL.
    pub url: String,
    /// Externally reachable base URL, when it differs from `url`.
    pub host_url: Option<String>,
    /// Number of tools the sidecar declares.
    pub tools_count: i64,
    /// Free-form grouping label.
    pub category: Option<String>,
}

impl SidecarEntry {
    /// Base URL to contact the sidecar on, preferring the externally
    /// reachable address.
    pub fn contact_url(&self) -> &str {
        self.host_url.as_deref().unwrap_or(&self.url)
    }
}

/// Read/write access to the registered sidecar set.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// All registered sidecars.
    async fn load_all(&self) -> Result<Vec<SidecarEntry>>;

    /// Look up one sidecar by name.
    async fn get(&self, name: &str) -> Result<SidecarEntry>;

    /// Insert or update a sidecar entry.
    async fn upsert(&self, entry: &SidecarEntry) -> Result<()>;

    /// Remove a sidecar. Returns whether an entry existed.
    async fn remove(&self, name: &str) -> Result<bool>;
}

/// In-memory registry store.
///
/// Used by tests and by deployments that run without a durable store.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<HashMap<String, SidecarEntry>>,
}

impl InMemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistry {
    async fn load_all(&self) -> Result<Vec<SidecarEntry>> {
        let entries = self.entries.read().await;
        let mut all: Vec<SidecarEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn get(&self, name: &str) -> Result<SidecarEntry> {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    async fn upsert(&self, entry: &SidecarEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(entry.name.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(name).is_some())
    }
}
