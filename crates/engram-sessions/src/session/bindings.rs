//! Binding keys: the restart-durable pointer from a logical client identity
//! to its current session

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::storage::database::{Database, SharedDatabase};
use crate::storage::error::StorageResult;
use crate::storage::repository::{BindingRepository, SqliteBindingRepository};

/// Well-known binding key for single-tenant deployments.
pub const DEFAULT_BINDING_KEY: &str = "default";

/// In-memory mirror of the durable binding table.
///
/// Populated lazily from the store and invalidated on write. Never the
/// source of truth: dropping every entry only costs the next resolve a
/// store read.
#[derive(Debug, Default)]
pub struct BindingCache {
    entries: RwLock<HashMap<String, String>>,
}

impl BindingCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the cached session id for a key.
    pub async fn get(&self, binding_key: &str) -> Option<String> {
        self.entries.read().await.get(binding_key).cloned()
    }

    /// Caches a key's session id.
    pub async fn insert(&self, binding_key: &str, session_id: &str) {
        self.entries
            .write()
            .await
            .insert(binding_key.to_string(), session_id.to_string());
    }

    /// Drops a key's cached entry.
    pub async fn remove(&self, binding_key: &str) -> Option<String> {
        self.entries.write().await.remove(binding_key)
    }

    /// Drops every cached entry pointing at the given session.
    pub async fn remove_session(&self, session_id: &str) {
        self.entries
            .write()
            .await
            .retain(|_, bound| bound != session_id);
    }

    /// Empties the cache.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Durable binding table with a read-through cache.
///
/// Bindings are written to the store first and only then mirrored in the
/// cache, so a restart loses nothing but cached lookups.
pub struct BindingTable {
    db: SharedDatabase,
    cache: BindingCache,
}

impl BindingTable {
    /// Creates a binding table over the shared database.
    #[must_use]
    pub fn new(db: SharedDatabase) -> Self {
        Self::with_cache(db, BindingCache::new())
    }

    /// Creates a binding table around an externally constructed cache.
    #[must_use]
    pub fn with_cache(db: SharedDatabase, cache: BindingCache) -> Self {
        Self { db, cache }
    }

    /// Resolves the session id bound to a key.
    ///
    /// Checks the cache first and falls back to the durable table,
    /// repopulating the cache on a hit.
    pub async fn resolve(&self, binding_key: &str) -> StorageResult<Option<String>> {
        if let Some(session_id) = self.cache.get(binding_key).await {
            return Ok(Some(session_id));
        }
        let stored = {
            let db = Database::lock(&self.db)?;
            let repo = SqliteBindingRepository::new(db.conn());
            repo.get(binding_key)?
        };
        if let Some(session_id) = &stored {
            self.cache.insert(binding_key, session_id).await;
            debug!(binding_key = %binding_key, session_id = %session_id, "Repopulated binding from store");
        }
        Ok(stored)
    }

    /// Binds a key to a session, replacing any previous binding.
    pub async fn bind(&self, binding_key: &str, session_id: &str) -> StorageResult<()> {
        {
            let db = Database::lock(&self.db)?;
            let mut repo = SqliteBindingRepository::new(db.conn());
            repo.upsert(binding_key, session_id, Utc::now())?;
        }
        self.cache.insert(binding_key, session_id).await;
        Ok(())
    }

    /// Mirrors a binding that was already written durably elsewhere.
    pub(crate) async fn note(&self, binding_key: &str, session_id: &str) {
        self.cache.insert(binding_key, session_id).await;
    }

    /// Drops a key's cached entry. The durable row is left alone.
    pub async fn forget(&self, binding_key: &str) {
        self.cache.remove(binding_key).await;
    }

    /// Drops every cached entry pointing at the given session.
    pub async fn forget_session(&self, session_id: &str) {
        self.cache.remove_session(session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_insert_and_get() {
        let cache = BindingCache::new();
        assert_eq!(cache.get("default").await, None);

        cache.insert("default", "s1").await;
        assert_eq!(cache.get("default").await, Some("s1".to_string()));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_insert_replaces() {
        let cache = BindingCache::new();
        cache.insert("default", "s1").await;
        cache.insert("default", "s2").await;
        assert_eq!(cache.get("default").await, Some("s2".to_string()));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_remove() {
        let cache = BindingCache::new();
        cache.insert("default", "s1").await;
        assert_eq!(cache.remove("default").await, Some("s1".to_string()));
        assert_eq!(cache.remove("default").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_remove_session_drops_all_keys() {
        let cache = BindingCache::new();
        cache.insert("terminal-1", "s1").await;
        cache.insert("terminal-2", "s1").await;
        cache.insert("terminal-3", "s2").await;

        cache.remove_session("s1").await;
        assert_eq!(cache.get("terminal-1").await, None);
        assert_eq!(cache.get("terminal-2").await, None);
        assert_eq!(cache.get("terminal-3").await, Some("s2".to_string()));
    }

    #[tokio::test]
    async fn test_cache_clear() {
        let cache = BindingCache::new();
        cache.insert("a", "s1").await;
        cache.insert("b", "s2").await;
        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_table_resolve_falls_back_to_store() {
        let db = Database::open_in_memory().unwrap().into_shared();
        {
            let guard = db.lock().unwrap();
            guard
                .conn()
                .execute(
                    "INSERT INTO sessions (id, display_id, status, started_at, last_activity_at, agent_type)
                     VALUES ('s1', 'SES-2025-0001', 'active', '2025-01-01T00:00:00+00:00', '2025-01-01T00:00:00+00:00', 'architect')",
                    [],
                )
                .unwrap();
        }

        let table = BindingTable::new(db);
        table.bind("default", "s1").await.unwrap();

        // Drop the cached entry; the durable row must still answer
        table.forget("default").await;
        assert_eq!(
            table.resolve("default").await.unwrap(),
            Some("s1".to_string())
        );
        // And the cache is repopulated
        assert_eq!(table.cache.get("default").await, Some("s1".to_string()));
    }

    #[tokio::test]
    async fn test_table_resolve_unknown_key() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let table = BindingTable::new(db);
        assert_eq!(table.resolve("missing").await.unwrap(), None);
    }
}
