//! # Store
//!
//! Durable storage for processed log entries, keyed by `(tenant_id, record_id)`.
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::record::PersistedLogEntry;

/// Enumeration of errors for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid table name")]
    InvalidTableName(String),
    #[error("stored entry could not be decoded: {0}")]
    CorruptEntry(String),
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The result of a conditional insert. Finding the key taken is an expected outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Atomically write `entry` unless an entry with the same key already exists.
    /// Implementations must decide this inside a single atomic operation: concurrent callers racing
    /// on one key get exactly one `Inserted`.
    async fn insert_if_absent(&self, entry: &PersistedLogEntry) -> StoreResult<InsertOutcome>;

    async fn get(&self, tenant_id: &str, record_id: &str)
        -> StoreResult<Option<PersistedLogEntry>>;
}

/// A `LogStore` kept in process memory, for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), PersistedLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries belonging to `tenant_id`.
    pub fn entries_for(&self, tenant_id: &str) -> Vec<PersistedLogEntry> {
        self.lock()
            .values()
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), PersistedLogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn insert_if_absent(&self, entry: &PersistedLogEntry) -> StoreResult<InsertOutcome> {
        let key = (entry.tenant_id.clone(), entry.record_id.clone());
        let mut entries = self.lock();

        match entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn get(
        &self,
        tenant_id: &str,
        record_id: &str,
    ) -> StoreResult<Option<PersistedLogEntry>> {
        let key = (tenant_id.to_owned(), record_id.to_owned());

        Ok(self.lock().get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::record::Origin;

    fn entry(tenant_id: &str, record_id: &str, sanitized_text: &str) -> PersistedLogEntry {
        PersistedLogEntry {
            tenant_id: tenant_id.to_owned(),
            record_id: record_id.to_owned(),
            origin: Origin::JsonSubmission,
            raw_text: "raw".to_owned(),
            sanitized_text: sanitized_text.to_owned(),
            received_at: Utc::now(),
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_second_insert_reports_already_exists() {
        let store = MemoryStore::new();

        assert_eq!(
            store.insert_if_absent(&entry("acme", "1", "first")).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&entry("acme", "1", "second")).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        let stored = store.get("acme", "1").await.unwrap().unwrap();
        assert_eq!(stored.sanitized_text, "first");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_same_record_id_under_two_tenants() {
        let store = MemoryStore::new();

        store.insert_if_absent(&entry("acme", "1", "a")).await.unwrap();
        store.insert_if_absent(&entry("beta", "1", "b")).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.entries_for("acme").len(), 1);
        assert_eq!(
            store.get("beta", "1").await.unwrap().unwrap().sanitized_text,
            "b"
        );
        assert!(store.get("gamma", "1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_have_a_single_winner() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_if_absent(&entry("acme", "race", &i.to_string()))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);
    }
}
