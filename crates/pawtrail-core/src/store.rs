//! Identity persistence boundary.
//!
//! The engine owns no storage technology; it talks to an injected
//! [`IdentityStore`]. The durable SQLite implementation lives in the
//! `pawtrail-store` crate; [`MemoryStore`] backs tests and ephemeral runs.

use crate::types::IdentityRecord;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate identity: {0} is already persisted")]
    Duplicate(String),
    #[error("store backend: {0}")]
    Backend(String),
    #[error("corrupt record for {0}: {1}")]
    Corrupt(String, String),
}

/// Durable mapping from identity key to canonical vector + metadata.
///
/// `persist` is a strict insert: an existing key is a hard error, never
/// a silent overwrite.
pub trait IdentityStore: Send + Sync {
    fn persist(&self, record: &IdentityRecord) -> Result<(), StoreError>;
    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError>;
    fn get(&self, identity_key: &str) -> Result<Option<IdentityRecord>, StoreError>;
    /// Returns whether the identity was present.
    fn remove(&self, identity_key: &str) -> Result<bool, StoreError>;
}

/// In-memory store with no durability.
pub struct MemoryStore {
    records: Mutex<HashMap<String, IdentityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore for MemoryStore {
    fn persist(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");
        if records.contains_key(&record.identity_key) {
            return Err(StoreError::Duplicate(record.identity_key.clone()));
        }
        records.insert(record.identity_key.clone(), record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let records = self.records.lock().expect("store lock poisoned");
        let mut all: Vec<IdentityRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        Ok(all)
    }

    fn get(&self, identity_key: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let records = self.records.lock().expect("store lock poisoned");
        Ok(records.get(identity_key).cloned())
    }

    fn remove(&self, identity_key: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");
        Ok(records.remove(identity_key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;
    use chrono::Utc;

    fn record(key: &str) -> IdentityRecord {
        IdentityRecord {
            identity_key: key.to_string(),
            display_name: "Rex".into(),
            embedding: Embedding {
                values: vec![1.0, 0.0],
                model_version: None,
            },
            version: 1,
            created_at: Utc::now(),
            session_id: "sess".into(),
        }
    }

    #[test]
    fn test_persist_and_get() {
        let store = MemoryStore::new();
        store.persist(&record("123456rex")).unwrap();
        let got = store.get("123456rex").unwrap().unwrap();
        assert_eq!(got.display_name, "Rex");
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_persist_rejected() {
        let store = MemoryStore::new();
        store.persist(&record("123456rex")).unwrap();
        let err = store.persist(&record("123456rex")).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_load_all_sorted_by_key() {
        let store = MemoryStore::new();
        store.persist(&record("zzz999zed")).unwrap();
        store.persist(&record("aaa111abe")).unwrap();
        let keys: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.identity_key)
            .collect();
        assert_eq!(keys, vec!["aaa111abe", "zzz999zed"]);
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        store.persist(&record("123456rex")).unwrap();
        assert!(store.remove("123456rex").unwrap());
        assert!(!store.remove("123456rex").unwrap());
    }
}
