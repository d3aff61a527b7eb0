//! In-memory record store.
//!
//! Data is lost when the process exits. Used by the tests and by
//! `storage = "memory"`.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::error::Result;
use crate::domain::port::RecordStore;

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<(String, String), Vec<u8>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .get(&(namespace.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
        self.records
            .insert((namespace.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .records
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut records: Vec<(String, Vec<u8>)> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}
