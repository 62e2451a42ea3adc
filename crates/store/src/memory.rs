// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::{Repository, StoreError, CONTROL_TABLE};

/// In-memory [`Repository`]. Tables are created lazily on first touch.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn upsert(&self, table: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.tables
            .write()
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Value, StoreError> {
        self.tables
            .read()
            .get(table)
            .and_then(|entries| entries.get(key))
            .cloned()
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn get_multiple(
        &self,
        table: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, StoreError> {
        let tables = self.tables.read();
        let entries = tables.get(table);
        let mut found = BTreeMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match entries.and_then(|entries| entries.get(key)) {
                Some(value) => {
                    found.insert(key.clone(), value.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(StoreError::NotFound { keys: missing })
        }
    }

    async fn get_all(&self, table: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        Ok(self.tables.read().get(table).cloned().unwrap_or_default())
    }

    async fn remove(&self, table: &str, key: &str) -> Result<(), StoreError> {
        self.tables
            .write()
            .get_mut(table)
            .and_then(|entries| entries.remove(key))
            .map(drop)
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn remove_multiple(&self, table: &str, keys: &[String]) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let entries = tables.entry(table.to_owned()).or_default();
        let missing: Vec<_> = keys
            .iter()
            .filter(|key| !entries.contains_key(*key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::NotFound { keys: missing });
        }
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn next_index(&self, counter: &str) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let control = tables.entry(CONTROL_TABLE.to_owned()).or_default();
        let index = control
            .get(counter)
            .and_then(Value::as_u64)
            .unwrap_or_default();
        control.insert(counter.to_owned(), Value::from(index + 1));
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn upsert_get_remove() {
        let repo = InMemoryRepository::new();
        repo.upsert("nodes", "node-0", json!({"status": "started"}))
            .await
            .unwrap();
        assert_eq!(
            repo.get("nodes", "node-0").await.unwrap(),
            json!({"status": "started"})
        );

        repo.upsert("nodes", "node-0", json!({"status": "reachable"}))
            .await
            .unwrap();
        assert_eq!(
            repo.get("nodes", "node-0").await.unwrap(),
            json!({"status": "reachable"})
        );

        repo.remove("nodes", "node-0").await.unwrap();
        assert!(matches!(
            repo.get("nodes", "node-0").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn get_multiple_lists_missing_keys() {
        let repo = InMemoryRepository::new();
        repo.upsert("nodes", "node-0", json!({})).await.unwrap();

        let err = repo
            .get_multiple(
                "nodes",
                &["node-0".to_owned(), "node-1".to_owned(), "node-2".to_owned()],
            )
            .await
            .unwrap_err();
        match err {
            StoreError::NotFound { keys } => {
                assert_eq!(keys, vec!["node-1".to_owned(), "node-2".to_owned()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn counters_are_monotonic_and_independent() {
        let repo = InMemoryRepository::new();
        assert_eq!(repo.next_index("node-index").await.unwrap(), 0);
        assert_eq!(repo.next_index("node-index").await.unwrap(), 1);
        assert_eq!(repo.next_index("cluster-index").await.unwrap(), 0);
        assert_eq!(repo.next_index("node-index").await.unwrap(), 2);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_counter_allocations_are_unique() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let repo = repo.clone();
            handles.push(tokio::spawn(
                async move { repo.next_index("idx").await.unwrap() },
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 32);
    }
}
