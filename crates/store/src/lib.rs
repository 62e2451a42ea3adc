// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Entity persistence. The [`Repository`] trait is the narrow contract every
//! durable backend has to provide: string-keyed tables of JSON documents with
//! atomic per-key upsert, plus monotonic counters for id allocation. The
//! in-memory implementation in [`memory`] backs tests and ephemeral runs;
//! durable backends live outside this workspace.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use flotilla_types::GenericError;

mod cluster_store;
pub mod memory;
mod node_store;

pub use cluster_store::ClusterStore;
pub use memory::InMemoryRepository;
pub use node_store::NodeStore;

/// Table holding the id-allocation counters.
pub const CONTROL_TABLE: &str = "control";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entries not found: {}", keys.join(", "))]
    NotFound { keys: Vec<String> },
    #[error("codec error: {0}")]
    Codec(GenericError),
}

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        StoreError::NotFound {
            keys: vec![key.into()],
        }
    }

    pub fn codec(err: impl Into<GenericError>) -> Self {
        StoreError::Codec(err.into())
    }
}

/// String-keyed JSON document store. Every mutation is atomic per key; a
/// crash between two upserts leaves the first one durable.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    async fn upsert(&self, table: &str, key: &str, value: Value) -> Result<(), StoreError>;

    async fn get(&self, table: &str, key: &str) -> Result<Value, StoreError>;

    /// Fetches all requested keys. Fails with [`StoreError::NotFound`] listing
    /// every missing key if any is absent.
    async fn get_multiple(
        &self,
        table: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, StoreError>;

    async fn get_all(&self, table: &str) -> Result<BTreeMap<String, Value>, StoreError>;

    async fn remove(&self, table: &str, key: &str) -> Result<(), StoreError>;

    async fn remove_multiple(&self, table: &str, keys: &[String]) -> Result<(), StoreError>;

    /// Atomically claims and returns the next unused index of the named
    /// counter, kept in the [`CONTROL_TABLE`]. Indexes start at zero and are
    /// never reused.
    async fn next_index(&self, counter: &str) -> Result<u64, StoreError>;
}
