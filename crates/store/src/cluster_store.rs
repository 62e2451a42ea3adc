// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use serde_json::Value;

use flotilla_types::{unix_millis, Cluster, ClusterId};

use crate::{Repository, StoreError};

const TABLE: &str = "clusters";
const COUNTER: &str = "cluster-index";

/// Typed view over the `clusters` table.
#[derive(Clone)]
pub struct ClusterStore {
    repository: Arc<dyn Repository>,
}

impl ClusterStore {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    pub async fn allocate_id(&self) -> Result<ClusterId, StoreError> {
        Ok(ClusterId::from_index(
            self.repository.next_index(COUNTER).await?,
        ))
    }

    /// Persists the cluster, refreshing its `update_time`.
    pub async fn upsert(&self, cluster: &mut Cluster) -> Result<(), StoreError> {
        cluster.update_time = unix_millis();
        let value = serde_json::to_value(&*cluster).map_err(StoreError::codec)?;
        self.repository
            .upsert(TABLE, cluster.cluster_id.as_str(), value)
            .await
    }

    pub async fn get(&self, cluster_id: &ClusterId) -> Result<Cluster, StoreError> {
        decode(self.repository.get(TABLE, cluster_id.as_str()).await?)
    }

    pub async fn all(&self) -> Result<Vec<Cluster>, StoreError> {
        self.repository
            .get_all(TABLE)
            .await?
            .into_values()
            .map(decode)
            .collect()
    }

    pub async fn find_by_name(&self, cluster_name: &str) -> Result<Option<Cluster>, StoreError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|c| c.cluster_name == cluster_name))
    }

    pub async fn remove(&self, cluster_id: &ClusterId) -> Result<(), StoreError> {
        self.repository.remove(TABLE, cluster_id.as_str()).await
    }
}

fn decode(value: Value) -> Result<Cluster, StoreError> {
    serde_json::from_value(value).map_err(StoreError::codec)
}
