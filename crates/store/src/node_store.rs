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

use flotilla_types::{unix_millis, Node, NodeId};

use crate::{Repository, StoreError};

const TABLE: &str = "nodes";
const COUNTER: &str = "node-index";

/// Typed view over the `nodes` table. Cheap to clone; all clones share the
/// underlying repository.
#[derive(Clone)]
pub struct NodeStore {
    repository: Arc<dyn Repository>,
}

impl NodeStore {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Claims a fresh, never-reused node id.
    pub async fn allocate_id(&self) -> Result<NodeId, StoreError> {
        Ok(NodeId::from_index(self.repository.next_index(COUNTER).await?))
    }

    /// Persists the node, refreshing its `update_time`.
    pub async fn upsert(&self, node: &mut Node) -> Result<(), StoreError> {
        node.update_time = unix_millis();
        let value = serde_json::to_value(&*node).map_err(StoreError::codec)?;
        self.repository.upsert(TABLE, node.node_id.as_str(), value).await
    }

    pub async fn get(&self, node_id: &NodeId) -> Result<Node, StoreError> {
        decode(self.repository.get(TABLE, node_id.as_str()).await?)
    }

    /// Fetches all requested nodes; fails listing every missing id.
    pub async fn get_multiple(&self, node_ids: &[NodeId]) -> Result<Vec<Node>, StoreError> {
        let keys: Vec<String> = node_ids.iter().map(|id| id.as_str().to_owned()).collect();
        self.repository
            .get_multiple(TABLE, &keys)
            .await?
            .into_values()
            .map(decode)
            .collect()
    }

    pub async fn all(&self) -> Result<Vec<Node>, StoreError> {
        self.repository
            .get_all(TABLE)
            .await?
            .into_values()
            .map(decode)
            .collect()
    }

    pub async fn matching<F>(&self, filter: F) -> Result<Vec<Node>, StoreError>
    where
        F: Fn(&Node) -> bool,
    {
        Ok(self.all().await?.into_iter().filter(|n| filter(n)).collect())
    }

    pub async fn remove(&self, node_id: &NodeId) -> Result<(), StoreError> {
        self.repository.remove(TABLE, node_id.as_str()).await
    }

    pub async fn remove_multiple(&self, node_ids: &[NodeId]) -> Result<(), StoreError> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = node_ids.iter().map(|id| id.as_str().to_owned()).collect();
        self.repository.remove_multiple(TABLE, &keys).await
    }
}

fn decode(value: Value) -> Result<Node, StoreError> {
    serde_json::from_value(value).map_err(StoreError::codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRepository;
    use flotilla_types::{
        InstanceConfig, InstanceDescriptor, LoginConfig, NodeStatus, ProviderConfig,
    };

    fn descriptor() -> InstanceDescriptor {
        InstanceDescriptor {
            provider: ProviderConfig {
                provider_config_id: "aws-east".into(),
                provider: "aws".into(),
                region: "us-east-1".into(),
                extra: Default::default(),
            },
            login: LoginConfig {
                login_config_id: "ubuntu".into(),
                user: "ubuntu".into(),
                ssh_port: 22,
                keypair_name: None,
                keypair_public_file: None,
                keypair_private_file: None,
                sudo: true,
                sudo_user: "root".into(),
            },
            instance: InstanceConfig {
                instance_config_id: "type-a".into(),
                provider: "aws-east".into(),
                login: "ubuntu".into(),
                flavor: "t2.micro".into(),
                image_id: "ami-1234".into(),
                security_group: None,
                boot_disk_size: None,
                boot_disk_device: None,
                boot_disk_type: None,
                placement_group: None,
                price: None,
                network_ids: vec![],
            },
        }
    }

    #[test_log::test(tokio::test)]
    async fn round_trip_refreshes_update_time() {
        let store = NodeStore::new(Arc::new(InMemoryRepository::new()));
        let id = store.allocate_id().await.unwrap();
        assert_eq!(id, NodeId::from_index(0));

        let mut node = Node::new(id.clone(), descriptor());
        node.update_time = 0;
        store.upsert(&mut node).await.unwrap();
        assert!(node.update_time > 0);

        let mut loaded = store.get(&id).await.unwrap();
        assert_eq!(loaded.node_id, id);
        assert_eq!(loaded.status, NodeStatus::Unknown);

        loaded.status = NodeStatus::Started;
        let before = loaded.update_time;
        store.upsert(&mut loaded).await.unwrap();
        assert!(loaded.update_time >= before);
        assert_eq!(store.get(&id).await.unwrap().status, NodeStatus::Started);
    }

    #[test_log::test(tokio::test)]
    async fn matching_filters_on_attributes() {
        let store = NodeStore::new(Arc::new(InMemoryRepository::new()));
        for status in [NodeStatus::Started, NodeStatus::Stopped, NodeStatus::Reachable] {
            let id = store.allocate_id().await.unwrap();
            let mut node = Node::new(id, descriptor());
            node.status = status;
            store.upsert(&mut node).await.unwrap();
        }

        let up = store.matching(|n| n.status.is_up()).await.unwrap();
        assert_eq!(up.len(), 2);
    }
}
