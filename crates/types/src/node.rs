// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ClusterId, InstanceDescriptor, NodeId};

/// Lifecycle status of a managed node.
///
/// `Unknown → Started → {Reachable | Unreachable} → Paused → Started` (on
/// resume) `→ Stopped` (terminal, record removed). `Reachable` and
/// `Unreachable` may oscillate while reachability probes run. Any
/// provider-reported terminated state maps to `Stopped`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Started,
    Reachable,
    Unreachable,
    Paused,
    Stopped,
}

impl NodeStatus {
    /// Up from the provider's point of view, though possibly not reachable.
    pub fn is_up(self) -> bool {
        matches!(
            self,
            NodeStatus::Started | NodeStatus::Reachable | NodeStatus::Unreachable
        )
    }

    /// Candidate for a remote reachability probe: the provider reports the
    /// instance running but the node has not been confirmed dead.
    pub fn probeable(self) -> bool {
        matches!(
            self,
            NodeStatus::Unknown | NodeStatus::Started | NodeStatus::Reachable
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeKind {
    #[default]
    Cloud,
    Local,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CloudLifecycle {
    #[default]
    Normal,
    Preemptible,
}

/// A node's membership within one cluster: which node types it fills and,
/// per type, whether the node-stage setup chain has completed for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
    #[serde(default)]
    pub node_types: BTreeSet<String>,
    #[serde(default)]
    pub setup_done: BTreeMap<String, bool>,
}

impl ClusterMembership {
    pub fn add_node_type(&mut self, node_type: &str) {
        self.node_types.insert(node_type.to_owned());
        self.setup_done.entry(node_type.to_owned()).or_insert(false);
    }

    pub fn is_setup(&self, node_type: &str) -> bool {
        self.setup_done.get(node_type).copied().unwrap_or(false)
    }
}

/// Persisted record describing one managed compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    /// Template the node was created from. Immutable after creation.
    pub configuration: InstanceDescriptor,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub cloud_instance_id: Option<String>,
    #[serde(default)]
    pub cloud_lifecycle: CloudLifecycle,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub creation_time: u64,
    /// Refreshed on every persisted mutation.
    #[serde(default)]
    pub update_time: u64,
    /// Role name → host names under which the node was added. An empty set
    /// marks direct membership in a role that declares no hosts.
    #[serde(default)]
    pub roles: BTreeMap<String, BTreeSet<String>>,
    /// Free-form user tags: key → set of values.
    #[serde(default)]
    pub tags: BTreeMap<String, BTreeSet<String>>,
    /// Typed cluster membership relation.
    #[serde(default)]
    pub clusters: BTreeMap<ClusterId, ClusterMembership>,
    /// Provider-private scratch data.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Node {
    pub fn new(node_id: NodeId, configuration: InstanceDescriptor) -> Self {
        let now = crate::unix_millis();
        Self {
            node_id,
            configuration,
            nickname: String::new(),
            ip: None,
            kind: NodeKind::default(),
            cloud_instance_id: None,
            cloud_lifecycle: CloudLifecycle::default(),
            status: NodeStatus::default(),
            creation_time: now,
            update_time: now,
            roles: BTreeMap::new(),
            tags: BTreeMap::new(),
            clusters: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.configuration.provider_name()
    }

    pub fn instance_config_id(&self) -> &str {
        self.configuration.instance_config_id()
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    pub fn has_tag_value(&self, key: &str, value: &str) -> bool {
        self.tags
            .get(key)
            .is_some_and(|values| values.contains(value))
    }

    pub fn member_of(&self, cluster_id: &ClusterId) -> bool {
        self.clusters.contains_key(cluster_id)
    }

    pub fn membership(&self, cluster_id: &ClusterId) -> Option<&ClusterMembership> {
        self.clusters.get(cluster_id)
    }

    pub fn membership_mut(&mut self, cluster_id: &ClusterId) -> &mut ClusterMembership {
        self.clusters.entry(cluster_id.clone()).or_default()
    }

    /// Direct membership in a host-less role.
    pub fn in_role(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    /// Membership in a role under a specific host.
    pub fn in_role_host(&self, role: &str, host: &str) -> bool {
        self.roles
            .get(role)
            .is_some_and(|hosts| hosts.contains(host))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) ip={} status={} instance={}",
            self.node_id,
            self.nickname,
            self.ip.as_deref().unwrap_or("-"),
            self.status,
            self.instance_config_id(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceConfig, LoginConfig, ProviderConfig};

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

    #[test]
    fn membership_relation() {
        let mut node = Node::new(NodeId::from_index(1), descriptor());
        let cluster = ClusterId::from_index(3);
        assert!(!node.member_of(&cluster));

        node.membership_mut(&cluster).add_node_type("worker");
        assert!(node.member_of(&cluster));
        let membership = node.membership(&cluster).unwrap();
        assert!(membership.node_types.contains("worker"));
        assert!(!membership.is_setup("worker"));
    }

    #[test]
    fn role_markers() {
        let mut node = Node::new(NodeId::from_index(2), descriptor());
        node.roles.insert("commands-common".into(), BTreeSet::new());
        node.roles
            .entry("spits".into())
            .or_default()
            .insert("jobmanager".into());

        assert!(node.in_role("commands-common"));
        assert!(node.in_role_host("spits", "jobmanager"));
        assert!(!node.in_role_host("spits", "taskmanager"));
    }

    #[test]
    fn status_round_trip() {
        let status = NodeStatus::Unreachable;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"unreachable\"");
        assert_eq!(status.to_string(), "unreachable");
        assert!(status.is_up());
        assert!(!status.probeable());
    }
}
