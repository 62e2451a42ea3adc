// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster descriptors and the resolved cluster configuration model.
//!
//! A [`ClusterConfig`] is the validated, fully cross-referenced form of a
//! declarative template: every setup reference has been resolved to the
//! actual [`Setup`] body. The snapshot embedded in a [`Cluster`] is taken at
//! creation/update time, so later edits to template files never silently
//! change a running cluster.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ClusterId;

/// Persisted record describing one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: ClusterId,
    /// Human-friendly nickname, random when not provided.
    pub cluster_name: String,
    /// Name of the template this cluster was created from.
    pub config_name: String,
    /// Resolved snapshot of the template at creation/update time.
    pub config: ClusterConfig,
    pub creation_time: u64,
    /// Refreshed on every persisted mutation.
    pub update_time: u64,
    /// True only after every stage of the setup pipeline has succeeded.
    #[serde(default)]
    pub is_setup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub options: ClusterOptions,
    #[serde(default)]
    pub before_all: Vec<NamedSetup>,
    #[serde(default)]
    pub before: Vec<NamedSetup>,
    #[serde(default)]
    pub after: Vec<NamedSetup>,
    #[serde(default)]
    pub after_all: Vec<NamedSetup>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeTypeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// Node type to pick interactive-login targets from.
    #[serde(default)]
    pub ssh_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeSpec {
    /// Instance template backing this node type.
    pub instance: String,
    pub count: u32,
    /// Smallest viable fleet for this type. `min_count ≤ count` always holds
    /// for a validated config.
    pub min_count: u32,
    #[serde(default)]
    pub setups: Vec<NamedSetup>,
}

/// A resolved setup reference: the name it was referenced by plus the body it
/// resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSetup {
    pub name: String,
    pub setup: Setup,
}

/// A reusable chain of role additions and actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    #[serde(default)]
    pub roles: Vec<RoleAdd>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAdd {
    /// Role name, optionally qualified as `role/host`.
    pub name: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// One step of a setup. The variant is decided at parse time by the keys
/// present in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Role {
        role: String,
        action: String,
        #[serde(default)]
        extra: BTreeMap<String, String>,
    },
    Command {
        command: String,
    },
    Playbook {
        playbook: String,
        #[serde(default)]
        extra: BTreeMap<String, String>,
    },
}

/// Stages of the cluster setup pipeline, in execution order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    BeforeAll,
    Before,
    Node,
    After,
    AfterAll,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::BeforeAll,
        Stage::Before,
        Stage::Node,
        Stage::After,
        Stage::AfterAll,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_variants_from_yaml_shapes() {
        let role: Action =
            serde_json::from_str(r#"{"role": "spits", "action": "start", "extra": {"x": "1"}}"#)
                .unwrap();
        assert!(matches!(role, Action::Role { .. }));

        let command: Action = serde_json::from_str(r#"{"command": "hostname"}"#).unwrap();
        assert!(matches!(command, Action::Command { .. }));

        let playbook: Action = serde_json::from_str(r#"{"playbook": "deploy.yml"}"#).unwrap();
        assert!(matches!(playbook, Action::Playbook { .. }));
    }

    #[test]
    fn stage_order_and_parse() {
        assert!(Stage::BeforeAll < Stage::Before);
        assert!(Stage::Node < Stage::AfterAll);
        assert_eq!("before_all".parse::<Stage>().unwrap(), Stage::BeforeAll);
        assert_eq!(Stage::AfterAll.to_string(), "after_all");
        assert!("nonsense".parse::<Stage>().is_err());
    }
}
