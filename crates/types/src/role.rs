// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the implicit action that gates role membership: when a role
/// declares it, nodes only become members after it succeeds on every
/// addressed host.
pub const SETUP_ACTION: &str = "setup";

/// Declarative definition of a role: the named actions it offers and the
/// sub-hosts it splits its members into. An empty `hosts` list means nodes
/// are addressed directly by role name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    #[serde(default)]
    pub actions: BTreeMap<String, RoleAction>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl RoleDefinition {
    pub fn has_setup(&self) -> bool {
        self.actions.contains_key(SETUP_ACTION)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAction {
    /// Playbook path, relative to the roles directory.
    pub playbook: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub vars: Vec<ActionVariable>,
}

impl RoleAction {
    /// Variables that must be present in the caller-provided extras.
    pub fn required_vars(&self) -> impl Iterator<Item = &ActionVariable> {
        self.vars.iter().filter(|v| !v.optional)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionVariable {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
}
