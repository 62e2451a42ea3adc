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
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use flotilla_types::{GenericError, Node, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Per-node result of a fanned-out remote command. Transport failures are a
/// normal outcome here, not an error: the command ran against many targets
/// and each one reports independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed(CommandOutput),
    Failed { error: String },
}

impl CommandOutcome {
    /// The command both reached the node and exited zero.
    pub fn succeeded(&self) -> bool {
        matches!(self, CommandOutcome::Completed(output) if output.exit_code == 0)
    }
}

/// Result of one playbook run across an inventory.
#[derive(Debug, Clone, Default)]
pub struct PlaybookOutcome {
    /// Whether the run as a whole finished successfully.
    pub ok: bool,
    pub ret_code: i32,
    /// Per-host success, keyed by node id.
    pub hosts: BTreeMap<NodeId, bool>,
    /// Facts the playbook published per host.
    pub collected_vars: BTreeMap<NodeId, BTreeMap<String, serde_json::Value>>,
}

impl PlaybookOutcome {
    pub fn all_hosts_ok(&self) -> bool {
        self.hosts.values().all(|ok| *ok)
    }
}

/// Inventory handed to a playbook run: group name → member nodes.
pub type Inventory = BTreeMap<String, Vec<Node>>;

/// Extra per-group and per-host variables for a playbook run.
#[derive(Debug, Clone, Default)]
pub struct PlaybookVars {
    pub group_vars: BTreeMap<String, BTreeMap<String, String>>,
    pub host_vars: BTreeMap<NodeId, BTreeMap<String, String>>,
}

/// Transport for remote commands and playbook runs. Implemented outside the
/// core (SSH sessions, automation-engine runners).
#[async_trait]
pub trait RemoteExecutor: Send + Sync + 'static {
    /// Runs `command` on every node, concurrently at the executor's
    /// discretion. An `Err` means the dispatch itself failed; per-node
    /// failures are reported in the map.
    async fn run_command(
        &self,
        nodes: &[Node],
        command: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<NodeId, CommandOutcome>, GenericError>;

    /// Runs the playbook against the inventory. An `Err` means the run could
    /// not be dispatched at all; a dispatched-but-failed run comes back as
    /// `Ok` with `ok == false`.
    async fn run_playbook(
        &self,
        playbook: &Path,
        inventory: &Inventory,
        vars: &PlaybookVars,
        extra: &BTreeMap<String, String>,
    ) -> Result<PlaybookOutcome, GenericError>;
}
