// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scripted in-process provider and executor fakes for tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use flotilla_types::{GenericError, InstanceConfig, InstanceDescriptor, LoginConfig, Node, NodeId,
    NodeStatus, ProviderConfig};

use crate::{CommandOutcome, CommandOutput, InstanceProvider, Inventory, PlaybookOutcome,
    PlaybookVars, RemoteExecutor, StartedInstance};

/// Instance descriptor against the `aws` mock provider.
pub fn test_descriptor(instance_config_id: &str) -> InstanceDescriptor {
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
            keypair_name: Some("default".into()),
            keypair_public_file: None,
            keypair_private_file: Some("default.pem".into()),
            sudo: true,
            sudo_user: "root".into(),
        },
        instance: InstanceConfig {
            instance_config_id: instance_config_id.into(),
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

#[derive(Default)]
struct ProviderState {
    fail_starts: bool,
    fail_stops: bool,
    /// Per start call, yield at most this many instances.
    yield_at_most: Option<u32>,
    reported_status: HashMap<NodeId, NodeStatus>,
    launched: u32,
    start_calls: usize,
    stopped: Vec<NodeId>,
    paused: Vec<NodeId>,
    resumed: Vec<NodeId>,
}

/// Provider driver fake. Started instances come up `Started` with a unique
/// private address; `update_status` reports the scripted status per node, or
/// echoes the current one.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<ProviderState>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_starts(&self, fail: bool) {
        self.state.lock().fail_starts = fail;
    }

    pub fn fail_stops(&self, fail: bool) {
        self.state.lock().fail_stops = fail;
    }

    /// Caps how many instances each start call yields, regardless of the
    /// requested count.
    pub fn yield_at_most(&self, cap: u32) {
        self.state.lock().yield_at_most = Some(cap);
    }

    pub fn report_status(&self, node_id: NodeId, status: NodeStatus) {
        self.state.lock().reported_status.insert(node_id, status);
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn stopped(&self) -> Vec<NodeId> {
        self.state.lock().stopped.clone()
    }

    pub fn paused(&self) -> Vec<NodeId> {
        self.state.lock().paused.clone()
    }

    pub fn resumed(&self) -> Vec<NodeId> {
        self.state.lock().resumed.clone()
    }
}

#[async_trait]
impl InstanceProvider for MockProvider {
    async fn start_instances(
        &self,
        _descriptor: &InstanceDescriptor,
        count: u32,
        _timeout: Duration,
    ) -> Result<Vec<StartedInstance>, GenericError> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        if state.fail_starts {
            return Err("provider unavailable".into());
        }
        let yielded = state.yield_at_most.map_or(count, |cap| count.min(cap));
        let mut instances = Vec::with_capacity(yielded as usize);
        for _ in 0..yielded {
            state.launched += 1;
            instances.push(StartedInstance {
                cloud_instance_id: Some(format!("i-{:06x}", state.launched)),
                ip: Some(format!("10.0.0.{}", state.launched)),
                ..Default::default()
            });
        }
        Ok(instances)
    }

    async fn stop_instances(
        &self,
        nodes: &[Node],
        _timeout: Duration,
    ) -> Result<Vec<Node>, GenericError> {
        let mut state = self.state.lock();
        if state.fail_stops {
            return Err("stop failed".into());
        }
        let mut stopped = Vec::with_capacity(nodes.len());
        for node in nodes {
            state.stopped.push(node.node_id.clone());
            let mut node = node.clone();
            node.status = NodeStatus::Stopped;
            stopped.push(node);
        }
        Ok(stopped)
    }

    async fn pause_instances(
        &self,
        nodes: &[Node],
        _timeout: Duration,
    ) -> Result<Vec<Node>, GenericError> {
        let mut state = self.state.lock();
        let mut paused = Vec::with_capacity(nodes.len());
        for node in nodes {
            state.paused.push(node.node_id.clone());
            let mut node = node.clone();
            node.status = NodeStatus::Paused;
            paused.push(node);
        }
        Ok(paused)
    }

    async fn resume_instances(
        &self,
        nodes: &[Node],
        _timeout: Duration,
    ) -> Result<Vec<Node>, GenericError> {
        let mut state = self.state.lock();
        let mut resumed = Vec::with_capacity(nodes.len());
        for node in nodes {
            state.resumed.push(node.node_id.clone());
            let mut node = node.clone();
            node.status = NodeStatus::Started;
            // resumed instances come back on a fresh address
            state.launched += 1;
            node.ip = Some(format!("10.0.1.{}", state.launched));
            resumed.push(node);
        }
        Ok(resumed)
    }

    async fn update_status(
        &self,
        nodes: &[Node],
        _timeout: Duration,
    ) -> Result<Vec<Node>, GenericError> {
        let state = self.state.lock();
        Ok(nodes
            .iter()
            .map(|node| {
                let mut node = node.clone();
                if let Some(status) = state.reported_status.get(&node.node_id) {
                    node.status = *status;
                }
                node
            })
            .collect())
    }
}

/// One recorded playbook dispatch.
#[derive(Debug, Clone)]
pub struct PlaybookCall {
    pub playbook: PathBuf,
    pub inventory: BTreeMap<String, Vec<NodeId>>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Default)]
struct ExecutorState {
    default_exit_code: i32,
    exit_code_scripts: HashMap<NodeId, VecDeque<i32>>,
    failing_commands: HashSet<String>,
    failing_playbooks: HashSet<String>,
    command_calls: Vec<(Vec<NodeId>, String)>,
    playbook_calls: Vec<PlaybookCall>,
}

/// Remote executor fake. Commands succeed by default; individual nodes can
/// be scripted with a sequence of exit codes, whole command strings or
/// playbook file names can be made to fail.
#[derive(Default)]
pub struct MockExecutor {
    state: Mutex<ExecutorState>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Exit code produced for any node without a script.
    pub fn fail_all_commands(&self, exit_code: i32) {
        self.state.lock().default_exit_code = exit_code;
    }

    /// Successive exit codes this node produces, one per command dispatch it
    /// is part of; afterwards it falls back to the default.
    pub fn script_exit_codes(&self, node_id: NodeId, codes: Vec<i32>) {
        self.state
            .lock()
            .exit_code_scripts
            .insert(node_id, codes.into());
    }

    /// Any dispatch of exactly this command string exits non-zero everywhere.
    pub fn fail_command(&self, command: &str) {
        self.state.lock().failing_commands.insert(command.to_owned());
    }

    /// Any run of a playbook with this file name fails as a whole.
    pub fn fail_playbook(&self, file_name: &str) {
        self.state
            .lock()
            .failing_playbooks
            .insert(file_name.to_owned());
    }

    pub fn command_calls(&self) -> Vec<(Vec<NodeId>, String)> {
        self.state.lock().command_calls.clone()
    }

    pub fn playbook_calls(&self) -> Vec<PlaybookCall> {
        self.state.lock().playbook_calls.clone()
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run_command(
        &self,
        nodes: &[Node],
        command: &str,
        _timeout: Duration,
    ) -> Result<BTreeMap<NodeId, CommandOutcome>, GenericError> {
        let mut state = self.state.lock();
        state.command_calls.push((
            nodes.iter().map(|n| n.node_id.clone()).collect(),
            command.to_owned(),
        ));

        let default_exit_code = if state.failing_commands.contains(command) {
            1
        } else {
            state.default_exit_code
        };
        let mut outcomes = BTreeMap::new();
        for node in nodes {
            let exit_code = state
                .exit_code_scripts
                .get_mut(&node.node_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(default_exit_code);
            outcomes.insert(
                node.node_id.clone(),
                CommandOutcome::Completed(CommandOutput {
                    stdout: "OK\n".to_owned(),
                    stderr: String::new(),
                    exit_code,
                }),
            );
        }
        Ok(outcomes)
    }

    async fn run_playbook(
        &self,
        playbook: &Path,
        inventory: &Inventory,
        _vars: &PlaybookVars,
        extra: &BTreeMap<String, String>,
    ) -> Result<PlaybookOutcome, GenericError> {
        let mut state = self.state.lock();
        let id_inventory: BTreeMap<String, Vec<NodeId>> = inventory
            .iter()
            .map(|(group, nodes)| {
                (
                    group.clone(),
                    nodes.iter().map(|n| n.node_id.clone()).collect(),
                )
            })
            .collect();
        state.playbook_calls.push(PlaybookCall {
            playbook: playbook.to_owned(),
            inventory: id_inventory,
            extra: extra.clone(),
        });

        let ok = !playbook
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| state.failing_playbooks.contains(name));
        let hosts: BTreeMap<NodeId, bool> = inventory
            .values()
            .flatten()
            .map(|node| (node.node_id.clone(), ok))
            .collect();
        Ok(PlaybookOutcome {
            ok,
            ret_code: if ok { 0 } else { 2 },
            hosts,
            collected_vars: BTreeMap::new(),
        })
    }
}
