// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cluster orchestrator: creates clusters from templates, grows and
//! shrinks them, and runs the staged setup pipeline over their members.
//!
//! Creation and grow are all-or-nothing at the minimum-viable-fleet level:
//! when any node type cannot reach its minimum, every node started by the
//! failing call is stopped again. The pre-existing cluster state is never
//! touched by a failed operation.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tracing::{error, info, warn};

use flotilla_node::{
    default_max_workers, AlivenessOptions, CommandOutcome, NodeManager, NodeManagerError,
    PauseOptions, PlaybookOutcome, PlaybookVars, ResumeOptions, StartOptions, StopOptions,
};
use flotilla_store::{ClusterStore, NodeStore, StoreError};
use flotilla_types::{
    random_nickname, unix_millis, Action, Cluster, ClusterId, NamedSetup, NodeId, NodeStatus,
    RoleAdd, Stage,
};

use crate::{ClusterConfigError, ClusterTemplates, InstanceConfigError, InstanceDatabase,
    InstancePaths, RoleError, RoleManager, RoleTarget};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid cluster: {0}")]
    InvalidCluster(ClusterId),
    #[error("no nodes in cluster {0}")]
    Empty(ClusterId),
    #[error("cluster {cluster} resize failed: {reason}")]
    Resize { cluster: ClusterId, reason: String },
    #[error("error setting up cluster {cluster} at '{stage}' stage (setup '{setup}')")]
    Setup {
        cluster: ClusterId,
        stage: Stage,
        setup: String,
    },
    #[error("unknown node types {node_types:?} for cluster {cluster}")]
    UnknownNodeTypes {
        cluster: ClusterId,
        node_types: Vec<String>,
    },
    #[error("nodes {node_ids:?} do not belong to cluster {cluster}")]
    NotMembers {
        cluster: ClusterId,
        node_ids: Vec<NodeId>,
    },
    #[error("no nodes of type '{node_type}' in cluster {cluster}")]
    NoSuchTypeMembers {
        cluster: ClusterId,
        node_type: String,
    },
    #[error(transparent)]
    Config(#[from] ClusterConfigError),
    #[error(transparent)]
    Instances(#[from] InstanceConfigError),
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error(transparent)]
    Node(#[from] NodeManagerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where the orchestrator reads its declarative inputs from. Held as plain
/// paths and re-read on every create/update call, so edits on disk are
/// always picked up.
#[derive(Debug, Clone)]
pub struct ClusterManagerConfig {
    /// Cluster template files.
    pub template_files: Vec<PathBuf>,
    /// Provider/login/instance configuration documents.
    pub instance_paths: InstancePaths,
    /// Fail hard on any invalid template instead of dropping it.
    pub strict_templates: bool,
}

#[derive(Debug, Clone)]
pub struct GrowOptions {
    pub start_timeout: Duration,
    pub connection_retries: usize,
    pub retry_timeout: Duration,
    pub max_workers: usize,
}

impl Default for GrowOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(600),
            connection_retries: 15,
            retry_timeout: Duration::from_secs(30),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Nickname for the new cluster; random when unset.
    pub cluster_name: Option<String>,
    /// Skip node allocation entirely (an empty cluster record is created).
    pub skip_start: bool,
    pub grow: GrowOptions,
}

#[derive(Debug, Clone)]
pub struct RemoveOptions {
    /// Stop removed nodes (removing their records) instead of only untagging.
    pub stop_nodes: bool,
    pub remove_cluster_if_empty: bool,
    pub max_workers: usize,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            stop_nodes: true,
            remove_cluster_if_empty: true,
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Stage to resume the pipeline from.
    pub start_at: Stage,
    /// Bounded concurrency for the node stage fan-out.
    pub max_workers: usize,
    /// Applies to each shell-command action dispatch.
    pub command_timeout: Duration,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            start_at: Stage::BeforeAll,
            max_workers: default_max_workers(),
            command_timeout: Duration::from_secs(600),
        }
    }
}

struct TypeRequest {
    node_type: String,
    minimum: u32,
    desired: u32,
}

/// Composes the node lifecycle manager, role dispatcher and template
/// database into cluster-level operations.
pub struct ClusterManager {
    node_manager: Arc<NodeManager>,
    role_manager: Arc<RoleManager>,
    node_store: NodeStore,
    cluster_store: ClusterStore,
    config: ClusterManagerConfig,
}

impl ClusterManager {
    pub fn new(
        node_manager: Arc<NodeManager>,
        role_manager: Arc<RoleManager>,
        cluster_store: ClusterStore,
        config: ClusterManagerConfig,
    ) -> Self {
        let node_store = node_manager.store().clone();
        Self {
            node_manager,
            role_manager,
            node_store,
            cluster_store,
            config,
        }
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    pub fn role_manager(&self) -> &Arc<RoleManager> {
        &self.role_manager
    }

    pub async fn cluster(&self, cluster_id: &ClusterId) -> Result<Cluster, ClusterError> {
        self.cluster_store
            .get(cluster_id)
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => ClusterError::InvalidCluster(cluster_id.clone()),
                other => ClusterError::Store(other),
            })
    }

    pub async fn all_clusters(&self) -> Result<Vec<Cluster>, ClusterError> {
        Ok(self.cluster_store.all().await?)
    }

    /// All current member nodes, derived from the persisted membership
    /// relation rather than stored on the cluster record.
    pub async fn members(&self, cluster_id: &ClusterId) -> Result<Vec<NodeId>, ClusterError> {
        Ok(self
            .node_store
            .matching(|n| n.member_of(cluster_id))
            .await?
            .into_iter()
            .map(|n| n.node_id)
            .collect())
    }

    /// Current members grouped by node type. A node filling several types
    /// appears under each of them.
    pub async fn members_by_type(
        &self,
        cluster_id: &ClusterId,
    ) -> Result<BTreeMap<String, Vec<NodeId>>, ClusterError> {
        let mut result: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for node in self.node_store.matching(|n| n.member_of(cluster_id)).await? {
            if let Some(membership) = node.membership(cluster_id) {
                for node_type in &membership.node_types {
                    result
                        .entry(node_type.clone())
                        .or_default()
                        .push(node.node_id.clone());
                }
            }
        }
        Ok(result)
    }

    /// Creates a cluster from the named template. The resolved template is
    /// embedded into the cluster record, then (unless `skip_start`) nodes
    /// are allocated for every declared node type. When any type misses its
    /// minimum, everything allocated for this cluster is stopped again and
    /// the record removed: creation is all-or-nothing.
    pub async fn create(
        &self,
        template_name: &str,
        opts: &CreateOptions,
    ) -> Result<ClusterId, ClusterError> {
        let templates =
            ClusterTemplates::load(&self.config.template_files, self.config.strict_templates)?;
        let template = templates.cluster(template_name)?.clone();

        let cluster_id = self.cluster_store.allocate_id().await?;
        let in_use: HashSet<String> = self
            .cluster_store
            .all()
            .await?
            .into_iter()
            .map(|c| c.cluster_name)
            .collect();
        let cluster_name = opts
            .cluster_name
            .clone()
            .unwrap_or_else(|| random_nickname(&in_use));

        let now = unix_millis();
        let mut cluster = Cluster {
            cluster_id: cluster_id.clone(),
            cluster_name,
            config_name: template_name.to_owned(),
            config: template,
            creation_time: now,
            update_time: now,
            is_setup: false,
        };
        self.cluster_store.upsert(&mut cluster).await?;
        info!(cluster = %cluster_id, template = template_name, "created cluster");

        if !opts.skip_start {
            let requests: BTreeMap<String, (u32, u32)> = cluster
                .config
                .nodes
                .iter()
                .map(|(node_type, spec)| (node_type.clone(), (spec.min_count, spec.count)))
                .collect();
            if let Err(err) = self.grow(&cluster_id, &requests, &opts.grow).await {
                error!(cluster = %cluster_id, %err, "cluster creation failed, removing record");
                if let Err(remove_err) = self.cluster_store.remove(&cluster_id).await {
                    warn!(cluster = %cluster_id, %remove_err, "could not remove cluster record");
                }
                return Err(err);
            }
        }
        Ok(cluster_id)
    }

    /// Starts additional nodes and partitions the reachable ones across the
    /// requested node types. Requests are `type → (minimum, desired)`.
    /// Node-type names sharing an instance template draw from a common pool:
    /// each type's minimum is satisfied first, then the remainder is handed
    /// out by `desired - minimum`, both in lexicographic type order. When
    /// any minimum cannot be met, every node started by this call is stopped
    /// again; the existing cluster is left untouched.
    pub async fn grow(
        &self,
        cluster_id: &ClusterId,
        requests: &BTreeMap<String, (u32, u32)>,
        opts: &GrowOptions,
    ) -> Result<BTreeMap<String, Vec<NodeId>>, ClusterError> {
        let cluster = self.cluster(cluster_id).await?;

        let unknown: Vec<String> = requests
            .keys()
            .filter(|t| !cluster.config.nodes.contains_key(*t))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ClusterError::UnknownNodeTypes {
                cluster: cluster_id.clone(),
                node_types: unknown,
            });
        }

        // group requested types by their backing instance template
        let mut by_instance: BTreeMap<String, Vec<TypeRequest>> = BTreeMap::new();
        for (node_type, (minimum, desired)) in requests {
            if *desired == 0 {
                continue;
            }
            let spec = &cluster.config.nodes[node_type];
            by_instance
                .entry(spec.instance.clone())
                .or_default()
                .push(TypeRequest {
                    node_type: node_type.clone(),
                    minimum: *minimum,
                    desired: *desired,
                });
        }
        if by_instance.is_empty() {
            return Ok(BTreeMap::new());
        }

        let instances = InstanceDatabase::load(&self.config.instance_paths, false)?;
        let mut start_requests = Vec::new();
        for (instance_id, reqs) in &by_instance {
            let desired: u32 = reqs.iter().map(|r| r.desired).sum();
            start_requests.push((instances.descriptor(instance_id)?.clone(), desired));
        }

        let started = self
            .node_manager
            .start_many(
                &start_requests,
                &StartOptions {
                    start_timeout: opts.start_timeout,
                    connection_retries: opts.connection_retries,
                    retry_timeout: opts.retry_timeout,
                    terminate_not_alive: false,
                    max_workers: opts.max_workers,
                },
            )
            .await?;

        let mut reachable: BTreeMap<String, VecDeque<NodeId>> = BTreeMap::new();
        let mut unreachable: Vec<NodeId> = Vec::new();
        for node in self.node_manager.nodes(&started).await? {
            if node.status == NodeStatus::Reachable {
                reachable
                    .entry(node.instance_config_id().to_owned())
                    .or_default()
                    .push_back(node.node_id);
            } else {
                unreachable.push(node.node_id);
            }
        }

        let minimum_unmet = by_instance.iter().any(|(instance_id, reqs)| {
            let have = reachable.get(instance_id).map_or(0, |pool| pool.len() as u32);
            have < reqs.iter().map(|r| r.minimum).sum()
        });
        if minimum_unmet {
            error!(
                cluster = %cluster_id,
                "minimum node count not reached, stopping {} nodes started by this call",
                started.len()
            );
            self.node_manager
                .stop(
                    &started,
                    &StopOptions {
                        max_workers: opts.max_workers,
                        ..Default::default()
                    },
                )
                .await?;
            return Err(ClusterError::Resize {
                cluster: cluster_id.clone(),
                reason: "minimum node count not reached".to_owned(),
            });
        }

        if !unreachable.is_empty() {
            warn!(
                cluster = %cluster_id,
                "stopping {} nodes that never became reachable",
                unreachable.len()
            );
            self.node_manager
                .stop(
                    &unreachable,
                    &StopOptions {
                        max_workers: opts.max_workers,
                        ..Default::default()
                    },
                )
                .await?;
        }

        // partition each instance pool: minimums first, then the remainder
        let mut partitioned: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for (instance_id, reqs) in &by_instance {
            let mut pool = reachable.remove(instance_id).unwrap_or_default();
            for req in reqs {
                let take = (req.minimum as usize).min(pool.len());
                partitioned
                    .entry(req.node_type.clone())
                    .or_default()
                    .extend(pool.drain(..take));
            }
            for req in reqs {
                let remainder = req.desired.saturating_sub(req.minimum) as usize;
                if remainder == 0 {
                    continue;
                }
                let take = remainder.min(pool.len());
                partitioned
                    .entry(req.node_type.clone())
                    .or_default()
                    .extend(pool.drain(..take));
                if pool.is_empty() {
                    break;
                }
            }
        }

        self.tag_members(cluster_id, &partitioned).await?;
        Ok(partitioned)
    }

    /// Tags pre-existing nodes into the cluster under the given node types.
    /// Their node-stage setup state starts out false.
    pub async fn add_existing_nodes(
        &self,
        cluster_id: &ClusterId,
        node_types: &BTreeMap<String, Vec<NodeId>>,
    ) -> Result<(), ClusterError> {
        self.cluster(cluster_id).await?;
        self.tag_members(cluster_id, node_types).await
    }

    async fn tag_members(
        &self,
        cluster_id: &ClusterId,
        node_types: &BTreeMap<String, Vec<NodeId>>,
    ) -> Result<(), ClusterError> {
        for (node_type, node_ids) in node_types {
            if node_ids.is_empty() {
                continue;
            }
            for mut node in self.node_store.get_multiple(node_ids).await? {
                node.membership_mut(cluster_id).add_node_type(node_type);
                self.node_store.upsert(&mut node).await?;
            }
        }
        Ok(())
    }

    /// Removes specific member nodes from the cluster. Every id must be a
    /// current member, otherwise nothing is changed and the offenders are
    /// reported.
    pub async fn remove_nodes(
        &self,
        cluster_id: &ClusterId,
        node_ids: &[NodeId],
        opts: &RemoveOptions,
    ) -> Result<Vec<NodeId>, ClusterError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let members: HashSet<NodeId> = self.members(cluster_id).await?.into_iter().collect();
        let invalid: Vec<NodeId> = node_ids
            .iter()
            .filter(|id| !members.contains(*id))
            .cloned()
            .collect();
        if !invalid.is_empty() {
            return Err(ClusterError::NotMembers {
                cluster: cluster_id.clone(),
                node_ids: invalid,
            });
        }

        if opts.stop_nodes {
            self.node_manager
                .stop(
                    node_ids,
                    &StopOptions {
                        max_workers: opts.max_workers,
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            for mut node in self.node_store.get_multiple(node_ids).await? {
                node.clusters.remove(cluster_id);
                self.node_store.upsert(&mut node).await?;
            }
        }

        if opts.remove_cluster_if_empty && self.members(cluster_id).await?.is_empty() {
            info!(cluster = %cluster_id, "cluster has no members left, removing record");
            self.cluster_store.remove(cluster_id).await?;
        }
        Ok(node_ids.to_vec())
    }

    /// Removes `count` arbitrary member nodes per type.
    pub async fn shrink(
        &self,
        cluster_id: &ClusterId,
        node_types: &BTreeMap<String, u32>,
        opts: &RemoveOptions,
    ) -> Result<Vec<NodeId>, ClusterError> {
        let members = self.members_by_type(cluster_id).await?;
        let mut to_remove = BTreeSet::new();
        for (node_type, count) in node_types {
            let Some(type_members) = members.get(node_type) else {
                return Err(ClusterError::NoSuchTypeMembers {
                    cluster: cluster_id.clone(),
                    node_type: node_type.clone(),
                });
            };
            if (type_members.len() as u32) < *count {
                return Err(ClusterError::Resize {
                    cluster: cluster_id.clone(),
                    reason: format!(
                        "cannot remove {count} nodes of type '{node_type}', only {} are members",
                        type_members.len()
                    ),
                });
            }
            to_remove.extend(type_members.iter().take(*count as usize).cloned());
        }
        let node_ids: Vec<NodeId> = to_remove.into_iter().collect();
        self.remove_nodes(cluster_id, &node_ids, opts).await
    }

    /// Runs the staged setup pipeline `before_all → before → node → after →
    /// after_all`, resumable from any stage. `before_all`/`after_all`
    /// address all current members; `before`/`after` address the nodes being
    /// (re-)set-up in this call (all members when `node_types` is `None`);
    /// the node stage runs each type's setup chain, concurrently across
    /// types and serially within a chain. A failing setup aborts the
    /// remaining stages. `is_setup` turns false at the start and true only
    /// once every stage has succeeded; each type's per-node setup marker
    /// flips as soon as its own node-stage chain succeeded.
    pub async fn setup(
        &self,
        cluster_id: &ClusterId,
        node_types: Option<&BTreeMap<String, Vec<NodeId>>>,
        opts: &SetupOptions,
    ) -> Result<(), ClusterError> {
        let mut cluster = self.cluster(cluster_id).await?;
        cluster.is_setup = false;
        self.cluster_store.upsert(&mut cluster).await?;

        let member_types = self.members_by_type(cluster_id).await?;
        let targets: BTreeMap<String, Vec<NodeId>> = match node_types {
            Some(types) => types.clone(),
            None => member_types.clone(),
        };
        let unknown: Vec<String> = targets
            .keys()
            .filter(|t| !cluster.config.nodes.contains_key(*t))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ClusterError::UnknownNodeTypes {
                cluster: cluster_id.clone(),
                node_types: unknown,
            });
        }

        let all_members: Vec<NodeId> = member_types
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let being_added: Vec<NodeId> = targets
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for stage in Stage::ALL {
            if stage < opts.start_at {
                continue;
            }
            match stage {
                Stage::BeforeAll => {
                    self.run_setup_list(cluster_id, stage, &cluster.config.before_all, &all_members, opts)
                        .await?
                }
                Stage::Before => {
                    self.run_setup_list(cluster_id, stage, &cluster.config.before, &being_added, opts)
                        .await?
                }
                Stage::Node => self.run_node_stage(cluster_id, &cluster, &targets, opts).await?,
                Stage::After => {
                    self.run_setup_list(cluster_id, stage, &cluster.config.after, &being_added, opts)
                        .await?
                }
                Stage::AfterAll => {
                    self.run_setup_list(cluster_id, stage, &cluster.config.after_all, &all_members, opts)
                        .await?
                }
            }
        }

        cluster.is_setup = true;
        self.cluster_store.upsert(&mut cluster).await?;
        info!(cluster = %cluster_id, "cluster setup finished");
        Ok(())
    }

    /// Node stage: each targeted type's setup chain, concurrently across
    /// types. Types whose chain succeeded get their setup marker flipped
    /// even when another type fails the stage.
    async fn run_node_stage(
        &self,
        cluster_id: &ClusterId,
        cluster: &Cluster,
        targets: &BTreeMap<String, Vec<NodeId>>,
        opts: &SetupOptions,
    ) -> Result<(), ClusterError> {
        let tasks: Vec<(String, Vec<NamedSetup>, Vec<NodeId>)> = targets
            .iter()
            .filter(|(_, node_ids)| !node_ids.is_empty())
            .map(|(node_type, node_ids)| {
                (
                    node_type.clone(),
                    cluster.config.nodes[node_type].setups.clone(),
                    node_ids.clone(),
                )
            })
            .collect();

        let results: Vec<(String, Result<(), ClusterError>)> = stream::iter(tasks)
            .map(|(node_type, setups, node_ids)| {
                let cluster_id = cluster_id.clone();
                async move {
                    let result = self
                        .run_setup_list(&cluster_id, Stage::Node, &setups, &node_ids, opts)
                        .await;
                    (node_type, result)
                }
            })
            .buffer_unordered(opts.max_workers.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for (node_type, result) in results {
            match result {
                Ok(()) => {
                    if let Some(node_ids) = targets.get(&node_type) {
                        self.mark_setup_done(cluster_id, &node_type, node_ids).await?;
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn mark_setup_done(
        &self,
        cluster_id: &ClusterId,
        node_type: &str,
        node_ids: &[NodeId],
    ) -> Result<(), ClusterError> {
        for mut node in self.node_store.get_multiple(node_ids).await? {
            node.membership_mut(cluster_id)
                .setup_done
                .insert(node_type.to_owned(), true);
            self.node_store.upsert(&mut node).await?;
        }
        Ok(())
    }

    async fn run_setup_list(
        &self,
        cluster_id: &ClusterId,
        stage: Stage,
        setups: &[NamedSetup],
        node_ids: &[NodeId],
        opts: &SetupOptions,
    ) -> Result<(), ClusterError> {
        if node_ids.is_empty() || setups.is_empty() {
            return Ok(());
        }
        for named in setups {
            info!(
                cluster = %cluster_id,
                %stage,
                setup = %named.name,
                nodes = node_ids.len(),
                "running setup"
            );
            if !self.run_setup(named, node_ids, opts).await {
                return Err(ClusterError::Setup {
                    cluster: cluster_id.clone(),
                    stage,
                    setup: named.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Runs one setup body (role additions, then actions) against the nodes.
    /// Failures are reported as `false`; the caller decides which stage they
    /// abort.
    async fn run_setup(&self, named: &NamedSetup, node_ids: &[NodeId], opts: &SetupOptions) -> bool {
        for role_add in &named.setup.roles {
            if !self.run_role_add(role_add, node_ids).await {
                return false;
            }
        }
        for action in &named.setup.actions {
            if !self.run_action(action, node_ids, opts).await {
                return false;
            }
        }
        true
    }

    async fn run_role_add(&self, role_add: &RoleAdd, node_ids: &[NodeId]) -> bool {
        let (role_name, target) = match role_add.name.split_once('/') {
            Some((role, host)) => (
                role,
                RoleTarget::Hosts(BTreeMap::from([(host.to_owned(), node_ids.to_vec())])),
            ),
            None => (role_add.name.as_str(), RoleTarget::Nodes(node_ids.to_vec())),
        };
        match self
            .role_manager
            .add(role_name, target, &PlaybookVars::default(), &role_add.extra)
            .await
        {
            Ok(added) => node_ids.iter().all(|id| added.contains(id)),
            Err(err) => {
                error!(role = role_name, %err, "role addition failed");
                false
            }
        }
    }

    async fn run_action(&self, action: &Action, node_ids: &[NodeId], opts: &SetupOptions) -> bool {
        match action {
            Action::Command { command } => {
                match self
                    .node_manager
                    .execute(node_ids, command, opts.command_timeout)
                    .await
                {
                    Ok(outcomes) => node_ids
                        .iter()
                        .all(|id| outcomes.get(id).is_some_and(CommandOutcome::succeeded)),
                    Err(err) => {
                        error!(%err, command, "command action failed");
                        false
                    }
                }
            }
            Action::Role { role, action, extra } => {
                let targets = match self.role_manager.role_nodes(role, Some(node_ids)).await {
                    Ok(targets) => targets,
                    Err(err) => {
                        error!(role, %err, "could not resolve role membership");
                        return false;
                    }
                };
                match self
                    .role_manager
                    .action(
                        role,
                        action,
                        Some(RoleTarget::Hosts(targets)),
                        &PlaybookVars::default(),
                        extra,
                    )
                    .await
                {
                    Ok(outcome) => outcome.ok,
                    Err(err) => {
                        error!(role, action, %err, "role action failed");
                        false
                    }
                }
            }
            Action::Playbook { playbook, extra } => {
                match self
                    .node_manager
                    .playbook(Path::new(playbook), node_ids, extra)
                    .await
                {
                    Ok(outcome) => outcome.ok,
                    Err(err) => {
                        error!(playbook, %err, "playbook action failed");
                        false
                    }
                }
            }
        }
    }

    /// Stops (or only untags) all member nodes, then removes the cluster
    /// record when `remove_cluster` is set.
    pub async fn stop(
        &self,
        cluster_id: &ClusterId,
        stop_nodes: bool,
        remove_cluster: bool,
    ) -> Result<Vec<NodeId>, ClusterError> {
        let members = self.members(cluster_id).await?;
        let removed = if members.is_empty() {
            Vec::new()
        } else {
            self.remove_nodes(
                cluster_id,
                &members,
                &RemoveOptions {
                    stop_nodes,
                    remove_cluster_if_empty: false,
                    ..Default::default()
                },
            )
            .await?
        };
        if remove_cluster {
            self.cluster_store.remove(cluster_id).await?;
        }
        info!(cluster = %cluster_id, "cluster stopped");
        Ok(removed)
    }

    pub async fn pause(
        &self,
        cluster_id: &ClusterId,
        opts: &PauseOptions,
    ) -> Result<Vec<NodeId>, ClusterError> {
        let members = self.members(cluster_id).await?;
        Ok(self.node_manager.pause(&members, opts).await?)
    }

    pub async fn resume(
        &self,
        cluster_id: &ClusterId,
        opts: &ResumeOptions,
    ) -> Result<Vec<NodeId>, ClusterError> {
        let members = self.members(cluster_id).await?;
        Ok(self.node_manager.resume(&members, opts).await?)
    }

    pub async fn is_alive(
        &self,
        cluster_id: &ClusterId,
        opts: &AlivenessOptions,
    ) -> Result<BTreeMap<NodeId, bool>, ClusterError> {
        let members = self.members(cluster_id).await?;
        Ok(self.node_manager.is_alive(&members, opts).await?)
    }

    pub async fn execute(
        &self,
        cluster_id: &ClusterId,
        command: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<NodeId, CommandOutcome>, ClusterError> {
        let members = self.members(cluster_id).await?;
        Ok(self.node_manager.execute(&members, command, timeout).await?)
    }

    pub async fn playbook(
        &self,
        cluster_id: &ClusterId,
        playbook: &Path,
        extra: &BTreeMap<String, String>,
    ) -> Result<PlaybookOutcome, ClusterError> {
        let members = self.members(cluster_id).await?;
        Ok(self.node_manager.playbook(playbook, &members, extra).await?)
    }

    /// Re-resolves the cluster's template from disk and replaces the
    /// embedded snapshot.
    pub async fn update_config(&self, cluster_id: &ClusterId) -> Result<(), ClusterError> {
        let templates =
            ClusterTemplates::load(&self.config.template_files, self.config.strict_templates)?;
        let mut cluster = self.cluster(cluster_id).await?;
        cluster.config = templates.cluster(&cluster.config_name)?.clone();
        self.cluster_store.upsert(&mut cluster).await?;
        info!(cluster = %cluster_id, template = %cluster.config_name, "cluster config updated");
        Ok(())
    }

    /// Picks the member node interactive logins should target: the first
    /// node of the `ssh_to` type when the template sets one, any member
    /// otherwise.
    pub async fn ssh_target(&self, cluster_id: &ClusterId) -> Result<NodeId, ClusterError> {
        let cluster = self.cluster(cluster_id).await?;
        if let Some(node_type) = &cluster.config.options.ssh_to {
            let members = self.members_by_type(cluster_id).await?;
            members
                .get(node_type)
                .and_then(|node_ids| node_ids.first())
                .cloned()
                .ok_or_else(|| ClusterError::NoSuchTypeMembers {
                    cluster: cluster_id.clone(),
                    node_type: node_type.clone(),
                })
        } else {
            self.members(cluster_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ClusterError::Empty(cluster_id.clone()))
        }
    }
}
