// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use itertools::Itertools;
use tracing::{error, info, warn};

use flotilla_store::{NodeStore, StoreError};
use flotilla_types::retries::RetryPolicy;
use flotilla_types::{
    random_nickname, GenericError, InstanceDescriptor, Node, NodeId, NodeStatus,
};

use crate::{CommandOutcome, InstanceProvider, Inventory, PlaybookOutcome, PlaybookVars,
    RemoteExecutor};

#[derive(Debug, thiserror::Error)]
pub enum NodeManagerError {
    #[error("unhandled provider: {0}")]
    UnhandledProvider(String),
    #[error("no nodes were started")]
    Deployment,
    #[error("provider {provider} failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: GenericError,
    },
    #[error("remote executor failed: {0}")]
    Executor(#[source] GenericError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pool size used when the caller does not pin one explicitly.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Applies to each provider start call, not the aggregate fan-out.
    pub start_timeout: Duration,
    /// Reachability probe rounds after starting; zero skips the protocol.
    pub connection_retries: usize,
    /// Sleep between probe rounds.
    pub retry_timeout: Duration,
    /// Best-effort stop of nodes that never became reachable.
    pub terminate_not_alive: bool,
    pub max_workers: usize,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(600),
            connection_retries: 15,
            retry_timeout: Duration::from_secs(30),
            terminate_not_alive: false,
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlivenessOptions {
    /// Number of remote probe rounds.
    pub retries: usize,
    /// Sleep between probe rounds.
    pub wait_timeout: Duration,
    /// Applies to each provider status call and each probe dispatch.
    pub update_timeout: Duration,
    pub max_workers: usize,
    pub test_command: String,
}

impl Default for AlivenessOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            wait_timeout: Duration::from_secs(30),
            update_timeout: Duration::from_secs(30),
            max_workers: default_max_workers(),
            test_command: "echo \"OK\"".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopOptions {
    pub timeout: Duration,
    pub max_workers: usize,
    /// Remove confirmed-stopped nodes from the repository.
    pub remove: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            max_workers: default_max_workers(),
            remove: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PauseOptions {
    pub timeout: Duration,
    pub max_workers: usize,
}

impl Default for PauseOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResumeOptions {
    pub timeout: Duration,
    /// Addresses may change across a resume, so the reachability protocol is
    /// re-run afterwards unless this is zero.
    pub connection_retries: usize,
    pub retry_timeout: Duration,
    pub max_workers: usize,
}

impl Default for ResumeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            connection_retries: 10,
            retry_timeout: Duration::from_secs(30),
            max_workers: default_max_workers(),
        }
    }
}

/// Owns all node state transitions. Requests are grouped by provider and
/// dispatched across a bounded worker pool; every transition is persisted
/// before the operation is considered complete.
///
/// Callers must not issue overlapping lifecycle operations against the same
/// node id; this layer does not lock individual nodes. Concurrent callers on
/// disjoint node sets are always safe.
pub struct NodeManager {
    store: NodeStore,
    providers: HashMap<String, Arc<dyn InstanceProvider>>,
    executor: Arc<dyn RemoteExecutor>,
}

impl NodeManager {
    pub fn new(
        store: NodeStore,
        providers: HashMap<String, Arc<dyn InstanceProvider>>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            store,
            providers,
            executor,
        }
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn InstanceProvider>, NodeManagerError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| NodeManagerError::UnhandledProvider(name.to_owned()))
    }

    /// Resolves every node's provider up front, so fan-out tasks never hit an
    /// unknown driver mid-flight.
    fn provider_batches(
        &self,
        nodes: &[Node],
    ) -> Result<Vec<(String, Arc<dyn InstanceProvider>, Vec<Node>)>, NodeManagerError> {
        let mut groups: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for node in nodes {
            groups
                .entry(node.provider_name().to_owned())
                .or_default()
                .push(node.clone());
        }
        groups
            .into_iter()
            .map(|(name, batch)| Ok((name.clone(), self.provider(&name)?, batch)))
            .collect()
    }

    // ---- queries ----------------------------------------------------------

    pub async fn node(&self, node_id: &NodeId) -> Result<Node, NodeManagerError> {
        Ok(self.store.get(node_id).await?)
    }

    pub async fn nodes(&self, node_ids: &[NodeId]) -> Result<Vec<Node>, NodeManagerError> {
        Ok(self.store.get_multiple(node_ids).await?)
    }

    pub async fn all_nodes(&self) -> Result<Vec<Node>, NodeManagerError> {
        Ok(self.store.all().await?)
    }

    pub async fn nodes_matching<F>(&self, filter: F) -> Result<Vec<Node>, NodeManagerError>
    where
        F: Fn(&Node) -> bool,
    {
        Ok(self.store.matching(filter).await?)
    }

    pub async fn reachable_nodes(&self) -> Result<Vec<Node>, NodeManagerError> {
        self.nodes_matching(|n| n.status == NodeStatus::Reachable)
            .await
    }

    pub async fn up_nodes(&self) -> Result<Vec<Node>, NodeManagerError> {
        self.nodes_matching(|n| n.status.is_up()).await
    }

    pub async fn not_running_nodes(&self) -> Result<Vec<Node>, NodeManagerError> {
        self.nodes_matching(|n| !n.status.is_up()).await
    }

    pub async fn nodes_with_tag(&self, key: &str) -> Result<Vec<Node>, NodeManagerError> {
        self.nodes_matching(|n| n.has_tag(key)).await
    }

    pub async fn nodes_with_tag_value(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Node>, NodeManagerError> {
        self.nodes_matching(|n| n.has_tag_value(key, value)).await
    }

    // ---- provisioning -----------------------------------------------------

    /// Starts `count` instances of the descriptor's template and persists a
    /// node record for every instance the provider reported. No node is left
    /// in flight: the records are durable before this returns.
    pub async fn start(
        &self,
        descriptor: &InstanceDescriptor,
        count: u32,
        timeout: Duration,
    ) -> Result<Vec<NodeId>, NodeManagerError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let provider_name = descriptor.provider_name().to_owned();
        let provider = self.provider(&provider_name)?;
        let started = provider
            .start_instances(descriptor, count, timeout)
            .await
            .map_err(|source| NodeManagerError::Provider {
                provider: provider_name.clone(),
                source,
            })?;

        let mut in_use: HashSet<String> = self
            .all_nodes()
            .await?
            .into_iter()
            .map(|n| n.nickname)
            .collect();

        let mut node_ids = Vec::with_capacity(started.len());
        for instance in started {
            let node_id = self.store.allocate_id().await?;
            let mut node = Node::new(node_id.clone(), descriptor.clone());
            node.nickname = random_nickname(&in_use);
            in_use.insert(node.nickname.clone());
            node.kind = instance.kind;
            node.cloud_instance_id = instance.cloud_instance_id;
            node.ip = instance.ip;
            node.cloud_lifecycle = instance.cloud_lifecycle;
            node.status = instance.status;
            node.extra = instance.extra;
            self.store.upsert(&mut node).await?;
            node_ids.push(node_id);
        }
        info!(
            provider = %provider_name,
            instance = descriptor.instance_config_id(),
            count = node_ids.len(),
            "started nodes"
        );
        Ok(node_ids)
    }

    /// Starts several instance batches, dispatching concurrently across the
    /// worker pool. A batch that fails is logged and contributes no nodes;
    /// the call fails with [`NodeManagerError::Deployment`] only when nothing
    /// started at all. When `connection_retries > 0` the reachability
    /// protocol runs on the new nodes, and with `terminate_not_alive` set,
    /// nodes that never became reachable are stopped (best-effort cleanup,
    /// not a transaction) and excluded from the result.
    pub async fn start_many(
        &self,
        requests: &[(InstanceDescriptor, u32)],
        opts: &StartOptions,
    ) -> Result<Vec<NodeId>, NodeManagerError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for (descriptor, _) in requests {
            self.provider(descriptor.provider_name())?;
        }

        let mut started: Vec<NodeId> = stream::iter(requests)
            .map(|(descriptor, count)| async move {
                match self.start(descriptor, *count, opts.start_timeout).await {
                    Ok(ids) => ids,
                    Err(err) => {
                        error!(
                            instance = descriptor.instance_config_id(),
                            %err,
                            "failed to start instances"
                        );
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(opts.max_workers.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        if started.is_empty() {
            return Err(NodeManagerError::Deployment);
        }
        info!(
            "started {} nodes: {}",
            started.len(),
            started.iter().sorted().join(", ")
        );

        if opts.connection_retries > 0 {
            let alive = self
                .is_alive(
                    &started,
                    &AlivenessOptions {
                        retries: opts.connection_retries,
                        wait_timeout: opts.retry_timeout,
                        max_workers: opts.max_workers,
                        ..Default::default()
                    },
                )
                .await?;
            let not_alive: Vec<NodeId> = alive
                .iter()
                .filter(|(_, reachable)| !**reachable)
                .map(|(id, _)| id.clone())
                .collect();
            if opts.terminate_not_alive && !not_alive.is_empty() {
                warn!(
                    "nodes {} are not alive and are being terminated",
                    not_alive.iter().sorted().join(", ")
                );
                self.stop(
                    &not_alive,
                    &StopOptions {
                        max_workers: opts.max_workers,
                        ..Default::default()
                    },
                )
                .await?;
                started.retain(|id| !not_alive.contains(id));
            }
        }

        Ok(started)
    }

    /// Two-phase reachability check. Phase 1 refreshes authoritative status
    /// from each provider (grouped, concurrent); nodes not in a
    /// running-equivalent state are immediately reported not alive. Phase 2
    /// probes the ambiguous subset with a lightweight remote command for up
    /// to `retries` rounds, re-testing only the still-unreachable nodes each
    /// round and stopping early once none remain. Every status change is
    /// persisted as it happens, so a crash mid-protocol loses nothing.
    pub async fn is_alive(
        &self,
        node_ids: &[NodeId],
        opts: &AlivenessOptions,
    ) -> Result<BTreeMap<NodeId, bool>, NodeManagerError> {
        if node_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let nodes = self.nodes(node_ids).await?;
        let batches = self.provider_batches(&nodes)?;

        let results: Vec<Result<Vec<Node>, NodeManagerError>> = stream::iter(batches)
            .map(|(name, provider, batch)| {
                let timeout = opts.update_timeout;
                async move {
                    provider
                        .update_status(&batch, timeout)
                        .await
                        .map_err(|source| NodeManagerError::Provider {
                            provider: name,
                            source,
                        })
                }
            })
            .buffer_unordered(opts.max_workers.max(1))
            .collect()
            .await;

        let mut statuses: BTreeMap<NodeId, NodeStatus> = BTreeMap::new();
        for result in results {
            for mut node in result? {
                self.store.upsert(&mut node).await?;
                statuses.insert(node.node_id.clone(), node.status);
            }
        }

        // Not alive until proven reachable, including nodes the provider did
        // not report back.
        let mut alive: BTreeMap<NodeId, bool> =
            node_ids.iter().map(|id| (id.clone(), false)).collect();

        let mut pending: Vec<NodeId> = statuses
            .iter()
            .filter(|(_, status)| status.probeable())
            .map(|(id, _)| id.clone())
            .collect();
        if pending.is_empty() || opts.retries == 0 {
            return Ok(alive);
        }

        let mut delays = RetryPolicy::fixed_delay(opts.wait_timeout, Some(opts.retries)).iter();
        for round in 1..=opts.retries {
            info!(
                round,
                retries = opts.retries,
                "checking whether nodes {} are alive",
                pending.iter().sorted().join(", ")
            );
            let batch = self.store.get_multiple(&pending).await?;
            let outcomes = self
                .executor
                .run_command(&batch, &opts.test_command, opts.update_timeout)
                .await
                .map_err(NodeManagerError::Executor)?;

            for mut node in batch {
                match outcomes.get(&node.node_id) {
                    Some(outcome @ CommandOutcome::Completed(_)) if outcome.succeeded() => {
                        node.status = NodeStatus::Reachable;
                        self.store.upsert(&mut node).await?;
                        alive.insert(node.node_id.clone(), true);
                        pending.retain(|id| id != &node.node_id);
                    }
                    Some(CommandOutcome::Completed(_)) => {
                        node.status = NodeStatus::Unreachable;
                        self.store.upsert(&mut node).await?;
                    }
                    Some(CommandOutcome::Failed { error }) => {
                        error!(node = %node.node_id, %error, "error executing reachability probe");
                    }
                    None => {}
                }
            }

            if pending.is_empty() || round == opts.retries {
                break;
            }
            info!(
                "nodes {} are unreachable, probing again in {:?}",
                pending.iter().sorted().join(", "),
                opts.wait_timeout
            );
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(alive)
    }

    /// Stops nodes, grouped by provider. Individual failures are logged, not
    /// raised; the returned set holds the nodes that actually stopped. Those
    /// are removed from the repository unless `remove` is unset.
    pub async fn stop(
        &self,
        node_ids: &[NodeId],
        opts: &StopOptions,
    ) -> Result<Vec<NodeId>, NodeManagerError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let nodes = self.nodes(node_ids).await?;
        let batches = self.provider_batches(&nodes)?;

        let stopped: Vec<Node> = stream::iter(batches)
            .map(|(name, provider, batch)| {
                let timeout = opts.timeout;
                async move {
                    match provider.stop_instances(&batch, timeout).await {
                        Ok(nodes) => nodes,
                        Err(err) => {
                            error!(provider = %name, %err, "failed to stop instances");
                            Vec::new()
                        }
                    }
                }
            })
            .buffer_unordered(opts.max_workers.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut stopped_ids = Vec::with_capacity(stopped.len());
        for mut node in stopped {
            node.status = NodeStatus::Stopped;
            self.store.upsert(&mut node).await?;
            stopped_ids.push(node.node_id.clone());
        }

        if stopped_ids.len() == node_ids.len() {
            info!(
                "nodes {} were successfully stopped",
                stopped_ids.iter().sorted().join(", ")
            );
        } else {
            let missing: BTreeSet<&NodeId> = node_ids
                .iter()
                .filter(|id| !stopped_ids.contains(id))
                .collect();
            warn!(
                "some nodes were not successfully stopped: {}",
                missing.iter().join(", ")
            );
        }

        if opts.remove {
            self.store.remove_multiple(&stopped_ids).await?;
        }
        Ok(stopped_ids)
    }

    pub async fn pause(
        &self,
        node_ids: &[NodeId],
        opts: &PauseOptions,
    ) -> Result<Vec<NodeId>, NodeManagerError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let nodes = self.nodes(node_ids).await?;
        let batches = self.provider_batches(&nodes)?;

        let results: Vec<Result<Vec<Node>, NodeManagerError>> = stream::iter(batches)
            .map(|(name, provider, batch)| {
                let timeout = opts.timeout;
                async move {
                    provider.pause_instances(&batch, timeout).await.map_err(
                        |source| NodeManagerError::Provider {
                            provider: name,
                            source,
                        },
                    )
                }
            })
            .buffer_unordered(opts.max_workers.max(1))
            .collect()
            .await;

        let mut paused_ids = Vec::new();
        for result in results {
            for mut node in result? {
                self.store.upsert(&mut node).await?;
                paused_ids.push(node.node_id.clone());
            }
        }
        info!(
            "nodes {} were successfully paused",
            paused_ids.iter().sorted().join(", ")
        );
        Ok(paused_ids)
    }

    pub async fn resume(
        &self,
        node_ids: &[NodeId],
        opts: &ResumeOptions,
    ) -> Result<Vec<NodeId>, NodeManagerError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let nodes = self.nodes(node_ids).await?;
        let batches = self.provider_batches(&nodes)?;

        let results: Vec<Result<Vec<Node>, NodeManagerError>> = stream::iter(batches)
            .map(|(name, provider, batch)| {
                let timeout = opts.timeout;
                async move {
                    provider.resume_instances(&batch, timeout).await.map_err(
                        |source| NodeManagerError::Provider {
                            provider: name,
                            source,
                        },
                    )
                }
            })
            .buffer_unordered(opts.max_workers.max(1))
            .collect()
            .await;

        let mut resumed_ids = Vec::new();
        for result in results {
            for mut node in result? {
                self.store.upsert(&mut node).await?;
                resumed_ids.push(node.node_id.clone());
            }
        }
        info!(
            "nodes {} were successfully resumed",
            resumed_ids.iter().sorted().join(", ")
        );

        if opts.connection_retries > 0 {
            self.is_alive(
                &resumed_ids,
                &AlivenessOptions {
                    retries: opts.connection_retries,
                    wait_timeout: opts.retry_timeout,
                    max_workers: opts.max_workers,
                    ..Default::default()
                },
            )
            .await?;
        }
        Ok(resumed_ids)
    }

    // ---- tags -------------------------------------------------------------

    pub async fn add_tags(
        &self,
        node_ids: &[NodeId],
        tags: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<(), NodeManagerError> {
        if node_ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        for mut node in self.nodes(node_ids).await? {
            for (key, values) in tags {
                node.tags
                    .entry(key.clone())
                    .or_default()
                    .extend(values.iter().cloned());
            }
            self.store.upsert(&mut node).await?;
        }
        Ok(())
    }

    pub async fn remove_tags(
        &self,
        node_ids: &[NodeId],
        keys: &[String],
    ) -> Result<(), NodeManagerError> {
        if node_ids.is_empty() || keys.is_empty() {
            return Ok(());
        }
        for mut node in self.nodes(node_ids).await? {
            for key in keys {
                node.tags.remove(key);
            }
            self.store.upsert(&mut node).await?;
        }
        Ok(())
    }

    // ---- remote execution -------------------------------------------------

    pub async fn execute(
        &self,
        node_ids: &[NodeId],
        command: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<NodeId, CommandOutcome>, NodeManagerError> {
        let nodes = self.nodes(node_ids).await?;
        self.executor
            .run_command(&nodes, command, timeout)
            .await
            .map_err(NodeManagerError::Executor)
    }

    pub async fn playbook(
        &self,
        playbook: &Path,
        node_ids: &[NodeId],
        extra: &BTreeMap<String, String>,
    ) -> Result<PlaybookOutcome, NodeManagerError> {
        let nodes = self.nodes(node_ids).await?;
        let inventory: Inventory = BTreeMap::from([("all".to_owned(), nodes)]);
        self.executor
            .run_playbook(playbook, &inventory, &PlaybookVars::default(), extra)
            .await
            .map_err(NodeManagerError::Executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_descriptor, MockExecutor, MockProvider};
    use flotilla_store::InMemoryRepository;

    fn manager(
        provider: Arc<MockProvider>,
        executor: Arc<MockExecutor>,
    ) -> NodeManager {
        let store = NodeStore::new(Arc::new(InMemoryRepository::new()));
        NodeManager::new(
            store,
            HashMap::from([("aws".to_owned(), provider as Arc<dyn InstanceProvider>)]),
            executor,
        )
    }

    fn fast_aliveness(retries: usize) -> AlivenessOptions {
        AlivenessOptions {
            retries,
            wait_timeout: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn start_with_unknown_provider_fails() {
        let manager = manager(MockProvider::new(), MockExecutor::new());
        let mut descriptor = test_descriptor("type-a");
        descriptor.provider.provider = "azure".to_owned();

        let err = manager
            .start(&descriptor, 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeManagerError::UnhandledProvider(p) if p == "azure"));
    }

    #[test_log::test(tokio::test)]
    async fn start_persists_every_reported_node() {
        let provider = MockProvider::new();
        let manager = manager(provider, MockExecutor::new());

        let ids = manager
            .start(&test_descriptor("type-a"), 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let nodes = manager.nodes(&ids).await.unwrap();
        let nicknames: HashSet<_> = nodes.iter().map(|n| n.nickname.clone()).collect();
        assert_eq!(nicknames.len(), 3);
        for node in nodes {
            assert_eq!(node.status, NodeStatus::Started);
            assert!(node.ip.is_some());
        }
    }

    #[test_log::test(tokio::test)]
    async fn start_zero_is_a_noop() {
        let provider = MockProvider::new();
        let manager = manager(provider.clone(), MockExecutor::new());
        let ids = manager
            .start(&test_descriptor("type-a"), 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(provider.start_calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn start_many_with_nothing_started_is_a_deployment_error() {
        let provider = MockProvider::new();
        provider.fail_starts(true);
        let manager = manager(provider, MockExecutor::new());

        let err = manager
            .start_many(
                &[(test_descriptor("type-a"), 2)],
                &StartOptions {
                    connection_retries: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeManagerError::Deployment));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn start_many_terminates_nodes_that_never_become_reachable() {
        let provider = MockProvider::new();
        let executor = MockExecutor::new();
        let manager = manager(provider.clone(), executor.clone());

        // Nothing is reachable until we say so; make every probe fail.
        executor.fail_all_commands(1);

        let started = manager
            .start_many(
                &[(test_descriptor("type-a"), 2)],
                &StartOptions {
                    connection_retries: 2,
                    retry_timeout: Duration::from_millis(5),
                    terminate_not_alive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(started.is_empty());
        assert_eq!(provider.stopped().len(), 2);
        assert!(manager.all_nodes().await.unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn is_alive_reports_stopped_nodes_without_probing() {
        let provider = MockProvider::new();
        let executor = MockExecutor::new();
        let manager = manager(provider.clone(), executor.clone());

        let ids = manager
            .start(&test_descriptor("type-a"), 2, Duration::from_secs(1))
            .await
            .unwrap();
        for id in &ids {
            provider.report_status(id.clone(), NodeStatus::Stopped);
        }

        let alive = manager.is_alive(&ids, &fast_aliveness(5)).await.unwrap();
        assert!(alive.values().all(|reachable| !reachable));
        assert_eq!(executor.command_calls().len(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn aliveness_rounds_retest_only_the_unreachable_subset() {
        let provider = MockProvider::new();
        let executor = MockExecutor::new();
        let manager = manager(provider, executor.clone());

        let ids = manager
            .start(&test_descriptor("type-a"), 2, Duration::from_secs(1))
            .await
            .unwrap();
        let (first, second) = (ids[0].clone(), ids[1].clone());

        // first answers immediately, second only on the second round
        executor.script_exit_codes(second.clone(), vec![1, 0]);

        let alive = manager.is_alive(&ids, &fast_aliveness(3)).await.unwrap();
        assert!(alive[&first]);
        assert!(alive[&second]);

        let calls = executor.command_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, vec![first.clone(), second.clone()]);
        assert_eq!(calls[1].0, vec![second.clone()]);

        for id in &ids {
            assert_eq!(
                manager.node(id).await.unwrap().status,
                NodeStatus::Reachable
            );
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn aliveness_persists_unreachable_status_each_round() {
        let provider = MockProvider::new();
        let executor = MockExecutor::new();
        let manager = manager(provider, executor.clone());

        let ids = manager
            .start(&test_descriptor("type-a"), 1, Duration::from_secs(1))
            .await
            .unwrap();
        executor.script_exit_codes(ids[0].clone(), vec![1, 1]);

        let alive = manager.is_alive(&ids, &fast_aliveness(2)).await.unwrap();
        assert!(!alive[&ids[0]]);
        assert_eq!(
            manager.node(&ids[0]).await.unwrap().status,
            NodeStatus::Unreachable
        );
    }

    #[test_log::test(tokio::test)]
    async fn stop_removes_confirmed_nodes() {
        let provider = MockProvider::new();
        let manager = manager(provider, MockExecutor::new());

        let ids = manager
            .start(&test_descriptor("type-a"), 2, Duration::from_secs(1))
            .await
            .unwrap();
        let stopped = manager.stop(&ids, &StopOptions::default()).await.unwrap();
        assert_eq!(stopped.len(), 2);
        assert!(manager.all_nodes().await.unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn stop_failure_is_logged_not_raised() {
        let provider = MockProvider::new();
        let manager = manager(provider.clone(), MockExecutor::new());

        let ids = manager
            .start(&test_descriptor("type-a"), 2, Duration::from_secs(1))
            .await
            .unwrap();
        provider.fail_stops(true);

        let stopped = manager.stop(&ids, &StopOptions::default()).await.unwrap();
        assert!(stopped.is_empty());
        assert_eq!(manager.all_nodes().await.unwrap().len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn pause_then_resume_runs_the_reachability_protocol_again() {
        let provider = MockProvider::new();
        let executor = MockExecutor::new();
        let manager = manager(provider, executor.clone());

        let ids = manager
            .start(&test_descriptor("type-a"), 1, Duration::from_secs(1))
            .await
            .unwrap();
        manager.pause(&ids, &PauseOptions::default()).await.unwrap();
        assert_eq!(
            manager.node(&ids[0]).await.unwrap().status,
            NodeStatus::Paused
        );

        manager
            .resume(
                &ids,
                &ResumeOptions {
                    connection_retries: 1,
                    retry_timeout: Duration::from_millis(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // the resume-triggered probe confirmed the node
        assert_eq!(
            manager.node(&ids[0]).await.unwrap().status,
            NodeStatus::Reachable
        );
        assert_eq!(executor.command_calls().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn tag_maintenance() {
        let provider = MockProvider::new();
        let manager = manager(provider, MockExecutor::new());
        let ids = manager
            .start(&test_descriptor("type-a"), 1, Duration::from_secs(1))
            .await
            .unwrap();

        let tags = BTreeMap::from([(
            "team".to_owned(),
            BTreeSet::from(["hpc".to_owned()]),
        )]);
        manager.add_tags(&ids, &tags).await.unwrap();
        assert!(manager.node(&ids[0]).await.unwrap().has_tag_value("team", "hpc"));
        assert_eq!(manager.nodes_with_tag("team").await.unwrap().len(), 1);

        manager
            .remove_tags(&ids, &["team".to_owned()])
            .await
            .unwrap();
        assert!(!manager.node(&ids[0]).await.unwrap().has_tag("team"));
    }
}
