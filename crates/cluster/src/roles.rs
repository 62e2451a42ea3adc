// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Role membership and action dispatch.
//!
//! A role is a logical membership category with named playbook-backed
//! actions. Actions only ever run against nodes that were actually added to
//! the addressed role/host; stale or hand-edited membership is a hard error,
//! never silently skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use flotilla_node::{PlaybookOutcome, PlaybookVars, RemoteExecutor};
use flotilla_store::{NodeStore, StoreError};
use flotilla_types::{GenericError, NodeId, RoleDefinition, SETUP_ACTION};

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("invalid role named: {0}")]
    InvalidRole(String),
    #[error("invalid action '{action}' for role {role}")]
    InvalidAction { role: String, action: String },
    #[error("invalid host '{host}' for role '{role}'")]
    InvalidHost { role: String, host: String },
    #[error("invalid hosts {hosts:?} for role {role}")]
    InvalidTarget { role: String, hosts: Vec<String> },
    #[error("node {node_id} does not belong to {role}")]
    NodeRole { node_id: NodeId, role: String },
    #[error("missing the required variable '{var}' for action '{action}' of role '{role}'")]
    MissingActionVariable {
        role: String,
        action: String,
        var: String,
    },
    #[error("setup action failed for role {role}, nodes were not assigned")]
    Assignment { role: String },
    #[error("failed to load role definitions: {0}")]
    Load(#[source] GenericError),
    #[error("remote executor failed: {0}")]
    Executor(#[source] GenericError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Addressed nodes for an add/action/remove call: either a bare node list,
/// or an explicit host → nodes map for roles that declare sub-hosts.
#[derive(Debug, Clone)]
pub enum RoleTarget {
    Nodes(Vec<NodeId>),
    Hosts(BTreeMap<String, Vec<NodeId>>),
}

impl From<Vec<NodeId>> for RoleTarget {
    fn from(nodes: Vec<NodeId>) -> Self {
        RoleTarget::Nodes(nodes)
    }
}

impl From<BTreeMap<String, Vec<NodeId>>> for RoleTarget {
    fn from(hosts: BTreeMap<String, Vec<NodeId>>) -> Self {
        RoleTarget::Hosts(hosts)
    }
}

/// Maintains the node ↔ role/host membership relation and dispatches named
/// actions against it.
pub struct RoleManager {
    store: NodeStore,
    executor: Arc<dyn RemoteExecutor>,
    /// Playbook paths in role definitions are resolved relative to this.
    roles_dir: PathBuf,
    roles: BTreeMap<String, RoleDefinition>,
}

impl RoleManager {
    /// Loads role definitions from a directory of YAML files (file stem =
    /// role name). Invalid files are dropped with a logged error, or fail
    /// the load in strict mode.
    pub fn load(
        store: NodeStore,
        executor: Arc<dyn RemoteExecutor>,
        roles_dir: impl Into<PathBuf>,
        actions_dir: &Path,
        strict: bool,
    ) -> Result<Self, RoleError> {
        let mut roles = BTreeMap::new();
        let entries =
            std::fs::read_dir(actions_dir).map_err(|err| RoleError::Load(err.into()))?;
        for entry in entries {
            let path = entry.map_err(|err| RoleError::Load(err.into()))?.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "yml" | "yaml"));
            if !is_yaml {
                continue;
            }
            let Some(role_name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match read_role(&path) {
                Ok(role) => {
                    roles.insert(role_name.to_owned(), role);
                }
                Err(err) if strict => return Err(err),
                Err(err) => {
                    error!(role = role_name, %err, "discarding role definition");
                }
            }
        }
        Ok(Self {
            store,
            executor,
            roles_dir: roles_dir.into(),
            roles,
        })
    }

    pub fn roles(&self) -> &BTreeMap<String, RoleDefinition> {
        &self.roles
    }

    fn role(&self, role_name: &str) -> Result<&RoleDefinition, RoleError> {
        self.roles
            .get(role_name)
            .ok_or_else(|| RoleError::InvalidRole(role_name.to_owned()))
    }

    /// Current membership of the role, keyed by host (or by the role name
    /// itself for host-less roles), optionally restricted to a node subset.
    pub async fn role_nodes(
        &self,
        role_name: &str,
        from_node_ids: Option<&[NodeId]>,
    ) -> Result<BTreeMap<String, Vec<NodeId>>, RoleError> {
        let role = self.role(role_name)?;
        let restrict = |id: &NodeId| from_node_ids.map_or(true, |subset| subset.contains(id));

        let mut result = BTreeMap::new();
        if role.hosts.is_empty() {
            let members = self
                .store
                .matching(|n| n.in_role(role_name) && restrict(&n.node_id))
                .await?;
            result.insert(
                role_name.to_owned(),
                members.into_iter().map(|n| n.node_id).collect(),
            );
        } else {
            for host in &role.hosts {
                let members = self
                    .store
                    .matching(|n| n.in_role_host(role_name, host) && restrict(&n.node_id))
                    .await?;
                result.insert(
                    host.clone(),
                    members.into_iter().map(|n| n.node_id).collect(),
                );
            }
        }
        Ok(result)
    }

    /// Expands the target into a host → node-ids inventory, validating host
    /// names against the role definition. Host-less roles map the whole set
    /// under the role name itself.
    fn resolve_target(
        &self,
        role_name: &str,
        role: &RoleDefinition,
        target: RoleTarget,
    ) -> Result<BTreeMap<String, Vec<NodeId>>, RoleError> {
        match (role.hosts.is_empty(), target) {
            (true, RoleTarget::Nodes(nodes)) => {
                Ok(BTreeMap::from([(role_name.to_owned(), nodes)]))
            }
            (true, RoleTarget::Hosts(map)) => {
                if map.len() != 1 || !map.contains_key(role_name) {
                    return Err(RoleError::InvalidTarget {
                        role: role_name.to_owned(),
                        hosts: map.keys().cloned().collect(),
                    });
                }
                Ok(map)
            }
            (false, RoleTarget::Nodes(nodes)) => Ok(role
                .hosts
                .iter()
                .map(|host| (host.clone(), nodes.clone()))
                .collect()),
            (false, RoleTarget::Hosts(map)) => {
                for host in map.keys() {
                    if !role.hosts.contains(host) {
                        return Err(RoleError::InvalidHost {
                            role: role_name.to_owned(),
                            host: host.clone(),
                        });
                    }
                }
                Ok(map)
            }
        }
    }

    /// Adds nodes to the role. When the role declares a `setup` action it is
    /// executed first and must succeed for every addressed host; membership
    /// is never granted on a partially-successful setup.
    pub async fn add(
        &self,
        role_name: &str,
        target: RoleTarget,
        vars: &PlaybookVars,
        extra: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeId>, RoleError> {
        let role = self.role(role_name)?.clone();
        let inventory = self.resolve_target(role_name, &role, target)?;

        if role.has_setup() {
            let outcome = self
                .dispatch(role_name, &role, SETUP_ACTION, &inventory, vars, extra)
                .await?;
            if !outcome.ok || outcome.ret_code != 0 || !outcome.all_hosts_ok() {
                return Err(RoleError::Assignment {
                    role: role_name.to_owned(),
                });
            }
        }

        let mut added = BTreeSet::new();
        for (host, node_ids) in &inventory {
            for mut node in self.store.get_multiple(node_ids).await? {
                let hosts = node.roles.entry(role_name.to_owned()).or_default();
                if host != role_name {
                    hosts.insert(host.clone());
                }
                self.store.upsert(&mut node).await?;
                added.insert(node.node_id);
            }
        }
        info!(
            role = role_name,
            count = added.len(),
            "added nodes to role"
        );
        Ok(added.into_iter().collect())
    }

    /// Runs a named action against the role. With no target given, the
    /// current membership is addressed. Every addressed node must actually
    /// carry the role/host membership marker, and every non-optional action
    /// variable must be present in `extra`.
    pub async fn action(
        &self,
        role_name: &str,
        action_name: &str,
        target: Option<RoleTarget>,
        vars: &PlaybookVars,
        extra: &BTreeMap<String, String>,
    ) -> Result<PlaybookOutcome, RoleError> {
        let role = self.role(role_name)?.clone();
        let action = role
            .actions
            .get(action_name)
            .ok_or_else(|| RoleError::InvalidAction {
                role: role_name.to_owned(),
                action: action_name.to_owned(),
            })?;

        let inventory = match target {
            Some(target) => self.resolve_target(role_name, &role, target)?,
            None => self.role_nodes(role_name, None).await?,
        };

        for (host, node_ids) in &inventory {
            for node in self.store.get_multiple(node_ids).await? {
                let member = if host == role_name {
                    node.in_role(role_name)
                } else {
                    node.in_role_host(role_name, host)
                };
                if !member {
                    let role = if host == role_name {
                        role_name.to_owned()
                    } else {
                        format!("{role_name}/{host}")
                    };
                    return Err(RoleError::NodeRole {
                        node_id: node.node_id,
                        role,
                    });
                }
            }
        }

        for var in action.required_vars() {
            if !extra.contains_key(&var.name) {
                return Err(RoleError::MissingActionVariable {
                    role: role_name.to_owned(),
                    action: action_name.to_owned(),
                    var: var.name.clone(),
                });
            }
        }

        self.dispatch(role_name, &role, action_name, &inventory, vars, extra)
            .await
    }

    /// Strips role membership. A node left with zero hosts for the role is
    /// fully removed from its membership map.
    pub async fn remove(
        &self,
        role_name: &str,
        target: RoleTarget,
    ) -> Result<Vec<NodeId>, RoleError> {
        let role = self.role(role_name)?.clone();
        let inventory = self.resolve_target(role_name, &role, target)?;

        let mut removed = BTreeSet::new();
        for (host, node_ids) in &inventory {
            for mut node in self.store.get_multiple(node_ids).await? {
                let fully_removed = match node.roles.get_mut(role_name) {
                    None => continue,
                    Some(hosts) => {
                        if host != role_name {
                            hosts.remove(host);
                        }
                        host == role_name || hosts.is_empty()
                    }
                };
                if fully_removed {
                    node.roles.remove(role_name);
                }
                self.store.upsert(&mut node).await?;
                removed.insert(node.node_id);
            }
        }
        Ok(removed.into_iter().collect())
    }

    async fn dispatch(
        &self,
        role_name: &str,
        role: &RoleDefinition,
        action_name: &str,
        inventory_ids: &BTreeMap<String, Vec<NodeId>>,
        vars: &PlaybookVars,
        extra: &BTreeMap<String, String>,
    ) -> Result<PlaybookOutcome, RoleError> {
        let action = role
            .actions
            .get(action_name)
            .ok_or_else(|| RoleError::InvalidAction {
                role: role_name.to_owned(),
                action: action_name.to_owned(),
            })?;
        let mut inventory = BTreeMap::new();
        for (host, node_ids) in inventory_ids {
            inventory.insert(host.clone(), self.store.get_multiple(node_ids).await?);
        }
        let playbook = self.roles_dir.join(&action.playbook);
        info!(
            role = role_name,
            action = action_name,
            playbook = %playbook.display(),
            "executing role action"
        );
        self.executor
            .run_playbook(&playbook, &inventory, vars, extra)
            .await
            .map_err(RoleError::Executor)
    }
}

fn read_role(path: &Path) -> Result<RoleDefinition, RoleError> {
    let content = std::fs::read_to_string(path).map_err(|err| RoleError::Load(err.into()))?;
    serde_yaml::from_str(&content).map_err(|err| RoleError::Load(err.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use flotilla_node::test_util::{test_descriptor, MockExecutor};
    use flotilla_store::InMemoryRepository;
    use flotilla_types::Node;

    const SPITS_ROLE: &str = r#"
actions:
  setup:
    playbook: roles/spits/setup.yml
  start:
    playbook: roles/spits/start.yml
    vars:
      - name: job_id
      - name: verbosity
        optional: true
hosts:
  - jobmanager
  - taskmanager
"#;

    const COMMANDS_ROLE: &str = r#"
actions:
  install-packages:
    playbook: roles/commands/install.yml
    vars:
      - name: packages
"#;

    struct Fixture {
        manager: RoleManager,
        executor: Arc<MockExecutor>,
        store: NodeStore,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let actions_dir = dir.path().join("actions.d");
        std::fs::create_dir_all(&actions_dir).unwrap();
        for (name, content) in [("spits.yml", SPITS_ROLE), ("commands-common.yml", COMMANDS_ROLE)]
        {
            let mut file = std::fs::File::create(actions_dir.join(name)).unwrap();
            file.write_all(content.as_bytes()).unwrap();
        }

        let store = NodeStore::new(Arc::new(InMemoryRepository::new()));
        let executor = MockExecutor::new();
        let manager = RoleManager::load(
            store.clone(),
            executor.clone(),
            dir.path().join("roles"),
            &actions_dir,
            true,
        )
        .unwrap();
        Fixture {
            manager,
            executor,
            store,
            _dir: dir,
        }
    }

    async fn persist_nodes(store: &NodeStore, count: usize) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let id = store.allocate_id().await.unwrap();
            let mut node = Node::new(id.clone(), test_descriptor("type-a"));
            store.upsert(&mut node).await.unwrap();
            ids.push(id);
        }
        ids
    }

    #[test_log::test(tokio::test)]
    async fn load_discards_invalid_definitions_unless_strict() {
        let dir = tempfile::tempdir().unwrap();
        let actions_dir = dir.path().join("actions.d");
        std::fs::create_dir_all(&actions_dir).unwrap();
        std::fs::write(actions_dir.join("good.yml"), COMMANDS_ROLE).unwrap();
        std::fs::write(actions_dir.join("broken.yml"), "actions: [nope]").unwrap();

        let store = NodeStore::new(Arc::new(InMemoryRepository::new()));
        let manager = RoleManager::load(
            store.clone(),
            MockExecutor::new(),
            dir.path().join("roles"),
            &actions_dir,
            false,
        )
        .unwrap();
        assert!(manager.roles().contains_key("good"));
        assert!(!manager.roles().contains_key("broken"));

        assert!(RoleManager::load(
            store,
            MockExecutor::new(),
            dir.path().join("roles"),
            &actions_dir,
            true,
        )
        .is_err());
    }

    #[test_log::test(tokio::test)]
    async fn add_then_action_succeeds_for_hostless_role() {
        let f = fixture().await;
        let ids = persist_nodes(&f.store, 2).await;

        let added = f
            .manager
            .add(
                "commands-common",
                RoleTarget::Nodes(ids.clone()),
                &PlaybookVars::default(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(added.len(), 2);
        for id in &ids {
            assert!(f.store.get(id).await.unwrap().in_role("commands-common"));
        }

        let outcome = f
            .manager
            .action(
                "commands-common",
                "install-packages",
                Some(RoleTarget::Nodes(ids.clone())),
                &PlaybookVars::default(),
                &BTreeMap::from([("packages".to_owned(), "gcc".to_owned())]),
            )
            .await
            .unwrap();
        assert!(outcome.ok);

        let call = &f.executor.playbook_calls()[0];
        assert!(call.playbook.ends_with("roles/commands/install.yml"));
        assert_eq!(call.inventory["commands-common"], ids);
    }

    #[test_log::test(tokio::test)]
    async fn action_against_non_member_is_a_hard_error() {
        let f = fixture().await;
        let ids = persist_nodes(&f.store, 1).await;

        let err = f
            .manager
            .action(
                "commands-common",
                "install-packages",
                Some(RoleTarget::Nodes(ids)),
                &PlaybookVars::default(),
                &BTreeMap::from([("packages".to_owned(), "gcc".to_owned())]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoleError::NodeRole { .. }));
        assert!(f.executor.playbook_calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn action_requires_declared_variables() {
        let f = fixture().await;
        let ids = persist_nodes(&f.store, 1).await;
        f.manager
            .add(
                "commands-common",
                RoleTarget::Nodes(ids.clone()),
                &PlaybookVars::default(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        let err = f
            .manager
            .action(
                "commands-common",
                "install-packages",
                Some(RoleTarget::Nodes(ids)),
                &PlaybookVars::default(),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, RoleError::MissingActionVariable { var, .. } if var == "packages")
        );
    }

    #[test_log::test(tokio::test)]
    async fn add_validates_host_names() {
        let f = fixture().await;
        let ids = persist_nodes(&f.store, 1).await;

        let err = f
            .manager
            .add(
                "spits",
                RoleTarget::Hosts(BTreeMap::from([("gateway".to_owned(), ids.clone())])),
                &PlaybookVars::default(),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoleError::InvalidHost { host, .. } if host == "gateway"));
        assert!(f.store.get(&ids[0]).await.unwrap().roles.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn failed_setup_action_grants_no_membership() {
        let f = fixture().await;
        let ids = persist_nodes(&f.store, 2).await;
        f.executor.fail_playbook("setup.yml");

        let err = f
            .manager
            .add(
                "spits",
                RoleTarget::Hosts(BTreeMap::from([("jobmanager".to_owned(), ids.clone())])),
                &PlaybookVars::default(),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoleError::Assignment { .. }));
        for id in &ids {
            assert!(f.store.get(id).await.unwrap().roles.is_empty());
        }
    }

    #[test_log::test(tokio::test)]
    async fn host_membership_and_removal() {
        let f = fixture().await;
        let ids = persist_nodes(&f.store, 2).await;

        f.manager
            .add(
                "spits",
                RoleTarget::Hosts(BTreeMap::from([
                    ("jobmanager".to_owned(), vec![ids[0].clone()]),
                    ("taskmanager".to_owned(), ids.clone()),
                ])),
                &PlaybookVars::default(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        let members = f.manager.role_nodes("spits", None).await.unwrap();
        assert_eq!(members["jobmanager"], vec![ids[0].clone()]);
        assert_eq!(members["taskmanager"], ids);

        // dropping the jobmanager host leaves the taskmanager membership
        f.manager
            .remove(
                "spits",
                RoleTarget::Hosts(BTreeMap::from([(
                    "jobmanager".to_owned(),
                    vec![ids[0].clone()],
                )])),
            )
            .await
            .unwrap();
        let node = f.store.get(&ids[0]).await.unwrap();
        assert!(!node.in_role_host("spits", "jobmanager"));
        assert!(node.in_role_host("spits", "taskmanager"));

        // dropping the last host removes the role entirely
        f.manager
            .remove(
                "spits",
                RoleTarget::Hosts(BTreeMap::from([(
                    "taskmanager".to_owned(),
                    vec![ids[0].clone()],
                )])),
            )
            .await
            .unwrap();
        assert!(!f.store.get(&ids[0]).await.unwrap().roles.contains_key("spits"));
    }

    #[test_log::test(tokio::test)]
    async fn plain_node_list_addresses_every_declared_host() {
        let f = fixture().await;
        let ids = persist_nodes(&f.store, 1).await;

        f.manager
            .add(
                "spits",
                RoleTarget::Nodes(ids.clone()),
                &PlaybookVars::default(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        let node = f.store.get(&ids[0]).await.unwrap();
        assert!(node.in_role_host("spits", "jobmanager"));
        assert!(node.in_role_host("spits", "taskmanager"));

        // the gating setup playbook addressed both hosts
        let call = &f.executor.playbook_calls()[0];
        assert!(call.playbook.ends_with("roles/spits/setup.yml"));
        assert_eq!(call.inventory.len(), 2);
    }
}
