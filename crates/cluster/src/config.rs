// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Declarative cluster templates.
//!
//! Template files declare reusable setups and cluster definitions; this
//! loader cross-validates them into resolved [`ClusterConfig`] values. A
//! cluster whose validation fails (dangling setup reference, impossible
//! counts, bad `ssh_to`) is dropped whole with a logged error; the other
//! definitions survive. The loader is pure and is re-invoked on every
//! cluster create/update call, so edits to the files are always picked up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::error;

use flotilla_types::{ClusterConfig, ClusterOptions, NamedSetup, NodeTypeSpec, Setup};

#[derive(Debug, thiserror::Error)]
pub enum ClusterConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("redefinition of {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("invalid setup named {setup} in cluster {cluster}")]
    InvalidSetup { cluster: String, setup: String },
    #[error("in cluster {cluster}: {node_type}.min_count > {node_type}.count")]
    MinCountExceedsCount { cluster: String, node_type: String },
    #[error("in cluster {cluster}: invalid ssh_to option's value: {ssh_to}")]
    InvalidSshTo { cluster: String, ssh_to: String },
    #[error("unknown cluster template: {0}")]
    UnknownTemplate(String),
}

/// On-disk shape of one template file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    #[serde(default)]
    setups: BTreeMap<String, Setup>,
    #[serde(default)]
    clusters: BTreeMap<String, RawCluster>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    #[serde(default)]
    options: ClusterOptions,
    #[serde(default)]
    before_all: Vec<String>,
    #[serde(default)]
    before: Vec<String>,
    #[serde(default)]
    after: Vec<String>,
    #[serde(default)]
    after_all: Vec<String>,
    #[serde(default)]
    nodes: BTreeMap<String, RawNodeType>,
}

#[derive(Debug, Deserialize)]
struct RawNodeType {
    /// Instance template backing this node type.
    #[serde(rename = "type")]
    instance: String,
    count: u32,
    #[serde(default)]
    min_count: Option<u32>,
    #[serde(default)]
    setups: Vec<String>,
}

/// Validated setups and cluster templates from a set of files.
#[derive(Debug, Default)]
pub struct ClusterTemplates {
    setups: BTreeMap<String, Setup>,
    clusters: BTreeMap<String, ClusterConfig>,
}

impl ClusterTemplates {
    /// Loads and cross-validates all files. With `strict` unset, unreadable
    /// files, duplicate names (last seen wins) and invalid cluster
    /// definitions are logged and skipped; with `strict` set, any of them
    /// fails the whole load.
    pub fn load(files: &[PathBuf], strict: bool) -> Result<Self, ClusterConfigError> {
        let mut setups: BTreeMap<String, Setup> = BTreeMap::new();
        let mut raw_clusters: BTreeMap<String, RawCluster> = BTreeMap::new();

        for path in files {
            let file = match read_template(path) {
                Ok(file) => file,
                Err(err) if strict => return Err(err),
                Err(err) => {
                    error!(%err, "skipping unreadable template file");
                    continue;
                }
            };
            for (name, setup) in file.setups {
                if setups.insert(name.clone(), setup).is_some() {
                    if strict {
                        return Err(ClusterConfigError::Duplicate {
                            kind: "setup",
                            name,
                        });
                    }
                    error!(setup = %name, "redefinition of setup, last definition wins");
                }
            }
            for (name, cluster) in file.clusters {
                if raw_clusters.insert(name.clone(), cluster).is_some() {
                    if strict {
                        return Err(ClusterConfigError::Duplicate {
                            kind: "cluster",
                            name,
                        });
                    }
                    error!(cluster = %name, "redefinition of cluster, last definition wins");
                }
            }
        }

        let mut clusters = BTreeMap::new();
        for (name, raw) in raw_clusters {
            match resolve_cluster(&name, raw, &setups) {
                Ok(config) => {
                    clusters.insert(name, config);
                }
                Err(err) if strict => return Err(err),
                Err(err) => {
                    error!(cluster = %name, %err, "dropping cluster definition");
                }
            }
        }

        Ok(Self { setups, clusters })
    }

    pub fn cluster(&self, name: &str) -> Result<&ClusterConfig, ClusterConfigError> {
        self.clusters
            .get(name)
            .ok_or_else(|| ClusterConfigError::UnknownTemplate(name.to_owned()))
    }

    pub fn clusters(&self) -> &BTreeMap<String, ClusterConfig> {
        &self.clusters
    }

    pub fn setup(&self, name: &str) -> Option<&Setup> {
        self.setups.get(name)
    }

    pub fn setups(&self) -> &BTreeMap<String, Setup> {
        &self.setups
    }
}

fn read_template(path: &Path) -> Result<TemplateFile, ClusterConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ClusterConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ClusterConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

fn resolve_cluster(
    name: &str,
    raw: RawCluster,
    setups: &BTreeMap<String, Setup>,
) -> Result<ClusterConfig, ClusterConfigError> {
    let resolve_refs = |refs: &[String]| -> Result<Vec<NamedSetup>, ClusterConfigError> {
        refs.iter()
            .map(|setup_name| {
                setups
                    .get(setup_name)
                    .map(|setup| NamedSetup {
                        name: setup_name.clone(),
                        setup: setup.clone(),
                    })
                    .ok_or_else(|| ClusterConfigError::InvalidSetup {
                        cluster: name.to_owned(),
                        setup: setup_name.clone(),
                    })
            })
            .collect()
    };

    let mut nodes = BTreeMap::new();
    for (node_type, raw_node) in &raw.nodes {
        let min_count = raw_node.min_count.unwrap_or(raw_node.count);
        if min_count > raw_node.count {
            return Err(ClusterConfigError::MinCountExceedsCount {
                cluster: name.to_owned(),
                node_type: node_type.clone(),
            });
        }
        nodes.insert(
            node_type.clone(),
            NodeTypeSpec {
                instance: raw_node.instance.clone(),
                count: raw_node.count,
                min_count,
                setups: resolve_refs(&raw_node.setups)?,
            },
        );
    }

    if let Some(ssh_to) = &raw.options.ssh_to {
        if !nodes.contains_key(ssh_to) {
            return Err(ClusterConfigError::InvalidSshTo {
                cluster: name.to_owned(),
                ssh_to: ssh_to.clone(),
            });
        }
    }

    Ok(ClusterConfig {
        options: raw.options,
        before_all: resolve_refs(&raw.before_all)?,
        before: resolve_refs(&raw.before)?,
        after: resolve_refs(&raw.after)?,
        after_all: resolve_refs(&raw.after_all)?,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    const BASIC: &str = r#"
setups:
  base-setup:
    roles:
      - name: commands-common
    actions:
      - command: "hostname"
  worker-setup:
    actions:
      - role: spits
        action: start
        extra:
          mode: worker
clusters:
  spits:
    options:
      ssh_to: coordinator
    before_all: [base-setup]
    nodes:
      coordinator:
        type: type-a
        count: 1
      worker:
        type: type-b
        count: 4
        min_count: 2
        setups: [worker-setup]
"#;

    #[test_log::test]
    fn loads_and_resolves_a_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "spits.yml", BASIC);

        let templates = ClusterTemplates::load(&[path], true).unwrap();
        let cluster = templates.cluster("spits").unwrap();

        assert_eq!(cluster.before_all.len(), 1);
        assert_eq!(cluster.before_all[0].name, "base-setup");

        let coordinator = &cluster.nodes["coordinator"];
        // min_count defaults to count when omitted
        assert_eq!(coordinator.count, 1);
        assert_eq!(coordinator.min_count, 1);

        let worker = &cluster.nodes["worker"];
        assert_eq!(worker.min_count, 2);
        assert_eq!(worker.setups[0].name, "worker-setup");
        assert_eq!(cluster.options.ssh_to.as_deref(), Some("coordinator"));
    }

    #[test_log::test]
    fn dangling_setup_reference_drops_only_that_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "clusters.yml",
            r#"
setups:
  ok-setup:
    actions:
      - command: "true"
clusters:
  broken:
    before_all: [no-such-setup]
    nodes:
      worker: {type: type-a, count: 1}
  fine:
    before_all: [ok-setup]
    nodes:
      worker: {type: type-a, count: 1}
"#,
        );

        let templates = ClusterTemplates::load(&[path.clone()], false).unwrap();
        assert!(templates.cluster("fine").is_ok());
        assert!(matches!(
            templates.cluster("broken"),
            Err(ClusterConfigError::UnknownTemplate(_))
        ));

        assert!(matches!(
            ClusterTemplates::load(&[path], true),
            Err(ClusterConfigError::InvalidSetup { .. })
        ));
    }

    #[test_log::test]
    fn min_count_above_count_drops_only_that_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "clusters.yml",
            r#"
clusters:
  impossible:
    nodes:
      worker: {type: type-a, count: 2, min_count: 3}
  possible:
    nodes:
      worker: {type: type-a, count: 2, min_count: 2}
"#,
        );

        let templates = ClusterTemplates::load(&[path], false).unwrap();
        assert!(templates.cluster("possible").is_ok());
        assert!(templates.cluster("impossible").is_err());
    }

    #[test_log::test]
    fn ssh_to_must_reference_a_declared_node_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "clusters.yml",
            r#"
clusters:
  bad-ssh:
    options:
      ssh_to: gateway
    nodes:
      worker: {type: type-a, count: 1}
"#,
        );

        let templates = ClusterTemplates::load(&[path.clone()], false).unwrap();
        assert!(templates.clusters().is_empty());
        assert!(matches!(
            ClusterTemplates::load(&[path], true),
            Err(ClusterConfigError::InvalidSshTo { .. })
        ));
    }

    #[test_log::test]
    fn duplicates_across_files_last_seen_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_file(
            &dir,
            "a.yml",
            r#"
clusters:
  dup:
    nodes:
      worker: {type: type-a, count: 1}
"#,
        );
        let second = write_file(
            &dir,
            "b.yml",
            r#"
clusters:
  dup:
    nodes:
      worker: {type: type-a, count: 7}
"#,
        );

        let templates =
            ClusterTemplates::load(&[first.clone(), second.clone()], false).unwrap();
        assert_eq!(templates.cluster("dup").unwrap().nodes["worker"].count, 7);

        assert!(matches!(
            ClusterTemplates::load(&[first, second], true),
            Err(ClusterConfigError::Duplicate { kind: "cluster", .. })
        ));
    }

    #[test_log::test]
    fn unparseable_file_is_skipped_when_not_strict() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write_file(&dir, "bad.yml", "clusters: [not, a, map]");
        let good = write_file(
            &dir,
            "good.yml",
            r#"
clusters:
  fine:
    nodes:
      worker: {type: type-a, count: 1}
"#,
        );

        let templates = ClusterTemplates::load(&[bad.clone(), good], false).unwrap();
        assert!(templates.cluster("fine").is_ok());
        assert!(ClusterTemplates::load(&[bad], true).is_err());
    }
}
