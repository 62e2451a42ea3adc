// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Instance template database: joins the provider, login and instance
//! configuration documents into [`InstanceDescriptor`]s. Invalid or dangling
//! entries are dropped with a logged error, so one bad template never takes
//! down the rest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::error;

use flotilla_types::{GenericError, InstanceConfig, InstanceDescriptor, LoginConfig,
    ProviderConfig};

#[derive(Debug, thiserror::Error)]
pub enum InstanceConfigError {
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
    #[error("invalid entry '{entry}': {source}")]
    InvalidEntry { entry: String, source: GenericError },
    #[error("in instance '{instance}': unknown reference '{reference}'")]
    DanglingReference { instance: String, reference: String },
    #[error("unknown instance template: {0}")]
    UnknownTemplate(String),
}

/// Locations of the three instance configuration documents.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    pub providers: PathBuf,
    pub logins: PathBuf,
    pub instances: PathBuf,
}

#[derive(Debug, Default)]
pub struct InstanceDatabase {
    providers: BTreeMap<String, ProviderConfig>,
    logins: BTreeMap<String, LoginConfig>,
    descriptors: BTreeMap<String, InstanceDescriptor>,
}

impl InstanceDatabase {
    /// Loads the three documents and joins them. With `strict` unset,
    /// invalid entries and instances with dangling provider/login references
    /// are dropped with a logged error.
    pub fn load(paths: &InstancePaths, strict: bool) -> Result<Self, InstanceConfigError> {
        let providers: BTreeMap<String, ProviderConfig> =
            load_section(&paths.providers, strict, |id, config: &mut ProviderConfig| {
                config.provider_config_id = id.to_owned();
            })?;
        let logins: BTreeMap<String, LoginConfig> =
            load_section(&paths.logins, strict, |id, config: &mut LoginConfig| {
                config.login_config_id = id.to_owned();
            })?;
        let instances: BTreeMap<String, InstanceConfig> =
            load_section(&paths.instances, strict, |id, config: &mut InstanceConfig| {
                config.instance_config_id = id.to_owned();
            })?;

        let mut descriptors = BTreeMap::new();
        for (instance_id, instance) in instances {
            match (providers.get(&instance.provider), logins.get(&instance.login)) {
                (Some(provider), Some(login)) => {
                    descriptors.insert(
                        instance_id,
                        InstanceDescriptor {
                            provider: provider.clone(),
                            login: login.clone(),
                            instance,
                        },
                    );
                }
                (provider, _) => {
                    let reference = if provider.is_none() {
                        instance.provider.clone()
                    } else {
                        instance.login.clone()
                    };
                    let err = InstanceConfigError::DanglingReference {
                        instance: instance_id.clone(),
                        reference,
                    };
                    if strict {
                        return Err(err);
                    }
                    error!(%err, "dropping instance configuration");
                }
            }
        }

        Ok(Self {
            providers,
            logins,
            descriptors,
        })
    }

    pub fn descriptor(&self, instance_id: &str) -> Result<&InstanceDescriptor, InstanceConfigError> {
        self.descriptors
            .get(instance_id)
            .ok_or_else(|| InstanceConfigError::UnknownTemplate(instance_id.to_owned()))
    }

    pub fn descriptors(&self) -> &BTreeMap<String, InstanceDescriptor> {
        &self.descriptors
    }

    pub fn providers(&self) -> &BTreeMap<String, ProviderConfig> {
        &self.providers
    }

    pub fn logins(&self) -> &BTreeMap<String, LoginConfig> {
        &self.logins
    }
}

/// Loads one keyed section, injecting the entry key into each parsed value.
/// Invalid entries are dropped (or fail the load in strict mode).
fn load_section<T: DeserializeOwned>(
    path: &Path,
    strict: bool,
    set_id: impl Fn(&str, &mut T),
) -> Result<BTreeMap<String, T>, InstanceConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| InstanceConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    let raw: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(&content).map_err(|source| InstanceConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

    let mut entries = BTreeMap::new();
    for (id, value) in raw {
        match serde_yaml::from_value::<T>(value) {
            Ok(mut entry) => {
                set_id(&id, &mut entry);
                entries.insert(id, entry);
            }
            Err(source) => {
                let err = InstanceConfigError::InvalidEntry {
                    entry: id,
                    source: source.into(),
                };
                if strict {
                    return Err(err);
                }
                error!(%err, "dropping configuration entry");
            }
        }
    }
    Ok(entries)
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

    fn paths(dir: &tempfile::TempDir) -> InstancePaths {
        InstancePaths {
            providers: write_file(
                dir,
                "providers.yaml",
                r#"
aws-east:
  provider: aws
  region: us-east-1
  access_keyfile: aws_key.pub
"#,
            ),
            logins: write_file(
                dir,
                "logins.yaml",
                r#"
ubuntu:
  user: ubuntu
  keypair_private_file: default.pem
"#,
            ),
            instances: write_file(
                dir,
                "instances.yaml",
                r#"
type-a:
  provider: aws-east
  login: ubuntu
  flavor: t2.large
  image_id: ami-07d0cf3af28718ef8
type-dangling:
  provider: no-such-provider
  login: ubuntu
  flavor: t2.micro
  image_id: ami-07d0cf3af28718ef8
"#,
            ),
        }
    }

    #[test_log::test]
    fn joins_sections_into_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let db = InstanceDatabase::load(&paths(&dir), false).unwrap();

        let descriptor = db.descriptor("type-a").unwrap();
        assert_eq!(descriptor.provider_name(), "aws");
        assert_eq!(descriptor.provider.provider_config_id, "aws-east");
        assert_eq!(descriptor.login.user, "ubuntu");
        assert_eq!(descriptor.login.ssh_port, 22);
        assert_eq!(descriptor.instance.flavor, "t2.large");
        // provider-private fields survive verbatim
        assert!(descriptor.provider.extra.contains_key("access_keyfile"));
    }

    #[test_log::test]
    fn dangling_references_drop_the_instance_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = InstanceDatabase::load(&paths(&dir), false).unwrap();
        assert!(db.descriptor("type-a").is_ok());
        assert!(matches!(
            db.descriptor("type-dangling"),
            Err(InstanceConfigError::UnknownTemplate(_))
        ));

        assert!(matches!(
            InstanceDatabase::load(&paths(&dir), true),
            Err(InstanceConfigError::DanglingReference { .. })
        ));
    }
}
