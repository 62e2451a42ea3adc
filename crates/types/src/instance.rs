// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Instance templates: the provider/login/instance triple a node is created
//! from. Entries are loaded from the instance configuration files and joined
//! into an [`InstanceDescriptor`], which becomes immutable once attached to a
//! node.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Credentials and API endpoint description for one cloud account. Fields
/// beyond the common ones are provider-private and kept verbatim in `extra`
/// (key files, VPC ids, endpoint URLs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Injected from the entry key at load time.
    #[serde(default)]
    pub provider_config_id: String,
    /// Name of the provider driver handling this account, e.g. `aws`.
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Injected from the entry key at load time.
    #[serde(default)]
    pub login_config_id: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub keypair_name: Option<String>,
    #[serde(default)]
    pub keypair_public_file: Option<String>,
    #[serde(default)]
    pub keypair_private_file: Option<String>,
    #[serde(default = "default_sudo")]
    pub sudo: bool,
    #[serde(default = "default_sudo_user")]
    pub sudo_user: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_sudo() -> bool {
    true
}

fn default_sudo_user() -> String {
    "root".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Injected from the entry key at load time.
    #[serde(default)]
    pub instance_config_id: String,
    /// Reference to a loaded [`ProviderConfig`].
    pub provider: String,
    /// Reference to a loaded [`LoginConfig`].
    pub login: String,
    pub flavor: String,
    pub image_id: String,
    #[serde(default)]
    pub security_group: Option<String>,
    #[serde(default)]
    pub boot_disk_size: Option<u64>,
    #[serde(default)]
    pub boot_disk_device: Option<String>,
    #[serde(default)]
    pub boot_disk_type: Option<String>,
    #[serde(default)]
    pub placement_group: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub network_ids: Vec<String>,
}

/// Fully joined instance template. This is what gets attached to a node as
/// its `configuration` and what the lifecycle manager hands to provider
/// drivers on start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub provider: ProviderConfig,
    pub login: LoginConfig,
    pub instance: InstanceConfig,
}

impl InstanceDescriptor {
    /// Name of the provider driver responsible for this template.
    pub fn provider_name(&self) -> &str {
        &self.provider.provider
    }

    pub fn instance_config_id(&self) -> &str {
        &self.instance.instance_config_id
    }
}
