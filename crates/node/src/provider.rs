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
use std::time::Duration;

use async_trait::async_trait;

use flotilla_types::{CloudLifecycle, GenericError, InstanceDescriptor, Node, NodeKind, NodeStatus};

/// Instance-level facts reported by a provider for a freshly started
/// machine. The lifecycle manager turns these into persisted [`Node`]
/// records; drivers never mint node ids themselves.
#[derive(Debug, Clone)]
pub struct StartedInstance {
    pub kind: NodeKind,
    pub cloud_instance_id: Option<String>,
    pub ip: Option<String>,
    pub cloud_lifecycle: CloudLifecycle,
    pub status: NodeStatus,
    /// Provider-private scratch data carried on the node record.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for StartedInstance {
    fn default() -> Self {
        Self {
            kind: NodeKind::Cloud,
            cloud_instance_id: None,
            ip: None,
            cloud_lifecycle: CloudLifecycle::Normal,
            status: NodeStatus::Started,
            extra: BTreeMap::new(),
        }
    }
}

/// Capability contract implemented by each registered provider driver.
///
/// All methods take per-call timeouts applying to the underlying remote API
/// call. For stop/pause/resume/update, the returned nodes carry the
/// refreshed status (and possibly a new ip); nodes absent from the result
/// could not be processed. Provider-reported terminated states must map to
/// [`NodeStatus::Stopped`].
#[async_trait]
pub trait InstanceProvider: Send + Sync + 'static {
    async fn start_instances(
        &self,
        descriptor: &InstanceDescriptor,
        count: u32,
        timeout: Duration,
    ) -> Result<Vec<StartedInstance>, GenericError>;

    async fn stop_instances(
        &self,
        nodes: &[Node],
        timeout: Duration,
    ) -> Result<Vec<Node>, GenericError>;

    async fn pause_instances(
        &self,
        nodes: &[Node],
        timeout: Duration,
    ) -> Result<Vec<Node>, GenericError>;

    async fn resume_instances(
        &self,
        nodes: &[Node],
        timeout: Duration,
    ) -> Result<Vec<Node>, GenericError>;

    /// Refreshes status and address from the cloud API without changing the
    /// desired state of any instance.
    async fn update_status(
        &self,
        nodes: &[Node],
        timeout: Duration,
    ) -> Result<Vec<Node>, GenericError>;
}
