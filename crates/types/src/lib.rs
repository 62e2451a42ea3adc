// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Core data model shared by the flotilla fleet and cluster managers.

use std::time::{SystemTime, UNIX_EPOCH};

mod cluster;
mod errors;
mod identifiers;
mod instance;
mod nickname;
mod node;
pub mod retries;
mod role;

pub use cluster::*;
pub use errors::*;
pub use identifiers::*;
pub use instance::*;
pub use nickname::random_nickname;
pub use node::*;
pub use role::*;

/// Milliseconds since the unix epoch. Persisted timestamps (`creation_time`,
/// `update_time`) all use this resolution.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
