// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster management: declarative template loading and validation, role
//! membership and action dispatch, and the orchestrator running the staged
//! setup pipeline.

mod config;
mod instances;
mod orchestrator;
mod roles;

pub use config::*;
pub use instances::*;
pub use orchestrator::*;
pub use roles::*;
