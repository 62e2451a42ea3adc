// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Error type which abstracts away the actual [`std::error::Error`] type. Use
/// this type at seams where the concrete error type is external or not
/// important, e.g. provider drivers and remote executors.
pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;
