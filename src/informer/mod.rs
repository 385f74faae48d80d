// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Multi-cluster watch management: cluster connections, watch workers, and
//! the manager facade the host drives.

mod cluster;
mod manager;
mod watcher;

pub use cluster::{ClusterInfo, ClusterStatus};
pub use manager::InformerManager;
