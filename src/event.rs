// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Resource events delivered to the host.

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::gvr::Gvr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "ADDED"),
            EventType::Modified => write!(f, "MODIFIED"),
            EventType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// A resource transition observed by a watch worker.
///
/// For sensitive kinds `object` (and `old_object`) carry the redacted twin;
/// the un-redacted original never leaves the core except through
/// [`InformerManager::get_original`](crate::InformerManager::get_original).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub cluster_id: String,
    pub gvr: Gvr,
    /// Empty for cluster-scoped kinds
    pub namespace: String,
    pub name: String,
    pub object: DynamicObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_object: Option<DynamicObject>,
    pub timestamp: DateTime<Utc>,
}

/// Callback handed in at manager construction. Invoked synchronously from
/// watch worker tasks, so it must not block; it may be invoked concurrently
/// with itself across different (cluster, GVR) keys.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;
