// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Multi-cluster Kubernetes observation core.
//!
//! A single process holds long-lived connections to several clusters,
//! discovers arbitrary resource kinds at runtime, runs one watch stream per
//! (cluster, kind), caches observed objects in a durable local store,
//! redacts fields designated as sensitive before they leave the process, and
//! forwards add/modify/delete events to a host-supplied callback.
//!
//! The entry point is [`InformerManager`]; the leaf components
//! ([`ResourceVersionStore`], [`ResourceCache`], [`Redactor`]) are public so
//! hosts and tests can use them standalone.

pub mod cache;
pub mod error;
pub mod event;
pub mod gvr;
pub mod informer;
pub mod redact;
pub mod store;

pub use cache::{CacheStats, ResourceCache};
pub use error::{Error, Result};
pub use event::{Event, EventHandler, EventType};
pub use gvr::Gvr;
pub use informer::{ClusterInfo, ClusterStatus, InformerManager};
pub use redact::{REDACTED, Redactor, SensitivePolicy};
pub use store::ResourceVersionStore;
