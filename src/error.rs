// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Error types for the observation core.

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubeconfig could not be parsed, neither as inline YAML nor as a file path
    #[error("failed to parse kubeconfig: {0}")]
    Kubeconfig(String),

    /// Kubernetes client error, surfaced verbatim so callers can decide on retry
    #[error("kubernetes API error: {0}")]
    Client(#[from] kube::Error),

    /// Access to a GVR was denied at watcher pre-flight. Terminal for this
    /// GVR; retrying without a new credential is pointless.
    #[error("unauthorized access to {gvr} in cluster {cluster}: {message}")]
    Unauthorized {
        cluster: String,
        gvr: String,
        message: String,
    },

    /// The GVR is not served by the cluster (or discovery failed to find it)
    #[error("resource {gvr} not found in cluster {cluster}")]
    Discovery { cluster: String, gvr: String },

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("watcher for {gvr} not found in cluster {cluster}")]
    WatcherNotFound { cluster: String, gvr: String },

    /// The durable cache is disabled (failed to open at startup) or closed
    #[error("cache not available")]
    CacheUnavailable,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the underlying API response was a 401.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Error::Unauthorized { .. } => true,
            Error::Client(kube::Error::Api(ae)) => {
                ae.code == 401 || ae.reason == "Unauthorized"
            }
            _ => false,
        }
    }
}
