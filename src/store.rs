// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Persistent resource-version bookkeeping.
//!
//! Tracks the last resource version handed to the event callback per
//! (cluster, GVR), mirrored to a pretty-printed JSON file so a restarted
//! process can resume watches without a full re-list. The file is an
//! optimization, not a correctness dependency: any unreadable or unparseable
//! state yields an empty store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gvr::Gvr;

type VersionMap = HashMap<String, HashMap<String, String>>;

pub struct ResourceVersionStore {
    path: PathBuf,
    /// clusterID -> GVR string -> resource version
    data: RwLock<VersionMap>,
    save_tx: mpsc::Sender<()>,
}

impl ResourceVersionStore {
    /// Open the store, loading any existing state from `path`.
    ///
    /// Spawns the coalescing saver task, so this must be called within a
    /// Tokio runtime. Every mutation nudges the saver; concurrent mutations
    /// collapse into one write whose contents are the state at snapshot time,
    /// so the file always converges on the last value seen.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let data = Self::load(&path);
        let (save_tx, mut save_rx) = mpsc::channel::<()>(1);

        let store = Arc::new(Self {
            path,
            data: RwLock::new(data),
            save_tx,
        });

        let weak = Arc::downgrade(&store);
        tokio::spawn(async move {
            while save_rx.recv().await.is_some() {
                let Some(store) = weak.upgrade() else { break };
                let result = tokio::task::spawn_blocking(move || store.write_snapshot()).await;
                match result {
                    Ok(Err(e)) => warn!(error = %e, "failed to save resource version store"),
                    Err(e) => warn!(error = %e, "resource version saver task failed"),
                    Ok(Ok(())) => {}
                }
            }
        });

        store
    }

    fn load(path: &std::path::Path) -> VersionMap {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no resource version store to load");
                return VersionMap::new();
            }
        };
        match serde_json::from_str(&content) {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring unparseable resource version store");
                VersionMap::new()
            }
        }
    }

    /// Last version recorded for (cluster, gvr), or `""` if none.
    pub fn get(&self, cluster_id: &str, gvr: &Gvr) -> String {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(cluster_id)
            .and_then(|m| m.get(&gvr.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Record a version unconditionally and schedule a save.
    pub fn set(&self, cluster_id: &str, gvr: &Gvr, version: &str) {
        {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            data.entry(cluster_id.to_string())
                .or_default()
                .insert(gvr.to_string(), version.to_string());
        }
        // Full channel means a save is already pending; it will pick this up
        let _ = self.save_tx.try_send(());
    }

    /// Drop all versions for a cluster and schedule a save.
    pub fn delete_cluster(&self, cluster_id: &str) {
        {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            data.remove(cluster_id);
        }
        let _ = self.save_tx.try_send(());
    }

    /// Synchronous save, used at shutdown. Errors are logged; version data is
    /// best-effort.
    pub fn flush(&self) {
        if let Err(e) = self.write_snapshot() {
            warn!(error = %e, "failed to flush resource version store");
        }
    }

    /// Write the current state atomically: temp file in the same directory,
    /// then rename over the target.
    fn write_snapshot(&self) -> std::io::Result<()> {
        let snapshot = {
            let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
            data.clone()
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pods() -> Gvr {
        Gvr::new("", "v1", "pods")
    }

    #[tokio::test]
    async fn test_get_missing_returns_empty() {
        let dir = TempDir::new().unwrap();
        let store = ResourceVersionStore::new(dir.path().join("versions.json"));
        assert_eq!(store.get("c1", &pods()), "");
    }

    #[tokio::test]
    async fn test_set_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = ResourceVersionStore::new(dir.path().join("versions.json"));
        store.set("c1", &pods(), "100");
        assert_eq!(store.get("c1", &pods()), "100");
        store.set("c1", &pods(), "250");
        assert_eq!(store.get("c1", &pods()), "250");
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.json");
        {
            let store = ResourceVersionStore::new(path.clone());
            store.set("c1", &pods(), "42");
            store.set("c1", &Gvr::new("apps", "v1", "deployments"), "7");
            store.flush();
        }

        let store = ResourceVersionStore::new(path);
        assert_eq!(store.get("c1", &pods()), "42");
        assert_eq!(store.get("c1", &Gvr::new("apps", "v1", "deployments")), "7");
    }

    #[tokio::test]
    async fn test_delete_cluster_drops_submap() {
        let dir = TempDir::new().unwrap();
        let store = ResourceVersionStore::new(dir.path().join("versions.json"));
        store.set("c1", &pods(), "42");
        store.set("c2", &pods(), "9");
        store.delete_cluster("c1");
        assert_eq!(store.get("c1", &pods()), "");
        assert_eq!(store.get("c2", &pods()), "9");
    }

    #[tokio::test]
    async fn test_corrupt_file_yields_empty_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.json");
        std::fs::write(&path, "not json").unwrap();

        let store = ResourceVersionStore::new(path);
        assert_eq!(store.get("c1", &pods()), "");
        // The store remains usable and persists over the corrupt file
        store.set("c1", &pods(), "5");
        store.flush();
        assert_eq!(store.get("c1", &pods()), "5");
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deeply/nested/versions.json");
        let store = ResourceVersionStore::new(path.clone());
        store.set("c1", &pods(), "1");
        store.flush();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_flush_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.json");
        let store = ResourceVersionStore::new(path.clone());
        store.set("c1", &pods(), "1");
        store.flush();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_background_save_eventually_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.json");
        let store = ResourceVersionStore::new(path.clone());
        store.set("c1", &pods(), "77");

        // Saver runs asynchronously; poll briefly
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(path.exists());
        let reloaded = ResourceVersionStore::load(&path);
        assert_eq!(reloaded["c1"]["/v1/pods"], "77");
    }
}
