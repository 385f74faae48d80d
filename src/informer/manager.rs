// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! The informer manager: registry of cluster connections, public facade for
//! the host, and the event pipeline every watch worker feeds.

use chrono::Utc;
use kube::ResourceExt;
use kube::api::DynamicObject;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::cluster::{ClusterConnection, ClusterInfo};
use super::watcher::{WatchWorker, WorkerContext};
use crate::cache::{CacheStats, ResourceCache, strip_last_applied};
use crate::error::{Error, Result};
use crate::event::{Event, EventHandler, EventType};
use crate::gvr::Gvr;
use crate::redact::{Redactor, SensitivePolicy};
use crate::store::ResourceVersionStore;

/// How long a worker gets to finish its initial sync before the cluster is
/// marked errored.
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// The shared tail of every watch callback: record the resource version,
/// write the cache in the background, redact sensitive kinds, and hand the
/// event to the host.
pub(crate) struct EventPipeline {
    store: Arc<ResourceVersionStore>,
    cache: Option<Arc<ResourceCache>>,
    redactor: Arc<Redactor>,
    handler: EventHandler,
}

impl EventPipeline {
    pub(crate) fn new(
        store: Arc<ResourceVersionStore>,
        cache: Option<Arc<ResourceCache>>,
        redactor: Arc<Redactor>,
        handler: EventHandler,
    ) -> Self {
        Self {
            store,
            cache,
            redactor,
            handler,
        }
    }

    /// Called synchronously from worker tasks, so per-key ordering is the
    /// worker's ordering. Only the cache write leaves this call path.
    pub(crate) fn dispatch(
        &self,
        event_type: EventType,
        cluster_id: &str,
        gvr: &Gvr,
        kind: &str,
        mut obj: DynamicObject,
        mut old: Option<DynamicObject>,
    ) {
        // Strip before anything else so the cache blob and the handler's
        // object are the same bytes
        strip_last_applied(&mut obj);
        if let Some(previous) = old.as_mut() {
            strip_last_applied(previous);
        }

        if let Some(version) = obj.resource_version()
            && !version.is_empty()
        {
            self.store.set(cluster_id, gvr, &version);

            if let Some(cache) = &self.cache {
                let cache = cache.clone();
                let cluster_id = cluster_id.to_string();
                let gvr = gvr.clone();
                let obj = obj.clone();
                // Keep the watch task off the disk
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = cache.store(&cluster_id, &gvr, &obj) {
                        warn!(cluster = %cluster_id, gvr = %gvr, error = %e, "failed to cache resource");
                    }
                });
            }
        }

        let sensitive = self.redactor.is_sensitive(&gvr.group, kind);
        let object = if sensitive {
            self.redactor.redact_object(&gvr.group, kind, &obj)
        } else {
            obj
        };
        let old_object = old.map(|previous| {
            if sensitive {
                self.redactor.redact_object(&gvr.group, kind, &previous)
            } else {
                previous
            }
        });

        let event = Event {
            event_type,
            cluster_id: cluster_id.to_string(),
            gvr: gvr.clone(),
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
            object,
            old_object,
            timestamp: Utc::now(),
        };

        (self.handler)(event);
    }
}

/// Manages dynamic watches across multiple clusters.
///
/// Construct one per process with a host-owned data directory; the version
/// store and the durable cache live under it. Must be created within a Tokio
/// runtime (the version store spawns its saver task). The event handler is
/// invoked from watch worker tasks and must not block.
pub struct InformerManager {
    clusters: RwLock<HashMap<String, Arc<ClusterConnection>>>,
    store: Arc<ResourceVersionStore>,
    cache: Option<Arc<ResourceCache>>,
    redactor: Arc<Redactor>,
    pipeline: Arc<EventPipeline>,
    shut: AtomicBool,
}

impl InformerManager {
    /// Manager with the built-in sensitivity policy.
    pub fn new(data_dir: impl AsRef<Path>, handler: EventHandler) -> Self {
        Self::with_policy(data_dir, SensitivePolicy::default(), handler)
    }

    pub fn with_policy(
        data_dir: impl AsRef<Path>,
        policy: SensitivePolicy,
        handler: EventHandler,
    ) -> Self {
        let data_dir = data_dir.as_ref();
        let store = ResourceVersionStore::new(data_dir.join("resource_versions.json"));
        let redactor = Arc::new(Redactor::new(policy));

        let cache = match ResourceCache::open(&data_dir.join("cache"), redactor.clone()) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "failed to initialize resource cache, continuing without it");
                None
            }
        };

        let pipeline = Arc::new(EventPipeline::new(
            store.clone(),
            cache.clone(),
            redactor.clone(),
            handler,
        ));

        Self {
            clusters: RwLock::new(HashMap::new()),
            store,
            cache,
            redactor,
            pipeline,
            shut: AtomicBool::new(false),
        }
    }

    /// Register a cluster. `kubeconfig` is the config text or a path to it;
    /// an empty `context` uses the kubeconfig's current-context.
    pub async fn add_cluster(
        &self,
        id: &str,
        name: &str,
        kubeconfig: &str,
        context: &str,
    ) -> Result<()> {
        let cluster = Arc::new(ClusterConnection::connect(id, name, kubeconfig, context).await?);
        self.clusters.write().await.insert(id.to_string(), cluster);
        Ok(())
    }

    /// Remove a cluster, stopping all its watch workers and purging its slice
    /// of the version store. Cache rows are kept: they accelerate a re-add
    /// and age out via [`clean_old_cache`](Self::clean_old_cache).
    pub async fn remove_cluster(&self, id: &str) -> Result<()> {
        let cluster = self
            .clusters
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;

        cluster.stop_all_workers().await;
        self.store.delete_cluster(id);
        Ok(())
    }

    /// Snapshot of all registered clusters.
    pub async fn list_clusters(&self) -> HashMap<String, ClusterInfo> {
        let clusters: Vec<Arc<ClusterConnection>> =
            self.clusters.read().await.values().cloned().collect();

        let mut result = HashMap::with_capacity(clusters.len());
        for cluster in clusters {
            result.insert(cluster.id.clone(), cluster.snapshot().await);
        }
        result
    }

    /// Host-driven UI ordering bit; opaque to the core.
    pub async fn set_pinned(&self, cluster_id: &str, pinned: bool) -> Result<()> {
        self.get_cluster(cluster_id).await?.set_pinned(pinned).await;
        Ok(())
    }

    /// Start watching a GVR on a cluster. Idempotent: a second add for the
    /// same GVR is a no-op success. A 401 at pre-flight is terminal for the
    /// GVR and marks the cluster errored; other pre-flight failures surface
    /// verbatim for the caller to judge.
    pub async fn add_watcher(
        &self,
        cluster_id: &str,
        gvr: &Gvr,
        namespace: Option<&str>,
    ) -> Result<()> {
        let cluster = self.get_cluster(cluster_id).await?;

        if cluster.has_worker(gvr).await {
            return Ok(());
        }

        let (ar, scope) = match cluster.resolve(gvr).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let e = annotate_unauthorized(e, cluster_id, gvr);
                cluster.set_error(e.to_string()).await;
                return Err(e);
            }
        };

        let api = cluster.dynamic_api(&ar, &scope, namespace);
        if let Err(e) = cluster.preflight(&api).await {
            let e = annotate_unauthorized(Error::Client(e), cluster_id, gvr);
            cluster.set_error(e.to_string()).await;
            return Err(e);
        }

        let ctx = WorkerContext {
            cluster_id: cluster_id.to_string(),
            gvr: gvr.clone(),
            kind: ar.kind.clone(),
            resume_version: self.store.get(cluster_id, gvr),
            pipeline: self.pipeline.clone(),
        };
        let worker = WatchWorker::spawn(api, ctx);
        let mut synced = worker.synced();

        if !cluster.insert_worker(gvr.clone(), worker).await {
            // Lost a race with a concurrent add; the dropped worker aborts
            return Ok(());
        }

        // The worker stays registered on sync timeout so the host can retry
        // by removing and re-adding
        let weak = Arc::downgrade(&cluster);
        let gvr = gvr.clone();
        tokio::spawn(async move {
            let synced_in_time = tokio::time::timeout(CACHE_SYNC_TIMEOUT, synced.wait_for(|s| *s))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if !synced_in_time
                && let Some(cluster) = weak.upgrade()
            {
                debug!(cluster = %cluster.id, gvr = %gvr, "initial sync timed out");
                cluster
                    .set_error(format!("failed to sync cache for {}", gvr))
                    .await;
            }
        });

        Ok(())
    }

    /// Stop watching a GVR. The worker's task is aborted immediately.
    pub async fn remove_watcher(&self, cluster_id: &str, gvr: &Gvr) -> Result<()> {
        let cluster = self.get_cluster(cluster_id).await?;
        match cluster.remove_worker(gvr).await {
            Some(_worker) => Ok(()),
            None => Err(Error::WatcherNotFound {
                cluster: cluster_id.to_string(),
                gvr: gvr.to_string(),
            }),
        }
    }

    /// Cached objects for (cluster, gvr) plus the resume hint. The hint comes
    /// from the version store; the cache's lexicographic figure is not a
    /// reliable ordering of opaque resource versions.
    pub async fn load_initial(
        &self,
        cluster_id: &str,
        gvr: &Gvr,
    ) -> Result<(Vec<DynamicObject>, String)> {
        let Some(cache) = &self.cache else {
            return Ok((Vec::new(), String::new()));
        };

        let cache = cache.clone();
        let cluster_id_owned = cluster_id.to_string();
        let gvr_owned = gvr.clone();
        let (objects, _) =
            tokio::task::spawn_blocking(move || cache.load_all(&cluster_id_owned, &gvr_owned))
                .await
                .map_err(|e| Error::Internal(e.to_string()))??;

        Ok((objects, self.store.get(cluster_id, gvr)))
    }

    /// Read an object, preferring the cache. A hit on a sensitive kind
    /// returns the redacted twin with `true`; use
    /// [`get_original`](Self::get_original) for the authoritative object.
    pub async fn get_with_sensitivity(
        &self,
        cluster_id: &str,
        gvr: &Gvr,
        namespace: &str,
        name: &str,
    ) -> Result<(DynamicObject, bool)> {
        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let cluster_id_owned = cluster_id.to_string();
            let gvr_owned = gvr.clone();
            let namespace_owned = namespace.to_string();
            let name_owned = name.to_string();
            let hit = tokio::task::spawn_blocking(move || {
                cache.get(&cluster_id_owned, &gvr_owned, &namespace_owned, &name_owned)
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

            if let Some((object, is_sensitive)) = hit {
                return Ok((object, is_sensitive));
            }
        }

        let original = self.get_original(cluster_id, gvr, namespace, name).await?;
        let kind = original
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        if self.redactor.is_sensitive(&gvr.group, &kind) {
            let redacted = self.redactor.redact_object(&gvr.group, &kind, &original);
            Ok((redacted, true))
        } else {
            Ok((original, false))
        }
    }

    /// Fetch the un-redacted object straight from the API server, bypassing
    /// the cache. This is the only way a sensitive object's real contents
    /// leave the core.
    pub async fn get_original(
        &self,
        cluster_id: &str,
        gvr: &Gvr,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject> {
        let cluster = self.get_cluster(cluster_id).await?;
        let (ar, scope) = cluster.resolve(gvr).await?;
        let namespace = (!namespace.is_empty()).then_some(namespace);
        let api = cluster.dynamic_api(&ar, &scope, namespace);
        Ok(api.get(name).await?)
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        let cache = self.cache.clone().ok_or(Error::CacheUnavailable)?;
        tokio::task::spawn_blocking(move || cache.stats())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    /// Age-based cache sweep; the only mechanism that drops rows for removed
    /// clusters.
    pub async fn clean_old_cache(&self, max_age: Duration) -> Result<usize> {
        let cache = self.cache.clone().ok_or(Error::CacheUnavailable)?;
        tokio::task::spawn_blocking(move || cache.clean_older_than(max_age))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    /// Stop all workers, flush the version store, and close the cache.
    /// Idempotent, and returns without waiting on stream teardown.
    pub async fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }

        let clusters: Vec<Arc<ClusterConnection>> =
            self.clusters.read().await.values().cloned().collect();
        for cluster in clusters {
            cluster.stop_all_workers().await;
        }

        self.store.flush();
        if let Some(cache) = &self.cache {
            cache.close();
        }
    }

    async fn get_cluster(&self, id: &str) -> Result<Arc<ClusterConnection>> {
        self.clusters
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))
    }
}

/// Promote a 401 into the terminal Unauthorized shape; other errors pass
/// through untouched.
fn annotate_unauthorized(e: Error, cluster_id: &str, gvr: &Gvr) -> Error {
    if e.is_unauthorized() {
        Error::Unauthorized {
            cluster: cluster_id.to_string(),
            gvr: gvr.to_string(),
            message: e.to_string(),
        }
    } else {
        e
    }
}
