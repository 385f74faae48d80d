// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Watch workers.
//!
//! One worker per (cluster, GVR) drives a list+watch loop against the
//! dynamic API and feeds transitions into the event pipeline. The worker
//! owns the in-memory index of last-seen objects, which is what turns the
//! flat watch protocol into ADDED/MODIFIED/DELETED transitions and supplies
//! the prior object on MODIFIED.
//!
//! Each worker is its own tokio task, so stopping one is precise: dropping
//! the [`WatchWorker`] aborts the task and no stream is left running behind
//! a detached handler.

use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DynamicObject, ListParams, TypeMeta, WatchEvent, WatchParams};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::manager::EventPipeline;
use crate::event::EventType;
use crate::gvr::Gvr;

/// Server-side watch window; the server closes the stream at the timeout and
/// the worker re-watches from its resume point.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Page size for full re-lists
const LIST_PAGE_SIZE: u32 = 500;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Everything a worker needs to label and dispatch its events.
pub(crate) struct WorkerContext {
    pub cluster_id: String,
    pub gvr: Gvr,
    /// Kind from discovery; injected into objects the list API returns bare
    pub kind: String,
    /// Resume point from the version store; empty means full list first
    pub resume_version: String,
    pub pipeline: Arc<EventPipeline>,
}

/// Handle to a running watch task. Dropping it aborts the task.
pub(crate) struct WatchWorker {
    handle: JoinHandle<()>,
    synced: watch::Receiver<bool>,
}

impl WatchWorker {
    pub(crate) fn spawn(api: Api<DynamicObject>, ctx: WorkerContext) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        let handle = tokio::spawn(run(api, ctx, synced_tx));
        Self {
            handle,
            synced: synced_rx,
        }
    }

    /// Flips to true once the initial sync (first full list, or a resumed
    /// watch being established) has completed.
    pub(crate) fn synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }
}

impl Drop for WatchWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(api: Api<DynamicObject>, ctx: WorkerContext, synced: watch::Sender<bool>) {
    let mut index: HashMap<String, DynamicObject> = HashMap::new();
    let mut resume = if ctx.resume_version.is_empty() {
        None
    } else {
        Some(ctx.resume_version.clone())
    };
    let mut backoff = Duration::from_secs(1);

    loop {
        if resume.is_none() {
            match relist(&api, &ctx, &mut index).await {
                Ok(version) => {
                    resume = Some(version);
                    backoff = Duration::from_secs(1);
                    let _ = synced.send(true);
                }
                Err(e) => {
                    warn!(cluster = %ctx.cluster_id, gvr = %ctx.gvr, error = %e, "list failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        }

        let Some(version) = resume.clone() else {
            continue;
        };

        match watch_once(&api, &ctx, &mut index, &version, &synced).await {
            Ok(Some(latest)) => {
                // Stream ended normally; re-watch from where it left off
                resume = Some(latest);
                backoff = Duration::from_secs(1);
            }
            Ok(None) => {
                // Resume point expired on the server; full re-list
                debug!(cluster = %ctx.cluster_id, gvr = %ctx.gvr, "watch desynced, re-listing");
                resume = None;
            }
            Err(e) => {
                if is_gone(&e) {
                    resume = None;
                    continue;
                }
                warn!(cluster = %ctx.cluster_id, gvr = %ctx.gvr, error = %e, "watch failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Paginated full list. Listed objects are diffed against the index, so a
/// re-list after a gap emits MODIFIED for changed objects and DELETED for
/// objects that vanished while the worker was not watching. Returns the
/// list's resource version as the next watch start point.
async fn relist(
    api: &Api<DynamicObject>,
    ctx: &WorkerContext,
    index: &mut HashMap<String, DynamicObject>,
) -> std::result::Result<String, kube::Error> {
    let mut continue_token: Option<String> = None;
    let mut seen: HashSet<String> = HashSet::new();
    let mut version = String::new();

    loop {
        let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
        if let Some(token) = &continue_token {
            params = params.continue_token(token);
        }

        let list = api.list(&params).await?;
        if let Some(rv) = list.metadata.resource_version.clone() {
            version = rv;
        }

        for obj in list.items {
            seen.insert(index_key(&obj));
            deliver_applied(ctx, index, obj);
        }

        match list.metadata.continue_ {
            Some(token) if !token.is_empty() => continue_token = Some(token),
            _ => break,
        }
    }

    let stale: Vec<String> = index
        .keys()
        .filter(|key| !seen.contains(*key))
        .cloned()
        .collect();
    for key in stale {
        if let Some(obj) = index.remove(&key) {
            dispatch(ctx, EventType::Deleted, obj, None);
        }
    }

    Ok(version)
}

/// One watch stream from `version` until it ends. Returns the latest observed
/// resource version, or None when the server signalled that the resume point
/// is gone and a full re-list is required.
async fn watch_once(
    api: &Api<DynamicObject>,
    ctx: &WorkerContext,
    index: &mut HashMap<String, DynamicObject>,
    version: &str,
    synced: &watch::Sender<bool>,
) -> std::result::Result<Option<String>, kube::Error> {
    let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    let mut stream = api.watch(&params, version).await?.boxed();
    let _ = synced.send(true);

    let mut latest = version.to_string();
    while let Some(event) = stream.try_next().await? {
        match event {
            WatchEvent::Added(obj) => {
                update_latest(&mut latest, &obj);
                deliver_applied(ctx, index, obj);
            }
            WatchEvent::Modified(obj) => {
                update_latest(&mut latest, &obj);
                deliver_applied(ctx, index, obj);
            }
            WatchEvent::Deleted(obj) => {
                update_latest(&mut latest, &obj);
                let key = index_key(&obj);
                index.remove(&key);
                dispatch(ctx, EventType::Deleted, obj, None);
            }
            WatchEvent::Bookmark(bookmark) => {
                latest = bookmark.metadata.resource_version.clone();
            }
            WatchEvent::Error(e) if e.code == 410 => {
                return Ok(None);
            }
            // Other in-stream errors (429, 5xx) get the same backoff as
            // transport failures; only an expired resume point warrants an
            // immediate re-list
            WatchEvent::Error(e) => {
                return Err(kube::Error::Api(e));
            }
        }
    }

    Ok(Some(latest))
}

fn update_latest(latest: &mut String, obj: &DynamicObject) {
    if let Some(rv) = &obj.metadata.resource_version
        && !rv.is_empty()
    {
        *latest = rv.clone();
    }
}

/// Apply an observed object against the index and dispatch the resulting
/// transition: ADDED for an unseen identity, MODIFIED (with the prior
/// object) otherwise.
fn deliver_applied(
    ctx: &WorkerContext,
    index: &mut HashMap<String, DynamicObject>,
    obj: DynamicObject,
) {
    let key = index_key(&obj);
    let old = index.insert(key, obj.clone());
    match old {
        Some(previous) => dispatch(ctx, EventType::Modified, obj, Some(previous)),
        None => dispatch(ctx, EventType::Added, obj, None),
    }
}

fn dispatch(ctx: &WorkerContext, event_type: EventType, mut obj: DynamicObject, old: Option<DynamicObject>) {
    ensure_type_meta(&mut obj, ctx);
    ctx.pipeline
        .dispatch(event_type, &ctx.cluster_id, &ctx.gvr, &ctx.kind, obj, old);
}

/// List responses omit apiVersion/kind on items; fill them in from discovery
/// so consumers always see self-describing objects.
fn ensure_type_meta(obj: &mut DynamicObject, ctx: &WorkerContext) {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ctx.gvr.api_version(),
            kind: ctx.kind.clone(),
        });
    }
}

fn index_key(obj: &DynamicObject) -> String {
    format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or(""),
        obj.metadata.name.as_deref().unwrap_or("")
    )
}

fn is_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 410)
}
