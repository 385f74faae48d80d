use kube::api::{Api, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::{Client, Config};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::watcher::WatchWorker;
use crate::error::{Error, Result};
use crate::gvr::Gvr;

/// Timeout for connecting to a cluster's API server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for reading API responses
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Connected,
    /// Reserved; no transition drives this today
    Disconnected,
    Error,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterStatus::Connected => write!(f, "connected"),
            ClusterStatus::Disconnected => write!(f, "disconnected"),
            ClusterStatus::Error => write!(f, "error"),
        }
    }
}

/// Serializable snapshot of a cluster connection, shaped for the host UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub id: String,
    pub name: String,
    pub context: String,
    pub server: String,
    pub status: ClusterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub is_pinned: bool,
}

struct ClusterState {
    status: ClusterStatus,
    last_error: Option<String>,
    pinned: bool,
}

/// A connection to one Kubernetes cluster: its client, the map of active
/// watch workers, and the per-cluster state the host renders.
pub(crate) struct ClusterConnection {
    pub(crate) id: String,
    name: String,
    context: String,
    server: String,
    client: Client,
    state: RwLock<ClusterState>,
    workers: RwLock<HashMap<Gvr, WatchWorker>>,
    /// Discovery results are cached per GVR; a cluster's API surface rarely
    /// changes within a connection's lifetime.
    resolved: RwLock<HashMap<Gvr, (ApiResource, Scope)>>,
}

impl ClusterConnection {
    /// Build a connection from a kubeconfig, which may be either the full
    /// YAML text or a path to a file containing it. The path form is only
    /// tried after the blob fails to parse. An empty context selects the
    /// kubeconfig's current-context.
    pub(crate) async fn connect(
        id: &str,
        name: &str,
        kubeconfig: &str,
        context: &str,
    ) -> Result<Self> {
        let kc = match Kubeconfig::from_yaml(kubeconfig) {
            Ok(kc) => kc,
            Err(parse_err) => Kubeconfig::read_from(kubeconfig).map_err(|path_err| {
                Error::Kubeconfig(format!(
                    "not valid kubeconfig YAML ({parse_err}); not a readable kubeconfig path ({path_err})"
                ))
            })?,
        };

        let options = KubeConfigOptions {
            context: (!context.is_empty()).then(|| context.to_string()),
            ..Default::default()
        };
        let mut config = Config::from_custom_kubeconfig(kc, &options)
            .await
            .map_err(|e| Error::Kubeconfig(e.to_string()))?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let server = config.cluster_url.to_string();
        let client = Client::try_from(config)?;

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            context: context.to_string(),
            server,
            client,
            state: RwLock::new(ClusterState {
                status: ClusterStatus::Connected,
                last_error: None,
                pinned: false,
            }),
            workers: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve a GVR to its ApiResource and scope via the discovery API,
    /// filtered to the GVR's group.
    pub(crate) async fn resolve(&self, gvr: &Gvr) -> Result<(ApiResource, Scope)> {
        {
            let resolved = self.resolved.read().await;
            if let Some((ar, scope)) = resolved.get(gvr) {
                return Ok((ar.clone(), scope.clone()));
            }
        }

        debug!(cluster = %self.id, gvr = %gvr, "resolving GVR via discovery");
        let discovery = Discovery::new(self.client.clone())
            .filter(&[gvr.group.as_str()])
            .run()
            .await?;

        let mut found = None;
        for group in discovery.groups() {
            if group.name() != gvr.group {
                continue;
            }
            for (ar, caps) in group.versioned_resources(&gvr.version) {
                if ar.plural == gvr.resource {
                    found = Some((ar, caps.scope));
                    break;
                }
            }
        }

        let (ar, scope) = found.ok_or_else(|| Error::Discovery {
            cluster: self.id.clone(),
            gvr: gvr.to_string(),
        })?;

        self.resolved
            .write()
            .await
            .insert(gvr.clone(), (ar.clone(), scope.clone()));
        Ok((ar, scope))
    }

    /// Dynamic API handle, namespaced when the resource is and a namespace
    /// was requested.
    pub(crate) fn dynamic_api(
        &self,
        ar: &ApiResource,
        scope: &Scope,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        if matches!(scope, Scope::Namespaced)
            && let Some(ns) = namespace
            && !ns.is_empty()
        {
            Api::namespaced_with(self.client.clone(), ns, ar)
        } else {
            Api::all_with(self.client.clone(), ar)
        }
    }

    /// Probe API access for a GVR before committing a watch worker to it.
    pub(crate) async fn preflight(
        &self,
        api: &Api<DynamicObject>,
    ) -> std::result::Result<(), kube::Error> {
        let params = ListParams::default().limit(1);
        api.list(&params).await.map(|_| ())
    }

    pub(crate) async fn set_error(&self, message: impl Into<String>) {
        let mut state = self.state.write().await;
        state.status = ClusterStatus::Error;
        state.last_error = Some(message.into());
    }

    pub(crate) async fn set_pinned(&self, pinned: bool) {
        self.state.write().await.pinned = pinned;
    }

    pub(crate) async fn snapshot(&self) -> ClusterInfo {
        let state = self.state.read().await;
        ClusterInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            context: self.context.clone(),
            server: self.server.clone(),
            status: state.status,
            last_error: state.last_error.clone(),
            is_pinned: state.pinned,
        }
    }

    pub(crate) async fn has_worker(&self, gvr: &Gvr) -> bool {
        self.workers.read().await.contains_key(gvr)
    }

    /// Register a worker unless one already holds the slot. Returns false
    /// (dropping the new worker, which aborts its task) on a lost race.
    pub(crate) async fn insert_worker(&self, gvr: Gvr, worker: WatchWorker) -> bool {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&gvr) {
            return false;
        }
        workers.insert(gvr, worker);
        true
    }

    pub(crate) async fn remove_worker(&self, gvr: &Gvr) -> Option<WatchWorker> {
        self.workers.write().await.remove(gvr)
    }

    /// Stop every watch worker. Dropping a worker aborts its task, so this is
    /// bounded regardless of what the streams are doing.
    pub(crate) async fn stop_all_workers(&self) {
        self.workers.write().await.clear();
    }
}
