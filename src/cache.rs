// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Durable resource cache.
//!
//! Keeps the most recent observed object per identity
//! (cluster, GVR, namespace, name) in a single SQLite file so the UI can be
//! warmed instantly after a restart. Sensitive kinds are redacted before the
//! blob is written; an un-redacted sensitive object never touches disk.

use kube::ResourceExt;
use kube::api::DynamicObject;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::gvr::Gvr;
use crate::redact::Redactor;

/// kubectl keeps a full copy of the applied manifest here; it doubles the
/// blob size and the UI never wants it.
pub(crate) const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Remove the last-applied annotation in place.
pub(crate) fn strip_last_applied(obj: &mut DynamicObject) {
    if let Some(annotations) = obj.metadata.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
    }
}

/// Cache introspection counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total: i64,
    pub sensitive: i64,
    pub per_cluster: HashMap<String, i64>,
}

/// SQLite-backed store of observed objects. Writes are serialized through the
/// connection mutex; the busy timeout rides out the write peaks of a large
/// initial sync.
pub struct ResourceCache {
    conn: Mutex<Option<Connection>>,
    redactor: Arc<Redactor>,
}

impl ResourceCache {
    /// Open (or create) the cache database under `cache_dir`.
    pub fn open(cache_dir: &Path, redactor: Arc<Redactor>) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let conn = Connection::open(cache_dir.join("resource_cache.db"))?;
        Self::from_connection(conn, redactor)
    }

    /// In-memory cache for tests.
    pub fn open_in_memory(redactor: Arc<Redactor>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, redactor)
    }

    fn from_connection(conn: Connection, redactor: Arc<Redactor>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        let _: String = conn.query_row("PRAGMA journal_mode = MEMORY", [], |row| row.get(0))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS resource_cache (
                uid TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                gvr TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                resource_version TEXT NOT NULL,
                data TEXT NOT NULL,
                is_sensitive BOOLEAN DEFAULT FALSE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(cluster_id, gvr, namespace, name)
            );
            CREATE INDEX IF NOT EXISTS idx_updated_at ON resource_cache(updated_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            redactor,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert the latest observation of an object. Strips the last-applied
    /// annotation and stores the redacted twin for sensitive kinds.
    pub fn store(&self, cluster_id: &str, gvr: &Gvr, obj: &DynamicObject) -> Result<()> {
        let mut clean = obj.clone();
        strip_last_applied(&mut clean);

        let kind = clean
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        let is_sensitive = self.redactor.is_sensitive(&gvr.group, &kind);
        let stored = if is_sensitive {
            self.redactor.redact_object(&gvr.group, &kind, &clean)
        } else {
            clean
        };

        let namespace = stored.namespace().unwrap_or_default();
        let name = stored.name_any();
        let resource_version = stored.resource_version().unwrap_or_default();
        // Objects that never hit the API server (e.g. synthetic test input)
        // have no uid; key them on the identity tuple so they cannot collide.
        let uid = match stored.uid() {
            Some(uid) if !uid.is_empty() => uid,
            _ => format!("{}/{}/{}/{}", cluster_id, gvr, namespace, name),
        };
        let data = serde_json::to_string(&stored)?;

        let guard = self.lock();
        let conn = guard.as_ref().ok_or(Error::CacheUnavailable)?;
        // Cached statement: this is the hot path during an initial sync
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT INTO resource_cache
                (uid, cluster_id, gvr, namespace, name, resource_version, data, is_sensitive)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(cluster_id, gvr, namespace, name) DO UPDATE SET
                uid = excluded.uid,
                resource_version = excluded.resource_version,
                data = excluded.data,
                is_sensitive = excluded.is_sensitive,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )?;
        stmt.execute(params![
            &uid,
            cluster_id,
            &gvr.to_string(),
            &namespace,
            &name,
            &resource_version,
            &data,
            is_sensitive,
        ])?;

        Ok(())
    }

    /// Point read by identity. Returns the stored object and whether it was
    /// redacted before storage.
    pub fn get(
        &self,
        cluster_id: &str,
        gvr: &Gvr,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(DynamicObject, bool)>> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(Error::CacheUnavailable)?;

        let row: Option<(String, bool)> = conn
            .query_row(
                r#"
                SELECT data, is_sensitive FROM resource_cache
                WHERE cluster_id = ?1 AND gvr = ?2 AND namespace = ?3 AND name = ?4
                "#,
                params![cluster_id, &gvr.to_string(), namespace, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((data, is_sensitive)) => {
                let obj: DynamicObject = serde_json::from_str(&data)?;
                Ok(Some((obj, is_sensitive)))
            }
            None => Ok(None),
        }
    }

    /// All cached objects for (cluster, gvr), most recently updated first,
    /// plus the lexicographically greatest resource version across the rows.
    /// Resource versions are opaque, so that figure is only a hint; resume
    /// decisions should use the version store instead.
    pub fn load_all(&self, cluster_id: &str, gvr: &Gvr) -> Result<(Vec<DynamicObject>, String)> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(Error::CacheUnavailable)?;

        let mut stmt = conn.prepare(
            r#"
            SELECT data, resource_version FROM resource_cache
            WHERE cluster_id = ?1 AND gvr = ?2
            ORDER BY updated_at DESC
            "#,
        )?;

        let rows = stmt
            .query_map(params![cluster_id, &gvr.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut objects = Vec::with_capacity(rows.len());
        let mut latest_version = String::new();
        for (data, version) in rows {
            let obj: DynamicObject = match serde_json::from_str(&data) {
                Ok(obj) => obj,
                Err(e) => {
                    debug!(cluster = %cluster_id, gvr = %gvr, error = %e, "skipping unparseable cache row");
                    continue;
                }
            };
            objects.push(obj);
            if version > latest_version {
                latest_version = version;
            }
        }

        Ok((objects, latest_version))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(Error::CacheUnavailable)?;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM resource_cache", [], |row| row.get(0))?;
        let sensitive: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resource_cache WHERE is_sensitive = 1",
            [],
            |row| row.get(0),
        )?;

        let mut stmt =
            conn.prepare("SELECT cluster_id, COUNT(*) FROM resource_cache GROUP BY cluster_id")?;
        let per_cluster = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;

        Ok(CacheStats {
            total,
            sensitive,
            per_cluster,
        })
    }

    /// Delete rows not updated within `max_age`. Returns the number removed.
    pub fn clean_older_than(&self, max_age: Duration) -> Result<usize> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(Error::CacheUnavailable)?;

        let removed = conn.execute(
            "DELETE FROM resource_cache WHERE updated_at < datetime('now', '-' || ?1 || ' seconds')",
            params![max_age.as_secs() as i64],
        )?;
        Ok(removed)
    }

    /// Release the database file. Safe to call more than once; subsequent
    /// operations report the cache as unavailable.
    pub fn close(&self) {
        let mut guard = self.lock();
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> ResourceCache {
        ResourceCache::open_in_memory(Arc::new(Redactor::default())).unwrap()
    }

    fn pods() -> Gvr {
        Gvr::new("", "v1", "pods")
    }

    fn secrets() -> Gvr {
        Gvr::new("", "v1", "secrets")
    }

    fn pod(name: &str, version: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": format!("uid-{}", name),
                "resourceVersion": version
            },
            "spec": { "containers": [{ "name": "app", "image": "nginx" }] }
        }))
        .unwrap()
    }

    #[test]
    fn test_store_and_get_roundtrip() {
        let cache = cache();
        let obj = pod("p1", "100");
        cache.store("c1", &pods(), &obj).unwrap();

        let (read, is_sensitive) = cache.get("c1", &pods(), "default", "p1").unwrap().unwrap();
        assert!(!is_sensitive);
        assert_eq!(
            serde_json::to_value(&read).unwrap(),
            serde_json::to_value(&obj).unwrap()
        );
    }

    #[test]
    fn test_get_missing_returns_none() {
        let cache = cache();
        assert!(cache.get("c1", &pods(), "default", "nope").unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_single_row_per_identity() {
        let cache = cache();
        cache.store("c1", &pods(), &pod("p1", "100")).unwrap();
        cache.store("c1", &pods(), &pod("p1", "101")).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 1);

        let (read, _) = cache.get("c1", &pods(), "default", "p1").unwrap().unwrap();
        assert_eq!(read.resource_version().unwrap(), "101");
    }

    #[test]
    fn test_recreated_object_with_new_uid_replaces_row() {
        let cache = cache();
        cache.store("c1", &pods(), &pod("p1", "100")).unwrap();

        let mut recreated = pod("p1", "200");
        recreated.metadata.uid = Some("uid-new".to_string());
        cache.store("c1", &pods(), &recreated).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 1);
        let (read, _) = cache.get("c1", &pods(), "default", "p1").unwrap().unwrap();
        assert_eq!(read.uid().unwrap(), "uid-new");
    }

    #[test]
    fn test_strips_last_applied_annotation() {
        let cache = cache();
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "p1",
                "namespace": "default",
                "uid": "u1",
                "resourceVersion": "1",
                "annotations": {
                    LAST_APPLIED_ANNOTATION: "{\"big\":\"blob\"}",
                    "keep": "me"
                }
            }
        }))
        .unwrap();
        cache.store("c1", &pods(), &obj).unwrap();

        let (read, _) = cache.get("c1", &pods(), "default", "p1").unwrap().unwrap();
        let annotations = read.metadata.annotations.unwrap();
        assert!(!annotations.contains_key(LAST_APPLIED_ANNOTATION));
        assert_eq!(annotations["keep"], "me");
    }

    #[test]
    fn test_sensitive_object_stored_redacted() {
        let cache = cache();
        let secret: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": "s1",
                "namespace": "default",
                "uid": "u-s1",
                "resourceVersion": "9"
            },
            "type": "Opaque",
            "data": { "password": "c2VjcmV0" }
        }))
        .unwrap();
        cache.store("c1", &secrets(), &secret).unwrap();

        let (read, is_sensitive) = cache.get("c1", &secrets(), "default", "s1").unwrap().unwrap();
        assert!(is_sensitive);
        assert_eq!(read.data["data"], crate::redact::REDACTED);
        assert_eq!(read.data["type"], "Opaque");
    }

    #[test]
    fn test_uidless_objects_do_not_collide() {
        let cache = cache();
        let mut a = pod("a", "1");
        a.metadata.uid = None;
        let mut b = pod("b", "1");
        b.metadata.uid = None;
        cache.store("c1", &pods(), &a).unwrap();
        cache.store("c1", &pods(), &b).unwrap();
        assert_eq!(cache.stats().unwrap().total, 2);
    }

    #[test]
    fn test_load_all_returns_objects_and_version_hint() {
        let cache = cache();
        cache.store("c1", &pods(), &pod("a", "5")).unwrap();
        cache.store("c1", &pods(), &pod("b", "12")).unwrap();
        cache.store("c1", &pods(), &pod("c", "9")).unwrap();
        cache.store("c2", &pods(), &pod("other", "99")).unwrap();

        let (objects, latest) = cache.load_all("c1", &pods()).unwrap();
        assert_eq!(objects.len(), 3);
        // Lexicographic, not numeric: "9" > "12"
        assert_eq!(latest, "9");
    }

    #[test]
    fn test_stats_counts() {
        let cache = cache();
        cache.store("c1", &pods(), &pod("a", "1")).unwrap();
        cache.store("c1", &pods(), &pod("b", "1")).unwrap();
        let secret: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "s", "namespace": "default", "uid": "us", "resourceVersion": "1" },
            "data": { "k": "v" }
        }))
        .unwrap();
        cache.store("c2", &secrets(), &secret).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.sensitive, 1);
        assert_eq!(stats.per_cluster["c1"], 2);
        assert_eq!(stats.per_cluster["c2"], 1);
    }

    #[test]
    fn test_bulk_upserts_across_distinct_identities() {
        let cache = cache();

        for i in 0..5000 {
            cache
                .store("c1", &pods(), &pod(&format!("p-{}", i), "1"))
                .unwrap();
        }
        assert_eq!(cache.stats().unwrap().total, 5000);

        // A second wave lands on the identity rows instead of growing the table
        for i in 0..5000 {
            cache
                .store("c1", &pods(), &pod(&format!("p-{}", i), "2"))
                .unwrap();
        }
        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 5000);
        assert_eq!(stats.per_cluster["c1"], 5000);

        let (read, _) = cache
            .get("c1", &pods(), "default", "p-4999")
            .unwrap()
            .unwrap();
        assert_eq!(read.resource_version().unwrap(), "2");

        let (objects, _) = cache.load_all("c1", &pods()).unwrap();
        assert_eq!(objects.len(), 5000);
    }

    #[test]
    fn test_clean_older_than() {
        let cache = cache();
        cache.store("c1", &pods(), &pod("old", "1")).unwrap();
        cache.store("c1", &pods(), &pod("new", "2")).unwrap();

        // Backdate one row past the cutoff
        {
            let guard = cache.lock();
            let conn = guard.as_ref().unwrap();
            conn.execute(
                "UPDATE resource_cache SET updated_at = datetime('now', '-7200 seconds') WHERE name = 'old'",
                [],
            )
            .unwrap();
        }

        let removed = cache.clean_older_than(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("c1", &pods(), "default", "old").unwrap().is_none());
        assert!(cache.get("c1", &pods(), "default", "new").unwrap().is_some());
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_ops() {
        let cache = cache();
        cache.store("c1", &pods(), &pod("p", "1")).unwrap();
        cache.close();
        cache.close();
        assert!(matches!(
            cache.get("c1", &pods(), "default", "p"),
            Err(Error::CacheUnavailable)
        ));
        assert!(matches!(
            cache.store("c1", &pods(), &pod("p", "2")),
            Err(Error::CacheUnavailable)
        ));
    }
}
