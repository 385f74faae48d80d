// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Sensitive-field redaction.
//!
//! A [`SensitivePolicy`] maps `"group/Kind"` keys to field paths whose values
//! must never leave the process un-redacted. Paths are dotted
//! (`spec.auth`) with at most one `[*]` wildcard meaning "every element of
//! this array". Redaction is best-effort: a path that does not exist in the
//! object silently does nothing.
//!
//! The redactor compiles paths once and rewrites the object tree directly;
//! there is no serialize/deserialize round trip.

use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Literal written over redacted values.
pub const REDACTED: &str = "<redacted>";

/// Declarative redaction policy: `"group/Kind"` -> sensitive field paths.
/// The core group uses an empty group, so a Secret's key is `"/Secret"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivePolicy {
    pub resources: HashMap<String, Vec<String>>,
}

impl SensitivePolicy {
    /// Map key for a group/kind pair.
    pub fn key(group: &str, kind: &str) -> String {
        format!("{}/{}", group, kind)
    }
}

impl Default for SensitivePolicy {
    fn default() -> Self {
        let mut resources = HashMap::new();
        resources.insert(
            "/Secret".to_string(),
            vec!["data".to_string(), "stringData".to_string()],
        );
        resources.insert(
            "external-secrets.io/SecretStore".to_string(),
            vec!["spec.provider".to_string(), "spec.auth".to_string()],
        );
        resources.insert(
            "external-secrets.io/ClusterSecretStore".to_string(),
            vec!["spec.provider".to_string(), "spec.auth".to_string()],
        );
        resources.insert(
            "bitnami.com/SealedSecret".to_string(),
            vec!["spec.encryptedData".to_string()],
        );
        resources.insert(
            "cert-manager.io/Certificate".to_string(),
            vec!["spec.privateKey".to_string(), "spec.keystores".to_string()],
        );
        Self { resources }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    AllElements,
}

#[derive(Debug, Clone)]
struct FieldPath {
    segments: Vec<Segment>,
}

/// Compile a dotted path with optional single `[*]` wildcard.
/// Returns None for paths the DSL cannot express (more than one wildcard,
/// empty path).
fn compile_path(path: &str) -> Option<FieldPath> {
    let wildcard_count = path.matches("[*]").count();
    if wildcard_count > 1 {
        return None;
    }

    let mut segments = Vec::new();
    let (prefix, suffix) = match path.split_once("[*]") {
        Some((p, s)) => (p, Some(s.trim_start_matches('.'))),
        None => (path, None),
    };

    for part in prefix.split('.').filter(|p| !p.is_empty()) {
        segments.push(Segment::Field(part.to_string()));
    }
    if let Some(suffix) = suffix {
        // The wildcard needs an array to apply to
        if segments.is_empty() {
            return None;
        }
        segments.push(Segment::AllElements);
        for part in suffix.split('.').filter(|p| !p.is_empty()) {
            segments.push(Segment::Field(part.to_string()));
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(FieldPath { segments })
    }
}

fn redact_path(value: &mut Value, segments: &[Segment]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    match head {
        Segment::Field(name) => {
            let Some(map) = value.as_object_mut() else {
                return;
            };
            if rest.is_empty() {
                // Only overwrite fields that actually exist
                if map.contains_key(name) {
                    map.insert(name.clone(), Value::String(REDACTED.to_string()));
                }
            } else if let Some(child) = map.get_mut(name) {
                redact_path(child, rest);
            }
        }
        Segment::AllElements => {
            let Some(elements) = value.as_array_mut() else {
                return;
            };
            for element in elements {
                if rest.is_empty() {
                    // Bare wildcard: blank every field of every object element
                    if let Some(map) = element.as_object_mut() {
                        for v in map.values_mut() {
                            *v = Value::String(REDACTED.to_string());
                        }
                    }
                } else {
                    redact_path(element, rest);
                }
            }
        }
    }
}

/// Stateless redactor over an immutable policy.
pub struct Redactor {
    policy: SensitivePolicy,
    compiled: HashMap<String, Vec<FieldPath>>,
}

impl Redactor {
    pub fn new(policy: SensitivePolicy) -> Self {
        let mut compiled = HashMap::new();
        for (key, paths) in &policy.resources {
            let mut field_paths = Vec::new();
            for path in paths {
                match compile_path(path) {
                    Some(fp) => field_paths.push(fp),
                    None => {
                        warn!(key = %key, path = %path, "skipping invalid sensitive field path");
                    }
                }
            }
            compiled.insert(key.clone(), field_paths);
        }
        Self { policy, compiled }
    }

    pub fn policy(&self) -> &SensitivePolicy {
        &self.policy
    }

    /// Whether objects of this group/kind carry sensitive fields.
    pub fn is_sensitive(&self, group: &str, kind: &str) -> bool {
        self.policy
            .resources
            .contains_key(&SensitivePolicy::key(group, kind))
    }

    /// Rewrite the configured field paths of `value` in place.
    pub fn redact_value(&self, group: &str, kind: &str, value: &mut Value) {
        if let Some(paths) = self.compiled.get(&SensitivePolicy::key(group, kind)) {
            for path in paths {
                redact_path(value, &path.segments);
            }
        }
    }

    /// Produce a redacted deep copy of the object. Kinds absent from the
    /// policy still get a copy, since callers hand the twin to the cache and
    /// the event stream independently of the original.
    pub fn redact_object(&self, group: &str, kind: &str, obj: &DynamicObject) -> DynamicObject {
        let mut copy = obj.clone();
        self.redact_value(group, kind, &mut copy.data);
        copy
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(SensitivePolicy::default())
    }
}
