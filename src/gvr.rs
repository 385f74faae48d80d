// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! GroupVersionResource addressing.
//!
//! A `Gvr` is the (group, version, resource) triple used to address a
//! Kubernetes API surface. Its string form `"group/version/resource"`
//! (empty group rendered `"/version/resource"`) is stable and used as the
//! map key everywhere a per-kind index is kept: the version store, the
//! cache table, and the per-cluster worker map.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvr {
    /// API group; empty string for the core group
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. "pods"
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// The `apiVersion` string for objects of this GVR ("v1", "apps/v1", ...)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

impl FromStr for Gvr {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [group, version, resource] if !version.is_empty() && !resource.is_empty() => {
                Ok(Gvr::new(*group, *version, *resource))
            }
            _ => Err(crate::Error::Internal(format!(
                "invalid GVR string: '{}' (expected group/version/resource)",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_core_group() {
        let gvr = Gvr::new("", "v1", "pods");
        assert_eq!(gvr.to_string(), "/v1/pods");
    }

    #[test]
    fn test_display_named_group() {
        let gvr = Gvr::new("apps", "v1", "deployments");
        assert_eq!(gvr.to_string(), "apps/v1/deployments");
    }

    #[test]
    fn test_parse_roundtrip() {
        for s in ["/v1/pods", "apps/v1/deployments", "cert-manager.io/v1/certificates"] {
            let gvr: Gvr = s.parse().unwrap();
            assert_eq!(gvr.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("pods".parse::<Gvr>().is_err());
        assert!("a/b/c/d".parse::<Gvr>().is_err());
        assert!("apps//deployments".parse::<Gvr>().is_err());
        assert!("apps/v1/".parse::<Gvr>().is_err());
    }

    #[test]
    fn test_api_version() {
        assert_eq!(Gvr::new("", "v1", "pods").api_version(), "v1");
        assert_eq!(Gvr::new("apps", "v1", "deployments").api_version(), "apps/v1");
    }
}
