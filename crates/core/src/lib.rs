//! Orka core types: resource keys, dynamic objects, watch events and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod selector;

pub use config::CacheConfig;
pub use error::{CacheError, ErrorKind, Result};
pub use selector::{Expression, LabelSelector};

pub mod prelude {
    pub use super::{
        ApiResourceInfo, CacheConfig, CacheError, ErrorKind, Gvk, LabelSelector, Object, ObjectRef, PermissionResult,
        ResourceKey, Verb, WatchEvent,
    };
}

// ---------------- Resource identity ----------------

/// Group/Version/Kind triple. This is the identity a cache entry is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Parse a key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(CacheError::Resolution(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// A request against the cache: the type plus optional query parameters.
///
/// Only `gvk` takes part in cache identity. `namespace`, `name` and `selector`
/// narrow the query and never create a second watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub selector: Option<LabelSelector>,
}

impl ResourceKey {
    pub fn new(gvk: Gvk) -> Self {
        Self { gvk, namespace: None, name: None, selector: None }
    }

    pub fn parse(gvk_key: &str) -> Result<Self> {
        Ok(Self::new(Gvk::parse(gvk_key)?))
    }

    /// Empty namespaces are treated as "all namespaces".
    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.namespace = if ns.is_empty() { None } else { Some(ns) };
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = Some(selector);
        self
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gvk)?;
        if let Some(ns) = &self.namespace { write!(f, " ns={}", ns)?; }
        if let Some(name) = &self.name { write!(f, " name={}", name)?; }
        if let Some(sel) = &self.selector { write!(f, " selector={}", sel)?; }
        Ok(())
    }
}

/// Wire-addressable resource for a kind, as served by the API server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    pub gvk: Gvk,
    /// Plural resource name used in URLs and access reviews.
    pub plural: String,
    pub namespaced: bool,
}

// ---------------- Objects ----------------

/// A cluster object as a dynamically typed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(serde_json::Value);

impl Object {
    pub fn new(raw: serde_json::Value) -> Self { Self(raw) }

    pub fn as_value(&self) -> &serde_json::Value { &self.0 }
    pub fn into_value(self) -> serde_json::Value { self.0 }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> { self.meta_str("name") }

    /// Namespace, with empty strings normalized to `None` (cluster scoped).
    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace").filter(|s| !s.is_empty()) }

    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }
    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn object_ref(&self) -> Option<ObjectRef> {
        self.name().map(|name| ObjectRef { namespace: self.namespace().map(str::to_string), name: name.to_string() })
    }
}

impl From<serde_json::Value> for Object {
    fn from(v: serde_json::Value) -> Self { Self(v) }
}

/// Store key for a single object within one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|s| !s.is_empty()).map(str::to_string), name: name.to_string() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ---------------- Watch stream ----------------

/// Events produced by a list+watch stream for a single type.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(Object),
    Deleted(Object),
    /// Full relist. Replaces the contents of the store; the first one completes bootstrap.
    Restarted(Vec<Object>),
}

// ---------------- Permissions ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    List,
    Watch,
}

impl Verb {
    pub const REQUIRED: [Verb; 3] = [Verb::Get, Verb::List, Verb::Watch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A self access review for one verb on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReview {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub verb: Verb,
    pub namespace: Option<String>,
}

/// Outcome of probing get/list/watch for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionResult {
    pub get: bool,
    pub list: bool,
    pub watch: bool,
}

impl PermissionResult {
    pub fn set(&mut self, verb: Verb, allowed: bool) {
        match verb {
            Verb::Get => self.get = allowed,
            Verb::List => self.list = allowed,
            Verb::Watch => self.watch = allowed,
        }
    }

    pub fn allowed(&self, verb: Verb) -> bool {
        match verb {
            Verb::Get => self.get,
            Verb::List => self.list,
            Verb::Watch => self.watch,
        }
    }

    pub fn all_allowed(&self) -> bool { self.get && self.list && self.watch }

    /// Fails with `AccessDenied` naming every verb's state unless all are granted.
    pub fn ensure(&self, resource: &str) -> Result<()> {
        if self.all_allowed() {
            return Ok(());
        }
        Err(CacheError::AccessDenied { resource: resource.to_string(), access: *self })
    }
}

impl fmt::Display for PermissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "get:{}, list:{}, watch:{}", self.get, self.list, self.watch)
    }
}
