//! Orka kubehub: discovery, access reviews and list+watch streams.
//!
//! Everything the cache needs from a cluster goes through [`ClusterClient`].
//! [`KubeHub`] implements it with kube-rs; [`mock::MockCluster`] implements it in memory.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use orka_core::{AccessReview, ApiResourceInfo, Gvk, Object, WatchEvent};

pub mod access;
pub mod mock;
pub mod registry;

pub use access::AccessProber;
pub use registry::TypeRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk(&self) -> Gvk { Gvk::new(&self.group, &self.version, &self.kind) }

    pub fn api_resource(&self) -> ApiResourceInfo {
        ApiResourceInfo { gvk: self.gvk(), plural: self.plural.clone(), namespaced: self.namespaced }
    }
}

/// The cluster-facing operations the cache is built on.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Served resources (incl. CRDs).
    async fn discover(&self) -> Result<Vec<DiscoveredResource>>;

    /// Ask whether the current identity may perform `review.verb` on the resource.
    async fn self_access(&self, review: &AccessReview) -> Result<bool>;

    /// Open a scope-wide list+watch stream. The first item of a healthy stream is a `Restarted` relist.
    fn watch(&self, resource: &ApiResourceInfo) -> BoxStream<'static, Result<WatchEvent>>;
}

pub type SharedClient = Arc<dyn ClusterClient>;

// ----------------- kube-rs implementation -----------------

/// [`ClusterClient`] backed by a kube-rs [`Client`].
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
}

impl KubeHub {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self { client })
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

// List items may come back without apiVersion/kind; fill them so documents are self-describing.
fn to_object(obj: &DynamicObject, res: &ApiResourceInfo) -> Result<Object> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| res.gvk.api_version().into());
        map.entry("kind").or_insert_with(|| res.gvk.kind.clone().into());
    }
    Ok(Object::new(raw))
}

fn convert_event(ev: watcher::Event<DynamicObject>, res: &ApiResourceInfo) -> Result<WatchEvent> {
    Ok(match ev {
        watcher::Event::Applied(o) => WatchEvent::Applied(to_object(&o, res)?),
        watcher::Event::Deleted(o) => WatchEvent::Deleted(to_object(&o, res)?),
        watcher::Event::Restarted(list) => {
            debug!(gvk = %res.gvk, count = list.len(), "watch restart");
            WatchEvent::Restarted(list.iter().map(|o| to_object(o, res)).collect::<Result<Vec<_>>>()?)
        }
    })
}

#[async_trait::async_trait]
impl ClusterClient for KubeHub {
    async fn discover(&self) -> Result<Vec<DiscoveredResource>> {
        let discovery = Discovery::new(self.client.clone()).run().await.context("running discovery")?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        info!(count = out.len(), "discovery complete");
        Ok(out)
    }

    async fn self_access(&self, review: &AccessReview) -> Result<bool> {
        use k8s_openapi::api::authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec};
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let ra = ResourceAttributes {
            group: if review.group.is_empty() { None } else { Some(review.group.clone()) },
            version: Some(review.version.clone()),
            resource: Some(review.resource.clone()),
            verb: Some(review.verb.as_str().to_string()),
            namespace: review.namespace.clone(),
            ..Default::default()
        };
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec { resource_attributes: Some(ra), ..Default::default() },
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &ssar).await.context("creating SelfSubjectAccessReview")?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }

    fn watch(&self, resource: &ApiResourceInfo) -> BoxStream<'static, Result<WatchEvent>> {
        let gvk = GroupVersionKind::gvk(&resource.gvk.group, &resource.gvk.version, &resource.gvk.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &resource.plural);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let res = resource.clone();
        info!(gvk = %res.gvk, plural = %res.plural, "watcher started");
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(move |item| {
                let ev = item.context("watch stream")?;
                convert_event(ev, &res)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res() -> ApiResourceInfo {
        ApiResourceInfo { gvk: Gvk::new("apps", "v1", "Deployment"), plural: "deployments".into(), namespaced: true }
    }

    #[test]
    fn conversion_fills_type_meta_and_strips_managed_fields() {
        let raw = serde_json::json!({
            "metadata": { "name": "web", "namespace": "default", "managedFields": [{ "manager": "kubectl" }] },
            "spec": { "replicas": 2 }
        });
        let obj: DynamicObject = serde_json::from_value(raw).unwrap();
        let out = to_object(&obj, &res()).unwrap();
        let v = out.as_value();
        assert_eq!(v["apiVersion"], "apps/v1");
        assert_eq!(v["kind"], "Deployment");
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(out.name(), Some("web"));
        assert_eq!(v["spec"]["replicas"], 2);
    }

    #[test]
    fn restarted_converts_every_item() {
        let a: DynamicObject = serde_json::from_value(serde_json::json!({ "metadata": { "name": "a" } })).unwrap();
        let b: DynamicObject = serde_json::from_value(serde_json::json!({ "metadata": { "name": "b" } })).unwrap();
        match convert_event(watcher::Event::Restarted(vec![a, b]), &res()).unwrap() {
            WatchEvent::Restarted(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
