//! Orka public API façade (in-process): the dynamic cache.
//!
//! Callers ask for objects by [`ResourceKey`]. The first request for a kind resolves it,
//! checks get/list/watch access, opens a watch and waits for the initial sync; later
//! requests are served from memory.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, Span};

use orka_core::{CacheConfig, CacheError, Object, ObjectRef, ResourceKey, Result};
use orka_kubehub::{KubeHub, SharedClient};
use orka_store::{ResourceEventHandler, TypeWatcher, WatcherFactory};

pub mod retry;

pub use orka_core::{ErrorKind, Gvk, LabelSelector};
pub use orka_store::ObjectEvent;

/// Read surface other subsystems depend on.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects of the key's kind, narrowed by its namespace and selector.
    async fn list(&self, key: &ResourceKey) -> Result<Vec<Object>>;

    /// The single object named by the key.
    async fn get(&self, key: &ResourceKey) -> Result<Object>;

    /// Register a handler for add/update/delete of the key's kind.
    async fn watch(&self, key: &ResourceKey, handler: Arc<dyn ResourceEventHandler>) -> Result<()>;
}

/// Cache backed by one shared watcher per kind.
#[derive(Clone)]
pub struct DynamicCache {
    factory: Arc<WatcherFactory>,
}

fn ns_field(key: &ResourceKey) -> &str { key.namespace.as_deref().unwrap_or("") }

impl DynamicCache {
    pub fn new(factory: Arc<WatcherFactory>) -> Self { Self { factory } }

    pub fn with_client(client: SharedClient, config: CacheConfig, shutdown: CancellationToken) -> Self {
        Self::new(Arc::new(WatcherFactory::new(client, config, shutdown)))
    }

    /// Build a cache over the ambient kube client, with configuration from the environment.
    pub async fn connect(shutdown: CancellationToken) -> Result<Self> {
        let hub = KubeHub::try_default().await.map_err(|e| CacheError::transient(format!("{:#}", e)))?;
        let config = CacheConfig::from_env();
        info!(?config, "dynamic cache configured");
        Ok(Self::with_client(Arc::new(hub), config, shutdown))
    }

    pub fn factory(&self) -> &Arc<WatcherFactory> { &self.factory }

    async fn watcher(&self, key: &ResourceKey) -> Result<Arc<TypeWatcher>> {
        self.factory.current(key).await.map_err(|e| CacheError::resolving(key, e))
    }

    #[instrument(
        name = "dynamic_cache_list",
        skip(self, key),
        fields(namespace = %ns_field(key), api_version = %key.gvk.api_version(), kind = %key.gvk.kind)
    )]
    pub async fn list(&self, key: &ResourceKey) -> Result<Vec<Object>> {
        let watcher = self.watcher(key).await?;
        let objects = watcher.list(key.namespace.as_deref(), key.selector.as_ref());
        debug!(count = objects.len(), "list served from cache");
        Ok(objects)
    }

    /// Fetch one named object. Transient misses are retried; NotFound is returned at once.
    pub async fn get(&self, key: &ResourceKey) -> Result<Object> {
        self.get_with_retries(key).await.map(|(obj, _)| obj)
    }

    /// Like [`get`](Self::get), also reporting how many times the read was retried.
    #[instrument(
        name = "dynamic_cache_get",
        skip(self, key),
        fields(
            namespace = %ns_field(key),
            api_version = %key.gvk.api_version(),
            kind = %key.gvk.kind,
            object = key.name.as_deref().unwrap_or(""),
            retries = tracing::field::Empty,
        )
    )]
    pub async fn get_with_retries(&self, key: &ResourceKey) -> Result<(Object, u32)> {
        let name = key
            .name
            .as_deref()
            .ok_or_else(|| CacheError::Resolution(format!("get requires a name: {}", key)))?;
        let watcher = self.watcher(key).await?;
        let ns = key.namespace.as_deref();
        let config = self.factory.config();

        let w = &watcher;
        let retry::Retried { result, retries } = retry::fixed_delay(
            config.get_attempts,
            config.get_retry_delay,
            move || async move { w.get(ns, name, None) },
            |e: &CacheError| !e.is_not_found(),
        )
        .await;

        if retries > 0 {
            Span::current().record("retries", retries);
            counter!("cache_get_retries_total", retries as u64);
            info!(retries, "get retried");
        }

        let obj = match result {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => {
                return Err(CacheError::RetriesExhausted { key: key.to_string(), retries, source: Box::new(e) })
            }
        };

        // The store may have matched on labels that no longer hold; check again here.
        if let Some(sel) = &key.selector {
            if !sel.matches(&obj.labels()) {
                return Err(CacheError::FilteredOut {
                    reference: format!("{} {}", key.gvk, ObjectRef::new(ns, name)),
                    selector: sel.to_string(),
                });
            }
        }
        Ok((obj, retries))
    }

    /// Register `handler` on the kind's watcher. Succeeds whenever the kind resolves.
    pub async fn watch<H: ResourceEventHandler>(&self, key: &ResourceKey, handler: H) -> Result<()> {
        let watcher = self.watcher(key).await?;
        watcher.add_handler(handler);
        debug!(gvk = %key.gvk, "handler added");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for DynamicCache {
    async fn list(&self, key: &ResourceKey) -> Result<Vec<Object>> { DynamicCache::list(self, key).await }

    async fn get(&self, key: &ResourceKey) -> Result<Object> { DynamicCache::get(self, key).await }

    async fn watch(&self, key: &ResourceKey, handler: Arc<dyn ResourceEventHandler>) -> Result<()> {
        DynamicCache::watch(self, key, handler).await
    }
}
