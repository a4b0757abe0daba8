//! Watcher factory: lazily creates one [`TypeWatcher`] per resource and bootstraps it once.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orka_core::{ApiResourceInfo, CacheConfig, CacheError, Gvk, ResourceKey, Result};
use orka_kubehub::{AccessProber, SharedClient, TypeRegistry};

use crate::TypeWatcher;

#[derive(Default)]
struct FactoryState {
    /// Underlying streams keyed by wire resource (`group/version/plural`).
    watchers: FxHashMap<String, Arc<TypeWatcher>>,
    /// Kinds whose bootstrap sync has completed, with the resource they resolved to.
    seen: FxHashMap<Gvk, String>,
    /// Serializes the first-touch path per kind.
    slots: FxHashMap<Gvk, Arc<tokio::sync::Mutex<()>>>,
}

/// Process-wide registry of per-type watchers.
pub struct WatcherFactory {
    client: SharedClient,
    registry: TypeRegistry,
    prober: AccessProber,
    config: CacheConfig,
    shutdown: CancellationToken,
    state: Mutex<FactoryState>,
}

fn resource_name(res: &ApiResourceInfo) -> String {
    format!("{}/{}/{}", res.gvk.group, res.gvk.version, res.plural)
}

impl WatcherFactory {
    pub fn new(client: SharedClient, config: CacheConfig, shutdown: CancellationToken) -> Self {
        Self {
            registry: TypeRegistry::new(Arc::clone(&client)),
            prober: AccessProber::new(Arc::clone(&client)),
            client,
            config,
            shutdown,
            state: Mutex::new(FactoryState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig { &self.config }
    pub fn shutdown_token(&self) -> &CancellationToken { &self.shutdown }

    /// Number of underlying streams opened so far.
    pub fn started(&self) -> usize { self.state.lock().watchers.len() }

    pub fn is_seen(&self, gvk: &Gvk) -> bool { self.state.lock().seen.contains_key(gvk) }

    pub fn seen_kinds(&self) -> FxHashSet<Gvk> { self.state.lock().seen.keys().cloned().collect() }

    /// Stop every watcher by cancelling the shared shutdown token.
    pub fn shutdown(&self) {
        info!(watchers = self.started(), "stopping all watchers");
        self.shutdown.cancel();
    }

    /// Watcher of a kind that finished bootstrap and whose stream is still running.
    fn seen_watcher(&self, gvk: &Gvk) -> Option<Arc<TypeWatcher>> {
        let st = self.state.lock();
        st.seen.get(gvk).and_then(|name| st.watchers.get(name)).filter(|w| w.is_running()).cloned()
    }

    /// Number of kinds with a first-touch slot currently held or awaited.
    pub fn pending_slots(&self) -> usize { self.state.lock().slots.len() }

    /// Return the synced watcher for `key`'s kind, creating, permission-checking and
    /// bootstrapping it on first use. A kind whose stream stopped is bootstrapped again.
    pub async fn current(&self, key: &ResourceKey) -> Result<Arc<TypeWatcher>> {
        let gvk = &key.gvk;
        if let Some(w) = self.seen_watcher(gvk) {
            return Ok(w);
        }
        if self.shutdown.is_cancelled() {
            return Err(CacheError::ShuttingDown);
        }

        let slot = {
            let mut st = self.state.lock();
            Arc::clone(st.slots.entry(gvk.clone()).or_default())
        };
        // Only callers of this kind queue here; other kinds keep going.
        let first_touch = slot.lock().await;
        let res = match self.seen_watcher(gvk) {
            Some(w) => Ok(w),
            None => self.bootstrap(gvk).await,
        };

        // The last caller through drops the slot, so failed or unknown kinds leave nothing behind.
        {
            let mut st = self.state.lock();
            let last = st.slots.get(gvk).map_or(false, |cur| Arc::ptr_eq(cur, &slot) && Arc::strong_count(&slot) == 2);
            if last {
                st.slots.remove(gvk);
            }
        }
        drop(first_touch);
        res
    }

    async fn bootstrap(&self, gvk: &Gvk) -> Result<Arc<TypeWatcher>> {
        let resource = self.registry.resolve(gvk).await?;
        self.prober.check(&resource).await?;
        let name = resource_name(&resource);
        let watcher = self.watcher_for(&resource);

        let t0 = Instant::now();
        self.wait_synced(&watcher).await?;
        histogram!("cache_sync_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(gvk = %gvk, resource = %name, took_ms = %t0.elapsed().as_millis(), objects = watcher.len(), "watcher ready");

        self.state.lock().seen.insert(gvk.clone(), name);
        Ok(watcher)
    }

    /// Get or open the stream for a wire resource. Asking twice yields the same watcher
    /// unless the previous one has stopped.
    pub fn watcher_for(&self, resource: &ApiResourceInfo) -> Arc<TypeWatcher> {
        let name = resource_name(resource);
        let mut st = self.state.lock();
        if let Some(w) = st.watchers.get(&name) {
            if w.is_running() {
                return Arc::clone(w);
            }
            warn!(resource = %name, "replacing stopped watcher");
        }
        let stream = self.client.watch(resource);
        let w = TypeWatcher::spawn(resource.clone(), stream, self.config.event_queue_cap, self.shutdown.child_token());
        counter!("cache_watchers_started_total", 1u64);
        debug!(resource = %name, "watcher created");
        st.watchers.insert(name, Arc::clone(&w));
        w
    }

    async fn wait_synced(&self, watcher: &TypeWatcher) -> Result<()> {
        match self.config.sync_timeout {
            None => watcher.wait_synced(&self.shutdown).await,
            Some(limit) => match tokio::time::timeout(limit, watcher.wait_synced(&self.shutdown)).await {
                Ok(res) => res,
                Err(_) => Err(CacheError::transient(format!(
                    "timed out after {:?} waiting for {} to sync",
                    limit,
                    watcher.resource().gvk
                ))),
            },
        }
    }
}
