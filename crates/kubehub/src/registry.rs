//! Type registry: maps a GVK to the wire resource (plural + scope) it is served under.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use orka_core::{ApiResourceInfo, CacheError, Gvk, Result};

use crate::SharedClient;

/// How long a kind that discovery did not list is answered without asking again.
pub const DEFAULT_MISS_TTL: Duration = Duration::from_secs(5);

pub struct TypeRegistry {
    client: SharedClient,
    table: RwLock<FxHashMap<Gvk, ApiResourceInfo>>,
    misses: Mutex<FxHashMap<Gvk, Instant>>,
    miss_ttl: Duration,
}

impl TypeRegistry {
    pub fn new(client: SharedClient) -> Self {
        Self {
            client,
            table: RwLock::new(FxHashMap::default()),
            misses: Mutex::new(FxHashMap::default()),
            miss_ttl: DEFAULT_MISS_TTL,
        }
    }

    pub fn with_miss_ttl(mut self, ttl: Duration) -> Self {
        self.miss_ttl = ttl;
        self
    }

    pub fn len(&self) -> usize { self.table.read().len() }
    pub fn is_empty(&self) -> bool { self.table.read().is_empty() }

    fn unknown(gvk: &Gvk) -> CacheError { CacheError::Resolution(format!("GVK not found: {}", gvk)) }

    /// Resolve `gvk`, refreshing discovery once on a miss so CRDs installed after startup are found.
    /// A kind that is still missing after a refresh is not looked up again for `miss_ttl`.
    pub async fn resolve(&self, gvk: &Gvk) -> Result<ApiResourceInfo> {
        if let Some(hit) = self.table.read().get(gvk) {
            return Ok(hit.clone());
        }
        let recently_missed = self.misses.lock().get(gvk).map_or(false, |at| at.elapsed() < self.miss_ttl);
        if recently_missed {
            return Err(Self::unknown(gvk));
        }
        self.refresh().await?;
        let found = self.table.read().get(gvk).cloned();
        let mut misses = self.misses.lock();
        match found {
            Some(info) => {
                misses.remove(gvk);
                Ok(info)
            }
            None => {
                let ttl = self.miss_ttl;
                misses.retain(|_, at| at.elapsed() < ttl);
                misses.insert(gvk.clone(), Instant::now());
                Err(Self::unknown(gvk))
            }
        }
    }

    /// Reload the schema table from discovery.
    pub async fn refresh(&self) -> Result<()> {
        let resources = self.client.discover().await.map_err(|e| {
            warn!(error = %e, "discovery failed");
            CacheError::transient(format!("discovery: {:#}", e))
        })?;
        let table: FxHashMap<Gvk, ApiResourceInfo> =
            resources.into_iter().map(|r| (r.gvk(), r.api_resource())).collect();
        debug!(count = table.len(), "type registry refreshed");
        *self.table.write() = table;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::MockCluster;
    use orka_core::ErrorKind;

    #[tokio::test]
    async fn resolves_and_caches() {
        let cluster = Arc::new(MockCluster::new().with_resource("apps", "v1", "Deployment", "deployments", true));
        let reg = TypeRegistry::new(cluster.clone());
        let gvk = Gvk::new("apps", "v1", "Deployment");
        let info = reg.resolve(&gvk).await.unwrap();
        assert_eq!(info.plural, "deployments");
        assert!(info.namespaced);
        reg.resolve(&gvk).await.unwrap();
        assert_eq!(cluster.discover_count(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_resolution_error() {
        let cluster = Arc::new(MockCluster::new().with_resource("", "v1", "Pod", "pods", true));
        let reg = TypeRegistry::new(cluster.clone());
        let err = reg.resolve(&Gvk::new("example.com", "v1", "Widget")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(err.to_string().contains("example.com/v1/Widget"));
    }

    #[tokio::test]
    async fn miss_triggers_refresh_for_late_crds() {
        let cluster = Arc::new(MockCluster::new().with_resource("", "v1", "Pod", "pods", true));
        let reg = TypeRegistry::new(cluster.clone());
        reg.resolve(&Gvk::new("", "v1", "Pod")).await.unwrap();
        cluster.add_resource("example.com", "v1", "Widget", "widgets", false);
        let info = reg.resolve(&Gvk::new("example.com", "v1", "Widget")).await.unwrap();
        assert_eq!(info.plural, "widgets");
        assert_eq!(cluster.discover_count(), 2);
    }

    #[tokio::test]
    async fn repeated_unknown_kind_does_not_rerun_discovery() {
        let cluster = Arc::new(MockCluster::new().with_resource("", "v1", "Pod", "pods", true));
        let reg = TypeRegistry::new(cluster.clone());
        let bogus = Gvk::new("example.com", "v1", "Widget");
        for _ in 0..5 {
            assert_eq!(reg.resolve(&bogus).await.unwrap_err().kind(), ErrorKind::Resolution);
        }
        assert_eq!(cluster.discover_count(), 1);
        assert_eq!(reg.misses.lock().len(), 1);

        // Once the window has passed the kind is looked up again.
        let reg = TypeRegistry::new(cluster.clone()).with_miss_ttl(Duration::ZERO);
        reg.resolve(&bogus).await.unwrap_err();
        reg.resolve(&bogus).await.unwrap_err();
        assert_eq!(cluster.discover_count(), 3);
    }
}
