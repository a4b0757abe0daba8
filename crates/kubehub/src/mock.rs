//! In-memory cluster for tests and offline use.
//!
//! Resources, grants and seed objects are programmable; every call is counted so
//! callers can assert how often discovery, access reviews and watches happened.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use orka_core::{AccessReview, ApiResourceInfo, Object, PermissionResult, WatchEvent};

use crate::{ClusterClient, DiscoveredResource};

#[derive(Default)]
struct MockState {
    resources: Vec<DiscoveredResource>,
    grants: FxHashMap<String, PermissionResult>,
    failing_reviews: FxHashSet<String>,
    seeds: FxHashMap<String, Vec<Object>>,
    held: FxHashSet<String>,
    feeds: FxHashMap<String, Vec<mpsc::UnboundedSender<Result<WatchEvent>>>>,
    discover_calls: usize,
    probes: FxHashMap<String, usize>,
    watches: FxHashMap<String, usize>,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    pub fn with_resource(self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        self.add_resource(group, version, kind, plural, namespaced);
        self
    }

    pub fn add_resource(&self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) {
        self.state.lock().resources.push(DiscoveredResource {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        });
    }

    /// Resources without an explicit grant allow everything.
    pub fn grant(&self, plural: &str, access: PermissionResult) {
        self.state.lock().grants.insert(plural.to_string(), access);
    }

    /// Make every access review for `plural` fail at the transport level.
    pub fn fail_reviews(&self, plural: &str) {
        self.state.lock().failing_reviews.insert(plural.to_string());
    }

    /// Objects returned by the initial relist of every new watch on `plural`.
    pub fn seed(&self, plural: &str, objects: Vec<Object>) {
        self.state.lock().seeds.insert(plural.to_string(), objects);
    }

    /// Keep new watches on `plural` from sending their initial relist until [`release`](Self::release).
    pub fn hold(&self, plural: &str) {
        self.state.lock().held.insert(plural.to_string());
    }

    /// Send the seeded relist to every open watch on `plural` and stop holding new ones.
    pub fn release(&self, plural: &str) {
        let seed = {
            let mut st = self.state.lock();
            st.held.remove(plural);
            st.seeds.get(plural).cloned().unwrap_or_default()
        };
        self.emit(plural, WatchEvent::Restarted(seed));
    }

    /// Push an event to every open watch on `plural`.
    pub fn emit(&self, plural: &str, event: WatchEvent) {
        self.send(plural, || Ok(event.clone()));
    }

    /// Push a stream error to every open watch on `plural`.
    pub fn fail_watch(&self, plural: &str, msg: &str) {
        self.send(plural, || Err(anyhow!("{}", msg)));
    }

    /// End every open watch stream on `plural`.
    pub fn close_watches(&self, plural: &str) {
        self.state.lock().feeds.remove(plural);
    }

    fn send(&self, plural: &str, item: impl Fn() -> Result<WatchEvent>) {
        let mut st = self.state.lock();
        if let Some(feeds) = st.feeds.get_mut(plural) {
            feeds.retain(|tx| tx.unbounded_send(item()).is_ok());
        }
    }

    pub fn discover_count(&self) -> usize { self.state.lock().discover_calls }
    pub fn probe_count(&self, plural: &str) -> usize { self.state.lock().probes.get(plural).copied().unwrap_or(0) }
    pub fn watch_count(&self, plural: &str) -> usize { self.state.lock().watches.get(plural).copied().unwrap_or(0) }
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    async fn discover(&self) -> Result<Vec<DiscoveredResource>> {
        let mut st = self.state.lock();
        st.discover_calls += 1;
        Ok(st.resources.clone())
    }

    async fn self_access(&self, review: &AccessReview) -> Result<bool> {
        let mut st = self.state.lock();
        *st.probes.entry(review.resource.clone()).or_default() += 1;
        if st.failing_reviews.contains(&review.resource) {
            return Err(anyhow!("access review for {} unavailable", review.resource));
        }
        Ok(st.grants.get(&review.resource).map_or(true, |g| g.allowed(review.verb)))
    }

    fn watch(&self, resource: &ApiResourceInfo) -> BoxStream<'static, Result<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded();
        let mut st = self.state.lock();
        *st.watches.entry(resource.plural.clone()).or_default() += 1;
        if !st.held.contains(&resource.plural) {
            let seed = st.seeds.get(&resource.plural).cloned().unwrap_or_default();
            let _ = tx.unbounded_send(Ok(WatchEvent::Restarted(seed)));
        }
        st.feeds.entry(resource.plural.clone()).or_default().push(tx);
        rx.boxed()
    }
}
