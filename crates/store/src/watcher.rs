//! Per-type watcher: one list+watch stream feeding an in-RAM store.
//!
//! The ingest task owns the writable map. After each batch it publishes an immutable
//! snapshot through `ArcSwap`, so readers never lock and never see a half-applied record.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::{stream::BoxStream, FutureExt, StreamExt};
use metrics::gauge;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orka_core::{ApiResourceInfo, CacheError, LabelSelector, Object, ObjectRef, Result, WatchEvent};

use crate::handler::{HandlerSlot, Notification, ResourceEventHandler};

/// Immutable view of one type's objects.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<ObjectRef, Arc<Object>>,
}

/// Applies watch events to a working map and reports the resulting changes.
#[derive(Default)]
pub(crate) struct StoreWriter {
    epoch: u64,
    items: FxHashMap<ObjectRef, Arc<Object>>,
}

impl StoreWriter {
    fn upsert(&mut self, obj: Object, out: &mut Vec<Notification>) {
        let Some(key) = obj.object_ref() else {
            warn!("object without metadata.name ignored");
            return;
        };
        let new = Arc::new(obj);
        match self.items.insert(key, Arc::clone(&new)) {
            Some(old) => out.push(Notification::Updated { old, new }),
            None => out.push(Notification::Added(new)),
        }
    }

    pub(crate) fn apply(&mut self, ev: WatchEvent, out: &mut Vec<Notification>) {
        match ev {
            WatchEvent::Applied(obj) => self.upsert(obj, out),
            WatchEvent::Deleted(obj) => {
                if let Some(key) = obj.object_ref() {
                    if self.items.remove(&key).is_some() {
                        out.push(Notification::Deleted(Arc::new(obj)));
                    }
                }
            }
            WatchEvent::Restarted(list) => {
                let mut next: FxHashMap<ObjectRef, Arc<Object>> = FxHashMap::default();
                for obj in list {
                    let Some(key) = obj.object_ref() else { continue };
                    let new = Arc::new(obj);
                    match self.items.remove(&key) {
                        Some(old) if old == new => {
                            next.insert(key, old);
                        }
                        Some(old) => {
                            out.push(Notification::Updated { old, new: Arc::clone(&new) });
                            next.insert(key, new);
                        }
                        None => {
                            out.push(Notification::Added(Arc::clone(&new)));
                            next.insert(key, new);
                        }
                    }
                }
                // Whatever the relist did not mention is gone.
                let mut gone: Vec<_> = self.items.drain().collect();
                gone.sort_by(|a, b| a.0.cmp(&b.0));
                out.extend(gone.into_iter().map(|(_, o)| Notification::Deleted(o)));
                self.items = next;
            }
        }
    }

    pub(crate) fn freeze(&mut self) -> Arc<StoreSnapshot> {
        self.epoch = self.epoch.saturating_add(1);
        Arc::new(StoreSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Watch-backed cache for exactly one resource type.
pub struct TypeWatcher {
    resource: ApiResourceInfo,
    snap: ArcSwap<StoreSnapshot>,
    synced_rx: watch::Receiver<bool>,
    /// Last stream error since the most recent successful event.
    degraded: ArcSwapOption<String>,
    handlers: Mutex<Vec<HandlerSlot>>,
    events: AtomicU64,
    token: CancellationToken,
}

impl TypeWatcher {
    /// Start consuming `stream` on a background task. The watcher stops when `token` is cancelled
    /// or the stream ends.
    pub fn spawn(
        resource: ApiResourceInfo,
        stream: BoxStream<'static, anyhow::Result<WatchEvent>>,
        batch_cap: usize,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (synced_tx, synced_rx) = watch::channel(false);
        let watcher = Arc::new(Self {
            resource,
            snap: ArcSwap::from_pointee(StoreSnapshot::default()),
            synced_rx,
            degraded: ArcSwapOption::empty(),
            handlers: Mutex::new(Vec::new()),
            events: AtomicU64::new(0),
            token,
        });
        tokio::spawn(ingest(Arc::clone(&watcher), stream, batch_cap.max(1), synced_tx));
        watcher
    }

    pub fn resource(&self) -> &ApiResourceInfo { &self.resource }
    pub fn is_synced(&self) -> bool { *self.synced_rx.borrow() }
    pub fn len(&self) -> usize { self.snap.load().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn epoch(&self) -> u64 { self.snap.load().epoch }
    pub fn events_seen(&self) -> u64 { self.events.load(Ordering::Relaxed) }
    pub fn handler_count(&self) -> usize { self.handlers.lock().len() }

    /// False once the ingest task has exited (stream ended or stopped).
    pub fn is_running(&self) -> bool { self.synced_rx.has_changed().is_ok() }

    pub fn degraded(&self) -> Option<String> { self.degraded.load_full().map(|s| (*s).clone()) }

    pub fn stop(&self) { self.token.cancel(); }

    /// Wait for the bootstrap relist to land in the store.
    pub async fn wait_synced(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut rx = self.synced_rx.clone();
        if *rx.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            _ = shutdown.cancelled() => Err(CacheError::ShuttingDown),
            res = rx.wait_for(|synced| *synced) => match res {
                Ok(_) => Ok(()),
                Err(_) if shutdown.is_cancelled() || self.token.is_cancelled() => Err(CacheError::ShuttingDown),
                Err(_) => Err(CacheError::transient(format!(
                    "watch for {} ended before initial sync{}",
                    self.resource.gvk,
                    self.degraded().map(|e| format!(": {}", e)).unwrap_or_default()
                ))),
            },
        }
    }

    // Cluster-scoped kinds have no namespace; a caller-supplied one is ignored for them.
    fn scope<'a>(&self, namespace: Option<&'a str>) -> Option<&'a str> {
        if self.resource.namespaced { namespace.filter(|s| !s.is_empty()) } else { None }
    }

    /// Local read of every object in `namespace` (all namespaces when `None`) matching `selector`.
    pub fn list(&self, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Vec<Object> {
        let ns = self.scope(namespace);
        let snap = self.snap.load();
        let mut hits: Vec<(&ObjectRef, &Arc<Object>)> = snap
            .items
            .iter()
            .filter(|(k, _)| ns.map_or(true, |ns| k.namespace.as_deref() == Some(ns)))
            .filter(|(_, o)| selector.map_or(true, |s| s.matches(&o.labels())))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(b.0));
        hits.into_iter().map(|(_, o)| (**o).clone()).collect()
    }

    /// Local read by name. Absence while the stream is recovering is reported as transient.
    pub fn get(&self, namespace: Option<&str>, name: &str, selector: Option<&LabelSelector>) -> Result<Object> {
        let key = ObjectRef::new(self.scope(namespace), name);
        if !self.is_synced() {
            return Err(CacheError::transient(format!("{} is not synced yet", self.resource.gvk)));
        }
        let snap = self.snap.load();
        match snap.items.get(&key) {
            Some(obj) => {
                if let Some(sel) = selector {
                    if !sel.matches(&obj.labels()) {
                        return Err(CacheError::FilteredOut { reference: key.to_string(), selector: sel.to_string() });
                    }
                }
                Ok((**obj).clone())
            }
            None => match self.degraded() {
                Some(err) => Err(CacheError::transient(format!(
                    "{} {} not in cache while watch is recovering: {}",
                    self.resource.gvk, key, err
                ))),
                None => Err(CacheError::not_found(format!("{} {}", self.resource.gvk, key))),
            },
        }
    }

    /// Register `handler`. It first receives an add for every cached object, then live changes.
    pub fn add_handler<H: ResourceEventHandler>(&self, handler: H) {
        let slot = HandlerSlot::spawn(handler, self.resource.gvk.to_string());
        let mut handlers = self.handlers.lock();
        // Holding the handler lock keeps the ingest task from publishing between replay and registration.
        let snap = self.snap.load();
        let mut existing: Vec<_> = snap.items.iter().collect();
        existing.sort_by(|a, b| a.0.cmp(b.0));
        for (_, obj) in existing {
            slot.send(Notification::Added(Arc::clone(obj)));
        }
        handlers.push(slot);
        debug!(gvk = %self.resource.gvk, handlers = handlers.len(), "handler registered");
    }

    fn publish(&self, writer: &mut StoreWriter, notes: Vec<Notification>) {
        let mut handlers = self.handlers.lock();
        let next = writer.freeze();
        gauge!("cache_objects", next.items.len() as f64, "gvk" => self.resource.gvk.to_string());
        self.snap.store(next);
        if notes.is_empty() {
            return;
        }
        handlers.retain(|h| notes.iter().all(|n| h.send(n.clone())));
    }
}

impl fmt::Debug for TypeWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeWatcher")
            .field("gvk", &self.resource.gvk.to_string())
            .field("synced", &self.is_synced())
            .field("len", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn ingest(
    watcher: Arc<TypeWatcher>,
    stream: BoxStream<'static, anyhow::Result<WatchEvent>>,
    batch_cap: usize,
    synced_tx: watch::Sender<bool>,
) {
    let gvk = watcher.resource.gvk.to_string();
    let mut stream = stream.fuse();
    let mut writer = StoreWriter::default();
    loop {
        let first = tokio::select! {
            _ = watcher.token.cancelled() => {
                debug!(gvk = %gvk, "watcher cancelled");
                break;
            }
            item = stream.next() => item,
        };
        let Some(first) = first else {
            warn!(gvk = %gvk, "watch stream ended");
            watcher.degraded.store(Some(Arc::new("watch stream ended".to_string())));
            break;
        };
        // Coalesce whatever is already queued into one snapshot swap.
        let mut batch = vec![first];
        while batch.len() < batch_cap {
            match stream.next().now_or_never() {
                Some(Some(item)) => batch.push(item),
                _ => break,
            }
        }

        let mut notes = Vec::new();
        let mut relisted = false;
        let mut applied = 0u64;
        for item in batch {
            match item {
                Ok(ev) => {
                    applied += 1;
                    relisted |= matches!(ev, WatchEvent::Restarted(_));
                    watcher.degraded.store(None);
                    writer.apply(ev, &mut notes);
                }
                Err(e) => {
                    warn!(gvk = %gvk, error = %e, "watch stream error");
                    watcher.degraded.store(Some(Arc::new(format!("{:#}", e))));
                }
            }
        }
        watcher.publish(&mut writer, notes);
        watcher.events.fetch_add(applied, Ordering::Relaxed);
        if relisted && !*synced_tx.borrow() {
            info!(gvk = %gvk, objects = watcher.len(), "initial sync complete");
            synced_tx.send_replace(true);
        }
    }
    // Dropping the handler queues ends their delivery tasks once drained.
    watcher.handlers.lock().clear();
    info!(gvk = %gvk, "ingest loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str, ns: Option<&str>, rv: &str) -> Object {
        let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
        if let Some(ns) = ns {
            meta["namespace"] = serde_json::Value::String(ns.to_string());
        }
        Object::new(serde_json::json!({ "metadata": meta }))
    }

    fn kinds(notes: &[Notification]) -> Vec<&'static str> {
        notes
            .iter()
            .map(|n| match n {
                Notification::Added(_) => "add",
                Notification::Updated { .. } => "update",
                Notification::Deleted(_) => "delete",
            })
            .collect()
    }

    #[test]
    fn applied_then_deleted_sequence() {
        let mut w = StoreWriter::default();
        let mut notes = Vec::new();
        w.apply(WatchEvent::Applied(obj("a", Some("ns"), "1")), &mut notes);
        w.apply(WatchEvent::Applied(obj("a", Some("ns"), "2")), &mut notes);
        w.apply(WatchEvent::Deleted(obj("a", Some("ns"), "2")), &mut notes);
        w.apply(WatchEvent::Deleted(obj("ghost", None, "1")), &mut notes);
        assert_eq!(kinds(&notes), vec!["add", "update", "delete"]);
        assert!(w.freeze().items.is_empty());
    }

    #[test]
    fn restart_diffs_against_current_items() {
        let mut w = StoreWriter::default();
        let mut notes = Vec::new();
        w.apply(
            WatchEvent::Restarted(vec![obj("a", Some("ns"), "1"), obj("b", Some("ns"), "1"), obj("c", None, "1")]),
            &mut notes,
        );
        assert_eq!(kinds(&notes), vec!["add", "add", "add"]);

        notes.clear();
        w.apply(WatchEvent::Restarted(vec![obj("a", Some("ns"), "1"), obj("b", Some("ns"), "2"), obj("d", None, "1")]), &mut notes);
        // a unchanged, b updated, d added, c gone
        assert_eq!(kinds(&notes), vec!["update", "add", "delete"]);
        let snap = w.freeze();
        assert_eq!(snap.epoch, 1);
        assert_eq!(snap.items.len(), 3);
        assert!(snap.items.contains_key(&ObjectRef::new(None, "d")));
        assert!(!snap.items.contains_key(&ObjectRef::new(None, "c")));
    }

    #[tokio::test]
    async fn debug_shows_kind_and_sync_state() {
        let res = ApiResourceInfo { gvk: orka_core::Gvk::new("", "v1", "Pod"), plural: "pods".into(), namespaced: true };
        let w = TypeWatcher::spawn(res, futures::stream::pending().boxed(), 8, CancellationToken::new());
        let out = format!("{:?}", w);
        assert!(out.contains("v1/Pod"), "{}", out);
        assert!(out.contains("synced: false"), "{}", out);
        w.stop();
    }

    #[test]
    fn nameless_objects_are_ignored() {
        let mut w = StoreWriter::default();
        let mut notes = Vec::new();
        w.apply(WatchEvent::Applied(Object::new(serde_json::json!({ "metadata": {} }))), &mut notes);
        assert!(notes.is_empty());
        assert!(w.freeze().items.is_empty());
    }
}
