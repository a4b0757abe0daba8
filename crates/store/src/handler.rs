//! Event handlers and per-handler delivery queues.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;

use orka_core::Object;

/// Push-style consumer of a type's changes.
///
/// Callbacks run on the handler's own blocking delivery thread, one at a time, in stream order.
/// A slow handler delays only itself.
pub trait ResourceEventHandler: Send + Sync + 'static {
    fn on_add(&self, obj: &Object);
    fn on_update(&self, old: &Object, new: &Object);
    fn on_delete(&self, obj: &Object);
}

/// Owned form of a handler callback, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Added(Object),
    Updated { old: Object, new: Object },
    Deleted(Object),
}

impl ResourceEventHandler for mpsc::UnboundedSender<ObjectEvent> {
    fn on_add(&self, obj: &Object) { let _ = self.send(ObjectEvent::Added(obj.clone())); }
    fn on_update(&self, old: &Object, new: &Object) {
        let _ = self.send(ObjectEvent::Updated { old: old.clone(), new: new.clone() });
    }
    fn on_delete(&self, obj: &Object) { let _ = self.send(ObjectEvent::Deleted(obj.clone())); }
}

impl<H: ResourceEventHandler + ?Sized> ResourceEventHandler for Arc<H> {
    fn on_add(&self, obj: &Object) { (**self).on_add(obj) }
    fn on_update(&self, old: &Object, new: &Object) { (**self).on_update(old, new) }
    fn on_delete(&self, obj: &Object) { (**self).on_delete(obj) }
}

/// A change computed by the ingest loop, shared by every handler queue.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Added(Arc<Object>),
    Updated { old: Arc<Object>, new: Arc<Object> },
    Deleted(Arc<Object>),
}

/// Sending side of one registered handler.
pub(crate) struct HandlerSlot {
    tx: mpsc::UnboundedSender<Notification>,
}

impl HandlerSlot {
    /// Start the delivery loop for `handler` and return its queue.
    ///
    /// Callbacks are synchronous, so the loop runs on the blocking pool. A handler that
    /// stalls holds its own thread and never a runtime worker.
    pub(crate) fn spawn<H: ResourceEventHandler>(handler: H, label: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::task::spawn_blocking(move || {
            while let Some(n) = rx.blocking_recv() {
                match n {
                    Notification::Added(o) => handler.on_add(&o),
                    Notification::Updated { old, new } => handler.on_update(&old, &new),
                    Notification::Deleted(o) => handler.on_delete(&o),
                }
            }
            debug!(gvk = %label, "handler queue closed");
        });
        Self { tx }
    }

    /// Returns false once the delivery task is gone.
    pub(crate) fn send(&self, n: Notification) -> bool {
        counter!("cache_events_dispatched_total", 1u64);
        self.tx.send(n).is_ok()
    }
}
