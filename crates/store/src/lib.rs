//! Orka store: per-type watch-backed caches and the factory that owns them.

#![forbid(unsafe_code)]

pub mod factory;
pub mod handler;
pub mod watcher;

pub use factory::WatcherFactory;
pub use handler::{ObjectEvent, ResourceEventHandler};
pub use watcher::{StoreSnapshot, TypeWatcher};
