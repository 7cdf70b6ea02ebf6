//! FlowMesh replicated configuration store.
//!
//! A hierarchical key-value contract shared by agents and the analyzer,
//! plus the resource watcher that turns raw watch streams into typed
//! create/update/delete callbacks with an init replay. The in-memory
//! implementation backs tests and single-process deployments; a
//! clustered store satisfies the same trait.

mod store;
mod watcher;

pub use store::{
    ConfigResult, ConfigStore, ConfigStoreError, MemoryConfigStore, WatchAction, WatchEvent,
    WatchStream,
};
pub use watcher::{Resource, ResourceHandler, StoppableWatcher};
