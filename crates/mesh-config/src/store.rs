//! The hierarchical key-value store contract.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Result type alias for config store operations.
pub type ConfigResult<T> = Result<T, ConfigStoreError>;

/// Errors raised by config store operations.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("config entry not found: {0}")]
    NotFound(String),

    /// Transient disconnect; callers retry.
    #[error("config store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Kind of change a watch stream delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchAction {
    /// Replay of an existing entry when a watch starts.
    Init,
    Create,
    Update,
    Delete,
    /// TTL expiry; carries the previous value like delete.
    Expire,
}

/// One change observed on a watched prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    /// Current value; None on delete/expire.
    pub value: Option<Value>,
    /// Previous value; set on update, delete and expire.
    pub prev_value: Option<Value>,
}

/// Hierarchical key-value store with recursive watch.
pub trait ConfigStore: Send + Sync {
    fn get(&self, path: &str) -> ConfigResult<Value>;

    fn set(&self, path: &str, value: Value) -> ConfigResult<()>;

    fn delete(&self, path: &str) -> ConfigResult<()>;

    /// All entries under a prefix, key-ordered.
    fn list(&self, prefix: &str) -> ConfigResult<Vec<(String, Value)>>;

    /// Subscribe to changes under a prefix. The stream starts at the
    /// subscription point; callers needing a baseline list first.
    fn watch(&self, prefix: &str) -> ConfigResult<WatchStream>;
}

/// A prefix-filtered stream of watch events.
pub struct WatchStream {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    /// Next event under the prefix. `Unavailable` signals a lost or
    /// lagged subscription; the caller must re-list and re-watch.
    pub async fn next(&mut self) -> ConfigResult<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ConfigStoreError::Unavailable("watch closed".to_string()))
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(ConfigStoreError::Unavailable(format!(
                        "watch lagged by {n} events"
                    )))
                }
            }
        }
    }
}

/// In-memory store for tests and single-process deployments.
pub struct MemoryConfigStore {
    entries: Mutex<BTreeMap<String, Value>>,
    tx: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    /// Expire an entry, as a TTL would.
    pub fn expire(&self, path: &str) -> ConfigResult<()> {
        let prev = self
            .lock()
            .remove(path)
            .ok_or_else(|| ConfigStoreError::NotFound(path.to_string()))?;
        self.publish(WatchEvent {
            action: WatchAction::Expire,
            key: path.to_string(),
            value: None,
            prev_value: Some(prev),
        });
        Ok(())
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, path: &str) -> ConfigResult<Value> {
        self.lock()
            .get(path)
            .cloned()
            .ok_or_else(|| ConfigStoreError::NotFound(path.to_string()))
    }

    fn set(&self, path: &str, value: Value) -> ConfigResult<()> {
        let prev = self.lock().insert(path.to_string(), value.clone());
        let action = if prev.is_some() {
            WatchAction::Update
        } else {
            WatchAction::Create
        };
        self.publish(WatchEvent {
            action,
            key: path.to_string(),
            value: Some(value),
            prev_value: prev,
        });
        Ok(())
    }

    fn delete(&self, path: &str) -> ConfigResult<()> {
        let prev = self
            .lock()
            .remove(path)
            .ok_or_else(|| ConfigStoreError::NotFound(path.to_string()))?;
        self.publish(WatchEvent {
            action: WatchAction::Delete,
            key: path.to_string(),
            value: None,
            prev_value: Some(prev),
        });
        Ok(())
    }

    fn list(&self, prefix: &str) -> ConfigResult<Vec<(String, Value)>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> ConfigResult<WatchStream> {
        Ok(WatchStream {
            prefix: prefix.to_string(),
            rx: self.tx.subscribe(),
        })
    }
}
