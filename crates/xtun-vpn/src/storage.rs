//! Shared Storage
//!
//! The controller process and the tunnel process exchange session state
//! only through a key-value store that both can reach (an app-group
//! container on mobile platforms). Every key is namespaced by the shared
//! group identifier.
//!
//! Writes to different keys are independent; there is no multi-key
//! transaction, so a reader may briefly see a new status next to an old
//! timestamp.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Storage write rejected for key '{0}'")]
    WriteRejected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Key-value persistence shared across processes
pub trait Storage: Send + Sync {
    fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn get_string(&self, key: &str) -> Option<String>;

    /// Store a structured value
    fn set_value(&self, key: &str, value: &Value) -> Result<(), StorageError>;

    fn get_value(&self, key: &str) -> Option<Value>;

    fn remove(&self, key: &str);
}

/// Persisted session fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    Status,
    ConnectedUrl,
    ConnectedAt,
    EngineType,
    GlobalMode,
    LastError,
    Router,
    MonthlyStats,
}

impl StorageKey {
    fn suffix(&self) -> &'static str {
        match self {
            StorageKey::Status => "vpn.status",
            StorageKey::ConnectedUrl => "vpn.connected_url",
            StorageKey::ConnectedAt => "vpn.connected_at",
            StorageKey::EngineType => "vpn.engine_type",
            StorageKey::GlobalMode => "vpn.global_mode",
            StorageKey::LastError => "vpn.last_error",
            StorageKey::Router => "vpn.router",
            StorageKey::MonthlyStats => "stats.monthly",
        }
    }

    /// Full key under a group namespace
    pub fn namespaced(&self, group_id: &str) -> String {
        format!("{}.{}", group_id, self.suffix())
    }
}

/// Serialize and store, logging failures
pub(crate) fn store_json<T: Serialize>(storage: &dyn Storage, key: &str, value: &T) {
    let result = serde_json::to_value(value)
        .map_err(|e| StorageError::Serialization(e.to_string()))
        .and_then(|v| storage.set_value(key, &v));
    if let Err(e) = result {
        warn!("Failed to persist '{}': {}", key, e);
    }
}

/// Load and deserialize; anything unreadable counts as absent
pub(crate) fn load_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Option<T> {
    let value = storage.get_value(key)?;
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Ignoring unreadable value at '{}': {}", key, e);
            None
        }
    }
}

/// Store a string, logging failures
pub(crate) fn store_string(storage: &dyn Storage, key: &str, value: &str) {
    if let Err(e) = storage.set_string(key, value) {
        warn!("Failed to persist '{}': {}", key, e);
    }
}

/// In-memory storage for a single process and for tests
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set_value(key, &Value::String(value.to_string()))
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self.get_value(key)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    fn set_value(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get_value(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remove(&self, key: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
