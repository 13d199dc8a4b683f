//! Config and storage provider seams.
//!
//! Components never read ambient global state: every tunable is resolved
//! through a [`ConfigProvider`] passed into the constructor, and persisted
//! values (working credentials, known-good nicknames) go through a
//! [`StorageProvider`]. Both ship with in-memory implementations for tests
//! and embedding.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Key/value tunable source: `get(key, default)`.
pub trait ConfigProvider: Send + Sync {
    /// Raw string lookup; `None` when the key is absent.
    fn get_raw(&self, key: &str) -> Option<String>;

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get_raw(key) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %v, "config value not numeric; using default");
                default
            }),
            None => default,
        }
    }

    fn get_u32(&self, key: &str, default: u32) -> u32 {
        match self.get_raw(key) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %v, "config value not numeric; using default");
                default
            }),
            None => default,
        }
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_string())
    }

    /// Millisecond tunable as a `Duration`.
    fn get_millis(&self, key: &str, default_ms: u64) -> Duration {
        Duration::from_millis(self.get_u64(key, default_ms))
    }

    /// Second tunable as a `Duration`.
    fn get_secs(&self, key: &str, default_secs: u64) -> Duration {
        Duration::from_secs(self.get_u64(key, default_secs))
    }
}

/// Fixed in-memory config, mainly for tests and the demo binary.
#[derive(Debug, Default)]
pub struct StaticConfig {
    map: HashMap<String, String>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.map.insert(key.into(), value.into());
        self
    }
}

impl ConfigProvider for StaticConfig {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }
}

/// Simple persisted string KV. The real backing store lives in the excluded
/// application layer; this crate only consumes the interface.
pub trait StorageProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory storage for tests and the demo binary.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok().and_then(|m| m.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) {
        if let Ok(mut m) = self.map.lock() {
            m.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut m) = self.map.lock() {
            m.remove(key);
        }
    }
}
