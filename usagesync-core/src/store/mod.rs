//! Durable key-value store
//!
//! The synchronization core keeps three values here: the client identity, the
//! last acknowledged sequence number, and the pending counts. Values are JSON
//! strings. A write must be durable when `set` returns.
//!
//! The store is assumed to have a single writer process. `KvStore` is
//! synchronous; async callers go through [`blocking`] so a slow write never
//! stalls the runtime.

pub mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Installation identity
pub const CLIENT_ID_KEY: &str = "client_id_v1";
/// Last sequence number the server acknowledged
pub const SEQ_KEY: &str = "seq_v1";
/// Host -> unsent or unacknowledged count
pub const PENDING_KEY: &str = "pending_v1";

/// String-keyed durable storage
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Read and decode a JSON value
pub fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::Store(format!("corrupt value for {}: {}", key, e))),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub fn set_json<T: Serialize + ?Sized>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// Run a store operation on the blocking thread pool
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Store(format!("store task failed: {}", e)))?
}

/// Non-durable store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail, to exercise store failure handling
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let fail = self.fail_writes.lock().map(|flag| *flag).unwrap_or(false);
        if fail {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }

        let mut values = self
            .values
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        assert_eq!(get_json::<u64>(&store, SEQ_KEY).unwrap(), None);

        set_json(&store, SEQ_KEY, &7u64).unwrap();
        assert_eq!(get_json::<u64>(&store, SEQ_KEY).unwrap(), Some(7));

        let mut pending = BTreeMap::new();
        pending.insert("a".to_string(), 3u64);
        set_json(&store, PENDING_KEY, &pending).unwrap();
        assert_eq!(
            get_json::<BTreeMap<String, u64>>(&store, PENDING_KEY).unwrap(),
            Some(pending)
        );
    }

    #[test]
    fn test_corrupt_value_is_an_error() {
        let store = MemoryStore::new();
        store.set(SEQ_KEY, "not json").unwrap();

        let err = get_json::<u64>(&store, SEQ_KEY).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn test_blocking_propagates_store_errors() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let writer = store.clone();
        blocking(move || set_json(&*writer, SEQ_KEY, &3u64)).await.unwrap();
        assert_eq!(get_json::<u64>(&*store, SEQ_KEY).unwrap(), Some(3));

        store.set_fail_writes(true);
        let writer = store.clone();
        assert!(blocking(move || set_json(&*writer, SEQ_KEY, &4u64)).await.is_err());
    }

    #[test]
    fn test_simulated_write_failure() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.set("k", "v").is_err());

        store.set_fail_writes(false);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }
}
