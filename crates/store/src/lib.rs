//! Keel store: opaque key/value records guarded by etags.
//!
//! Every mutation names a `Precondition`; a failed precondition surfaces as
//! `Error::Conflict` and callers re-read and retry (`update`). The in-RAM
//! `MemoryStore` backs tests and single-process runs; `keel-persist` provides
//! the SQLite implementation.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use keel_core::{Error, ResourceId, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

/// A stored record and the etag it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub value: Json,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write.
    Any,
    DoesNotExist,
    Matches(String),
}

impl Precondition {
    /// Check against the etag currently stored under a key (`None` when absent).
    pub fn check(&self, current: Option<&str>) -> bool {
        match (self, current) {
            (Precondition::Any, _) => true,
            (Precondition::DoesNotExist, None) => true,
            (Precondition::DoesNotExist, Some(_)) => false,
            (Precondition::Matches(want), Some(have)) => want == have,
            (Precondition::Matches(_), None) => false,
        }
    }
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Fails with `NotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<Object>;

    /// Returns the new etag; fails with `Conflict` when the precondition does not hold.
    async fn save(&self, key: &str, value: Json, precondition: Precondition) -> Result<String>;

    /// Fails with `NotFound` for absent keys (unless `DoesNotExist` was asked) and `Conflict` on etag mismatch.
    async fn delete(&self, key: &str, precondition: Precondition) -> Result<()>;

    /// All records whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Object)>>;
}

/// Storage keys for each record family.
pub mod keys {
    use super::*;

    pub fn resource(id: &ResourceId) -> String { id.key().to_string() }

    pub fn operation(id: impl std::fmt::Display) -> String { format!("operations/{}", id) }

    pub fn lease(target: &ResourceId) -> String { format!("leases{}", target.key()) }

    /// Prefix matching every record stored below `scope`.
    pub fn under(scope: &ResourceId) -> String { format!("{}/", scope.key()) }

    pub const OPERATIONS: &str = "operations/";
}

/// Read and decode a record.
pub async fn get_as<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<(T, String)> {
    let obj = store.get(key).await?;
    let v = serde_json::from_value(obj.value).map_err(|e| Error::Internal(format!("decoding '{}': {}", key, e)))?;
    Ok((v, obj.etag))
}

/// Like `get_as`, mapping `NotFound` to `None`.
pub async fn find_as<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<(T, String)>> {
    match get_as(store, key).await {
        Ok(v) => Ok(Some(v)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn save_as<T: Serialize>(store: &dyn Store, key: &str, value: &T, precondition: Precondition) -> Result<String> {
    let json = serde_json::to_value(value).map_err(|e| Error::Internal(format!("encoding '{}': {}", key, e)))?;
    store.save(key, json, precondition).await
}

fn max_update_attempts() -> usize {
    std::env::var("KEEL_STORE_MAX_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(8)
}

/// Optimistic read-modify-write: read at an etag, apply `f`, write if the etag still
/// matches, and start over on conflict. Returns the written value.
pub async fn update<T, F>(store: &dyn Store, key: &str, mut f: F) -> Result<T>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(&mut T) -> Result<()> + Send,
{
    let attempts = max_update_attempts();
    for attempt in 1..=attempts {
        let (mut value, etag): (T, String) = get_as(store, key).await?;
        f(&mut value)?;
        match save_as(store, key, &value, Precondition::Matches(etag)).await {
            Ok(_) => return Ok(value),
            Err(Error::Conflict(_)) => {
                debug!(key, attempt, "store: update conflict, retrying");
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(key.to_string()))
}

/// In-RAM store with monotonically increasing etags.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<FxHashMap<String, Object>>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.records.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn next_etag(&self) -> String { format!("{}", self.version.fetch_add(1, Ordering::Relaxed) + 1) }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Object> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn save(&self, key: &str, value: Json, precondition: Precondition) -> Result<String> {
        let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if !precondition.check(map.get(key).map(|o| o.etag.as_str())) {
            counter!("store_conflict_total", 1u64);
            return Err(Error::Conflict(key.to_string()));
        }
        let etag = self.next_etag();
        map.insert(key.to_string(), Object { value, etag: etag.clone() });
        Ok(etag)
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<()> {
        let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let current = map.get(key).map(|o| o.etag.clone());
        if current.is_none() && precondition != Precondition::DoesNotExist {
            return Err(Error::NotFound(key.to_string()));
        }
        if !precondition.check(current.as_deref()) {
            counter!("store_conflict_total", 1u64);
            return Err(Error::Conflict(key.to_string()));
        }
        map.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Object)>> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(String, Object)> = map.iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
