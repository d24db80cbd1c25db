//! Keel persistence: SQLite-backed record store with etag preconditions.
//! One table keyed by record key; every write bumps the etag inside a transaction.

#![forbid(unsafe_code)]

use anyhow::Context;
use keel_core::{Error, Result};
use keel_store::{Object, Precondition, Store};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use serde_json::Value as Json;
use tracing::debug;

/// SQLite-backed store. Simple, synchronous under a mutex; records are small JSON blobs.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

fn internal(e: rusqlite::Error) -> Error { Error::Internal(format!("sqlite: {}", e)) }

impl SqliteStore {
    pub fn open_default() -> anyhow::Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS records (
                key        TEXT PRIMARY KEY,
                etag       TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        ).context("creating records table")?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn current_etag(tx: &rusqlite::Transaction<'_>, key: &str) -> Result<Option<String>> {
    tx.query_row("SELECT etag FROM records WHERE key = ?1", [key], |r| r.get::<_, String>(0))
        .optional()
        .map_err(internal)
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Object> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let row = db
            .query_row("SELECT value, etag FROM records WHERE key = ?1", [key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .optional()
            .map_err(internal)?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        let (value, etag) = row.ok_or_else(|| Error::NotFound(key.to_string()))?;
        let value: Json = serde_json::from_str(&value).map_err(|e| Error::Internal(format!("corrupt record '{}': {}", key, e)))?;
        Ok(Object { value, etag })
    }

    async fn save(&self, key: &str, value: Json, precondition: Precondition) -> Result<String> {
        let started = std::time::Instant::now();
        let body = serde_json::to_string(&value).map_err(|e| Error::Internal(e.to_string()))?;
        let mut db = self.conn();
        let tx = db.transaction().map_err(internal)?;
        if !precondition.check(current_etag(&tx, key)?.as_deref()) {
            counter!("store_conflict_total", 1u64);
            debug!(key, "persist: precondition failed");
            return Err(Error::Conflict(key.to_string()));
        }
        let etag = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO records(key, etag, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET etag = excluded.etag, value = excluded.value, updated_at = excluded.updated_at",
            (key, &etag, &body, now_ts()),
        ).map_err(internal)?;
        tx.commit().map_err(internal)?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(etag)
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction().map_err(internal)?;
        let current = current_etag(&tx, key)?;
        if current.is_none() && precondition != Precondition::DoesNotExist {
            return Err(Error::NotFound(key.to_string()));
        }
        if !precondition.check(current.as_deref()) {
            counter!("store_conflict_total", 1u64);
            return Err(Error::Conflict(key.to_string()));
        }
        tx.execute("DELETE FROM records WHERE key = ?1", [key]).map_err(internal)?;
        tx.commit().map_err(internal)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Object)>> {
        let db = self.conn();
        // substr comparison keeps LIKE wildcards in keys from matching.
        let mut stmt = db
            .prepare("SELECT key, value, etag FROM records WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(internal)?;
        let mut rows = stmt.query([prefix]).map_err(internal)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(internal)? {
            let key: String = row.get(0).map_err(internal)?;
            let value: String = row.get(1).map_err(internal)?;
            let etag: String = row.get(2).map_err(internal)?;
            let value: Json = serde_json::from_str(&value).map_err(|e| Error::Internal(format!("corrupt record '{}': {}", key, e)))?;
            out.push((key, Object { value, etag }));
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "keel.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn save_get_with_preconditions() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        let e1 = s.save("operations/1", json!({"status": "Accepted"}), Precondition::DoesNotExist).await.unwrap();
        assert!(matches!(s.save("operations/1", json!({}), Precondition::DoesNotExist).await, Err(Error::Conflict(_))));
        let e2 = s.save("operations/1", json!({"status": "Running"}), Precondition::Matches(e1.clone())).await.unwrap();
        assert!(matches!(s.save("operations/1", json!({}), Precondition::Matches(e1)).await, Err(Error::Conflict(_))));
        let got = s.get("operations/1").await.unwrap();
        assert_eq!(got.etag, e2);
        assert_eq!(got.value["status"], "Running");
        s.delete("operations/1", Precondition::Matches(e2)).await.unwrap();
        assert!(matches!(s.get("operations/1").await, Err(Error::NotFound(_))));
        s.delete("operations/1", Precondition::DoesNotExist).await.unwrap();
    }

    #[tokio::test]
    async fn list_prefix_is_literal() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        for k in ["/subscriptions/s/resourcegroups/rg/a", "/subscriptions/s/resourcegroups/rg_x/b", "/subscriptions/s/resourcegroups/rg/c"] {
            s.save(k, json!(k), Precondition::Any).await.unwrap();
        }
        let keys: Vec<String> = s.list("/subscriptions/s/resourcegroups/rg/").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["/subscriptions/s/resourcegroups/rg/a", "/subscriptions/s/resourcegroups/rg/c"]);
    }
}
