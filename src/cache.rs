use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::domain::{IdType, PropertyMap};
use crate::error::MolidError;

const CACHE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    identifier TEXT NOT NULL,
    id_type    TEXT NOT NULL,
    payload    TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (identifier, id_type)
);
";

/// A remote answer remembered under the identifier it was asked for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub identifier: String,
    pub id_type: IdType,
    pub records: Vec<PropertyMap>,
    pub fetched_at: String,
}

impl CacheEntry {
    pub fn now(identifier: &str, id_type: IdType, records: Vec<PropertyMap>) -> Self {
        Self {
            identifier: identifier.to_string(),
            id_type,
            records,
            fetched_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug)]
pub struct CacheStore {
    conn: Connection,
    path: PathBuf,
}

impl CacheStore {
    /// Opens the cache, creating file and schema on first use.
    pub fn open(path: &Path) -> Result<Self, MolidError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| MolidError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path)
            .map_err(|err| MolidError::Store(format!("open {}: {err}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=30000;")?;
        conn.execute_batch(CACHE_SCHEMA)?;
        debug!(path = %path.display(), "cache store ready");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, identifier: &str, id_type: IdType) -> Result<Option<CacheEntry>, MolidError> {
        let row = self
            .conn
            .query_row(
                "SELECT payload, fetched_at FROM cache_entries \
                 WHERE identifier = ?1 AND id_type = ?2",
                params![identifier, id_type.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((payload, fetched_at)) = row else {
            return Ok(None);
        };
        let records: Vec<PropertyMap> = serde_json::from_str(&payload)
            .map_err(|err| MolidError::Store(format!("corrupt cache payload: {err}")))?;
        Ok(Some(CacheEntry {
            identifier: identifier.to_string(),
            id_type,
            records,
            fetched_at,
        }))
    }

    /// Stores or replaces the entry for `(identifier, id_type)`.
    pub fn put(&mut self, entry: &CacheEntry) -> Result<(), MolidError> {
        let payload = serde_json::to_string(&entry.records)
            .map_err(|err| MolidError::StoreWrite(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO cache_entries (identifier, id_type, payload, fetched_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.identifier,
                    entry.id_type.as_str(),
                    payload,
                    entry.fetched_at
                ],
            )
            .map_err(|err| MolidError::StoreWrite(err.to_string()))?;
        debug!(identifier = %entry.identifier, id_type = %entry.id_type, "cache entry stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn put_then_get_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheStore::open(&dir.path().join("cache").join("c.db")).unwrap();
        assert!(cache.get("aspirin", IdType::Name).unwrap().is_none());

        let mut record = PropertyMap::new();
        record.insert("CID".to_string(), Value::from(2244));
        cache
            .put(&CacheEntry::now("aspirin", IdType::Name, vec![record.clone()]))
            .unwrap();
        let hit = cache.get("aspirin", IdType::Name).unwrap().unwrap();
        assert_eq!(hit.records, vec![record]);
        assert!(cache.get("aspirin", IdType::Cas).unwrap().is_none());

        cache
            .put(&CacheEntry::now("aspirin", IdType::Name, Vec::new()))
            .unwrap();
        assert!(cache.get("aspirin", IdType::Name).unwrap().unwrap().records.is_empty());
    }
}
