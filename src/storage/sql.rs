// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed cache provider.
//!
//! One store file per [`CacheIdentity`], named after the identity hash:
//!
//! ```sql
//! CREATE TABLE result_tree (
//!   query_id TEXT PRIMARY KEY,
//!   last_accessed INTEGER NOT NULL,   -- epoch millis
//!   tree_blob BLOB NOT NULL           -- serialized ResultTreeEntry
//! );
//! CREATE TABLE entity_data (
//!   entity_guid TEXT PRIMARY KEY,
//!   object_blob BLOB NOT NULL         -- serialized EntitySnapshot (no dependents)
//! );
//! CREATE TABLE entity_data_query_refs (
//!   entity_guid TEXT NOT NULL,
//!   query_id TEXT NOT NULL,
//!   PRIMARY KEY (entity_guid, query_id)
//! );
//! ```
//!
//! An entity's dependents live only in `entity_data_query_refs` and are
//! joined back onto the record when it is loaded.
//!
//! ## Access discipline
//!
//! The pool holds a single connection and every method runs under one
//! async operation lock, so read-modify-write sequences on the store never
//! interleave. Loaded records are kept in a weak identity map: callers
//! holding a record at the same time share one `Arc<EntityRecord>` per
//! guid, updates are written through to the file, and a record nobody holds
//! is re-read from the file on the next load.
//!
//! An entity blob that cannot be decoded is a codec error on the read path,
//! so the query reads as a miss. The write path starts that entity over in
//! memory and the write replaces the blob.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{CacheProvider, ProviderStats, StorageError};
use crate::compression;
use crate::entity::{EntityRecord, EntitySnapshot};
use crate::identity::{CacheIdentity, QueryId};
use crate::resilience::retry::{retry, RetryConfig};
use crate::result_tree::ResultTreeEntry;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS result_tree (
    query_id TEXT PRIMARY KEY NOT NULL,
    last_accessed INTEGER NOT NULL,
    tree_blob BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS entity_data (
    entity_guid TEXT PRIMARY KEY NOT NULL,
    object_blob BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS entity_data_query_refs (
    entity_guid TEXT NOT NULL,
    query_id TEXT NOT NULL,
    PRIMARY KEY (entity_guid, query_id)
);
CREATE INDEX IF NOT EXISTS idx_result_tree_last_accessed ON result_tree(last_accessed);
"#;

/// Dead identity-map entries are swept once the map reaches this size.
const LIVE_SWEEP_MIN: usize = 1024;

pub struct PersistentProvider {
    identity: CacheIdentity,
    path: PathBuf,
    pool: SqlitePool,
    /// Serializes all store access for this instance
    op_lock: Mutex<()>,
    /// Identity map of records currently held by someone
    live: DashMap<String, Weak<EntityRecord>>,
    /// Map size that triggers the next sweep of dead entries
    sweep_at: AtomicUsize,
}

impl PersistentProvider {
    /// Store file for `identity` inside `cache_dir`.
    #[must_use]
    pub fn db_path(cache_dir: &Path, identity: &CacheIdentity) -> PathBuf {
        cache_dir.join(format!("{}.sqlite", identity.hash()))
    }

    /// Open (or create) the store for `identity` under `cache_dir`.
    pub async fn open(identity: CacheIdentity, cache_dir: &Path, retry_config: &RetryConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(cache_dir)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to create cache dir {}: {}", cache_dir.display(), e)))?;
        let path = Self::db_path(cache_dir, &identity);
        Self::open_at(identity, path, retry_config).await
    }

    /// Open (or create) the store at an explicit file path.
    pub async fn open_at(identity: CacheIdentity, path: PathBuf, retry_config: &RetryConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = retry("sqlite_open", retry_config, || async {
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(options.clone())
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to open {}: {}", path.display(), e)))
        })
        .await?;

        let provider = Self {
            identity,
            path,
            pool,
            op_lock: Mutex::new(()),
            live: DashMap::new(),
            sweep_at: AtomicUsize::new(LIVE_SWEEP_MIN),
        };
        provider.init_schema().await?;

        info!(path = %provider.path.display(), identity = %provider.identity, "Persistent cache provider opened");
        Ok(provider)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        // SQLite needs separate statements
        for stmt in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to init cache schema: {}", e)))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the pool. Pending operations finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StorageError> {
        let raw = serde_json::to_vec(value).map_err(|e| StorageError::codec(key, e))?;
        compression::pack(raw).map_err(|e| StorageError::codec(key, e))
    }

    fn decode<T: DeserializeOwned>(key: &str, blob: &[u8]) -> Result<T, StorageError> {
        let raw = compression::unpack(blob).map_err(|e| StorageError::codec(key, e))?;
        serde_json::from_slice(&raw).map_err(|e| StorageError::codec(key, e))
    }

    fn live_record(&self, guid: &str) -> Option<Arc<EntityRecord>> {
        self.live.get(guid).and_then(|entry| entry.value().upgrade())
    }

    fn remember(&self, record: &Arc<EntityRecord>) {
        self.live.insert(record.guid().to_string(), Arc::downgrade(record));

        let len = self.live.len();
        if len >= self.sweep_at.load(Ordering::Relaxed) {
            self.live.retain(|_, weak| weak.strong_count() > 0);
            let next = (self.live.len() * 2).max(LIVE_SWEEP_MIN);
            self.sweep_at.store(next, Ordering::Relaxed);
            debug!(before = len, after = self.live.len(), "Swept entity identity map");
        }
    }

    /// Decode the stored record for `guid`, `None` when there is no row.
    /// Caller holds `op_lock`.
    async fn read_entity(&self, guid: &str) -> Result<Option<EntityRecord>, StorageError> {
        let row = sqlx::query("SELECT object_blob FROM entity_data WHERE entity_guid = ?")
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let blob: Vec<u8> = row.try_get("object_blob")?;
        let snapshot = Self::decode::<EntitySnapshot>(guid, &blob)?;
        let refs = self.load_refs(guid).await?;
        Ok(Some(EntityRecord::restore(snapshot, refs)))
    }

    /// Stored record only, nothing created. Caller holds `op_lock`.
    async fn find_entity(&self, guid: &str) -> Result<Option<Arc<EntityRecord>>, StorageError> {
        if let Some(record) = self.live_record(guid) {
            return Ok(Some(record));
        }
        let Some(record) = self.read_entity(guid).await? else {
            return Ok(None);
        };
        let record = Arc::new(record);
        self.remember(&record);
        Ok(Some(record))
    }

    /// Load or create one record. Caller holds `op_lock`.
    async fn load_entity(&self, guid: &str) -> Result<Arc<EntityRecord>, StorageError> {
        if let Some(record) = self.live_record(guid) {
            return Ok(record);
        }

        let record = match self.read_entity(guid).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let fresh = EntityRecord::new(guid);
                self.write_entity(&fresh).await?;
                fresh
            }
            Err(e) if e.is_codec() => {
                // Rebuilt by the caller's write; the old blob stays until then
                warn!(guid = %guid, error = %e, "Undecodable entity blob, starting entity over");
                crate::metrics::record_codec_error("sqlite", "entity_data");
                EntityRecord::restore(EntityRecord::new(guid).snapshot(), self.load_refs(guid).await?)
            }
            Err(e) => return Err(e),
        };

        let record = Arc::new(record);
        self.remember(&record);
        Ok(record)
    }

    async fn load_refs(&self, guid: &str) -> Result<Vec<QueryId>, StorageError> {
        let rows = sqlx::query("SELECT query_id FROM entity_data_query_refs WHERE entity_guid = ?")
            .bind(guid)
            .fetch_all(&self.pool)
            .await?;

        let mut refs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("query_id")?;
            refs.push(QueryId::from_raw(id));
        }
        Ok(refs)
    }

    /// Upsert blob and dependents. Caller holds `op_lock`.
    async fn write_entity(&self, record: &EntityRecord) -> Result<(), StorageError> {
        let blob = Self::encode(record.guid(), &record.snapshot())?;
        let refs = record.referenced_by();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO entity_data (entity_guid, object_blob) VALUES (?, ?)
             ON CONFLICT(entity_guid) DO UPDATE SET object_blob = excluded.object_blob",
        )
        .bind(record.guid())
        .bind(&blob)
        .execute(&mut *tx)
        .await?;

        for query_id in &refs {
            sqlx::query("INSERT OR IGNORE INTO entity_data_query_refs (entity_guid, query_id) VALUES (?, ?)")
                .bind(record.guid())
                .bind(query_id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CacheProvider for PersistentProvider {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn result_tree(&self, query_id: &QueryId) -> Result<Option<ResultTreeEntry>, StorageError> {
        let _guard = self.op_lock.lock().await;

        let row = sqlx::query("SELECT tree_blob FROM result_tree WHERE query_id = ?")
            .bind(query_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let blob: Vec<u8> = row.try_get("tree_blob")?;
        let mut entry: ResultTreeEntry = Self::decode(query_id.as_str(), &blob)?;
        entry.touch();

        sqlx::query("UPDATE result_tree SET last_accessed = ? WHERE query_id = ?")
            .bind(entry.last_accessed)
            .bind(query_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(Some(entry))
    }

    async fn set_result_tree(&self, query_id: &QueryId, entry: ResultTreeEntry) -> Result<(), StorageError> {
        let blob = Self::encode(query_id.as_str(), &entry)?;
        let _guard = self.op_lock.lock().await;

        sqlx::query(
            "INSERT INTO result_tree (query_id, last_accessed, tree_blob) VALUES (?, ?, ?)
             ON CONFLICT(query_id) DO UPDATE SET
                last_accessed = excluded.last_accessed,
                tree_blob = excluded.tree_blob",
        )
        .bind(query_id.as_str())
        .bind(entry.last_accessed)
        .bind(&blob)
        .execute(&self.pool)
        .await?;

        debug!(query_id = %query_id, bytes = blob.len(), "Stored result tree");
        Ok(())
    }

    async fn entity_data(&self, guid: &str) -> Result<Arc<EntityRecord>, StorageError> {
        if let Some(record) = self.live_record(guid) {
            return Ok(record);
        }
        let _guard = self.op_lock.lock().await;
        self.load_entity(guid).await
    }

    async fn entity_data_batch(
        &self,
        guids: &BTreeSet<String>,
    ) -> Result<HashMap<String, Arc<EntityRecord>>, StorageError> {
        let mut out = HashMap::with_capacity(guids.len());
        let mut missing = Vec::new();
        for guid in guids {
            match self.live_record(guid) {
                Some(record) => {
                    out.insert(guid.clone(), record);
                }
                None => missing.push(guid),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let _guard = self.op_lock.lock().await;
        for guid in missing {
            out.insert(guid.clone(), self.load_entity(guid).await?);
        }
        Ok(out)
    }

    async fn update_entity_data(&self, record: &EntityRecord) -> Result<(), StorageError> {
        let _guard = self.op_lock.lock().await;
        self.write_entity(record).await?;

        if let Some(live) = self.live_record(record.guid()) {
            if !std::ptr::eq(live.as_ref(), record) {
                // Foreign record: the held copy is behind the file now
                self.live.remove(record.guid());
            }
        }
        Ok(())
    }

    async fn stored_entity_data(
        &self,
        guids: &BTreeSet<String>,
    ) -> Result<HashMap<String, Arc<EntityRecord>>, StorageError> {
        let _guard = self.op_lock.lock().await;
        let mut out = HashMap::with_capacity(guids.len());
        for guid in guids {
            if let Some(record) = self.find_entity(guid).await? {
                out.insert(guid.clone(), record);
            }
        }
        Ok(out)
    }

    async fn stats(&self) -> Result<ProviderStats, StorageError> {
        let _guard = self.op_lock.lock().await;
        let trees: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM result_tree")
            .fetch_one(&self.pool)
            .await?
            .try_get("cnt")?;
        let entities: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM entity_data")
            .fetch_one(&self.pool)
            .await?
            .try_get("cnt")?;
        Ok(ProviderStats {
            result_trees: trees as usize,
            entities: entities as usize,
        })
    }
}
