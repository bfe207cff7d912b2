use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::entity::EntityRecord;
use crate::identity::{CacheIdentity, QueryId};
use crate::result_tree::ResultTreeEntry;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Codec failure for '{key}': {reason}")]
    Codec { key: String, reason: String },
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn codec(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Codec {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Codec failures affect one entry only; callers treat them as a miss.
    #[must_use]
    pub fn is_codec(&self) -> bool {
        matches!(self, Self::Codec { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Entry counts for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub result_trees: usize,
    pub entities: usize,
}

/// Storage behind one [`CacheIdentity`].
///
/// Implementations serialize their own storage access, so a sequence of
/// calls for one key is applied in submission order.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    fn identity(&self) -> &CacheIdentity;

    /// Short label for logs and metrics ("memory", "sqlite").
    fn name(&self) -> &'static str;

    /// Cached tree for `query_id`. Touches `last_accessed` on a hit.
    async fn result_tree(&self, query_id: &QueryId) -> Result<Option<ResultTreeEntry>, StorageError>;

    async fn set_result_tree(&self, query_id: &QueryId, entry: ResultTreeEntry) -> Result<(), StorageError>;

    /// Fetch-or-create. Every caller asking for the same guid gets the same
    /// record for the lifetime of the provider.
    async fn entity_data(&self, guid: &str) -> Result<Arc<EntityRecord>, StorageError>;

    /// Persist the record's fields and dependents.
    async fn update_entity_data(&self, record: &EntityRecord) -> Result<(), StorageError>;

    /// Resolve many guids at once.
    /// Default implementation falls back to sequential lookups.
    async fn entity_data_batch(
        &self,
        guids: &BTreeSet<String>,
    ) -> Result<HashMap<String, Arc<EntityRecord>>, StorageError> {
        let mut out = HashMap::with_capacity(guids.len());
        for guid in guids {
            out.insert(guid.clone(), self.entity_data(guid).await?);
        }
        Ok(out)
    }

    /// Read-only lookup: records already stored for `guids`. Guids with no
    /// record are absent from the map and nothing is created. A record that
    /// exists but cannot be decoded is a codec error.
    async fn stored_entity_data(
        &self,
        guids: &BTreeSet<String>,
    ) -> Result<HashMap<String, Arc<EntityRecord>>, StorageError>;

    async fn stats(&self) -> Result<ProviderStats, StorageError>;
}
