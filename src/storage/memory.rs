//! In-process cache provider.
//!
//! Two concurrent maps, one for result trees and one for entity records.
//! Records are handed out as `Arc`s straight from the map, so dedup is
//! by instance. Everything is dropped with the provider.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::traits::{CacheProvider, ProviderStats, StorageError};
use crate::entity::EntityRecord;
use crate::identity::{CacheIdentity, QueryId};
use crate::result_tree::ResultTreeEntry;

pub struct EphemeralProvider {
    identity: CacheIdentity,
    trees: DashMap<QueryId, ResultTreeEntry>,
    entities: DashMap<String, Arc<EntityRecord>>,
}

impl EphemeralProvider {
    #[must_use]
    pub fn new(identity: CacheIdentity) -> Self {
        debug!(identity = %identity, "Created ephemeral cache provider");
        Self {
            identity,
            trees: DashMap::new(),
            entities: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn clear(&self) {
        self.trees.clear();
        self.entities.clear();
    }
}

#[async_trait]
impl CacheProvider for EphemeralProvider {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn result_tree(&self, query_id: &QueryId) -> Result<Option<ResultTreeEntry>, StorageError> {
        Ok(self.trees.get_mut(query_id).map(|mut entry| {
            entry.touch();
            entry.value().clone()
        }))
    }

    async fn set_result_tree(&self, query_id: &QueryId, entry: ResultTreeEntry) -> Result<(), StorageError> {
        self.trees.insert(query_id.clone(), entry);
        Ok(())
    }

    async fn entity_data(&self, guid: &str) -> Result<Arc<EntityRecord>, StorageError> {
        Ok(self
            .entities
            .entry(guid.to_string())
            .or_insert_with(|| Arc::new(EntityRecord::new(guid)))
            .value()
            .clone())
    }

    async fn update_entity_data(&self, record: &EntityRecord) -> Result<(), StorageError> {
        // Records handed out by this provider are already live in the map.
        // Foreign records (built elsewhere) are adopted as a copy.
        if let Some(existing) = self.entities.get(record.guid()) {
            if std::ptr::eq(existing.value().as_ref(), record) {
                return Ok(());
            }
        }
        let adopted = EntityRecord::restore(record.snapshot(), record.referenced_by());
        self.entities.insert(record.guid().to_string(), Arc::new(adopted));
        Ok(())
    }

    async fn stored_entity_data(
        &self,
        guids: &BTreeSet<String>,
    ) -> Result<HashMap<String, Arc<EntityRecord>>, StorageError> {
        Ok(guids
            .iter()
            .filter_map(|guid| self.entities.get(guid).map(|r| (guid.clone(), r.value().clone())))
            .collect())
    }

    async fn stats(&self) -> Result<ProviderStats, StorageError> {
        Ok(ProviderStats {
            result_trees: self.trees.len(),
            entities: self.entities.len(),
        })
    }
}
