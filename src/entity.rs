//! Normalized entity records.
//!
//! An [`EntityRecord`] holds the scalar fields of one server entity plus the
//! set of queries whose cached results surface it. Records are shared: every
//! node, in every cached tree, that presents the same guid resolves to the
//! same record through the provider (`Arc<EntityRecord>`), never to a copy.
//!
//! All mutation goes through one per-record lock, so two queries
//! normalizing the same entity at the same time both land their writes.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::QueryId;
use crate::value::CacheValue;

#[derive(Debug, Default)]
struct EntityState {
    fields: BTreeMap<String, CacheValue>,
    referenced_by: BTreeSet<QueryId>,
}

/// One deduplicated server entity.
#[derive(Debug)]
pub struct EntityRecord {
    guid: String,
    state: Mutex<EntityState>,
}

/// Persisted form of a record. `referenced_by` is stored separately
/// (reverse-index table), never inside the blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub guid: String,
    #[serde(default)]
    pub fields: BTreeMap<String, CacheValue>,
}

impl EntityRecord {
    #[must_use]
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            state: Mutex::new(EntityState::default()),
        }
    }

    /// Rebuild a record from its blob and its reverse-index rows.
    #[must_use]
    pub fn restore(snapshot: EntitySnapshot, referenced_by: impl IntoIterator<Item = QueryId>) -> Self {
        Self {
            guid: snapshot.guid,
            state: Mutex::new(EntityState {
                fields: snapshot.fields,
                referenced_by: referenced_by.into_iter().collect(),
            }),
        }
    }

    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Overwrite `name` with `value` (no sub-structure merge) and register
    /// `requestor` as a dependent.
    ///
    /// Returns the dependents after the update, so the caller can work out
    /// which other queries just became impacted.
    pub fn update_field(
        &self,
        name: &str,
        value: CacheValue,
        requestor: Option<&QueryId>,
    ) -> BTreeSet<QueryId> {
        let mut state = self.state.lock();
        state.fields.insert(name.to_string(), value);
        if let Some(q) = requestor {
            state.referenced_by.insert(q.clone());
        }
        state.referenced_by.clone()
    }

    #[must_use]
    pub fn read_field(&self, name: &str) -> Option<CacheValue> {
        self.state.lock().fields.get(name).cloned()
    }

    /// Copy of all current fields.
    #[must_use]
    pub fn fields(&self) -> BTreeMap<String, CacheValue> {
        self.state.lock().fields.clone()
    }

    #[must_use]
    pub fn referenced_by(&self) -> BTreeSet<QueryId> {
        self.state.lock().referenced_by.clone()
    }

    /// Register `query` as a dependent. Returns the dependents *before*
    /// the registration.
    pub fn add_reference(&self, query: &QueryId) -> BTreeSet<QueryId> {
        let mut state = self.state.lock();
        let before = state.referenced_by.clone();
        state.referenced_by.insert(query.clone());
        before
    }

    #[must_use]
    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            guid: self.guid.clone(),
            fields: self.fields(),
        }
    }
}

impl PartialEq for EntityRecord {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        // never hold both locks at once
        self.guid == other.guid && self.fields() == other.fields()
    }
}
