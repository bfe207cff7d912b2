//! Normalized tree nodes.
//!
//! A [`NormalizedNode`] is the skeleton of one object in a result tree.
//! Entity-backed nodes carry only the guid handle of their record; their
//! scalar fields live on the shared [`EntityRecord`](crate::entity::EntityRecord).
//! Other nodes keep their scalars inline. Nested objects and lists of
//! objects are owned by the node in both cases.
//!
//! The serialized node is the dehydrated wire form stored in a
//! [`ResultTreeEntry`](crate::result_tree::ResultTreeEntry):
//!
//! ```json
//! {"guid":"G1","refs":{"owner":{"scalars":{"name":"x"}}},"lists":{"tags":[{"guid":"T1"}]}}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::CacheValue;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedNode {
    /// Guid of the backing entity record, if any.
    #[serde(rename = "guid", default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,

    /// Inline scalars. Always empty for entity-backed nodes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scalars: BTreeMap<String, CacheValue>,

    /// Singular nested objects.
    #[serde(rename = "refs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, NormalizedNode>,

    /// List-of-object fields.
    #[serde(rename = "lists", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub object_lists: BTreeMap<String, Vec<NormalizedNode>>,
}

impl NormalizedNode {
    #[must_use]
    pub fn inline() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entity_backed(guid: impl Into<String>) -> Self {
        Self {
            entity: Some(guid.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_entity_backed(&self) -> bool {
        self.entity.is_some()
    }

    /// Every guid referenced anywhere under this node (inclusive).
    #[must_use]
    pub fn entity_guids(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_guids(&mut out);
        out
    }

    fn collect_guids(&self, out: &mut BTreeSet<String>) {
        if let Some(guid) = &self.entity {
            out.insert(guid.clone());
        }
        for child in self.references.values() {
            child.collect_guids(out);
        }
        for list in self.object_lists.values() {
            for child in list {
                child.collect_guids(out);
            }
        }
    }

    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }
}
