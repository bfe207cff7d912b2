//! Cached result trees.
//!
//! A [`ResultTreeEntry`] is what the cache stores per query: the dehydrated
//! skeleton of the last server result plus freshness metadata. Staleness is
//! advisory; nothing is expired or evicted because of it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::QueryId;
use crate::node::NormalizedNode;

/// Current wall clock in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultTreeEntry {
    pub query_id: QueryId,
    /// Serialized [`NormalizedNode`] root.
    pub data: String,
    /// Time-to-live in milliseconds
    pub ttl_ms: u64,
    /// When the server result was cached (epoch millis)
    pub cached_at: i64,
    /// Last cache read (epoch millis)
    pub last_accessed: i64,
    /// Parsed root, kept alongside `data` while the entry lives in memory.
    #[serde(skip)]
    pub root: Option<Arc<NormalizedNode>>,
}

impl ResultTreeEntry {
    #[must_use]
    pub fn new(query_id: QueryId, data: String, ttl: Duration, root: Option<Arc<NormalizedNode>>) -> Self {
        let now = now_millis();
        Self {
            query_id,
            data,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            cached_at: now,
            last_accessed: now,
            root,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub fn age_at(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.cached_at).max(0) as u64)
    }

    /// `now - cached_at > ttl`.
    #[must_use]
    pub fn is_stale_at(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.cached_at) > i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(now_millis())
    }

    pub fn touch(&mut self) {
        self.last_accessed = now_millis();
    }

    /// The root node, parsing `data` if it is not already held in memory.
    pub fn root_node(&self) -> Result<Arc<NormalizedNode>, serde_json::Error> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => NormalizedNode::from_blob(&self.data).map(Arc::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_aged(age_secs: i64, ttl_secs: u64) -> ResultTreeEntry {
        let mut entry = ResultTreeEntry::new(
            QueryId::from("Q"),
            "{}".into(),
            Duration::from_secs(ttl_secs),
            None,
        );
        entry.cached_at = now_millis() - age_secs * 1000;
        entry
    }

    #[test]
    fn test_staleness_boundary() {
        assert!(entry_aged(11, 10).is_stale());
        assert!(!entry_aged(9, 10).is_stale());
    }

    #[test]
    fn test_stale_exactly_at_ttl_is_fresh() {
        let entry = entry_aged(0, 10);
        assert!(!entry.is_stale_at(entry.cached_at + 10_000));
        assert!(entry.is_stale_at(entry.cached_at + 10_001));
    }

    #[test]
    fn test_huge_ttl_never_goes_stale() {
        let entry = ResultTreeEntry::new(QueryId::from("Q"), "{}".into(), Duration::from_secs(u64::MAX), None);
        assert_eq!(entry.ttl_ms, u64::MAX);
        assert!(!entry.is_stale());
        assert!(!entry.is_stale_at(i64::MAX));

        let mut near_max = entry.clone();
        near_max.ttl_ms = u64::MAX / 2 + 1;
        assert!(!near_max.is_stale_at(i64::MAX));
    }

    #[test]
    fn test_touch_updates_last_accessed_only() {
        let mut entry = entry_aged(30, 60);
        let cached_at = entry.cached_at;
        entry.last_accessed = 0;
        entry.touch();
        assert!(entry.last_accessed > 0);
        assert_eq!(entry.cached_at, cached_at);
    }

    #[test]
    fn test_root_node_parses_when_not_cached() {
        let entry = ResultTreeEntry::new(QueryId::from("Q"), r#"{"guid":"G1"}"#.into(), Duration::ZERO, None);
        assert_eq!(entry.root_node().unwrap().entity.as_deref(), Some("G1"));

        let broken = ResultTreeEntry::new(QueryId::from("Q"), "not json".into(), Duration::ZERO, None);
        assert!(broken.root_node().is_err());
    }

    #[test]
    fn test_serialization_skips_root() {
        let root = Arc::new(NormalizedNode::entity_backed("G1"));
        let entry = ResultTreeEntry::new(QueryId::from("Q"), r#"{"guid":"G1"}"#.into(), Duration::from_secs(5), Some(root));
        let blob = serde_json::to_string(&entry).unwrap();
        assert!(!blob.contains("\"root\""));

        let back: ResultTreeEntry = serde_json::from_str(&blob).unwrap();
        assert!(back.root.is_none());
        assert_eq!(back.ttl(), Duration::from_secs(5));
        assert_eq!(back.query_id, QueryId::from("Q"));
    }
}
