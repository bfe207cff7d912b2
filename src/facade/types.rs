//! Public types for the cache facade.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::Value;

use crate::identity::{CacheIdentity, QueryId};
use crate::path::EntityPaths;

/// What the facade currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    /// No identity yet; reads miss, writes are dropped
    Unscoped,
    /// Provider open and serving
    Ready(CacheIdentity),
    /// Provider failed to open; the cache is off for this identity
    Disabled(CacheIdentity),
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unscoped => write!(f, "Unscoped"),
            Self::Ready(id) => write!(f, "Ready({})", id),
            Self::Disabled(id) => write!(f, "Disabled({})", id),
        }
    }
}

/// A server result as delivered by the transport.
#[derive(Debug, Clone)]
pub struct ServerResult {
    pub data: Value,
    /// Server-provided TTL; the configured default applies when absent
    pub ttl: Option<Duration>,
    pub entity_paths: EntityPaths,
}

impl ServerResult {
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ttl: None,
            entity_paths: EntityPaths::new(),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_entity_paths(mut self, paths: EntityPaths) -> Self {
        self.entity_paths = paths;
        self
    }

    /// Build from the raw transport payload: the JSON text, optional TTL in
    /// seconds and the entity-path metadata list.
    pub fn from_response(json: &str, ttl_secs: Option<u64>, entity_metadata: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::from_str(json)?,
            ttl: ttl_secs.map(Duration::from_secs),
            entity_paths: EntityPaths::from_extensions(entity_metadata),
        })
    }
}

/// A hydrated cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub query_id: QueryId,
    pub data: Value,
    pub stale: bool,
    /// Epoch millis of the server fetch this came from
    pub cached_at: i64,
    pub ttl: Duration,
}

/// Result of a cache write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Whether the result tree was stored
    pub stored: bool,
    /// Other queries scheduled for re-publish
    pub impacted: BTreeSet<QueryId>,
}

/// How a query consults the cache before going to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// Fresh cache hit wins; otherwise fetch
    #[default]
    PreferCache,
    /// Never fetch; serve whatever is cached, stale or not
    CacheOnly,
    /// Skip the cache read entirely
    ServerOnly,
}

/// Outcome of [`CacheFacade::lookup`](super::CacheFacade::lookup).
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// Serve this without a network round trip
    Hit(CachedResult),
    /// Go to the network; `stale` may be shown in the meantime
    Fetch { stale: Option<CachedResult> },
    /// Cache-only lookup found nothing
    Miss,
}
