//! Read/write API.
//!
//! - `read()` - hydrate the cached projection of a query
//! - `write()` - normalize a server result and fan out to impacted queries
//! - `lookup()` - read-before-fetch decision for a fetch policy
//! - `stats()` - entry counts of the current provider
//!
//! Nothing here returns an error. Storage and codec failures are logged,
//! counted and turned into a miss (reads) or a dropped write.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::identity::QueryId;
use crate::metrics::LatencyTimer;
use crate::result_tree::ResultTreeEntry;
use crate::storage::traits::{CacheProvider, ProviderStats, StorageError};
use crate::value::CacheValue;

use super::{CacheDecision, CacheFacade, CachedResult, FetchPolicy, ServerResult, WriteOutcome};

/// Provider stats are sampled every this many writes.
const SIZE_CHECK_INTERVAL: u64 = 64;

impl CacheFacade {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Read / Write
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cached result for `query_id`, hydrated from the current entity data.
    ///
    /// Stale entries are returned with `stale = true`; the caller decides
    /// whether to show them. `None` on a miss, when no provider is open, or
    /// when the entry cannot be decoded.
    #[tracing::instrument(skip(self), fields(query_id = %query_id))]
    pub async fn read(&self, query_id: &QueryId) -> Option<CachedResult> {
        let provider = self.current_provider()?;
        let name = provider.name();
        let _timer = LatencyTimer::new(name, "read");

        let entry = match provider.result_tree(query_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                crate::metrics::record_operation(name, "read", "miss");
                return None;
            }
            Err(e) => {
                self.note_failure(name, "result_tree", "read", &e);
                return None;
            }
        };

        let root = match entry.root_node() {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "Cached result tree undecodable, treating as miss");
                crate::metrics::record_codec_error(name, "result_tree");
                crate::metrics::record_operation(name, "read", "error");
                return None;
            }
        };

        let data = match self.processor.hydrate(&root, provider.as_ref()).await {
            Ok(data) => data,
            Err(e) => {
                self.note_failure(name, "entity_data", "read", &e);
                return None;
            }
        };

        let stale = entry.is_stale();
        crate::metrics::record_operation(name, "read", if stale { "stale" } else { "hit" });
        debug!(stale, "Cache hit");

        Some(CachedResult {
            query_id: query_id.clone(),
            data: data.into_json(),
            stale,
            cached_at: entry.cached_at,
            ttl: entry.ttl(),
        })
    }

    /// Store a fresh server result for `query_id`.
    ///
    /// `requestor` is the query that fetched the result. It is registered
    /// as a dependent of every entity in the result and is never in the
    /// impacted set of its own write. Pass `None` for writes that should
    /// not subscribe anything (mutation payloads).
    ///
    /// Every other query whose projection includes a touched entity is
    /// scheduled for re-publish before this returns; the callbacks run in
    /// the background.
    #[tracing::instrument(skip(self, result), fields(query_id = %query_id))]
    pub async fn write(&self, query_id: &QueryId, result: &ServerResult, requestor: Option<&QueryId>) -> WriteOutcome {
        let Some(provider) = self.current_provider() else {
            debug!("No cache provider, write dropped");
            return WriteOutcome::default();
        };
        let name = provider.name();
        let _timer = LatencyTimer::new(name, "write");

        let hydrated = CacheValue::from(result.data.clone());
        let dehydrated = match self
            .processor
            .dehydrate(&hydrated, &result.entity_paths, provider.as_ref(), requestor)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                self.note_failure(name, "entity_data", "write", &e);
                return WriteOutcome::default();
            }
        };

        let ttl = result.ttl.unwrap_or_else(|| self.config.default_ttl());
        let entry = ResultTreeEntry::new(
            query_id.clone(),
            dehydrated.data,
            ttl,
            Some(std::sync::Arc::new(dehydrated.root)),
        );

        // Entity updates above already landed; impacted queries see them
        // even if the tree itself fails to store.
        let stored = match provider.set_result_tree(query_id, entry).await {
            Ok(()) => {
                crate::metrics::record_operation(name, "write", "success");
                true
            }
            Err(e) => {
                self.note_failure(name, "result_tree", "write", &e);
                false
            }
        };

        let impacted = dehydrated.impacted;
        crate::metrics::record_impacted(impacted.len());
        if !impacted.is_empty() {
            debug!(impacted = impacted.len(), "Entity change impacts other queries");
            match &self.republish {
                Some(queue) => queue.schedule(&impacted),
                None => debug!("No republisher registered, impacted queries not notified"),
            }
        }

        self.maybe_check_size(provider.as_ref()).await;

        WriteOutcome { stored, impacted }
    }

    /// Decide how to serve `query_id` under `policy`.
    pub async fn lookup(&self, query_id: &QueryId, policy: FetchPolicy) -> CacheDecision {
        match policy {
            FetchPolicy::ServerOnly => CacheDecision::Fetch { stale: None },
            FetchPolicy::CacheOnly => match self.read(query_id).await {
                Some(cached) => CacheDecision::Hit(cached),
                None => CacheDecision::Miss,
            },
            FetchPolicy::PreferCache => match self.read(query_id).await {
                Some(cached) if !cached.stale => CacheDecision::Hit(cached),
                stale => CacheDecision::Fetch { stale },
            },
        }
    }

    /// Entry counts of the current provider.
    pub async fn stats(&self) -> Option<ProviderStats> {
        let provider = self.current_provider()?;
        match provider.stats().await {
            Ok(stats) => {
                crate::metrics::set_entries(provider.name(), stats.result_trees, stats.entities);
                Some(stats)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read cache stats");
                None
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════════

    fn note_failure(&self, provider: &'static str, table: &str, operation: &str, e: &StorageError) {
        if e.is_codec() {
            crate::metrics::record_codec_error(provider, table);
        }
        warn!(provider, operation, error = %e, "Cache operation failed, treating as miss");
        crate::metrics::record_operation(provider, operation, "error");
    }

    /// Advisory bound: log once per provider when over `max_entries`.
    async fn maybe_check_size(&self, provider: &dyn CacheProvider) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SIZE_CHECK_INTERVAL != 0 {
            return;
        }
        let Ok(stats) = provider.stats().await else {
            return;
        };
        crate::metrics::set_entries(provider.name(), stats.result_trees, stats.entities);

        let total = stats.result_trees + stats.entities;
        if total > self.config.max_entries && !self.size_warned.swap(true, Ordering::Relaxed) {
            warn!(
                entries = total,
                max_entries = self.config.max_entries,
                "Cache exceeds advisory size, nothing is evicted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::path::{DataPath, EntityPathHint, EntityPaths};
    use serde_json::json;
    use std::time::Duration;

    async fn scoped(config: CacheConfig) -> CacheFacade {
        let facade = CacheFacade::new(config, None);
        facade.on_auth_changed(Some("u")).await;
        facade
    }

    fn item_result(price: i64) -> ServerResult {
        ServerResult::new(json!({"item": {"id": "G1", "price": price}}))
            .with_ttl(Duration::from_secs(60))
            .with_entity_paths(EntityPaths::new().with(DataPath::root().field("item"), EntityPathHint::Single("G1".into())))
    }

    #[tokio::test]
    async fn test_unscoped_reads_miss_and_writes_drop() {
        let facade = CacheFacade::new(CacheConfig::default(), None);
        let q = QueryId::from("Q1");

        let outcome = facade.write(&q, &item_result(10), Some(&q)).await;
        assert_eq!(outcome, WriteOutcome::default());
        assert!(facade.read(&q).await.is_none());
        assert!(facade.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let facade = scoped(CacheConfig::default()).await;
        let q = QueryId::from("Q1");

        let outcome = facade.write(&q, &item_result(10), Some(&q)).await;
        assert!(outcome.stored);
        assert!(outcome.impacted.is_empty());

        let cached = facade.read(&q).await.unwrap();
        assert_eq!(cached.data, json!({"item": {"id": "G1", "price": 10}}));
        assert!(!cached.stale);
        assert_eq!(cached.ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_second_write_impacts_first_query() {
        let facade = scoped(CacheConfig::default()).await;
        let q1 = QueryId::from("Q1");
        let q2 = QueryId::from("Q2");

        facade.write(&q1, &item_result(10), Some(&q1)).await;
        let outcome = facade.write(&q2, &item_result(20), Some(&q2)).await;

        assert!(outcome.impacted.contains(&q1));
        assert!(!outcome.impacted.contains(&q2));
        assert_eq!(facade.read(&q1).await.unwrap().data["item"]["price"], 20);
    }

    #[tokio::test]
    async fn test_default_ttl_zero_reads_stale_later() {
        let facade = scoped(CacheConfig::default()).await;
        let q = QueryId::from("Q1");

        facade.write(&q, &ServerResult::new(json!({"n": 1})), Some(&q)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cached = facade.read(&q).await.unwrap();
        assert_eq!(cached.ttl, Duration::ZERO);
        assert!(cached.stale);
    }

    #[tokio::test]
    async fn test_non_object_root_write_is_dropped() {
        let facade = scoped(CacheConfig::default()).await;
        let q = QueryId::from("Q1");

        let outcome = facade.write(&q, &ServerResult::new(json!([1, 2, 3])), Some(&q)).await;
        assert!(!outcome.stored);
        assert!(facade.read(&q).await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_policies() {
        let facade = scoped(CacheConfig::default()).await;
        let q = QueryId::from("Q1");

        assert_eq!(facade.lookup(&q, FetchPolicy::CacheOnly).await, CacheDecision::Miss);
        assert_eq!(facade.lookup(&q, FetchPolicy::PreferCache).await, CacheDecision::Fetch { stale: None });

        facade.write(&q, &item_result(10), Some(&q)).await;

        assert!(matches!(facade.lookup(&q, FetchPolicy::PreferCache).await, CacheDecision::Hit(_)));
        assert!(matches!(facade.lookup(&q, FetchPolicy::CacheOnly).await, CacheDecision::Hit(_)));
        assert_eq!(facade.lookup(&q, FetchPolicy::ServerOnly).await, CacheDecision::Fetch { stale: None });
    }

    #[tokio::test]
    async fn test_prefer_cache_offers_stale_while_fetching() {
        let facade = scoped(CacheConfig::default()).await;
        let q = QueryId::from("Q1");

        facade.write(&q, &ServerResult::new(json!({"n": 1})), Some(&q)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        match facade.lookup(&q, FetchPolicy::PreferCache).await {
            CacheDecision::Fetch { stale: Some(cached) } => assert!(cached.stale),
            other => panic!("expected fetch with stale data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stats_count_trees_and_entities() {
        let facade = scoped(CacheConfig::default()).await;
        let q = QueryId::from("Q1");
        facade.write(&q, &item_result(10), Some(&q)).await;

        let stats = facade.stats().await.unwrap();
        assert_eq!(stats.result_trees, 1);
        assert_eq!(stats.entities, 1);
    }

    #[tokio::test]
    async fn test_oversize_is_advisory() {
        let config = CacheConfig { max_entries: 1, ..Default::default() };
        let facade = scoped(config).await;

        for i in 0..3 {
            let q = QueryId::from_raw(format!("Q{i}"));
            let outcome = facade.write(&q, &item_result(i), Some(&q)).await;
            assert!(outcome.stored);
        }
        assert!(facade.size_warned.load(Ordering::Relaxed));
        assert_eq!(facade.stats().await.unwrap().result_trees, 3);
    }

    #[tokio::test]
    async fn test_rescope_isolates_users() {
        let facade = scoped(CacheConfig::default()).await;
        let q = QueryId::from("Q1");
        facade.write(&q, &item_result(10), Some(&q)).await;

        facade.on_auth_changed(Some("other")).await;
        assert!(facade.read(&q).await.is_none());
    }
}
