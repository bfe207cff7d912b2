//! Configuration for the query cache.
//!
//! # Example
//!
//! ```
//! use query_cache::{CacheConfig, StorageKind};
//!
//! // Minimal config (uses defaults)
//! let config = CacheConfig::default();
//! assert_eq!(config.storage, StorageKind::Memory);
//! assert_eq!(config.republish_concurrency, 8);
//!
//! // Persistent cache for a project
//! let config = CacheConfig {
//!     storage: StorageKind::Persistent,
//!     project_id: "my-project".into(),
//!     host: "api.example.com".into(),
//!     cache_dir: Some("/var/cache/my-app".into()),
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::identity::{CacheIdentity, StorageKind};
use crate::resilience::retry::RetryConfig;

/// Configuration for the query cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Memory or persistent storage
    #[serde(default = "default_storage")]
    pub storage: StorageKind,

    /// Directory for persistent store files (default: `<tmp>/query-cache`)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Backend project id (part of the cache identity)
    #[serde(default)]
    pub project_id: String,

    /// Backend host (part of the cache identity)
    #[serde(default)]
    pub host: String,

    /// Advisory size bound (result trees + entities). Exceeding it is
    /// logged; nothing is evicted.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// TTL for results that arrive without one (seconds)
    #[serde(default)]
    pub default_ttl_secs: u64,

    /// Max concurrent re-publish callbacks
    #[serde(default = "default_republish_concurrency")]
    pub republish_concurrency: usize,

    /// Attempts when opening the persistent store
    #[serde(default = "default_open_attempts")]
    pub open_attempts: usize,
}

fn default_storage() -> StorageKind { StorageKind::Memory }
fn default_max_entries() -> usize { 100_000 }
fn default_republish_concurrency() -> usize { 8 }
fn default_open_attempts() -> usize { 3 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            cache_dir: None,
            project_id: String::new(),
            host: String::new(),
            max_entries: default_max_entries(),
            default_ttl_secs: 0,
            republish_concurrency: default_republish_concurrency(),
            open_attempts: default_open_attempts(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("query-cache"))
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn open_retry(&self) -> RetryConfig {
        RetryConfig::store_open().with_attempts(self.open_attempts)
    }

    /// Identity for `user_id` under this config.
    #[must_use]
    pub fn identity_for(&self, user_id: Option<&str>) -> CacheIdentity {
        CacheIdentity::new(self.storage, self.project_id.clone(), user_id, self.host.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.max_entries, 100_000);
        assert_eq!(config.default_ttl(), Duration::ZERO);
        assert_eq!(config.open_retry().max_attempts, 3);
    }

    #[test]
    fn test_deserialize_persistent() {
        let config: CacheConfig = serde_json::from_str(
            r#"{"storage": "persistent", "cache_dir": "/tmp/x", "project_id": "p", "host": "h", "default_ttl_secs": 30}"#,
        )
        .unwrap();
        assert_eq!(config.storage, StorageKind::Persistent);
        assert_eq!(config.resolved_cache_dir(), PathBuf::from("/tmp/x"));
        assert_eq!(config.default_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_identity_for_tracks_config() {
        let config = CacheConfig {
            project_id: "p".into(),
            host: "h".into(),
            ..Default::default()
        };
        let id = config.identity_for(Some("u"));
        assert_eq!(id.kind, StorageKind::Memory);
        assert_eq!(id.project_id, "p");
        assert_eq!(id.user_id, "u");
        assert_ne!(id, config.identity_for(None));
    }

    #[test]
    fn test_default_cache_dir_under_temp() {
        let config = CacheConfig::default();
        assert!(config.resolved_cache_dir().starts_with(std::env::temp_dir()));
    }
}
