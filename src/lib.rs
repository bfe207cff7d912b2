//! # Query Cache
//!
//! A normalized client-side cache for the results of a typed query/mutation
//! SDK.
//!
//! ## Architecture
//!
//! Server results are split into a per-query skeleton and a shared table of
//! entity records, so one entity appearing in many query results is stored
//! once and every query sees the latest write:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CacheFacade                          │
//! │  • Scoped to one CacheIdentity (kind, project, user, host)  │
//! │  • write(): dehydrate, store, re-publish impacted queries   │
//! │  • read():  load skeleton, hydrate from entity records      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TreeProcessor                         │
//! │  • JSON tree ⇄ NormalizedNode skeleton + EntityRecords      │
//! │  • Reports queries whose projection changed (fan-out)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       CacheProvider                         │
//! │  • EphemeralProvider: DashMap per process                   │
//! │  • PersistentProvider: one SQLite file per identity         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use query_cache::{CacheConfig, CacheFacade, QueryId, ServerResult, StorageKind};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheConfig {
//!         storage: StorageKind::Persistent,
//!         project_id: "my-project".into(),
//!         host: "api.example.com".into(),
//!         ..Default::default()
//!     };
//!     let facade = CacheFacade::new(config, None);
//!     facade.on_auth_changed(Some("user-1")).await;
//!
//!     let q1 = QueryId::new("GetItem", &json!({"id": "G1"}));
//!     let result = ServerResult::from_response(
//!         r#"{"item": {"id": "G1", "price": 10}}"#,
//!         Some(60),
//!         &json!([{"path": ["item"], "entityId": "G1"}]),
//!     )
//!     .expect("valid json");
//!     facade.write(&q1, &result, Some(&q1)).await;
//!
//!     if let Some(cached) = facade.read(&q1).await {
//!         println!("price = {} (stale: {})", cached.data["item"]["price"], cached.stale);
//!     }
//! }
//! ```
//!
//! ## Features
//!
//! - **Entity dedup**: one record per entity id, shared by every query
//! - **Fan-out**: a write reports (and re-publishes) other queries it changed
//! - **Identity scoping**: a new provider per user, no cross-user reads
//! - **Advisory staleness**: stale results are still served, flagged
//! - **Compression**: optional zstd for persisted blobs (`compression`)
//!
//! ## Modules
//!
//! - [`facade`]: The [`CacheFacade`] entry point
//! - [`processor`]: Dehydrate / hydrate
//! - [`storage`]: Cache providers (memory, SQLite)
//! - [`entity`], [`node`], [`value`], [`result_tree`]: Data model
//! - [`resilience`]: Retry for store open

pub mod compression;
pub mod config;
pub mod entity;
pub mod facade;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod path;
pub mod processor;
pub mod resilience;
pub mod result_tree;
pub mod storage;
pub mod value;

pub use config::CacheConfig;
pub use entity::{EntityRecord, EntitySnapshot};
pub use facade::{
    CacheDecision, CacheFacade, CachedResult, FetchPolicy, ProviderStatus, RepublishError, Republisher,
    ServerResult, WriteOutcome,
};
pub use identity::{CacheIdentity, QueryId, StorageKind};
pub use node::NormalizedNode;
pub use path::{DataPath, EntityPathHint, EntityPaths, PathSegment};
pub use processor::{Dehydrated, EntitySet, TreeProcessor};
pub use result_tree::ResultTreeEntry;
pub use storage::memory::EphemeralProvider;
pub use storage::sql::PersistentProvider;
pub use storage::traits::{CacheProvider, ProviderStats, StorageError};
pub use value::CacheValue;
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
