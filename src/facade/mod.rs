// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache facade.
//!
//! The [`CacheFacade`] is the single entry point the query-execution layer
//! talks to. It owns:
//! - the current [`CacheProvider`], scoped to one [`CacheIdentity`]
//! - the [`TreeProcessor`] used to dehydrate writes and hydrate reads
//! - the re-publish queue that pushes entity changes to other queries
//!
//! # Lifecycle
//!
//! ```text
//! Unscoped ──rescope──▶ Ready(identity) ──rescope──▶ Ready(identity')
//!                │                                 │
//!                └──open failed──▶ Disabled(identity) ◀┘
//! ```
//!
//! A rescope never mutates the old provider. Operations already holding it
//! finish against it and the provider is dropped with its last handle.
//! Rescoping back to a persistent identity whose old provider is still held
//! somewhere picks that provider up again instead of opening the same file
//! twice.
//!
//! # Example
//!
//! ```rust,no_run
//! use query_cache::{CacheConfig, CacheFacade, QueryId, ServerResult};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let facade = CacheFacade::new(CacheConfig::default(), None);
//! facade.on_auth_changed(Some("user-1")).await;
//!
//! let q = QueryId::new("Item", &json!({"id": 1}));
//! let result = ServerResult::new(json!({"item": {"price": 10}}));
//! facade.write(&q, &result, Some(&q)).await;
//!
//! let cached = facade.read(&q).await.expect("cached");
//! assert_eq!(cached.data["item"]["price"], 10);
//! # }
//! ```

mod api;
mod lifecycle;
mod republish;
mod types;

pub use republish::{RepublishError, Republisher};
pub use types::{CacheDecision, CachedResult, FetchPolicy, ProviderStatus, ServerResult, WriteOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::identity::CacheIdentity;
use crate::processor::TreeProcessor;
use crate::storage::traits::CacheProvider;

use republish::RepublishQueue;

/// Provider slot.
pub(super) enum ProviderState {
    Unscoped,
    Ready(Arc<dyn CacheProvider>),
    Disabled(CacheIdentity),
}

/// Normalized query cache, scoped to the current identity.
///
/// # Thread Safety
///
/// The facade is `Send + Sync`; share it behind an `Arc`. Reads and writes
/// clone the current provider handle and never hold the state lock across
/// an await.
pub struct CacheFacade {
    pub(super) config: CacheConfig,

    pub(super) processor: TreeProcessor,

    /// Current provider
    pub(super) state: RwLock<ProviderState>,

    /// Serializes rescopes so two auth events cannot open two providers
    pub(super) rescope_lock: Mutex<()>,

    /// Persistent providers swapped out by a rescope, while still in use
    pub(super) retired: parking_lot::Mutex<HashMap<CacheIdentity, Weak<dyn CacheProvider>>>,

    /// Absent when nobody listens for impacted queries
    republish: Option<RepublishQueue>,

    /// Writes since the last rescope (drives the periodic size check)
    pub(super) writes: AtomicU64,

    /// Size warning already emitted for the current provider
    pub(super) size_warned: AtomicBool,
}

impl CacheFacade {
    /// Create a facade with no provider.
    ///
    /// Reads miss and writes are dropped until the first
    /// [`rescope()`](Self::rescope) or [`on_auth_changed()`](Self::on_auth_changed).
    pub fn new(config: CacheConfig, republisher: Option<Arc<dyn Republisher>>) -> Self {
        let republish = republisher.map(|r| RepublishQueue::new(r, config.republish_concurrency));
        Self {
            config,
            processor: TreeProcessor::new(),
            state: RwLock::new(ProviderState::Unscoped),
            rescope_lock: Mutex::new(()),
            retired: parking_lot::Mutex::new(HashMap::new()),
            republish,
            writes: AtomicU64::new(0),
            size_warned: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> ProviderStatus {
        match &*self.state.read() {
            ProviderState::Unscoped => ProviderStatus::Unscoped,
            ProviderState::Ready(p) => ProviderStatus::Ready(p.identity().clone()),
            ProviderState::Disabled(id) => ProviderStatus::Disabled(id.clone()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(&*self.state.read(), ProviderState::Ready(_))
    }

    /// Handle to the current provider, if one is open.
    #[must_use]
    pub fn current_provider(&self) -> Option<Arc<dyn CacheProvider>> {
        match &*self.state.read() {
            ProviderState::Ready(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// Impacted queries waiting for a re-publish slot.
    #[must_use]
    pub fn pending_republishes(&self) -> usize {
        self.republish.as_ref().map_or(0, RepublishQueue::pending_len)
    }

    /// Re-publish callbacks currently running.
    #[must_use]
    pub fn inflight_republishes(&self) -> usize {
        self.republish.as_ref().map_or(0, RepublishQueue::inflight)
    }

    pub(super) fn current_identity(&self) -> Option<CacheIdentity> {
        match &*self.state.read() {
            ProviderState::Unscoped => None,
            ProviderState::Ready(p) => Some(p.identity().clone()),
            ProviderState::Disabled(id) => Some(id.clone()),
        }
    }
}
