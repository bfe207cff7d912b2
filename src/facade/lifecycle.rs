//! Provider lifecycle: scoping the cache to an identity.
//!
//! Every auth-state change recomputes the [`CacheIdentity`]. A different
//! identity gets a brand-new provider; the old one is never migrated or
//! cleared, so nothing written for one user is visible to another.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::identity::{CacheIdentity, StorageKind};
use crate::storage::memory::EphemeralProvider;
use crate::storage::sql::PersistentProvider;
use crate::storage::traits::{CacheProvider, StorageError};

use super::{CacheFacade, ProviderState, ProviderStatus};

impl CacheFacade {
    /// Point the facade at `identity`.
    ///
    /// No-op when the identity is unchanged (including a previously failed
    /// one, so an open failure is reported once). Otherwise a new provider
    /// is opened and swapped in; if opening fails the facade is disabled
    /// for this identity and every read misses until the next rescope.
    #[tracing::instrument(skip(self), fields(identity = %identity))]
    pub async fn rescope(&self, identity: CacheIdentity) -> ProviderStatus {
        let _guard = self.rescope_lock.lock().await;

        if self.current_identity().as_ref() == Some(&identity) {
            debug!("Identity unchanged, keeping provider");
            return self.status();
        }

        let opened = match self.revive(&identity) {
            Some(provider) => {
                debug!("Picked up provider still held from an earlier scope");
                Ok(provider)
            }
            None => self.open_provider(&identity).await,
        };

        let next = match opened {
            Ok(provider) => {
                info!(provider = provider.name(), "Cache scoped to new identity");
                crate::metrics::record_rescope(provider.name());
                ProviderState::Ready(provider)
            }
            Err(e) => {
                error!(error = %e, "Cache provider failed to open, cache disabled for this identity");
                crate::metrics::record_provider_init_failure(identity.kind.as_str());
                ProviderState::Disabled(identity)
            }
        };

        // Old provider drops with its last in-flight handle
        let previous = std::mem::replace(&mut *self.state.write(), next);
        self.retire(previous);
        self.writes.store(0, Ordering::Relaxed);
        self.size_warned.store(false, Ordering::Relaxed);

        self.status()
    }

    /// Recompute the identity for `user_id` (`None` = signed out) and
    /// rescope if it changed.
    pub async fn on_auth_changed(&self, user_id: Option<&str>) -> ProviderStatus {
        let identity = self.config.identity_for(user_id);
        self.rescope(identity).await
    }

    /// Scope the facade to a provider built by the caller (custom backends,
    /// fault injection). Replaces whatever was there, even for an equal
    /// identity.
    pub async fn install_provider(&self, provider: Arc<dyn CacheProvider>) -> ProviderStatus {
        let _guard = self.rescope_lock.lock().await;
        info!(provider = provider.name(), identity = %provider.identity(), "Cache provider installed");
        crate::metrics::record_rescope(provider.name());

        let previous = std::mem::replace(&mut *self.state.write(), ProviderState::Ready(provider));
        self.retire(previous);
        self.writes.store(0, Ordering::Relaxed);
        self.size_warned.store(false, Ordering::Relaxed);

        self.status()
    }

    fn revive(&self, identity: &CacheIdentity) -> Option<Arc<dyn CacheProvider>> {
        self.retired.lock().remove(identity).and_then(|weak| weak.upgrade())
    }

    fn retire(&self, previous: ProviderState) {
        let ProviderState::Ready(provider) = previous else {
            return;
        };
        // Memory providers start empty on every scope
        if provider.identity().kind != StorageKind::Persistent {
            return;
        }
        let mut retired = self.retired.lock();
        retired.retain(|_, weak| weak.strong_count() > 0);
        retired.insert(provider.identity().clone(), Arc::downgrade(&provider));
    }

    async fn open_provider(&self, identity: &CacheIdentity) -> Result<Arc<dyn CacheProvider>, StorageError> {
        match identity.kind {
            StorageKind::Memory => Ok(Arc::new(EphemeralProvider::new(identity.clone()))),
            StorageKind::Persistent => {
                let dir = self.config.resolved_cache_dir();
                let provider = PersistentProvider::open(identity.clone(), &dir, &self.config.open_retry()).await?;
                Ok(Arc::new(provider))
            }
        }
    }
}
