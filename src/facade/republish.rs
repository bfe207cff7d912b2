//! Fire-and-forget re-publish of impacted queries.
//!
//! After a write, every impacted query is handed to the embedding layer's
//! [`Republisher`] so it can push a fresh cache-derived projection to its
//! own subscribers. Scheduling is coalesced per query (a query already
//! waiting is not queued twice) and callbacks run under a semaphore, so a
//! burst of writes never turns into an unbounded pile of tasks. Failures
//! are logged and counted; they never reach the writer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::identity::QueryId;

#[derive(Error, Debug)]
pub enum RepublishError {
    #[error("no subscribers for query {0}")]
    NoSubscribers(QueryId),
    #[error("re-publish failed: {0}")]
    Failed(String),
}

/// Hook implemented by the query-execution layer.
#[async_trait]
pub trait Republisher: Send + Sync {
    /// Re-read `query_id` from the cache (stale allowed) and deliver it to
    /// that query's subscribers.
    async fn republish(&self, query_id: &QueryId) -> Result<(), RepublishError>;
}

pub(super) struct RepublishQueue {
    republisher: Arc<dyn Republisher>,
    permits: Arc<Semaphore>,
    pending: Arc<DashSet<QueryId>>,
    inflight: Arc<AtomicUsize>,
}

impl RepublishQueue {
    pub(super) fn new(republisher: Arc<dyn Republisher>, concurrency: usize) -> Self {
        Self {
            republisher,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            pending: Arc::new(DashSet::new()),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Schedule every id in `impacted`. Returns immediately.
    pub(super) fn schedule(&self, impacted: &BTreeSet<QueryId>) {
        for query_id in impacted {
            if !self.pending.insert(query_id.clone()) {
                debug!(query_id = %query_id, "Re-publish already pending, coalesced");
                crate::metrics::record_republish("coalesced");
                continue;
            }

            let republisher = self.republisher.clone();
            let permits = self.permits.clone();
            let pending = self.pending.clone();
            let inflight = self.inflight.clone();
            let query_id = query_id.clone();

            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    pending.remove(&query_id);
                    return;
                };
                // Leave the pending set before running so a write landing
                // during the callback schedules another pass.
                pending.remove(&query_id);
                crate::metrics::set_republish_inflight(inflight.fetch_add(1, Ordering::AcqRel) + 1);

                match republisher.republish(&query_id).await {
                    Ok(()) => crate::metrics::record_republish("success"),
                    Err(e) => {
                        warn!(query_id = %query_id, error = %e, "Re-publish of impacted query failed");
                        crate::metrics::record_republish("error");
                    }
                }

                crate::metrics::set_republish_inflight(inflight.fetch_sub(1, Ordering::AcqRel) - 1);
            });
        }
    }

    pub(super) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(super) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelRepublisher {
        tx: mpsc::UnboundedSender<QueryId>,
        fail: bool,
    }

    #[async_trait]
    impl Republisher for ChannelRepublisher {
        async fn republish(&self, query_id: &QueryId) -> Result<(), RepublishError> {
            let _ = self.tx.send(query_id.clone());
            if self.fail {
                Err(RepublishError::Failed("subscriber gone".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_schedule_delivers_each_query() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = RepublishQueue::new(Arc::new(ChannelRepublisher { tx, fail: false }), 2);

        queue.schedule(&BTreeSet::from([QueryId::from("A"), QueryId::from("B")]));

        let mut seen = BTreeSet::new();
        for _ in 0..2 {
            let q = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            seen.insert(q);
        }
        assert_eq!(seen, BTreeSet::from([QueryId::from("A"), QueryId::from("B")]));
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = RepublishQueue::new(Arc::new(ChannelRepublisher { tx, fail: true }), 1);

        queue.schedule(&BTreeSet::from([QueryId::from("A")]));
        let q = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(q, QueryId::from("A"));

        // Queue still usable afterwards
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.schedule(&BTreeSet::from([QueryId::from("A")]));
        let q = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(q, QueryId::from("A"));
    }

    struct BlockingRepublisher {
        gate: Arc<Semaphore>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Republisher for BlockingRepublisher {
        async fn republish(&self, _query_id: &QueryId) -> Result<(), RepublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.acquire().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pending_query_is_coalesced() {
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = RepublishQueue::new(
            Arc::new(BlockingRepublisher { gate: gate.clone(), calls: calls.clone() }),
            1,
        );

        // First A occupies the only permit; second A waits in pending
        queue.schedule(&BTreeSet::from([QueryId::from("A")]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.schedule(&BTreeSet::from([QueryId::from("A")]));
        queue.schedule(&BTreeSet::from([QueryId::from("A")]));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.inflight(), 1);
        assert_eq!(queue.pending_len(), 1);

        gate.add_permits(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.inflight(), 0);
        assert_eq!(queue.pending_len(), 0);
    }
}
