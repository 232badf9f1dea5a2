//! Request/response correlation.
//!
//! Each outgoing request parks a one-shot completion slot keyed by the
//! request id. Whoever removes the entry from the map first resolves it:
//! a reply, the timeout sweep, a connection teardown or a cancellation.
//! Later arrivals find nothing and are discarded, so resolution happens at
//! most once without extra locking.
//!
//! Timeouts are driven by one periodic sweep per bus instead of a timer per
//! request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::Envelope;
use crate::connection::ConnectionId;
use crate::error::BusError;

/// Why a pending request ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The deadline elapsed.
    Timeout,
    /// The connection carrying the request closed.
    ConnectionLost,
    /// The caller gave up.
    Cancelled,
}

impl From<FailureReason> for BusError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Timeout => BusError::Timeout,
            FailureReason::ConnectionLost => BusError::ConnectionLost,
            FailureReason::Cancelled => BusError::Cancelled,
        }
    }
}

/// How a pending request ended.
#[derive(Debug)]
pub enum Outcome {
    /// The matching reply envelope.
    Reply(Envelope),
    /// No reply will come.
    Failed(FailureReason),
}

struct Pending {
    deadline: Instant,
    connection: Option<ConnectionId>,
    slot: oneshot::Sender<Outcome>,
}

/// Awaitable side of a registered request.
///
/// Resolves to [`Outcome::Failed`] with `ConnectionLost` if the correlator
/// is dropped while the request is still parked.
#[derive(Debug)]
pub struct PendingReply {
    id: Uuid,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    /// Correlation id this handle waits on.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Outcome::Failed(FailureReason::ConnectionLost)))
    }
}

/// Table of in-flight requests.
#[derive(Default)]
pub struct Correlator {
    pending: DashMap<Uuid, Pending>,
}

impl Correlator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request until `deadline`.
    ///
    /// `connection` is the hop the request left on. Tearing that connection
    /// down fails the entry.
    pub fn register(
        &self,
        correlation_id: Uuid,
        deadline: Instant,
        connection: Option<ConnectionId>,
    ) -> PendingReply {
        let (slot, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            Pending {
                deadline,
                connection,
                slot,
            },
        );
        PendingReply {
            id: correlation_id,
            rx,
        }
    }

    /// Deliver a reply. Returns true iff this was the first resolution.
    pub fn resolve(&self, correlation_id: Uuid, reply: Envelope) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, pending)) => {
                // The waiter may already be gone; the entry is consumed either way.
                let _ = pending.slot.send(Outcome::Reply(reply));
                true
            }
            None => false,
        }
    }

    /// Fail one entry. Returns true iff it was still pending.
    pub fn fail(&self, correlation_id: Uuid, reason: FailureReason) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, pending)) => {
                let _ = pending.slot.send(Outcome::Failed(reason));
                true
            }
            None => false,
        }
    }

    /// Time out every entry whose deadline is at or before `before`.
    pub fn expire_all(&self, before: Instant) -> usize {
        self.fail_where(|p| p.deadline <= before, FailureReason::Timeout)
    }

    /// Fail every pending entry.
    pub fn fail_all(&self, reason: FailureReason) -> usize {
        self.fail_where(|_| true, reason)
    }

    /// Fail every entry that left on `connection`.
    pub fn fail_connection(&self, connection: ConnectionId, reason: FailureReason) -> usize {
        self.fail_where(|p| p.connection == Some(connection), reason)
    }

    fn fail_where(&self, predicate: impl Fn(&Pending) -> bool, reason: FailureReason) -> usize {
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        // Each remove races fairly with resolve(); only winners count.
        ids.into_iter().filter(|id| self.fail(*id, reason)).count()
    }

    /// Whether `correlation_id` is still waiting.
    pub fn contains(&self, correlation_id: &Uuid) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Run the timeout sweep every `interval` until `shutdown` fires.
///
/// On shutdown every remaining entry is failed as cancelled.
pub fn spawn_sweeper(
    correlator: Arc<Correlator>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = correlator.expire_all(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "request sweep timed out pending requests");
                    }
                }
            }
        }

        correlator.fail_all(FailureReason::Cancelled);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reply_for(id: Uuid) -> Envelope {
        Envelope::reply(id, "pong", Bytes::from_static(b"\x01"))
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_resolve_delivers_reply() {
        let correlator = Correlator::new();
        let id = Uuid::new_v4();
        let pending = correlator.register(id, far(), None);

        assert!(correlator.resolve(id, reply_for(id)));

        match pending.await {
            Outcome::Reply(env) => assert_eq!(env.correlation_id(), id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_reply_resolves_once() {
        let correlator = Correlator::new();
        let id = Uuid::new_v4();
        let pending = correlator.register(id, far(), None);

        assert!(correlator.resolve(id, reply_for(id)));
        assert!(!correlator.resolve(id, reply_for(id)));
        assert!(matches!(pending.await, Outcome::Reply(_)));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let correlator = Correlator::new();
        let id = Uuid::new_v4();
        assert!(!correlator.resolve(id, reply_for(id)));
    }

    #[tokio::test]
    async fn test_expire_all_only_past_deadlines() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let early = correlator.register(Uuid::new_v4(), now, None);
        let _late = correlator.register(Uuid::new_v4(), now + Duration::from_secs(60), None);

        assert_eq!(correlator.expire_all(now), 1);
        assert!(matches!(early.await, Outcome::Failed(FailureReason::Timeout)));
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn test_reply_after_expiry_is_discarded() {
        let correlator = Correlator::new();
        let id = Uuid::new_v4();
        let pending = correlator.register(id, Instant::now(), None);

        correlator.expire_all(Instant::now());
        assert!(!correlator.resolve(id, reply_for(id)));
        assert!(matches!(pending.await, Outcome::Failed(FailureReason::Timeout)));
    }

    #[tokio::test]
    async fn test_fail_connection_targets_only_that_hop() {
        let correlator = Correlator::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let on_a: Vec<_> = (0..3)
            .map(|_| correlator.register(Uuid::new_v4(), far(), Some(a)))
            .collect();
        let _on_b = correlator.register(Uuid::new_v4(), far(), Some(b));

        assert_eq!(correlator.fail_connection(a, FailureReason::ConnectionLost), 3);
        for pending in on_a {
            assert!(matches!(
                pending.await,
                Outcome::Failed(FailureReason::ConnectionLost)
            ));
        }
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = Correlator::new();
        let p1 = correlator.register(Uuid::new_v4(), far(), None);
        let p2 = correlator.register(Uuid::new_v4(), far(), None);

        assert_eq!(correlator.fail_all(FailureReason::Cancelled), 2);
        assert!(matches!(p1.await, Outcome::Failed(FailureReason::Cancelled)));
        assert!(matches!(p2.await, Outcome::Failed(FailureReason::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_correlator_reads_as_connection_lost() {
        let correlator = Correlator::new();
        let pending = correlator.register(Uuid::new_v4(), far(), None);
        drop(correlator);
        assert!(matches!(
            pending.await,
            Outcome::Failed(FailureReason::ConnectionLost)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reply_and_expiry_resolve_once() {
        let correlator = Arc::new(Correlator::new());

        for _ in 0..200 {
            let id = Uuid::new_v4();
            let pending = correlator.register(id, Instant::now(), None);

            let c1 = correlator.clone();
            let c2 = correlator.clone();
            let c3 = correlator.clone();
            let r1 = tokio::spawn(async move { c1.resolve(id, reply_for(id)) });
            let r2 = tokio::spawn(async move { c2.resolve(id, reply_for(id)) });
            let ex = tokio::spawn(async move { c3.expire_all(Instant::now()) });

            let wins = r1.await.unwrap() as usize + r2.await.unwrap() as usize + ex.await.unwrap();
            assert_eq!(wins, 1);
            let _ = pending.await;
        }
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_times_out_requests() {
        let correlator = Arc::new(Correlator::new());
        let shutdown = CancellationToken::new();
        let _task = spawn_sweeper(correlator.clone(), Duration::from_millis(10), shutdown.clone());

        let start = Instant::now();
        let pending = correlator.register(Uuid::new_v4(), start + Duration::from_millis(50), None);

        assert!(matches!(pending.await, Outcome::Failed(FailureReason::Timeout)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(1));
        shutdown.cancel();
    }
}
