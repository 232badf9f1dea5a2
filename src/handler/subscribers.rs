//! Broadcast subscribers.
//!
//! Each subscription owns a bounded queue and a drain task. Delivery from
//! the read loop is a `try_send` per subscriber, so a slow callback never
//! stalls the connection: when its queue is full the message is dropped for
//! that subscriber only and a warning is logged.
//!
//! The table also keeps the last payload seen per slug for
//! [`Bus::subscribe_with_last`](crate::Bus::subscribe_with_last).

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::MessageContext;

/// Default per-subscriber queue depth.
///
/// A single read from the socket can complete hundreds of frames, all
/// delivered before the subscriber's drain task gets to run.
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 16 * 1024;

/// Type-erased subscriber callback.
pub type Callback = Box<dyn Fn(Bytes, MessageContext) + Send + 'static>;

type Delivery = (Bytes, MessageContext);

struct Slot {
    token: u64,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Vec<Slot>>,
    last: HashMap<String, Delivery>,
}

/// Slug to subscriber queues.
pub struct SubscriberTable {
    inner: Mutex<Inner>,
    capacity: usize,
    next_token: AtomicU64,
    shutdown: CancellationToken,
}

impl SubscriberTable {
    /// Create a table whose drain tasks stop when `shutdown` fires.
    pub fn new(capacity: usize, shutdown: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            next_token: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Attach `callback` to `slug` until `lifetime` is cancelled.
    ///
    /// With `replay_last`, the cached last payload (if any) is queued ahead
    /// of anything delivered afterwards. Must be called inside a Tokio
    /// runtime.
    pub fn add(
        self: &Arc<Self>,
        slug: &str,
        callback: Callback,
        lifetime: CancellationToken,
        replay_last: bool,
    ) -> u64 {
        let (tx, mut rx) = mpsc::channel::<Delivery>(self.capacity);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut inner = self.inner.lock();
            if replay_last {
                if let Some(last) = inner.last.get(slug) {
                    let _ = tx.try_send(last.clone());
                }
            }
            inner
                .slots
                .entry(slug.to_string())
                .or_default()
                .push(Slot { token, tx });
        }

        let table: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let slug = slug.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = lifetime.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some((data, ctx)) => {
                            if catch_unwind(AssertUnwindSafe(|| callback(data, ctx))).is_err() {
                                tracing::warn!(slug = %slug, id = %ctx.id(), "subscriber panicked");
                            }
                        }
                        None => break,
                    },
                }
            }

            if let Some(table) = table.upgrade() {
                table.remove(&slug, token);
            }
        });

        token
    }

    /// Queue `data` for every subscriber of `slug` and remember it as the
    /// last value. Returns how many subscribers accepted it.
    pub fn deliver(&self, slug: &str, data: &Bytes, ctx: MessageContext) -> usize {
        let mut inner = self.inner.lock();
        inner.last.insert(slug.to_string(), (data.clone(), ctx));

        let Some(slots) = inner.slots.get_mut(slug) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| match slot.tx.try_send((data.clone(), ctx)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(slug, token = slot.token, "subscriber queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Last payload delivered for `slug`.
    pub fn last(&self, slug: &str) -> Option<Bytes> {
        self.inner.lock().last.get(slug).map(|(data, _)| data.clone())
    }

    /// Detach one subscriber.
    pub fn remove(&self, slug: &str, token: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(slots) = inner.slots.get_mut(slug) else {
            return false;
        };

        let before = slots.len();
        slots.retain(|slot| slot.token != token);
        let removed = slots.len() != before;
        if slots.is_empty() {
            inner.slots.remove(slug);
        }
        removed
    }

    /// Live subscribers of `slug`.
    pub fn count(&self, slug: &str) -> usize {
        self.inner.lock().slots.get(slug).map_or(0, Vec::len)
    }
}

/// Keeps a subscription or handler registration alive.
///
/// Dropping it (or calling [`unsubscribe`](Self::unsubscribe)) ends the
/// registration. The registration also ends when the lifetime token it
/// was created with is cancelled.
#[must_use = "dropping a Subscription ends it immediately"]
pub struct Subscription {
    slug: String,
    guard: Option<DropGuard>,
}

impl Subscription {
    pub(crate) fn new(slug: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            slug: slug.into(),
            guard: Some(token.drop_guard()),
        }
    }

    /// Slug this registration listens on.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// End the registration now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the registration until its lifetime token is cancelled.
    pub fn detach(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("slug", &self.slug)
            .field("attached", &self.guard.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx() -> MessageContext {
        MessageContext::local(Uuid::new_v4())
    }

    fn table() -> Arc<SubscriberTable> {
        Arc::new(SubscriberTable::new(8, CancellationToken::new()))
    }

    fn forward(tx: mpsc::UnboundedSender<Bytes>) -> Callback {
        Box::new(move |data: Bytes, _ctx: MessageContext| {
            let _ = tx.send(data);
        })
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_one_copy() {
        let table = table();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        table.add("tick", forward(tx1), lifetime.child_token(), false);
        table.add("tick", forward(tx2), lifetime.child_token(), false);

        assert_eq!(table.deliver("tick", &Bytes::from_static(b"1"), ctx()), 2);

        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_lifetime_detaches() {
        let table = table();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        table.add("tick", forward(tx), lifetime.clone(), false);
        assert_eq!(table.count("tick"), 1);

        lifetime.cancel();
        // The drain task drops its sender half when it exits.
        assert!(rx.recv().await.is_none());
        assert_eq!(table.count("tick"), 0);
        assert_eq!(table.deliver("tick", &Bytes::new(), ctx()), 0);
    }

    #[tokio::test]
    async fn test_replay_last() {
        let table = table();
        table.deliver("price", &Bytes::from_static(b"42"), ctx());
        assert_eq!(table.last("price"), Some(Bytes::from_static(b"42")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        table.add("price", forward(tx), CancellationToken::new(), true);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"42"));
    }

    #[tokio::test]
    async fn test_panicking_callback_keeps_draining() {
        let table = table();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: Callback = Box::new(move |data: Bytes, _ctx: MessageContext| {
            if data.is_empty() {
                panic!("empty payload");
            }
            let _ = tx.send(data);
        });
        table.add("tick", callback, CancellationToken::new(), false);

        table.deliver("tick", &Bytes::new(), ctx());
        table.deliver("tick", &Bytes::from_static(b"ok"), ctx());

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(table.count("tick"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_drops_for_that_subscriber_only() {
        let table = Arc::new(SubscriberTable::new(1, CancellationToken::new()));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate_rx = std::sync::Mutex::new(gate_rx);
        let blocked: Callback = Box::new(move |_: Bytes, _: MessageContext| {
            let _ = gate_rx.lock().map(|rx| rx.recv_timeout(Duration::from_secs(2)));
        });
        table.add("tick", blocked, CancellationToken::new(), false);

        let mut accepted = 0;
        for _ in 0..8 {
            accepted += table.deliver("tick", &Bytes::from_static(b"x"), ctx());
            tokio::task::yield_now().await;
        }
        assert!(accepted < 8);
        let _ = gate_tx.send(());
    }

    #[test]
    fn test_subscription_drop_cancels_token() {
        let token = CancellationToken::new();
        let sub = Subscription::new("tick", token.clone());
        assert_eq!(sub.slug(), "tick");
        sub.unsubscribe();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_detached_subscription_survives_drop() {
        let token = CancellationToken::new();
        Subscription::new("tick", token.clone()).detach();
        assert!(!token.is_cancelled());
    }
}
