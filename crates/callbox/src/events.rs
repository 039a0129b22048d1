//! Subscriber list used for transport and phone notifications.
//!
//! Delivery goes to a snapshot of the subscriber list taken at the start of
//! each `emit`, in registration order. Unsubscribing while an emit is in
//! progress only affects later emits. Subscriptions whose receiver was
//! dropped are pruned on the next emit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub type SubscriptionId = u64;

pub struct EventHub<E> {
    inner: Arc<HubInner<E>>,
}

struct HubInner<E> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

struct Subscriber<E> {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.inner.subscribers.lock();
        let before = guard.len();
        guard.retain(|sub| sub.id != id);
        guard.len() != before
    }

    /// Deliver `event` to every current subscriber; returns how many received it.
    pub fn emit(&self, event: E) -> usize {
        let snapshot: Vec<Subscriber<E>> = self.inner.subscribers.lock().clone();
        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for sub in &snapshot {
            if sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(sub.id);
            }
        }
        if !dead.is_empty() {
            self.inner
                .subscribers
                .lock()
                .retain(|sub| !dead.contains(&sub.id));
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

pub struct Subscription<E> {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}
