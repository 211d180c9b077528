//! Block/unblock notifications and the subscriber registry.
//!
//! A [`BlockEvent`] is raised only when an address changes classification: once when it crosses
//! the block threshold, and once when its counter expires. Subscribers are async callbacks; the
//! registry invokes all of them for each event and waits for the whole batch. A subscriber that
//! fails or panics is logged and does not affect the others.
//!
//! Any `tower::Service<BlockEvent>` can subscribe too (see [`SubscriberRegistry::subscribe_sink`]),
//! which is how [`EventRecorder`] and external sinks plug in.

use crate::error::BoxError;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// An address entered or left the blocked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BlockEvent {
    /// Address whose classification changed.
    pub address: IpAddr,
    /// `true` when newly blocked, `false` when unblocked.
    pub blocked: bool,
}

impl BlockEvent {
    /// Address crossed the threshold.
    pub fn blocked(address: IpAddr) -> Self {
        Self { address, blocked: true }
    }

    /// Address is no longer tracked as blocked.
    pub fn unblocked(address: IpAddr) -> Self {
        Self { address, blocked: false }
    }

    /// Stable label for logs and sinks.
    pub fn kind(&self) -> &'static str {
        if self.blocked {
            "blocked"
        } else {
            "unblocked"
        }
    }
}

impl fmt::Display for BlockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blocked {
            write!(f, "Blocked({})", self.address)
        } else {
            write!(f, "Unblocked({})", self.address)
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Subscribers that completed successfully.
    pub delivered: usize,
    /// Subscribers that returned an error or panicked.
    pub failed: usize,
}

type Callback = Arc<dyn Fn(BlockEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Registry of block-event subscribers.
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, Callback>>,
}

impl SubscriberRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), subscribers: Mutex::new(BTreeMap::new()) }
    }

    /// Register an async callback receiving `(address, blocked_now)`.
    pub fn subscribe<F, Fut>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(IpAddr, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.insert(Arc::new(move |event: BlockEvent| {
            Box::pin(callback(event.address, event.blocked))
                as BoxFuture<'static, Result<(), BoxError>>
        }))
    }

    /// Register a tower service as a subscriber. Each event goes to a fresh clone after
    /// `poll_ready`.
    pub fn subscribe_sink<S>(&self, sink: S) -> SubscriptionId
    where
        S: Service<BlockEvent, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        let sink = Mutex::new(sink);
        self.insert(Arc::new(move |event: BlockEvent| {
            let sink = sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
            Box::pin(async move {
                use tower::ServiceExt;
                let mut ready = sink.ready_oneshot().await.map_err(Into::<BoxError>::into)?;
                ready.call(event).await.map_err(Into::<BoxError>::into)
            }) as BoxFuture<'static, Result<(), BoxError>>
        }))
    }

    fn insert(&self, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, callback);
        id
    }

    /// Remove a subscriber; returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver `event` to every subscriber registered right now and wait for all of them.
    pub async fn emit(&self, event: BlockEvent) -> FanOut {
        let snapshot: Vec<(SubscriptionId, Callback)> =
            self.lock().iter().map(|(id, cb)| (*id, cb.clone())).collect();
        if snapshot.is_empty() {
            return FanOut::default();
        }

        let runs = snapshot.into_iter().map(|(id, callback)| async move {
            let outcome = AssertUnwindSafe(async move { callback(event).await }).catch_unwind().await;
            (id, outcome)
        });

        let mut fan_out = FanOut::default();
        for (id, outcome) in join_all(runs).await {
            match outcome {
                Ok(Ok(())) => fan_out.delivered += 1,
                Ok(Err(err)) => {
                    fan_out.failed += 1;
                    tracing::warn!(
                        subscriber = ?id,
                        address = %event.address,
                        kind = event.kind(),
                        error = %err,
                        "block event subscriber failed"
                    );
                }
                Err(_) => {
                    fan_out.failed += 1;
                    tracing::warn!(
                        subscriber = ?id,
                        address = %event.address,
                        kind = event.kind(),
                        "block event subscriber panicked"
                    );
                }
            }
        }
        fan_out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Callback>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry").field("subscribers", &self.len()).finish()
    }
}

/// A sink that keeps events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<BlockEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record(&self, event: BlockEvent) {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
    }

    pub fn events(&self) -> Vec<BlockEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<BlockEvent> for EventRecorder {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: BlockEvent) -> Self::Future {
        self.record(event);
        Box::pin(async { Ok(()) })
    }
}
