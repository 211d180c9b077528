//! The block decision engine.
//!
//! [`IpBlocker`] counts hits per address in a sliding window, decides whether an address is
//! blocked, computes the graduated delay, and notifies subscribers when an address crosses into
//! or out of the blocked state.
//!
//! ```rust
//! use ipblocker::{BlockRule, IpBlocker};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rule = BlockRule::new(3, Duration::from_secs(60))?;
//! let blocker = IpBlocker::in_memory(rule);
//!
//! for _ in 0..2 {
//!     assert!(!blocker.check_address("203.0.113.7").await?.blocked);
//! }
//! assert!(blocker.check_address("203.0.113.7").await?.blocked);
//! blocker.destroy().await?;
//! # Ok(())
//! # }
//! ```

use crate::address::parse_address;
use crate::error::{BlockError, BoxError, PolicyError};
use crate::events::{BlockEvent, SubscriberRegistry, SubscriptionId};
use crate::loadable::{LazyValue, Loadable};
use crate::rule::BlockRule;
use crate::store::{BlockStore, MemoryCounterStore, StoreAdapter};
use crate::whitelist::{WhitelistCache, WhitelistState};
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower::Service;

/// Decision for one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BlockResponse {
    /// Hit count reached or passed the rule's threshold.
    pub blocked: bool,
    /// How long the caller should wait before answering.
    #[cfg_attr(feature = "serde", serde(rename = "delay_ms", serialize_with = "as_millis"))]
    pub delay: Duration,
    /// Hits in the current window, including this one. Zero for whitelisted addresses.
    pub count: u64,
}

impl BlockResponse {
    /// Response for an address that is exempt from counting.
    pub fn exempt() -> Self {
        Self { blocked: false, delay: Duration::ZERO, count: 0 }
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(feature = "serde")]
fn as_millis<S: serde::Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(millis(*delay))
}

/// Snapshot of tracked addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BlockStatus {
    /// Addresses with a live counter.
    pub count: usize,
    /// Of those, how many are at or past the threshold.
    pub blocked: usize,
}

/// Per-address throttling engine.
///
/// Rule and store may be supplied ready-made or deferred (see [`Loadable`]); both are resolved once
/// on first use. The store is initialized on first use as well, at which point the engine starts
/// listening for counter expiries.
///
/// Read-increment-write on one address is not atomic: two concurrent hits may both read the same
/// count. Distinct addresses never interact.
pub struct IpBlocker<D = StoreAdapter<MemoryCounterStore>> {
    rule: LazyValue<BlockRule>,
    whitelist: WhitelistCache,
    store: LazyValue<D>,
    initialized: AtomicBool,
    init_gate: tokio::sync::Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
    subscribers: Arc<SubscriberRegistry>,
}

impl IpBlocker {
    /// Engine backed by a fresh [`MemoryCounterStore`].
    pub fn in_memory(rule: BlockRule) -> Self {
        Self::new(rule, StoreAdapter::new(MemoryCounterStore::new()))
    }
}

impl<D: BlockStore> IpBlocker<D> {
    pub fn new(rule: BlockRule, store: D) -> Self {
        Self::from_loadable(Loadable::Value(rule), Loadable::Value(store))
    }

    /// Engine whose rule and/or store are produced later.
    pub fn from_loadable(rule: Loadable<BlockRule>, store: Loadable<D>) -> Self {
        Self {
            rule: LazyValue::new(rule),
            whitelist: WhitelistCache::new(),
            store: LazyValue::new(store),
            initialized: AtomicBool::new(false),
            init_gate: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
            subscribers: Arc::new(SubscriberRegistry::new()),
        }
    }

    /// Resolve the store, initialize it and start the expiry listener. Idempotent; every other
    /// operation that touches the store calls it implicitly.
    pub async fn init(&self) -> Result<(), BlockError> {
        self.ready_store().await.map(|_| ())
    }

    /// The resolved rule.
    pub async fn rule(&self) -> Result<Arc<BlockRule>, BlockError> {
        Ok(self.rule.get().await?)
    }

    /// Record one hit from `ip` and decide.
    ///
    /// Whitelisted addresses are never counted and get [`BlockResponse::exempt`]. When this hit is
    /// the one that crosses the threshold, subscribers are notified and awaited before the call
    /// returns.
    pub async fn check_address(&self, ip: &str) -> Result<BlockResponse, BlockError> {
        let address = parse_address(ip)?;
        self.check_ip(address).await
    }

    /// [`check_address`](Self::check_address) for an already parsed address.
    pub async fn check_ip(&self, address: IpAddr) -> Result<BlockResponse, BlockError> {
        let rule = self.rule().await?;
        if self.whitelist.contains(&rule, &address)? {
            tracing::debug!(address = %address, "whitelisted address skipped");
            return Ok(BlockResponse::exempt());
        }

        let store = self.ready_store().await?;
        let count = store.get_count(address).await?.saturating_add(1);
        let blocked = rule.is_blocked(count);
        store.set_count(address, count, rule.duration()).await?;
        let delay = rule.delay_for(count);
        tracing::debug!(address = %address, count, blocked, delay_ms = millis(delay), "hit");

        if blocked && !rule.is_blocked(count - 1) {
            tracing::info!(address = %address, count, "address blocked");
            self.subscribers.emit(BlockEvent::blocked(address)).await;
        }
        Ok(BlockResponse { blocked, delay, count })
    }

    /// Force `ip` into the blocked state for one window. Emits no event.
    pub async fn block_ip(&self, ip: &str) -> Result<(), BlockError> {
        let address = parse_address(ip)?;
        let rule = self.rule().await?;
        if self.whitelist.contains(&rule, &address)? {
            return Err(PolicyError::Whitelisted(address).into());
        }
        let store = self.ready_store().await?;
        store.set_count(address, rule.count(), rule.duration()).await?;
        tracing::info!(address = %address, count = rule.count(), "address blocked manually");
        Ok(())
    }

    /// Forget `ip`'s counter; `true` if one existed. Emits no event.
    pub async fn clear_address(&self, ip: &str) -> Result<bool, BlockError> {
        let address = parse_address(ip)?;
        let store = self.ready_store().await?;
        let removed = store.remove(address).await?;
        if removed {
            tracing::info!(address = %address, "address cleared");
        }
        Ok(removed)
    }

    /// Count tracked and blocked addresses.
    pub async fn status(&self) -> Result<BlockStatus, BlockError> {
        let rule = self.rule().await?;
        let store = self.ready_store().await?;
        let entries = store.entries().await?;
        Ok(BlockStatus {
            count: entries.len(),
            blocked: entries.iter().filter(|(_, hits)| rule.is_blocked(*hits)).count(),
        })
    }

    /// Whether `ip` falls inside any whitelisted network.
    pub async fn is_whitelisted(&self, ip: &str) -> Result<bool, BlockError> {
        let address = parse_address(ip)?;
        let rule = self.rule().await?;
        Ok(self.whitelist.contains(&rule, &address)?)
    }

    /// Current whitelist cache.
    pub fn whitelist_state(&self) -> Arc<WhitelistState> {
        self.whitelist.snapshot()
    }

    /// Register an async callback for `(address, blocked_now)` transitions.
    pub fn subscribe<F, Fut>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(IpAddr, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Register a tower service that receives each [`BlockEvent`].
    pub fn subscribe_sink<S>(&self, sink: S) -> SubscriptionId
    where
        S: Service<BlockEvent, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.subscribers.subscribe_sink(sink)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stop listening for expiries and unload the store.
    ///
    /// A store that was never resolved is left untouched. The engine can be used again afterwards;
    /// the next operation re-initializes the store.
    pub async fn destroy(&self) -> Result<(), BlockError> {
        let _gate = self.init_gate.lock().await;
        self.stop_listener();
        self.initialized.store(false, Ordering::Release);
        if let Some(store) = self.store.peek() {
            store.unload().await?;
        }
        tracing::info!("ip blocker destroyed");
        Ok(())
    }

    async fn ready_store(&self) -> Result<Arc<D>, BlockError> {
        let store = self.store.get().await?;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(store);
        }
        // Callers arriving during init wait here until the store is ready.
        let _gate = self.init_gate.lock().await;
        if !self.initialized.load(Ordering::Acquire) {
            // Subscribe first so nothing reaped during init is missed.
            let expired = store.expired_events();
            store.init().await?;
            self.start_listener(expired);
            self.initialized.store(true, Ordering::Release);
        }
        Ok(store)
    }

    fn start_listener(&self, mut expired: tokio::sync::broadcast::Receiver<IpAddr>) {
        let subscribers = Arc::clone(&self.subscribers);
        let task = tokio::spawn(async move {
            loop {
                match expired.recv().await {
                    Ok(address) => {
                        tracing::info!(address = %address, "address unblocked");
                        subscribers.emit(BlockEvent::unblocked(address)).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "expiry events lost; unblock notifications skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        let previous = self.listener.lock().unwrap_or_else(PoisonError::into_inner).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_listener(&self) {
        if let Some(task) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl<D> Drop for IpBlocker<D> {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl<D> std::fmt::Debug for IpBlocker<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpBlocker")
            .field("rule", &self.rule.peek())
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
