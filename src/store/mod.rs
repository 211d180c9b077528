//! Counter storage.
//!
//! Two layers:
//! - [`CounterStore`]: a generic expiring key/value store with an expiry channel. Implement it
//!   for Redis, a shared cache, or use [`MemoryCounterStore`].
//! - [`BlockStore`]: exactly what [`IpBlocker`](crate::IpBlocker) needs. [`StoreAdapter`]
//!   provides it for any `CounterStore`, adding lazy init and expiry forwarding.

use crate::error::StoreError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub mod adapter;
pub mod memory;

pub use adapter::StoreAdapter;
pub use memory::MemoryCounterStore;

/// Expiring per-address counters.
///
/// Entries carry an absolute expiry. When the store reaps an entry on its own it must publish the
/// key on the channel returned by [`subscribe_expired`](CounterStore::subscribe_expired);
/// explicit `delete`/`clear` do not publish. Delivery is best effort with no replay.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Current count, or `None` if absent or expired.
    async fn get(&self, key: &IpAddr) -> Result<Option<u64>, Self::Error>;

    /// Store `count` until `expires_at`, replacing any previous entry and its expiry.
    async fn set(&self, key: IpAddr, count: u64, expires_at: Instant) -> Result<(), Self::Error>;

    /// Remove an entry; `true` if one was live.
    async fn delete(&self, key: &IpAddr) -> Result<bool, Self::Error>;

    /// Snapshot of live entries.
    async fn entries(&self) -> Result<Vec<(IpAddr, u64)>, Self::Error>;

    /// Drop every entry.
    async fn clear(&self) -> Result<(), Self::Error>;

    /// New receiver for keys reaped at expiry.
    fn subscribe_expired(&self) -> broadcast::Receiver<IpAddr>;
}

/// Storage operations required by the blocker.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// One-time setup; must be idempotent.
    async fn init(&self) -> Result<(), StoreError>;

    /// Hit count for `address`, 0 if untracked.
    async fn get_count(&self, address: IpAddr) -> Result<u64, StoreError>;

    /// Persist `count`, expiring `ttl` from now.
    async fn set_count(&self, address: IpAddr, count: u64, ttl: Duration) -> Result<(), StoreError>;

    /// Forget `address`; `true` if it was tracked.
    async fn remove(&self, address: IpAddr) -> Result<bool, StoreError>;

    /// Snapshot of tracked addresses and counts.
    async fn entries(&self) -> Result<Vec<(IpAddr, u64)>, StoreError>;

    /// Stop forwarding expiry events and discard all state.
    async fn unload(&self) -> Result<(), StoreError>;

    /// Receiver for addresses whose counters expired naturally.
    fn expired_events(&self) -> broadcast::Receiver<IpAddr>;
}
