//! Binds any [`CounterStore`] to the [`BlockStore`] surface the blocker uses.

use super::{BlockStore, CounterStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const EXPIRY_BUFFER: usize = 1024;

/// Lazily initialized adapter over a counter store.
///
/// `init` is idempotent and runs implicitly before every operation. It spawns a task that copies
/// the store's expiry notifications into the adapter's own channel; `unload` aborts that task,
/// resets the init flag and clears the store, so the adapter can be initialized again later.
pub struct StoreAdapter<S> {
    store: Arc<S>,
    initialized: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<IpAddr>,
}

impl<S: CounterStore> StoreAdapter<S> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    /// Share a store that other components also hold.
    pub fn from_arc(store: Arc<S>) -> Self {
        let (events, _) = broadcast::channel(EXPIRY_BUFFER);
        Self { store, initialized: AtomicBool::new(false), forwarder: Mutex::new(None), events }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut expired = self.store.subscribe_expired();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                match expired.recv().await {
                    Ok(address) => {
                        let _ = events.send(address);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "expiry notifications dropped by lagging forwarder");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        let previous = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::debug!("counter store initialized");
    }
}

fn store_err<E>(err: E) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::new(err)
}

#[async_trait]
impl<S: CounterStore> BlockStore for StoreAdapter<S> {
    async fn init(&self) -> Result<(), StoreError> {
        self.ensure_init();
        Ok(())
    }

    async fn get_count(&self, address: IpAddr) -> Result<u64, StoreError> {
        self.ensure_init();
        let count = self.store.get(&address).await.map_err(store_err)?.unwrap_or(0);
        tracing::debug!(address = %address, count, "counter read");
        Ok(count)
    }

    async fn set_count(&self, address: IpAddr, count: u64, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_init();
        tracing::debug!(address = %address, count, ttl_ms = ttl.as_millis(), "counter written");
        self.store.set(address, count, Instant::now() + ttl).await.map_err(store_err)
    }

    async fn remove(&self, address: IpAddr) -> Result<bool, StoreError> {
        self.ensure_init();
        let removed = self.store.delete(&address).await.map_err(store_err)?;
        tracing::debug!(address = %address, removed, "counter removed");
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<(IpAddr, u64)>, StoreError> {
        self.ensure_init();
        let entries = self.store.entries().await.map_err(store_err)?;
        tracing::debug!(live = entries.len(), "counters listed");
        Ok(entries)
    }

    async fn unload(&self) -> Result<(), StoreError> {
        let forwarder = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        self.initialized.store(false, Ordering::Release);
        self.store.clear().await.map_err(store_err)?;
        tracing::debug!("counter store unloaded");
        Ok(())
    }

    fn expired_events(&self) -> broadcast::Receiver<IpAddr> {
        self.events.subscribe()
    }
}

impl<S> Drop for StoreAdapter<S> {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.get_mut().unwrap_or_else(PoisonError::into_inner).take()
        {
            forwarder.abort();
        }
    }
}

impl<S> std::fmt::Debug for StoreAdapter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAdapter")
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn operations_initialize_lazily() {
        let adapter = StoreAdapter::new(MemoryCounterStore::new());
        assert!(!adapter.is_initialized());
        assert_eq!(adapter.get_count(ip("127.0.0.1")).await.unwrap(), 0);
        assert!(adapter.is_initialized());
        adapter.init().await.unwrap();
        adapter.init().await.unwrap();
        assert!(adapter.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn counts_round_trip_and_expire() {
        let adapter = StoreAdapter::new(MemoryCounterStore::new());
        let mut expired = adapter.expired_events();
        let key = ip("192.168.0.9");

        adapter.set_count(key, 4, Duration::from_secs(10)).await.unwrap();
        assert_eq!(adapter.get_count(key).await.unwrap(), 4);
        assert_eq!(adapter.entries().await.unwrap(), vec![(key, 4)]);

        assert_eq!(expired.recv().await.unwrap(), key);
        assert_eq!(adapter.get_count(key).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unload_detaches_and_clears() {
        let adapter = StoreAdapter::new(MemoryCounterStore::new());
        let mut expired = adapter.expired_events();
        adapter.set_count(ip("10.0.0.1"), 1, Duration::from_secs(1)).await.unwrap();
        assert!(adapter.remove(ip("10.0.0.1")).await.unwrap());
        adapter.set_count(ip("10.0.0.2"), 1, Duration::from_secs(1)).await.unwrap();

        adapter.unload().await.unwrap();
        assert!(!adapter.is_initialized());
        assert!(adapter.store().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reinit_after_unload_forwards_again() {
        let adapter = StoreAdapter::new(MemoryCounterStore::new());
        let mut expired = adapter.expired_events();
        adapter.init().await.unwrap();
        adapter.unload().await.unwrap();

        adapter.set_count(ip("::1"), 1, Duration::from_secs(3)).await.unwrap();
        assert_eq!(expired.recv().await.unwrap(), ip("::1"));
    }
}
