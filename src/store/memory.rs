//! In-process expiring counter store.

use super::CounterStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DEFAULT_EXPIRY_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
    count: u64,
    expires_at: Instant,
    generation: u64,
    reaper: JoinHandle<()>,
}

#[derive(Debug)]
struct Inner {
    entries: Mutex<HashMap<IpAddr, Entry>>,
    next_generation: Mutex<u64>,
    expired: broadcast::Sender<IpAddr>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<IpAddr, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `key` only if it still belongs to the writer that scheduled this reaper.
    fn reap(&self, key: IpAddr, generation: u64) {
        let reaped = {
            let mut entries = self.entries();
            match entries.get(&key) {
                Some(entry) if entry.generation == generation => entries.remove(&key).is_some(),
                _ => false,
            }
        };
        if reaped {
            self.publish_expired(key);
        }
    }

    fn publish_expired(&self, key: IpAddr) {
        tracing::trace!(address = %key, "counter expired");
        // No receivers is fine.
        let _ = self.expired.send(key);
    }
}

/// Counter store backed by a `HashMap`, with one reaper task per live entry.
///
/// Every `set` replaces the entry's reaper, so a key expires `ttl` after its *last* write.
/// Reaped keys are published on a broadcast channel; slow receivers may observe
/// `RecvError::Lagged` once `capacity` events are buffered.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone, Debug)]
pub struct MemoryCounterStore {
    inner: Arc<Inner>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EXPIRY_CAPACITY)
    }

    /// Store whose expiry channel buffers up to `capacity` events per receiver.
    pub fn with_capacity(capacity: usize) -> Self {
        let (expired, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                expired,
            }),
        }
    }

    /// Number of entries not yet reaped.
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_generation(&self) -> u64 {
        let mut next = self.inner.next_generation.lock().unwrap_or_else(PoisonError::into_inner);
        *next = next.wrapping_add(1);
        *next
    }

    fn spawn_reaper(&self, key: IpAddr, generation: u64, expires_at: Instant) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                inner.reap(key, generation);
            }
        })
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, entry) in self.entries.get_mut().unwrap_or_else(PoisonError::into_inner).drain() {
            entry.reaper.abort();
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    type Error = Infallible;

    async fn get(&self, key: &IpAddr) -> Result<Option<u64>, Self::Error> {
        let now = Instant::now();
        Ok(self
            .inner
            .entries()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.count))
    }

    async fn set(&self, key: IpAddr, count: u64, expires_at: Instant) -> Result<(), Self::Error> {
        let now = Instant::now();
        let generation = self.next_generation();
        let previous = {
            // Reaper cannot observe the map before the new entry is in place.
            let mut entries = self.inner.entries();
            let reaper = self.spawn_reaper(key, generation, expires_at);
            entries.insert(key, Entry { count, expires_at, generation, reaper })
        };
        if let Some(previous) = previous {
            previous.reaper.abort();
            // Lapsed but not yet reaped: its expiry is still owed.
            if previous.expires_at <= now {
                self.inner.publish_expired(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &IpAddr) -> Result<bool, Self::Error> {
        let now = Instant::now();
        let removed = self.inner.entries().remove(key);
        match removed {
            Some(entry) => {
                entry.reaper.abort();
                let live = entry.expires_at > now;
                if !live {
                    self.inner.publish_expired(*key);
                }
                Ok(live)
            }
            None => Ok(false),
        }
    }

    async fn entries(&self) -> Result<Vec<(IpAddr, u64)>, Self::Error> {
        let now = Instant::now();
        Ok(self
            .inner
            .entries()
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| (*key, entry.count))
            .collect())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let drained: Vec<Entry> = self.inner.entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.reaper.abort();
        }
        Ok(())
    }

    fn subscribe_expired(&self) -> broadcast::Receiver<IpAddr> {
        self.inner.expired.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn get_set_delete() {
        let store = MemoryCounterStore::new();
        let key = ip("127.0.0.1");
        assert_eq!(store.get(&key).await.unwrap(), None);

        store.set(key, 3, Instant::now() + Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(3));
        assert_eq!(store.entries().await.unwrap(), vec![(key, 3)]);

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_publishes_key() {
        let store = MemoryCounterStore::new();
        let mut expired = store.subscribe_expired();
        let key = ip("10.0.0.1");
        store.set(key, 1, Instant::now() + Duration::from_secs(5)).await.unwrap();

        let reaped = tokio::time::timeout(Duration::from_secs(6), expired.recv()).await;
        assert_eq!(reaped.unwrap().unwrap(), key);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_pushes_expiry_out() {
        let store = MemoryCounterStore::new();
        let mut expired = store.subscribe_expired();
        let key = ip("::1");
        store.set(key, 1, Instant::now() + Duration::from_secs(5)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        store.set(key, 2, Instant::now() + Duration::from_secs(5)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.get(&key).await.unwrap(), Some(2));
        assert!(expired.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(expired.recv().await.unwrap(), key);
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_removal_is_silent() {
        let store = MemoryCounterStore::new();
        let mut expired = store.subscribe_expired();
        store.set(ip("10.0.0.1"), 1, Instant::now() + Duration::from_secs(1)).await.unwrap();
        store.set(ip("10.0.0.2"), 1, Instant::now() + Duration::from_secs(1)).await.unwrap();
        store.delete(&ip("10.0.0.1")).await.unwrap();
        store.clear().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(expired.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        assert!(store.is_empty());
    }
    #[tokio::test(start_paused = true)]
    async fn overwriting_a_lapsed_entry_publishes_its_expiry() {
        let store = MemoryCounterStore::new();
        let mut expired = store.subscribe_expired();
        let key = ip("10.0.0.3");

        // Deadline already passed; the reaper has not been polled yet.
        store.set(key, 2, Instant::now()).await.unwrap();
        store.set(key, 1, Instant::now() + Duration::from_secs(5)).await.unwrap();
        assert_eq!(expired.try_recv().unwrap(), key);
        assert_eq!(store.get(&key).await.unwrap(), Some(1));

        // The replaced reaper stays quiet; only the new deadline fires.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(expired.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(expired.try_recv().unwrap(), key);
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_lapsed_entry_publishes_its_expiry() {
        let store = MemoryCounterStore::new();
        let mut expired = store.subscribe_expired();
        let key = ip("10.0.0.4");

        store.set(key, 1, Instant::now()).await.unwrap();
        assert!(!store.delete(&key).await.unwrap());
        assert_eq!(expired.try_recv().unwrap(), key);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(expired.try_recv().is_err());
        assert!(store.is_empty());
    }
}
