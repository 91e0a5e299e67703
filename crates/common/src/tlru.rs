//! Time-bounded LRU cache: every entry carries its own expiry deadline, and
//! reads push the deadline out again.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::RwLock, time::Instant};

struct Entry<V> {
    value: V,
    /// Stamped on every set/get; a sweeper removes the entry only when the
    /// map still holds the generation it was armed with.
    generation: AtomicU64,
}

struct Inner<V> {
    items: RwLock<HashMap<String, Entry<V>>>,
    generations: AtomicU64,
}

/// Keyed store with a per-entry timer. `set` replaces the entry and cancels
/// its pending expiry; `get` extends the remaining lifetime to the given TTL.
/// Eviction is purely time-based, never size-based.
pub struct Tlru<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Tlru<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for Tlru<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Tlru<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Insert or replace `key`. Any pending expiry for the old entry is
    /// cancelled by the generation change.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let armed = self.bump();
        {
            let mut items = self.inner.items.write().await;
            items.insert(key.clone(), Entry {
                value,
                generation: AtomicU64::new(armed),
            });
        }
        self.arm_sweeper(key, armed, ttl);
    }

    /// Fetch `key`, extending its remaining lifetime to `ttl` when present.
    pub async fn get(&self, key: &str, ttl: Duration) -> Option<V> {
        let (value, armed) = {
            let items = self.inner.items.read().await;
            let entry = items.get(key)?;
            // Stamping under the read lock is fine: sweepers re-check the
            // live generation under the write lock before removing anything.
            let armed = self.bump();
            entry.generation.store(armed, Ordering::Release);
            (entry.value.clone(), armed)
        };
        self.arm_sweeper(key.to_owned(), armed, ttl);
        Some(value)
    }

    /// Drop `key` immediately.
    pub async fn remove(&self, key: &str) {
        self.inner.items.write().await.remove(key);
    }

    fn bump(&self) -> u64 {
        self.inner
            .generations
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    fn arm_sweeper(&self, key: String, armed: u64, ttl: Duration) {
        let inner = Arc::clone(&self.inner);
        let deadline = Instant::now() + ttl;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut items = inner.items.write().await;
            let expired = items
                .get(&key)
                .is_some_and(|e| e.generation.load(Ordering::Acquire) == armed);
            if expired {
                items.remove(&key);
            }
        });
    }
}
