//! Process-local key/value map with proactive per-key expiry.
//!
//! Each entry with a TTL owns a timer task that removes it when the TTL runs
//! out. Dropping an entry (overwrite, delete, clear) aborts its timer, and a
//! timer only ever removes the exact entry it was scheduled for, so a stale
//! timer can never evict a newer value for the same key.
//!
//! Values read from somewhere slower go in through a [`Reservation`] taken
//! before the read: any `set`, `remove`, `remove_prefix` or `clear` touching
//! the key in between voids it, and the late value is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ttl::Ttl;

struct Slot<V> {
    value: V,
    expires_at: Option<Instant>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl<V> Slot<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

impl<V> Drop for Slot<V> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// TTL-aware map shared by clones of the same store.
///
/// Setting an entry with a TTL spawns a timer task, so it must happen inside
/// a Tokio runtime.
pub struct TtlStore<V> {
    entries: Arc<DashMap<String, Slot<V>>>,
    reservations: Arc<DashMap<String, u64>>,
    generation: Arc<AtomicU64>,
}

impl<V> Clone for TtlStore<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            reservations: Arc::clone(&self.reservations),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<V> Default for TtlStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TtlStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            reservations: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current value for `key`. Never evicts; an entry whose deadline passed
    /// but whose timer has not fired yet is reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|slot| slot.is_live(now))
    }

    /// Store `value`, replacing the entry and cancelling its pending expiry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Ttl) {
        let key = key.into();
        self.reservations.remove(&key);
        let slot = self.slot(&key, value, ttl);
        // The replaced slot, if any, is dropped here and aborts its timer.
        self.entries.insert(key, slot);
    }

    /// Claim `key` for a value that is about to be fetched. The claim holds
    /// until the key is written, removed or cleared, or a newer claim is taken.
    pub fn reserve(&self, key: impl Into<String>) -> Reservation<V> {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.reservations.insert(key.clone(), generation);
        Reservation {
            store: self.clone(),
            key,
            generation,
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.reservations.remove(key);
        self.entries.remove(key).map(|(_, slot)| slot.value.clone())
    }

    /// Remove every entry whose key starts with `prefix`. Returns how many went.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        self.reservations.retain(|key, _| !key.starts_with(prefix));
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn clear(&self) {
        self.reservations.clear();
        self.entries.clear();
    }

    /// Number of stored entries (live or awaiting their eviction timer).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(&self, key: &str, value: V, ttl: Ttl) -> Slot<V> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (expires_at, timer) = match ttl.as_duration() {
            Some(after) => (
                Some(Instant::now() + after),
                Some(self.schedule_eviction(key.to_string(), generation, after)),
            ),
            None => (None, None),
        };
        Slot {
            value,
            expires_at,
            generation,
            timer,
        }
    }

    fn schedule_eviction(&self, key: String, generation: u64, after: Duration) -> JoinHandle<()> {
        let entries: Weak<DashMap<String, Slot<V>>> = Arc::downgrade(&self.entries);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            if let Some((_, mut slot)) =
                entries.remove_if(&key, |_, slot| slot.generation == generation)
            {
                // Already running; nothing to abort.
                slot.timer.take();
                tracing::trace!(key = %key, "cache entry expired");
            }
        })
    }
}

/// Claim on one key of a [`TtlStore`], see [`TtlStore::reserve`].
pub struct Reservation<V>
where
    V: Clone + Send + Sync + 'static,
{
    store: TtlStore<V>,
    key: String,
    generation: u64,
}

impl<V> Reservation<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Store `value` if the claim still holds. Returns whether it was stored.
    pub fn fill(self, value: V, ttl: Ttl) -> bool {
        let store = &self.store;
        // The entry lock is held across the check and the insert, so a write
        // that voids the claim always lands after this value.
        match store.entries.entry(self.key.clone()) {
            Entry::Occupied(mut entry) => {
                if !self.release() {
                    return false;
                }
                entry.insert(store.slot(&self.key, value, ttl));
            }
            Entry::Vacant(entry) => {
                if !self.release() {
                    return false;
                }
                entry.insert(store.slot(&self.key, value, ttl));
            }
        }
        true
    }

    fn release(&self) -> bool {
        self.store
            .reservations
            .remove_if(&self.key, |_, generation| *generation == self.generation)
            .is_some()
    }
}

impl<V> Drop for Reservation<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get_without_ttl() {
        let store = TtlStore::new();
        store.set("a", 1, Ttl::NONE);
        assert_eq!(store.get("a"), Some(1));
        assert!(store.contains("a"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_entry_is_evicted_proactively() {
        let store = TtlStore::new();
        store.set("a", 1, Ttl::from_millis(30));
        assert_eq!(store.get("a"), Some(1));

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Removed by the timer, not by a lookup.
        assert_eq!(store.len(), 0);
        assert_eq!(store.get("a"), None);
    }

    #[tokio::test]
    async fn test_overwrite_cancels_previous_expiry() {
        let store = TtlStore::new();
        store.set("a", 1, Ttl::from_millis(30));
        store.set("a", 2, Ttl::NONE);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("a"), Some(2));
    }

    #[tokio::test]
    async fn test_old_timer_never_removes_newer_entry() {
        let store = TtlStore::new();
        store.set("a", 1, Ttl::from_millis(20));
        store.set("a", 2, Ttl::from_millis(200));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("a"), Some(2));
    }

    #[tokio::test]
    async fn test_remove_prefix_only_touches_matching_keys() {
        let store = TtlStore::new();
        store.set("ns1:a", 1, Ttl::from_millis(10_000));
        store.set("ns1:b", 2, Ttl::NONE);
        store.set("ns2:a", 3, Ttl::NONE);

        assert_eq!(store.remove_prefix("ns1:"), 2);
        assert_eq!(store.get("ns1:a"), None);
        assert_eq!(store.get("ns2:a"), Some(3));
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let store = TtlStore::new();
        store.set("a", 1, Ttl::from_millis(30));
        store.set("b", 2, Ttl::NONE);
        store.clear();
        assert!(store.is_empty());

        store.set("a", 3, Ttl::NONE);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("a"), Some(3));
    }

    #[tokio::test]
    async fn test_reservation_fills_untouched_key() {
        let store = TtlStore::new();
        let reservation = store.reserve("a");
        assert!(reservation.fill(1, Ttl::NONE));
        assert_eq!(store.get("a"), Some(1));
    }

    #[tokio::test]
    async fn test_write_voids_reservation() {
        let store = TtlStore::new();
        let reservation = store.reserve("a");
        store.set("a", 2, Ttl::NONE);

        assert!(!reservation.fill(1, Ttl::NONE));
        assert_eq!(store.get("a"), Some(2));
    }

    #[tokio::test]
    async fn test_remove_and_prefix_clear_void_reservations() {
        let store = TtlStore::new();
        let removed = store.reserve("ns:a");
        store.remove("ns:a");
        assert!(!removed.fill(1, Ttl::NONE));

        let cleared = store.reserve("ns:b");
        let other = store.reserve("other:b");
        store.remove_prefix("ns:");
        assert!(!cleared.fill(1, Ttl::NONE));
        assert!(other.fill(2, Ttl::NONE));
        assert_eq!(store.get("ns:b"), None);
        assert_eq!(store.get("other:b"), Some(2));
    }

    #[tokio::test]
    async fn test_newer_reservation_wins() {
        let store = TtlStore::new();
        let older = store.reserve("a");
        let newer = store.reserve("a");

        assert!(!older.fill(1, Ttl::NONE));
        assert!(newer.fill(2, Ttl::from_millis(10_000)));
        assert_eq!(store.get("a"), Some(2));
        assert!(store.reservations.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_reservation_is_released() {
        let store: TtlStore<i32> = TtlStore::new();
        drop(store.reserve("a"));
        assert!(store.reservations.is_empty());
    }
}
