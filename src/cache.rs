use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

/// Position in a cache's invalidation order. Take one with [`TtlCache::ticket`]
/// before loading a value from storage and hand it to
/// [`TtlCache::insert_if_fresh`] with the loaded value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

struct Cached<V> {
    value: V,
    inserted_at: Instant,
}

struct Slot<V> {
    value: Option<Cached<V>>,
    /// Stamp of the latest invalidation of this key, 0 if never invalidated.
    invalidated_at: u64,
}

/// Concurrent map whose entries expire after a fixed time-to-live.
///
/// Invalidations are stamped from a monotonic counter and remembered per key,
/// so a value loaded before an invalidation is refused instead of cached.
/// Removing a slot (lazily on lookup or in bulk by [`TtlCache::purge_expired`])
/// raises a floor below which tickets are refused, so forgetting a stamp never
/// lets a stale value back in.
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Slot<V>>,
    ttl: Duration,
    stamps: AtomicU64,
    floor: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            stamps: AtomicU64::new(0),
            floor: AtomicU64::new(0),
        }
    }

    pub fn ticket(&self) -> Ticket {
        Ticket(self.stamps.load(Ordering::SeqCst))
    }

    pub fn get(&self, key: &K) -> Option<V> {
        {
            let slot = self.entries.get(key)?;
            match &slot.value {
                Some(cached) if cached.inserted_at.elapsed() < self.ttl => {
                    return Some(cached.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }
        // shard guard released above; re-check in case a fresh value raced in
        self.raise_floor();
        self.entries.remove_if(key, |_, slot| self.is_expired(slot));
        None
    }

    /// Caches `value` unless `key` was invalidated after `ticket` was taken.
    /// Returns whether the value was stored.
    pub fn insert_if_fresh(&self, key: K, value: V, ticket: Ticket) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let cached = Cached {
            value,
            inserted_at: Instant::now(),
        };
        // the floor is read under the shard lock so a concurrent removal is ordered with it
        match self.entries.entry(key) {
            MapEntry::Occupied(mut slot) => {
                if ticket.0 < self.floor.load(Ordering::SeqCst)
                    || slot.get().invalidated_at > ticket.0
                {
                    return false;
                }
                slot.get_mut().value = Some(cached);
            }
            MapEntry::Vacant(slot) => {
                if ticket.0 < self.floor.load(Ordering::SeqCst) {
                    return false;
                }
                slot.insert(Slot {
                    value: Some(cached),
                    invalidated_at: 0,
                });
            }
        }
        true
    }

    pub fn invalidate(&self, key: &K) {
        let stamp = self.stamps.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries
            .entry(key.clone())
            .and_modify(|slot| {
                slot.value = None;
                slot.invalidated_at = stamp;
            })
            .or_insert(Slot {
                value: None,
                invalidated_at: stamp,
            });
    }

    /// Drops expired values and settled invalidation markers. Returns how
    /// many slots were removed.
    pub fn purge_expired(&self) -> usize {
        let floor = self.raise_floor();
        let before = self.entries.len();
        self.entries.retain(|_, slot| match &slot.value {
            Some(cached) => cached.inserted_at.elapsed() < self.ttl,
            None => slot.invalidated_at > floor,
        });
        before.saturating_sub(self.entries.len())
    }

    fn is_expired(&self, slot: &Slot<V>) -> bool {
        slot.value
            .as_ref()
            .is_some_and(|cached| cached.inserted_at.elapsed() >= self.ttl)
    }

    /// Refuses every ticket taken before now; called before any slot is removed.
    fn raise_floor(&self) -> u64 {
        let now = self.stamps.load(Ordering::SeqCst);
        self.floor.fetch_max(now, Ordering::SeqCst).max(now)
    }
}

/// Handle through which a maintenance task drops expired entries of any cache.
pub trait ExpiringCache: Send + Sync {
    fn purge_expired(&self) -> usize;
}

impl<K, V> ExpiringCache for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn purge_expired(&self) -> usize {
        TtlCache::purge_expired(self)
    }
}
