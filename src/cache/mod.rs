//! Bounded, open-addressed, random-eviction cache (C1).
//!
//! This is the hot-path lookup structure shared by the secrets store and
//! the capabilities store. It intentionally does not do Robin-Hood-style
//! bookkeeping: each primary bucket remembers only the single longest
//! probe distance of any key that ever hashed there, which is enough to
//! bound lookups without per-slot displacement counters.
//!
//! The cache holds no lock of its own. Callers that share a cache across
//! threads (C4, C5) wrap every call with their own mutex and release it
//! across any DB work, so a racing reader may briefly see an absent entry
//! that is concurrently being repopulated; `add_or_update` is idempotent
//! so this is harmless.

mod fnv;
mod rng;

use fnv::fnv1a_hash;
use rng::Xoshiro256PlusPlus;
use std::fmt::Debug;

/// Extracted from table size calculation: a minimum load headroom so the
/// cache rarely has to walk more than a couple of slots.
const RESERVATION_MARGIN: f64 = 1.25;

/// Anything stored in the cache must be identifiable by a stable, hashable
/// id of fixed byte width. `T::Id` doubles as the cache's lookup key.
pub trait CacheEntry {
    /// Stable identifier type. Must be representable as raw bytes for FNV
    /// hashing; `to_le_bytes`-style encodings are expected.
    type Id: Copy + Eq + Debug;

    /// The id that this value is stored and looked up under.
    fn cache_id(&self) -> Self::Id;
}

/// Byte-encode an id for hashing. Implemented for the fixed-width integer
/// ids used by every store in this crate (`u32` customer ids).
pub trait IdBytes {
    /// Little-endian byte representation used by the FNV hash.
    fn id_bytes(&self) -> Vec<u8>;
}

impl IdBytes for u32 {
    fn id_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl IdBytes for u64 {
    fn id_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

struct Slot<T> {
    value: Option<T>,
    max_distance: usize,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            value: None,
            max_distance: 0,
        }
    }
}

/// A bounded, open-addressed cache from `T::Id` to `T`.
pub struct Cache<T: CacheEntry> {
    table: Vec<Slot<T>>,
    max_depth: usize,
    count: usize,
    rng: Xoshiro256PlusPlus,
}

impl<T: CacheEntry> Cache<T>
where
    T::Id: IdBytes,
{
    /// Construct a cache that holds at most `max_depth` live entries. The
    /// backing table is sized to the next prime at or above
    /// `max_depth * 1.25` so that random eviction rarely needs more than
    /// one draw.
    pub fn new(max_depth: usize) -> Self {
        let table_size = table_size_for(max_depth);
        Self {
            table: (0..table_size).map(|_| Slot::empty()).collect(),
            max_depth: max_depth.max(1),
            count: 0,
            rng: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn initial_hash_index(&self, id: &T::Id) -> usize {
        let hash = fnv1a_hash(&id.id_bytes());
        (hash % self.table.len() as u64) as usize
    }

    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.table.len()
    }

    /// Locate the slot holding `id`, if any, scanning at most
    /// `max_distance` slots from the initial hash bucket.
    fn locate(&self, id: T::Id, initial: usize) -> Option<usize> {
        let budget = self.table[initial].max_distance;
        let mut index = initial;
        for _ in 0..=budget {
            if let Some(value) = &self.table[index].value {
                if value.cache_id() == id {
                    return Some(index);
                }
            }
            index = self.next_index(index);
        }
        None
    }

    /// Fetch a value by id.
    pub fn get(&self, id: T::Id) -> Option<&T> {
        let initial = self.initial_hash_index(&id);
        self.locate(id, initial).and_then(|i| self.table[i].value.as_ref())
    }

    /// Insert a value, or overwrite the existing entry with the same id in
    /// place (no distance bookkeeping change on overwrite). If the cache is
    /// at capacity, a random occupied slot is evicted first to guarantee
    /// room for the new entry.
    pub fn add_or_update(&mut self, value: T) {
        let id = value.cache_id();
        let initial = self.initial_hash_index(&id);

        if let Some(existing) = self.locate(id, initial) {
            self.table[existing].value = Some(value);
            return;
        }

        if self.count >= self.max_depth {
            self.perform_random_eviction();
        }

        let mut index = initial;
        let mut distance = 0usize;
        loop {
            if self.table[index].value.is_none() {
                break;
            }
            index = self.next_index(index);
            distance += 1;
        }

        self.table[index].value = Some(value);
        self.count += 1;

        if distance > self.table[initial].max_distance {
            self.table[initial].max_distance = distance;
        }
    }

    /// Evict an entry by id. Returns `false` if the id was not present.
    pub fn evict(&mut self, id: T::Id) -> bool {
        let initial = self.initial_hash_index(&id);
        let budget = self.table[initial].max_distance;

        let mut index = initial;
        let mut found_at: Option<usize> = None;
        let mut found_distance = 0usize;
        let mut other_max_distance = 0usize;

        for distance in 0..=budget {
            if let Some(value) = &self.table[index].value {
                if value.cache_id() == id {
                    found_at = Some(index);
                    found_distance = distance;
                } else if self.initial_hash_index(&value.cache_id()) == initial {
                    other_max_distance = other_max_distance.max(distance);
                }
            }
            index = self.next_index(index);
        }

        match found_at {
            Some(slot) => {
                self.table[slot].value = None;
                self.count -= 1;
                if found_distance == self.table[initial].max_distance {
                    self.table[initial].max_distance = other_max_distance;
                }
                true
            }
            None => false,
        }
    }

    fn perform_random_eviction(&mut self) {
        let table_len = self.table.len() as u64;
        loop {
            let candidate = (self.rng.next_u64() % table_len) as usize;
            if let Some(value) = &self.table[candidate].value {
                let id = value.cache_id();
                self.evict(id);
                return;
            }
        }
    }

    /// Reallocate the backing table at a new depth, dropping every entry.
    /// There is no rehash: the cache is simply empty and usable again
    /// afterward.
    pub fn resize(&mut self, new_depth: usize) {
        let table_size = table_size_for(new_depth);
        self.table = (0..table_size).map(|_| Slot::empty()).collect();
        self.max_depth = new_depth.max(1);
        self.count = 0;
    }
}

fn table_size_for(requested: usize) -> usize {
    let minimum = ((requested.max(1) as f64) * RESERVATION_MARGIN).ceil() as u64;
    next_prime(minimum.max(2))
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= n {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

fn next_prime(mut n: u64) -> u64 {
    if n <= 2 {
        return 2;
    }
    if n % 2 == 0 {
        n += 1;
    }
    while !is_prime(n) {
        n += 2;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Entry {
        id: u32,
        payload: u64,
    }

    impl CacheEntry for Entry {
        type Id = u32;
        fn cache_id(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn table_size_is_prime_and_above_margin() {
        let size = table_size_for(16);
        assert!(is_prime(size));
        assert!(size as f64 >= 16.0 * RESERVATION_MARGIN);
    }

    #[test]
    fn get_after_add_returns_the_value() {
        let mut cache: Cache<Entry> = Cache::new(16);
        cache.add_or_update(Entry { id: 5, payload: 99 });
        assert_eq!(cache.get(5), Some(&Entry { id: 5, payload: 99 }));
    }

    #[test]
    fn evict_removes_the_entry() {
        let mut cache: Cache<Entry> = Cache::new(16);
        cache.add_or_update(Entry { id: 5, payload: 99 });
        assert!(cache.evict(5));
        assert_eq!(cache.get(5), None);
        assert!(!cache.evict(5));
    }

    #[test]
    fn count_never_exceeds_max_depth() {
        let mut cache: Cache<Entry> = Cache::new(16);
        for id in 1..=200u32 {
            cache.add_or_update(Entry { id, payload: id as u64 });
            assert!(cache.len() <= 16);
        }
    }

    #[test]
    fn overwrite_in_place_does_not_change_count() {
        let mut cache: Cache<Entry> = Cache::new(16);
        cache.add_or_update(Entry { id: 5, payload: 1 });
        cache.add_or_update(Entry { id: 5, payload: 2 });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(5), Some(&Entry { id: 5, payload: 2 }));
    }

    #[test]
    fn resize_empties_and_remains_usable() {
        let mut cache: Cache<Entry> = Cache::new(16);
        cache.add_or_update(Entry { id: 5, payload: 1 });
        cache.resize(4);
        assert_eq!(cache.len(), 0);
        cache.add_or_update(Entry { id: 9, payload: 2 });
        assert_eq!(cache.get(9), Some(&Entry { id: 9, payload: 2 }));
    }
}
