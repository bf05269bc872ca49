//! The public map: routes operations to shards under an epoch pin.

use std::hash::{BuildHasher, Hash};

use ahash::RandomState;
use crossbeam_utils::CachePadded;
use lock_api::RawMutex;

use crate::epoch::EpochManager;
use crate::hash::shard_index;
use crate::lock::RawSpinLock;
use crate::shard::Shard;
use crate::stats::Stats;

/// Concurrent sharded Robin Hood hash map.
///
/// Keys are routed by the high bits of their hash to one of `2^SHARD_BITS`
/// shards; the low bits drive the probe sequence inside the shard, so the
/// two never compete for entropy. Reads are mutex-free (per-slot sequence
/// locks with retry); writes serialize on a per-shard lock, `M`, which
/// defaults to the crate's spin lock and accepts any [`lock_api::RawMutex`].
///
/// Values come back as owned clones — `find`-style reads validate a slot
/// snapshot and hand you a self-contained copy, never a reference into the
/// table. There are deliberately no iterators: under concurrent resize an
/// iterator could be safe or cheap, not both.
///
/// # Example
///
/// ```rust
/// use robinmap::RobinMap;
///
/// let map: RobinMap<u32, String> = RobinMap::new();
/// assert!(map.insert(42, "hello".to_string()));
/// assert_eq!(map.get(&42), Some("hello".to_string()));
/// assert!(map.remove(&42));
/// assert_eq!(map.get(&42), None);
/// ```
pub struct RobinMap<K, V, S = RandomState, M = RawSpinLock, const SHARD_BITS: u32 = 6> {
    shards: Box<[CachePadded<Shard<K, V, M>>]>,
    hasher: S,
    // Declared last: shards drop first, then the manager drains what they
    // retired. Boxed so the manager's address — the identity thread entries
    // key on — survives moves of the map value itself.
    epoch: Box<EpochManager>,
}

impl<K, V, const SHARD_BITS: u32> RobinMap<K, V, RandomState, RawSpinLock, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Create an empty map with the default hasher and spin lock.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    /// Create a map pre-sized for `capacity` elements, spread evenly across
    /// the shards.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, const SHARD_BITS: u32> Default for RobinMap<K, V, RandomState, RawSpinLock, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S, M, const SHARD_BITS: u32> RobinMap<K, V, S, M, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
    S: BuildHasher,
    M: RawMutex + Send + Sync,
{
    /// Number of shards (`2^SHARD_BITS`).
    pub const NUM_SHARDS: usize = 1 << SHARD_BITS;

    /// Create an empty map with a custom hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Create a map pre-sized for `capacity` elements with a custom hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        assert!(SHARD_BITS <= 16, "SHARD_BITS must be at most 16");
        let per_shard = capacity.div_ceil(Self::NUM_SHARDS);
        let shards: Vec<CachePadded<Shard<K, V, M>>> = (0..Self::NUM_SHARDS)
            .map(|_| CachePadded::new(Shard::with_capacity(per_shard)))
            .collect();
        Self {
            shards: shards.into_boxed_slice(),
            hasher,
            epoch: Box::new(EpochManager::new()),
        }
    }

    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    fn shard_for(&self, hash: u64) -> &Shard<K, V, M> {
        &self.shards[shard_index(hash, SHARD_BITS)]
    }

    /// Look up a key, returning a copy of its value.
    pub fn get(&self, key: &K) -> Option<V> {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(key);
        self.shard_for(hash).get(hash, key)
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(key);
        self.shard_for(hash).contains(hash, key)
    }

    /// Returns 1 if the key is present, 0 otherwise.
    pub fn count(&self, key: &K) -> usize {
        usize::from(self.contains_key(key))
    }

    /// Insert a key-value pair. Returns true if newly inserted, false if the
    /// key was already present (the stored value is left untouched).
    pub fn insert(&self, key: K, value: V) -> bool {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(&key);
        self.shard_for(hash).insert(hash, key, value, &self.epoch)
    }

    /// Remove a key. Returns true if it was present.
    pub fn remove(&self, key: &K) -> bool {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(key);
        self.shard_for(hash).remove(hash, key, &self.epoch)
    }

    /// Insert or overwrite. Returns true if newly inserted, false if an
    /// existing value was replaced.
    pub fn insert_or_assign(&self, key: K, value: V) -> bool {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(&key);
        self.shard_for(hash)
            .insert_or_assign(hash, key, value, &self.epoch)
    }

    /// Insert the value produced by `factory` if the key is absent. Returns
    /// true if inserted; the factory is not invoked when the key exists.
    pub fn insert_with<F>(&self, key: K, factory: F) -> bool
    where
        F: FnOnce() -> V,
    {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(&key);
        self.shard_for(hash)
            .insert_with(hash, key, factory, &self.epoch)
    }

    /// Return the stored value for `key`, or insert `value` and return a
    /// copy of it.
    pub fn get_or_insert(&self, key: K, value: V) -> V {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(&key);
        self.shard_for(hash)
            .get_or_insert(hash, key, value, &self.epoch)
    }

    /// Return the stored value for `key`, or insert the value produced by
    /// `factory` and return a copy of it. The factory runs exactly once, and
    /// only when the key is absent.
    pub fn get_or_insert_with<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        let _pin = self.epoch.enter();
        let hash = self.hash_key(&key);
        self.shard_for(hash)
            .get_or_insert_with(hash, key, factory, &self.epoch)
    }

    /// Approximate number of entries (sum of relaxed per-shard counters).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// True if the map appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries, resetting every shard to its default capacity.
    pub fn clear(&self) {
        let _pin = self.epoch.enter();
        for shard in self.shards.iter() {
            shard.clear(&self.epoch);
        }
    }

    /// Ensure capacity for at least `capacity` elements, spread evenly
    /// across the shards. Never shrinks.
    pub fn reserve(&self, capacity: usize) {
        let _pin = self.epoch.enter();
        let per_shard = capacity.div_ceil(Self::NUM_SHARDS);
        for shard in self.shards.iter() {
            shard.reserve(per_shard, &self.epoch);
        }
    }

    /// Total slot capacity across all shards.
    pub fn capacity(&self) -> usize {
        let _pin = self.epoch.enter();
        self.shards.iter().map(|shard| shard.capacity()).sum()
    }

    /// Per-shard entry counts. Use for imbalance detection.
    pub fn shard_loads(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.len()).collect()
    }

    /// Snapshot of per-shard sizes, capacities, and operation counters.
    pub fn stats(&self) -> Stats {
        let _pin = self.epoch.enter();
        let shard_sizes: Vec<usize> = self.shards.iter().map(|shard| shard.len()).collect();
        let shard_capacities: Vec<usize> =
            self.shards.iter().map(|shard| shard.capacity()).collect();
        let operations = self.shards.iter().map(|shard| shard.ops()).collect();
        Stats {
            size: shard_sizes.iter().sum(),
            shard_sizes,
            shard_capacities,
            operations,
        }
    }
}
