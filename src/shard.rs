//! One shard: a Robin Hood open-addressing table with per-slot sequence
//! locks.
//!
//! Writers serialize on the shard's mutex and bracket every slot mutation
//! with sequence-counter increments (odd = write in progress). Readers take
//! no lock at all: they snapshot a slot, re-check its counter, and restart
//! the probe if a writer interfered. Replaced tables are handed to the
//! epoch reclaimer because a reader may still be walking them.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use lock_api::{Mutex, RawMutex};

use crate::epoch::EpochManager;
use crate::lock::RawSpinLock;
use crate::stats::{ShardOps, ShardStats};

pub(crate) const DEFAULT_CAPACITY: usize = 16;

/// Probe-distance ceiling. An insertion walk reaching it aborts and forces
/// a resize, bounding worst-case write latency.
const MAX_DIST: u8 = 128;

const MAX_LOAD_FACTOR: f64 = 0.75;
const SHRINK_LOAD_FACTOR: f64 = 0.15;

/// One bucket.
///
/// `dist` encodes occupancy and displacement in one byte: 0 = empty, 1 = at
/// home position, k = displaced k-1 slots from home. The full hash is cached
/// so resize never re-hashes and probes can reject on a cheap compare before
/// touching the key. `dist == 0` also means `key`/`value` are uninitialized.
struct Slot<K, V> {
    /// Sequence counter: even = stable, odd = writer mid-mutation.
    seq: AtomicU32,
    dist: UnsafeCell<u8>,
    hash: UnsafeCell<u64>,
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
}

impl<K, V> Slot<K, V> {
    fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            dist: UnsafeCell::new(0),
            hash: UnsafeCell::new(0),
            key: UnsafeCell::new(MaybeUninit::uninit()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Mark a writer as active on this slot. Callers hold the shard mutex.
    #[inline]
    fn begin_write(&self) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
    }

    /// Mark the slot stable again.
    #[inline]
    fn end_write(&self) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
    }
}

/// Fixed-size slot array. Immutable in identity: capacity changes allocate a
/// new table and retire this one through the epoch manager.
struct Table<K, V> {
    capacity: usize,
    mask: usize,
    slots: Box<[Slot<K, V>]>,
}

impl<K, V> Table<K, V> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= DEFAULT_CAPACITY);
        let slots: Vec<Slot<K, V>> = (0..capacity).map(|_| Slot::new()).collect();
        Self {
            capacity,
            mask: capacity - 1,
            slots: slots.into_boxed_slice(),
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            // SAFETY: we have exclusive access and `dist != 0` is the
            // single source of truth for slot occupancy.
            unsafe {
                if *slot.dist.get() != 0 {
                    (*slot.key.get()).assume_init_drop();
                    (*slot.value.get()).assume_init_drop();
                }
            }
        }
    }
}

// SAFETY: a table is only mutated under its shard's mutex; cross-thread
// reads go through the seqlock protocol.
unsafe impl<K: Send, V: Send> Send for Table<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Table<K, V> {}

/// State owned by the shard's write mutex. The shrink counter is plain data
/// precisely because the mutex guards every access.
struct WriterState {
    shrink_counter: usize,
}

/// An independently locked sub-table. All writes take the mutex for their
/// whole duration; reads never do.
///
/// Every method requires the caller to hold an epoch pin on the map's
/// manager: the published table may be retired at any moment otherwise.
pub(crate) struct Shard<K, V, M = RawSpinLock> {
    table: AtomicPtr<Table<K, V>>,
    len: AtomicUsize,
    writer: Mutex<M, WriterState>,
    stats: ShardStats,
}

// SAFETY: the raw table pointer is published with release stores and read
// with acquires; slot data is synchronized by the mutex (writers) and the
// seqlock protocol (readers). K/V cross threads both by move and by `&`.
unsafe impl<K: Send + Sync, V: Send + Sync, M: RawMutex + Send> Send for Shard<K, V, M> {}
unsafe impl<K: Send + Sync, V: Send + Sync, M: RawMutex + Sync> Sync for Shard<K, V, M> {}

impl<K, V, M> Drop for Shard<K, V, M> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; the pointer came from `Box::into_raw`.
        unsafe {
            drop(Box::from_raw(self.table.load(Ordering::Relaxed)));
        }
    }
}

impl<K, V, M> Shard<K, V, M>
where
    K: Eq + Clone + Send,
    V: Clone + Send,
    M: RawMutex,
{
    /// Create a shard sized for `hint` elements (at least the default
    /// capacity, respecting the load factor).
    pub(crate) fn with_capacity(hint: usize) -> Self {
        let capacity = Self::capacity_for(hint);
        Self {
            table: AtomicPtr::new(Box::into_raw(Box::new(Table::new(capacity)))),
            len: AtomicUsize::new(0),
            writer: Mutex::new(WriterState { shrink_counter: 0 }),
            stats: ShardStats::new(),
        }
    }

    /// Smallest power-of-two capacity keeping `count` elements at or below
    /// the max load factor, clamped to the default capacity.
    fn capacity_for(count: usize) -> usize {
        let needed = (count as f64 / MAX_LOAD_FACTOR) as usize + 1;
        needed.next_power_of_two().max(DEFAULT_CAPACITY)
    }

    // ------------------------------------------------------------------
    // Lock-free reads
    // ------------------------------------------------------------------

    /// Look up `key`, returning a copy of its value.
    ///
    /// The probe restarts from the top — re-reading the published table
    /// pointer, which a resize may have swapped — whenever a slot's
    /// sequence counter is odd or changes across the snapshot.
    pub(crate) fn get(&self, hash: u64, key: &K) -> Option<V> {
        'restart: loop {
            // SAFETY: the caller's epoch pin keeps the published table (and
            // any table retired after the pin) alive.
            let t = unsafe { &*self.table.load(Ordering::Acquire) };
            let mut pos = (hash as usize) & t.mask;
            let mut expected_dist: u8 = 1;

            loop {
                let slot = &t.slots[pos];
                let seq1 = slot.seq.load(Ordering::Acquire);
                if seq1 & 1 != 0 {
                    continue 'restart; // writer active on this slot
                }

                // SAFETY: racy by design. `dist` and `hash` are plain-old
                // copies; the candidate key/value clones are trusted only
                // after the sequence check below confirms no writer touched
                // the slot since `seq1`.
                let (dist, slot_hash) = unsafe { (*slot.dist.get(), *slot.hash.get()) };
                let candidate = if dist == expected_dist && slot_hash == hash {
                    // SAFETY: an occupied, stable slot holds initialized
                    // key/value; a torn read is discarded by the check below.
                    unsafe {
                        Some((
                            (*slot.key.get()).assume_init_ref().clone(),
                            (*slot.value.get()).assume_init_ref().clone(),
                        ))
                    }
                } else {
                    None
                };

                if slot.seq.load(Ordering::Acquire) != seq1 {
                    continue 'restart; // slot changed under us
                }

                // The snapshot is consistent; decide on it.
                if dist == 0 || dist < expected_dist {
                    // Empty, or Robin Hood ordering proves the key cannot
                    // appear later in the probe sequence.
                    return None;
                }
                if let Some((slot_key, value)) = candidate {
                    if slot_key == *key {
                        self.stats.record_read();
                        return Some(value);
                    }
                }

                pos = (pos + 1) & t.mask;
                expected_dist = match expected_dist.checked_add(1) {
                    Some(d) => d,
                    None => return None, // probe distance exhausted
                };
            }
        }
    }

    pub(crate) fn contains(&self, hash: u64, key: &K) -> bool {
        self.get(hash, key).is_some()
    }

    // ------------------------------------------------------------------
    // Locked writes
    // ------------------------------------------------------------------

    /// Insert; returns false if the key is already present.
    pub(crate) fn insert(&self, hash: u64, key: K, value: V, epoch: &EpochManager) -> bool {
        let mut state = self.writer.lock();
        let t = self.current();
        if Self::find_slot(t, hash, &key).is_some() {
            return false;
        }
        self.insert_fresh(&mut state, hash, key, value, epoch);
        true
    }

    /// Insert or overwrite; returns true if newly inserted.
    pub(crate) fn insert_or_assign(
        &self,
        hash: u64,
        key: K,
        value: V,
        epoch: &EpochManager,
    ) -> bool {
        let mut state = self.writer.lock();
        let t = self.current();
        if let Some(pos) = Self::find_slot(t, hash, &key) {
            let slot = &t.slots[pos];
            // SAFETY: mutex held; the assignment is seq-bracketed so
            // readers discard any overlap.
            unsafe {
                slot.begin_write();
                *(*slot.value.get()).assume_init_mut() = value;
                slot.end_write();
            }
            self.stats.record_write();
            return false;
        }
        self.insert_fresh(&mut state, hash, key, value, epoch);
        true
    }

    /// Insert `factory()` if the key is absent; the factory is not invoked
    /// when the key exists.
    pub(crate) fn insert_with<F>(&self, hash: u64, key: K, factory: F, epoch: &EpochManager) -> bool
    where
        F: FnOnce() -> V,
    {
        let mut state = self.writer.lock();
        let t = self.current();
        if Self::find_slot(t, hash, &key).is_some() {
            return false;
        }
        self.insert_fresh(&mut state, hash, key, factory(), epoch);
        true
    }

    /// Return the stored value, or insert `value` and return a copy of it.
    pub(crate) fn get_or_insert(&self, hash: u64, key: K, value: V, epoch: &EpochManager) -> V {
        let mut state = self.writer.lock();
        let t = self.current();
        if let Some(pos) = Self::find_slot(t, hash, &key) {
            self.stats.record_read();
            // SAFETY: mutex held, slot occupied.
            return unsafe { (*t.slots[pos].value.get()).assume_init_ref().clone() };
        }
        let out = value.clone();
        self.insert_fresh(&mut state, hash, key, value, epoch);
        out
    }

    /// Return the stored value, or insert `factory()` and return a copy of
    /// it. The factory runs exactly once, and only on absence.
    pub(crate) fn get_or_insert_with<F>(
        &self,
        hash: u64,
        key: K,
        factory: F,
        epoch: &EpochManager,
    ) -> V
    where
        F: FnOnce() -> V,
    {
        let mut state = self.writer.lock();
        let t = self.current();
        if let Some(pos) = Self::find_slot(t, hash, &key) {
            self.stats.record_read();
            // SAFETY: mutex held, slot occupied.
            return unsafe { (*t.slots[pos].value.get()).assume_init_ref().clone() };
        }
        let value = factory();
        let out = value.clone();
        self.insert_fresh(&mut state, hash, key, value, epoch);
        out
    }

    /// Remove `key` via backward-shift deletion: pull the displaced chain
    /// one slot back so probe distances stay exact without tombstones.
    pub(crate) fn remove(&self, hash: u64, key: &K, epoch: &EpochManager) -> bool {
        let mut state = self.writer.lock();
        let t = self.current();
        let Some(mut pos) = Self::find_slot(t, hash, key) else {
            return false;
        };

        // `pos` starts as the slot holding the pair to discard; after the
        // first shift it is a moved-out husk that must not be dropped.
        let mut holds_removed = true;
        loop {
            let next_pos = (pos + 1) & t.mask;
            // SAFETY: mutex held; every mutation below is seq-bracketed,
            // and occupancy flags are kept exact so no drop runs twice.
            unsafe {
                let slot = &t.slots[pos];
                let next = &t.slots[next_pos];

                if *next.dist.get() <= 1 {
                    // Next is empty or at home: clear the hole and stop.
                    slot.begin_write();
                    *slot.dist.get() = 0;
                    *slot.hash.get() = 0;
                    if holds_removed {
                        (*slot.key.get()).assume_init_drop();
                        (*slot.value.get()).assume_init_drop();
                    }
                    slot.end_write();
                    break;
                }

                // Shift `next` back into `pos`, one step closer to home.
                slot.begin_write();
                next.begin_write();
                if holds_removed {
                    (*slot.key.get()).assume_init_drop();
                    (*slot.value.get()).assume_init_drop();
                    holds_removed = false;
                }
                (*slot.key.get()).write((*next.key.get()).assume_init_read());
                (*slot.value.get()).write((*next.value.get()).assume_init_read());
                *slot.hash.get() = *next.hash.get();
                *slot.dist.get() = *next.dist.get() - 1;
                next.end_write();
                slot.end_write();
            }
            pos = next_pos;
        }

        self.len.fetch_sub(1, Ordering::Relaxed);
        self.stats.record_remove();
        self.maybe_shrink(&mut state, epoch);
        true
    }

    /// Swap in a fresh default-capacity table and retire the old one.
    pub(crate) fn clear(&self, epoch: &EpochManager) {
        let mut state = self.writer.lock();
        let old = self.table.load(Ordering::Relaxed);
        let fresh = Box::into_raw(Box::new(Table::new(DEFAULT_CAPACITY)));
        self.table.store(fresh, Ordering::Release);
        self.len.store(0, Ordering::Relaxed);
        state.shrink_counter = 0;
        // SAFETY: `old` is no longer reachable from the shard; readers
        // pinned before the swap may still hold it, hence the retire.
        unsafe {
            epoch.retire(Box::from_raw(old));
        }
    }

    /// Grow (never shrink) so that `count` elements fit within the load
    /// factor. No-op if the table is already large enough.
    pub(crate) fn reserve(&self, count: usize, epoch: &EpochManager) {
        let _state = self.writer.lock();
        let needed = Self::capacity_for(count);
        if needed <= self.current().capacity {
            return;
        }
        self.resize(needed, epoch);
    }

    /// Approximate element count (relaxed load).
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Capacity of the published table. Caller must hold an epoch pin.
    pub(crate) fn capacity(&self) -> usize {
        // SAFETY: epoch pin keeps the table alive.
        unsafe { (*self.table.load(Ordering::Acquire)).capacity }
    }

    pub(crate) fn ops(&self) -> ShardOps {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Internals (all under the write mutex)
    // ------------------------------------------------------------------

    /// The published table. Only writers (mutex held) may use the relaxed
    /// load; everything read through it is then mutex-synchronized.
    fn current(&self) -> &Table<K, V> {
        // SAFETY: caller holds the epoch pin (readers) or the mutex
        // (writers); either keeps the table alive.
        unsafe { &*self.table.load(Ordering::Relaxed) }
    }

    /// Probe for `key`. Mutex must be held (plain, unvalidated slot reads).
    fn find_slot(t: &Table<K, V>, hash: u64, key: &K) -> Option<usize> {
        let mut pos = (hash as usize) & t.mask;
        let mut expected_dist: u8 = 1;
        loop {
            let slot = &t.slots[pos];
            // SAFETY: no concurrent writer can exist while we hold the
            // mutex, so the plain reads are stable.
            unsafe {
                let dist = *slot.dist.get();
                if dist == 0 || dist < expected_dist {
                    return None;
                }
                if dist == expected_dist
                    && *slot.hash.get() == hash
                    && (*slot.key.get()).assume_init_ref() == key
                {
                    return Some(pos);
                }
            }
            pos = (pos + 1) & t.mask;
            expected_dist = match expected_dist.checked_add(1) {
                Some(d) => d,
                None => return None,
            };
        }
    }

    /// Insert a key known to be absent, expanding or retrying with a
    /// doubled table as needed. Mutex must be held.
    fn insert_fresh(
        &self,
        state: &mut WriterState,
        hash: u64,
        key: K,
        value: V,
        epoch: &EpochManager,
    ) {
        self.expand_for_insert(epoch);
        let mut carried = (hash, key, value);
        loop {
            let t = self.current();
            match Self::insert_into(t, carried.0, carried.1, carried.2) {
                Ok(()) => break,
                Err(back) => {
                    // The walk hit the probe ceiling; whatever tuple it was
                    // carrying (possibly a displaced resident, not our
                    // argument) goes into the doubled table.
                    carried = back;
                    let doubled = t.capacity * 2;
                    self.resize(doubled, epoch);
                }
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        state.shrink_counter = 0;
        self.stats.record_write();
    }

    /// Robin Hood insertion walk. Does not check for duplicates — callers
    /// do that first. On reaching the probe-distance ceiling the carried
    /// tuple is handed back for a resize-and-retry.
    fn insert_into(t: &Table<K, V>, hash: u64, key: K, value: V) -> Result<(), (u64, K, V)> {
        let mut pos = (hash as usize) & t.mask;
        let mut cur_dist: u8 = 1;
        let mut cur_hash = hash;
        let mut cur_key = key;
        let mut cur_value = value;

        loop {
            let slot = &t.slots[pos];
            // SAFETY: mutex held; mutations are seq-bracketed.
            unsafe {
                let dist = *slot.dist.get();
                if dist == 0 {
                    slot.begin_write();
                    *slot.dist.get() = cur_dist;
                    *slot.hash.get() = cur_hash;
                    (*slot.key.get()).write(cur_key);
                    (*slot.value.get()).write(cur_value);
                    slot.end_write();
                    return Ok(());
                }
                if dist < cur_dist {
                    // Steal from the rich: the carried tuple is poorer
                    // (further from home) than the resident, so they swap.
                    slot.begin_write();
                    std::mem::swap(&mut cur_dist, &mut *slot.dist.get());
                    std::mem::swap(&mut cur_hash, &mut *slot.hash.get());
                    std::mem::swap(&mut cur_key, (*slot.key.get()).assume_init_mut());
                    std::mem::swap(&mut cur_value, (*slot.value.get()).assume_init_mut());
                    slot.end_write();
                }
            }
            pos = (pos + 1) & t.mask;
            cur_dist += 1;
            if cur_dist >= MAX_DIST {
                return Err((cur_hash, cur_key, cur_value));
            }
        }
    }

    /// Robin Hood insertion into a not-yet-published table during resize.
    /// No sequence brackets: no reader can see this table yet.
    fn rehash_insert(t: &Table<K, V>, hash: u64, key: K, value: V) {
        let mut pos = (hash as usize) & t.mask;
        let mut cur_dist: u8 = 1;
        let mut cur_hash = hash;
        let mut cur_key = key;
        let mut cur_value = value;

        loop {
            let slot = &t.slots[pos];
            // SAFETY: exclusive access to the unpublished table.
            unsafe {
                let dist = *slot.dist.get();
                if dist == 0 {
                    *slot.dist.get() = cur_dist;
                    *slot.hash.get() = cur_hash;
                    (*slot.key.get()).write(cur_key);
                    (*slot.value.get()).write(cur_value);
                    return;
                }
                if dist < cur_dist {
                    std::mem::swap(&mut cur_dist, &mut *slot.dist.get());
                    std::mem::swap(&mut cur_hash, &mut *slot.hash.get());
                    std::mem::swap(&mut cur_key, (*slot.key.get()).assume_init_mut());
                    std::mem::swap(&mut cur_value, (*slot.value.get()).assume_init_mut());
                }
            }
            pos = (pos + 1) & t.mask;
            cur_dist = cur_dist.wrapping_add(1);
            debug_assert!(cur_dist != 0, "probe distance overflow during rehash");
        }
    }

    /// Allocate a table of `new_capacity`, move every occupied slot over
    /// (re-using the cached hashes), publish it, retire the old one.
    /// Mutex must be held.
    fn resize(&self, new_capacity: usize, epoch: &EpochManager) {
        let old_ptr = self.table.load(Ordering::Relaxed);
        // SAFETY: mutex held; `old_ptr` stays valid until retired below.
        let old = unsafe { &*old_ptr };
        let new_table = Box::new(Table::new(new_capacity));

        for slot in old.slots.iter() {
            // SAFETY: each source slot is seq-locked across the move-out,
            // so a concurrent reader either restarts or sees it empty;
            // `dist = 0` keeps the old table's drop from double-freeing.
            unsafe {
                if *slot.dist.get() != 0 {
                    slot.begin_write();
                    let hash = *slot.hash.get();
                    let key = (*slot.key.get()).assume_init_read();
                    let value = (*slot.value.get()).assume_init_read();
                    *slot.dist.get() = 0;
                    slot.end_write();
                    Self::rehash_insert(&new_table, hash, key, value);
                }
            }
        }

        self.table.store(Box::into_raw(new_table), Ordering::Release);
        // SAFETY: the old table is unpublished; only readers pinned before
        // the store above can still reach it.
        unsafe {
            epoch.retire(Box::from_raw(old_ptr));
        }
    }

    /// Expand before an insertion if the new element would push the load
    /// factor over the limit. Mutex must be held.
    fn expand_for_insert(&self, epoch: &EpochManager) {
        let t = self.current();
        let len = self.len.load(Ordering::Relaxed);
        if (len + 1) as f64 > t.capacity as f64 * MAX_LOAD_FACTOR {
            self.resize(t.capacity * 2, epoch);
        }
    }

    /// Delayed shrink check after an erase. A single dip below the shrink
    /// load factor is not enough: the counter has to exceed an eighth of
    /// the capacity — sustained, uninterrupted low-load erasing — so
    /// workloads oscillating at the threshold don't thrash between sizes.
    fn maybe_shrink(&self, state: &mut WriterState, epoch: &EpochManager) {
        let t = self.current();
        let len = self.len.load(Ordering::Relaxed);
        let load = len as f64 / t.capacity as f64;

        if load < SHRINK_LOAD_FACTOR && t.capacity > DEFAULT_CAPACITY {
            state.shrink_counter += 1;
            if state.shrink_counter > t.capacity / 8 {
                let halved = (t.capacity / 2).max(DEFAULT_CAPACITY);
                self.resize(halved, epoch);
                state.shrink_counter = 0;
            }
        } else {
            state.shrink_counter = 0;
        }
    }

    /// Walk the table and verify the Robin Hood layout on a quiesced shard.
    #[cfg(test)]
    fn check_invariants(&self) {
        let _state = self.writer.lock();
        let t = self.current();
        let mut occupied = 0usize;

        for (i, slot) in t.slots.iter().enumerate() {
            assert_eq!(slot.seq.load(Ordering::Relaxed) & 1, 0, "slot left odd");
            // SAFETY: mutex held, no concurrent writers.
            unsafe {
                let dist = *slot.dist.get() as usize;
                if dist == 0 {
                    continue;
                }
                occupied += 1;
                let home = (*slot.hash.get() as usize) & t.mask;
                let displacement = (i + t.capacity - home) & t.mask;
                assert_eq!(displacement + 1, dist, "dist inconsistent at slot {i}");
            }
        }
        assert_eq!(occupied, self.len.load(Ordering::Relaxed), "len drifted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestShard = Shard<u64, String>;

    // Identity hashing lets the tests choose home slots directly.
    fn h(key: u64) -> u64 {
        key
    }

    #[test]
    fn insert_find_roundtrip() {
        let epoch = EpochManager::new();
        let shard = TestShard::with_capacity(0);
        let _pin = epoch.enter();

        assert!(shard.insert(h(1), 1, "one".into(), &epoch));
        assert!(!shard.insert(h(1), 1, "again".into(), &epoch));
        assert_eq!(shard.get(h(1), &1), Some("one".into()));
        assert_eq!(shard.get(h(2), &2), None);
        assert_eq!(shard.len(), 1);
        shard.check_invariants();
    }

    #[test]
    fn insert_triggers_expansion() {
        // Capacity 16, load factor 0.75: the 13th insert must expand.
        let epoch = EpochManager::new();
        let shard = TestShard::with_capacity(0);
        let _pin = epoch.enter();
        assert_eq!(shard.capacity(), 16);

        for i in 0..100 {
            assert!(shard.insert(h(i), i, i.to_string(), &epoch));
        }
        assert_eq!(shard.len(), 100);
        assert!(shard.capacity() > 16);

        for i in 0..100 {
            assert_eq!(shard.get(h(i), &i), Some(i.to_string()), "key {i} lost");
        }
        shard.check_invariants();
    }

    #[test]
    fn collision_chain_backward_shift() {
        // Force a displaced chain: four keys sharing home slot 3, then
        // remove from the middle and verify distances are pulled back.
        let epoch = EpochManager::new();
        let shard = TestShard::with_capacity(0);
        let _pin = epoch.enter();

        for key in [3, 19, 35, 51] {
            // key & 15 == 3 for each of these
            assert!(shard.insert(key, key, key.to_string(), &epoch));
        }
        shard.check_invariants();

        assert!(shard.remove(19, &19, &epoch));
        assert!(!shard.remove(19, &19, &epoch));
        shard.check_invariants();

        for key in [3, 35, 51] {
            assert_eq!(shard.get(key, &key), Some(key.to_string()));
        }
        assert_eq!(shard.get(19, &19), None);
        assert_eq!(shard.len(), 3);
    }

    #[test]
    fn erase_triggers_delayed_shrink() {
        let epoch = EpochManager::new();
        let shard = TestShard::with_capacity(0);
        let _pin = epoch.enter();

        for i in 0..200 {
            shard.insert(h(i), i, i.to_string(), &epoch);
        }
        let grown = shard.capacity();
        assert_eq!(grown, 512);

        // Erasing down to 2 keys keeps the load under the shrink factor for
        // the last ~75 erases, enough for the delayed counter to fire.
        for i in 2..200 {
            assert!(shard.remove(h(i), &i, &epoch));
        }
        assert_eq!(shard.len(), 2);
        assert!(shard.capacity() < grown, "no shrink after sustained low load");

        for i in 0..2 {
            assert_eq!(shard.get(h(i), &i), Some(i.to_string()));
        }
        shard.check_invariants();
    }

    #[test]
    fn reserve_preallocates() {
        let epoch = EpochManager::new();
        let shard = TestShard::with_capacity(0);
        let _pin = epoch.enter();

        shard.reserve(1000, &epoch);
        let reserved = shard.capacity();
        assert!(reserved >= 1024);

        for i in 0..500 {
            assert!(shard.insert(h(i), i, i.to_string(), &epoch));
        }
        assert_eq!(shard.capacity(), reserved, "insertions resized anyway");
        assert_eq!(shard.len(), 500);
    }

    #[test]
    fn expand_shrink_cycles_stay_consistent() {
        let epoch = EpochManager::new();
        let shard = TestShard::with_capacity(0);
        let _pin = epoch.enter();

        for cycle in 0u64..3 {
            let base = cycle * 1000;
            for i in 0..100 {
                shard.insert(h(base + i), base + i, i.to_string(), &epoch);
            }
            for i in 0..100 {
                assert!(shard.remove(h(base + i), &(base + i), &epoch));
            }
            assert_eq!(shard.len(), 0);
            shard.check_invariants();
        }

        assert!(shard.insert(h(42), 42, "final".into(), &epoch));
        assert_eq!(shard.get(h(42), &42), Some("final".into()));
    }

    #[test]
    fn clear_resets_to_default_capacity() {
        let epoch = EpochManager::new();
        let shard = TestShard::with_capacity(0);
        let _pin = epoch.enter();

        for i in 0..100 {
            shard.insert(h(i), i, i.to_string(), &epoch);
        }
        shard.clear(&epoch);
        assert_eq!(shard.len(), 0);
        assert_eq!(shard.capacity(), DEFAULT_CAPACITY);
        assert_eq!(shard.get(h(5), &5), None);
        shard.check_invariants();
    }
}
