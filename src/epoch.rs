//! Epoch-based deferred reclamation.
//!
//! Retired objects (replaced tables) must not be freed while a lock-free
//! reader may still be traversing them. The manager runs a three-generation
//! scheme: an object retired while the global epoch is `E` becomes safe to
//! delete once the epoch reaches `E + 2`, because by then every pinned
//! thread has crossed at least two epoch boundaries.
//!
//! Threads register lazily: the first pin against a given manager allocates
//! a [`ThreadEntry`] and pushes it onto the manager's intrusive list. A
//! thread-local handle remembers the entry; when the thread exits — or
//! touches a different manager — the entry is orphaned (`alive = false`) and
//! skipped by future epoch scans.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Attempt to advance only every this many unpins. Amortization only; any
/// number of skipped attempts is correct.
const ADVANCE_INTERVAL: u32 = 64;

const GENERATIONS: u64 = 3;

/// Header of a retired allocation: intrusive link plus a type-erased
/// destructor that reboxes the full allocation.
struct RetiredNode {
    next: *mut RetiredNode,
    drop_fn: unsafe fn(*mut RetiredNode),
}

/// The node must stay the first field so a node pointer is also a box
/// pointer for `drop_fn`.
#[repr(C)]
struct RetiredBox<T> {
    node: RetiredNode,
    payload: T,
}

unsafe fn drop_retired<T>(node: *mut RetiredNode) {
    // SAFETY: `node` is the first field of a live `Box<RetiredBox<T>>` and
    // this is the only call for it.
    unsafe {
        drop(Box::from_raw(node as *mut RetiredBox<T>));
    }
}

/// Treiber stack of retired allocations: lock-free CAS push, exchange drain.
struct RetireList {
    head: AtomicPtr<RetiredNode>,
}

impl RetireList {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, node: *mut RetiredNode) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is exclusively ours until the CAS succeeds.
            unsafe {
                (*node).next = head;
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => head = seen,
            }
        }
    }

    /// Detach the whole list and free every node on it.
    fn drain(&self) {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: the exchange made this list unreachable, so we hold
            // the only pointers into it.
            unsafe {
                let next = (*node).next;
                ((*node).drop_fn)(node);
                node = next;
            }
        }
    }
}

/// Per-(thread, manager) registration record.
///
/// `nesting` and `ops_since_advance` are only ever touched by the owning
/// thread; everything crossing threads is atomic.
pub(crate) struct ThreadEntry {
    local_epoch: AtomicU64,
    active: AtomicBool,
    nesting: Cell<u32>,
    ops_since_advance: Cell<u32>,
    alive: AtomicBool,
    next: AtomicPtr<ThreadEntry>,
    owner: *const EpochManager,
}

// SAFETY: the `Cell` fields are private to the owning thread (they are only
// reached through that thread's local handle), `owner` is an identity token
// that is compared but never dereferenced, and every shared field is atomic.
unsafe impl Send for ThreadEntry {}
unsafe impl Sync for ThreadEntry {}

/// Thread-local slot holding the most recently used entry. One per thread,
/// shared across managers: switching managers orphans the previous entry.
struct ThreadHandle {
    entry: RefCell<Option<Arc<ThreadEntry>>>,
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.borrow_mut().take() {
            entry.active.store(false, Ordering::Release);
            entry.alive.store(false, Ordering::Release);
        }
    }
}

thread_local! {
    static HANDLE: ThreadHandle = ThreadHandle {
        entry: RefCell::new(None),
    };
}

/// Three-generation epoch reclaimer.
///
/// `retire` and pinning never block; `try_advance` is best-effort and may be
/// a no-op any number of times. Memory held by retired objects is bounded by
/// the per-epoch retirement rate times three generations.
pub(crate) struct EpochManager {
    global_epoch: AtomicU64,
    threads: AtomicPtr<ThreadEntry>,
    retired: [RetireList; GENERATIONS as usize],
    /// Serializes epoch advancement so two threads never drain the same
    /// generation concurrently. Only ever try-locked.
    advance_lock: Mutex<()>,
}

// SAFETY: the thread list and retire lists are raw-pointer structures whose
// nodes are published with release/acquire pairs; retired payloads are
// constrained to `Send` at the `retire` call site.
unsafe impl Send for EpochManager {}
unsafe impl Sync for EpochManager {}

impl EpochManager {
    pub(crate) fn new() -> Self {
        Self {
            global_epoch: AtomicU64::new(0),
            threads: AtomicPtr::new(ptr::null_mut()),
            retired: [RetireList::new(), RetireList::new(), RetireList::new()],
            advance_lock: Mutex::new(()),
        }
    }

    /// Pin the calling thread. While the returned guard lives, no object
    /// retired in the current epoch can be freed. Guards nest.
    pub(crate) fn enter(&self) -> EpochGuard<'_> {
        let entry = self.thread_entry();
        // SAFETY: the thread-local handle and the manager's list each hold a
        // strong count on the entry, so it outlives the guard.
        self.pin(unsafe { &*entry });
        EpochGuard { mgr: self, entry }
    }

    /// Hand `payload` to the reclaimer; it is dropped once no pinned thread
    /// can still observe it.
    pub(crate) fn retire<T: Send>(&self, payload: T) {
        let boxed = Box::new(RetiredBox {
            node: RetiredNode {
                next: ptr::null_mut(),
                drop_fn: drop_retired::<T>,
            },
            payload,
        });
        let node = Box::into_raw(boxed) as *mut RetiredNode;
        let epoch = self.global_epoch.load(Ordering::Relaxed);
        self.retired[(epoch % GENERATIONS) as usize].push(node);
        self.try_advance();
    }

    fn pin(&self, entry: &ThreadEntry) {
        let nesting = entry.nesting.get() + 1;
        entry.nesting.set(nesting);
        if nesting == 1 {
            entry.active.store(true, Ordering::Relaxed);
            entry.local_epoch.store(
                self.global_epoch.load(Ordering::Acquire),
                Ordering::Release,
            );
        }
    }

    fn unpin(&self, entry: &ThreadEntry) {
        let nesting = entry.nesting.get();
        debug_assert!(nesting > 0);
        entry.nesting.set(nesting - 1);
        if nesting == 1 {
            entry.active.store(false, Ordering::Release);
            let ops = entry.ops_since_advance.get() + 1;
            if ops >= ADVANCE_INTERVAL {
                entry.ops_since_advance.set(0);
                self.try_advance();
            } else {
                entry.ops_since_advance.set(ops);
            }
        }
    }

    /// Advance the global epoch if every live, pinned thread has caught up
    /// with it, then drain the generation that fell two epochs behind.
    fn try_advance(&self) {
        let Some(_lock) = self.advance_lock.try_lock() else {
            return;
        };

        let epoch = self.global_epoch.load(Ordering::Acquire);

        let mut cursor = self.threads.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: list nodes carry a strong count owned by the list
            // itself; they stay allocated until the manager drops.
            let entry = unsafe { &*cursor };
            if entry.alive.load(Ordering::Acquire)
                && entry.active.load(Ordering::Acquire)
                && entry.local_epoch.load(Ordering::Acquire) < epoch
            {
                return; // a reader is still in an older epoch
            }
            cursor = entry.next.load(Ordering::Acquire);
        }

        let new_epoch = epoch + 1;
        self.global_epoch.store(new_epoch, Ordering::Release);

        // retired[new % 3]       -- current retirements
        // retired[(new - 1) % 3] -- one generation old, may still be read
        // retired[(new - 2) % 3] -- two generations old, safe
        if new_epoch >= 2 {
            self.retired[((new_epoch - 2) % GENERATIONS) as usize].drain();
        }
    }

    /// Fetch (or create) the calling thread's entry for this manager.
    fn thread_entry(&self) -> *const ThreadEntry {
        HANDLE.with(|handle| {
            let mut slot = handle.entry.borrow_mut();

            if let Some(entry) = slot.as_ref() {
                // The alive check guards against address reuse: a new
                // manager allocated where a dead one used to live must not
                // inherit the dead manager's entry, or this thread would be
                // invisible to its epoch scans.
                if ptr::eq(entry.owner, self as *const EpochManager)
                    && entry.alive.load(Ordering::Relaxed)
                {
                    return Arc::as_ptr(entry);
                }
                // The handle points at another manager's entry: orphan it.
                entry.active.store(false, Ordering::Release);
                entry.alive.store(false, Ordering::Release);
            }

            let entry = Arc::new(ThreadEntry {
                local_epoch: AtomicU64::new(0),
                active: AtomicBool::new(false),
                nesting: Cell::new(0),
                ops_since_advance: Cell::new(0),
                alive: AtomicBool::new(true),
                next: AtomicPtr::new(ptr::null_mut()),
                owner: self as *const EpochManager,
            });

            // The list takes one strong count, the handle keeps the other;
            // the entry is freed when both have let go.
            let raw = Arc::into_raw(Arc::clone(&entry)) as *mut ThreadEntry;
            let mut head = self.threads.load(Ordering::Relaxed);
            loop {
                entry.next.store(head, Ordering::Relaxed);
                match self.threads.compare_exchange_weak(
                    head,
                    raw,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(seen) => head = seen,
                }
            }

            let out = Arc::as_ptr(&entry);
            *slot = Some(entry);
            out
        })
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        for list in &self.retired {
            list.drain();
        }
        // Mark every entry dead, then release the list's strong counts.
        // Entries whose threads are still running stay allocated until
        // those threads' handles let go; the dead mark keeps a later
        // manager at this address from adopting them.
        let mut cursor = self.threads.load(Ordering::Relaxed);
        while !cursor.is_null() {
            // SAFETY: `cursor` came from `Arc::into_raw` in `thread_entry`;
            // read the link and store the mark before giving the count back.
            unsafe {
                let next = (*cursor).next.load(Ordering::Relaxed);
                (*cursor).alive.store(false, Ordering::Release);
                drop(Arc::from_raw(cursor));
                cursor = next;
            }
        }
    }
}

/// RAII pin on an [`EpochManager`]. Dropping it unpins; every 64th unpin
/// attempts an epoch advance.
pub(crate) struct EpochGuard<'a> {
    mgr: &'a EpochManager,
    entry: *const ThreadEntry,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: same lifetime argument as in `enter`.
        self.mgr.unpin(unsafe { &*self.entry });
    }
}
