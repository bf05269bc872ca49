//! Minimal spin mutex, the default per-shard write lock.

use std::sync::atomic::{AtomicBool, Ordering};

use lock_api::{GuardSend, RawMutex};

/// Test-and-test-and-set spin lock.
///
/// `lock` tries an optimistic exchange first; on failure it spins on relaxed
/// loads (no cache-line bouncing while the holder works) with a CPU pause
/// hint, then retries the exchange once the flag appears clear.
///
/// Implements [`lock_api::RawMutex`], so anything expecting that interface —
/// including `parking_lot`'s raw mutex as a drop-in alternative — composes
/// with it.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    const INIT: RawSpinLock = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A [`lock_api::Mutex`] backed by [`RawSpinLock`].
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
