//! A cheap spinning reader-writer lock protecting the global thread list.
//!
//! Two atomic counters: `writers` counts threads requesting or holding
//! exclusive access, `readers` counts active shared holders with `-1`
//! meaning write-locked. Writers are mutually exclusive and exclude readers;
//! no fairness beyond first-come spinning is promised. Reader sections are
//! short (peer validation/invalidation walks), writer sections rare (thread
//! creation and teardown).

use core::hint::spin_loop;
use core::sync::atomic::{
    AtomicI32,
    Ordering::{Acquire, Relaxed, Release},
};
use lock_api::GuardNoSend;

#[derive(Debug)]
pub struct RwAtomicLock {
    writers: AtomicI32,
    readers: AtomicI32,
}

unsafe impl lock_api::RawRwLock for RwAtomicLock {
    const INIT: RwAtomicLock = RwAtomicLock {
        writers: AtomicI32::new(0),
        readers: AtomicI32::new(0),
    };

    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock_shared(&self) {
        loop {
            // Pending writers block new readers so a writer eventually gets
            // a quiescent reader count.
            while self.writers.load(Relaxed) > 0 {
                spin_loop();
            }
            let readers = self.readers.load(Relaxed);
            if readers >= 0
                && self
                    .readers
                    .compare_exchange_weak(readers, readers + 1, Acquire, Relaxed)
                    .is_ok()
            {
                return;
            }
            spin_loop();
        }
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        if self.writers.load(Relaxed) > 0 {
            return false;
        }
        let readers = self.readers.load(Relaxed);
        readers >= 0
            && self
                .readers
                .compare_exchange(readers, readers + 1, Acquire, Relaxed)
                .is_ok()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        let _prev = self.readers.fetch_sub(1, Release);
        debug_assert!(_prev > 0, "unlock of an unlocked reader side");
    }

    #[inline]
    fn lock_exclusive(&self) {
        let _ = self.writers.fetch_add(1, Relaxed);
        while self
            .readers
            .compare_exchange_weak(0, -1, Acquire, Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        let _ = self.writers.fetch_add(1, Relaxed);
        if self
            .readers
            .compare_exchange(0, -1, Acquire, Relaxed)
            .is_ok()
        {
            true
        } else {
            let _ = self.writers.fetch_sub(1, Relaxed);
            false
        }
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        let _prev = self.readers.fetch_add(1, Release);
        debug_assert!(_prev == -1, "unlock of an unlocked writer side");
        let _ = self.writers.fetch_sub(1, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lock_api::RawRwLock as _;

    fn send_sync<T: Send + Sync>() {}

    #[test]
    fn is_send_sync() {
        send_sync::<RwAtomicLock>()
    }

    #[test]
    fn writers_exclude_readers() {
        let lock = RwAtomicLock::INIT;
        lock.lock_exclusive();
        assert!(!lock.try_lock_shared());
        assert!(!lock.try_lock_exclusive());
        unsafe { lock.unlock_exclusive() };
        assert!(lock.try_lock_shared());
        assert!(lock.try_lock_shared());
        assert!(!lock.try_lock_exclusive());
        unsafe {
            lock.unlock_shared();
            lock.unlock_shared();
        }
        assert!(lock.try_lock_exclusive());
        unsafe { lock.unlock_exclusive() };
    }

    #[test]
    fn contended_counter() {
        use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

        const THREADS: usize = 4;
        const ITERS: usize = 10_000;

        let lock = lock_api::RwLock::<RwAtomicLock, usize>::const_new(RwAtomicLock::INIT, 0);
        let observed = AtomicUsize::new(0);
        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..THREADS {
                let _ = scope.spawn(|_| {
                    for _ in 0..ITERS {
                        *lock.write() += 1;
                        let _ = observed.fetch_max(*lock.read(), Relaxed);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(*lock.read(), THREADS * ITERS);
        assert!(observed.load(Relaxed) <= THREADS * ITERS);
    }
}
