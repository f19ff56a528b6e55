//! Writer–writer/reader conflict: a committed writer dooms the speculative
//! reader, which restarts, observes the new value, and commits its own
//! update.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering::Relaxed};
use crossbeam_utils::thread;
use invalbrid::stats;
use invalbrid::tx::{self, CodeProperties, Outcome, RestartReason};
use std::sync::Barrier;

struct Shared<T>(UnsafeCell<T>);
unsafe impl<T> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new(value: T) -> Self {
        Shared(UnsafeCell::new(value))
    }

    fn ptr(&self) -> *mut T {
        self.0.get()
    }
}

fn abortable() -> CodeProperties {
    CodeProperties::INSTRUMENTED_CODE
}

#[test]
fn committed_writer_invalidates_speculative_reader() {
    let x = Shared::new(0u32);
    // helper + writer + reader
    let helper_in = Barrier::new(3);
    let read_done = Barrier::new(3);
    // writer -> reader, after the writer's commit
    let write_committed = Barrier::new(2);

    thread::scope(|scope| {
        // Parks in a serial transaction so both contenders begin while a
        // software transaction is alive, then commits right after the read
        // barrier to free the commit lock for the writer.
        let _ = scope.spawn(|_| {
            let attempt = AtomicU32::new(0);
            let out = tx::transaction(abortable(), |_tx| {
                if attempt.fetch_add(1, Relaxed) == 0 {
                    helper_in.wait();
                    read_done.wait();
                }
                Ok(())
            });
            assert_eq!(out, Outcome::Committed(()));
        });

        // Writer: stores x = 1 and commits first.
        let _ = scope.spawn(|_| {
            helper_in.wait();
            let attempt = AtomicU32::new(0);
            let out = tx::transaction(abortable(), |tx| {
                if attempt.fetch_add(1, Relaxed) == 0 {
                    read_done.wait();
                }
                unsafe { tx.store(x.ptr(), 1u32)? };
                Ok(())
            });
            assert_eq!(out, Outcome::Committed(()));
            let totals = stats::thread_totals();
            assert_eq!(totals.restarts_total(), 0);
            write_committed.wait();
        });

        // Reader: reads x before the writer commits, gets doomed, restarts,
        // and wins with its own update.
        let _ = scope.spawn(|_| {
            helper_in.wait();
            let attempt = AtomicU32::new(0);
            let out = tx::transaction(abortable(), |tx| {
                let n = attempt.fetch_add(1, Relaxed);
                let v = unsafe { tx.load(x.ptr())? };
                if n == 0 {
                    assert_eq!(v, 0, "first attempt must read the initial value");
                    read_done.wait();
                    write_committed.wait();
                }
                unsafe { tx.store(x.ptr(), v + 10)? };
                Ok(v)
            });
            // The second attempt read the writer's published value.
            assert_eq!(out, Outcome::Committed(1));
            let totals = stats::thread_totals();
            assert_eq!(totals.restarts_for(RestartReason::LockedRead), 1);
            assert_eq!(totals.restarts_total(), 1);
            assert_eq!(totals.started[stats::SPEC_SW], 2);
            assert_eq!(totals.committed[stats::SPEC_SW], 1);
        });
    })
    .unwrap();

    assert_eq!(unsafe { *x.ptr() }, 11);
}
