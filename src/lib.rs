//! A hybrid software/hardware transactional memory runtime.
//!
//! `invalbrid` makes concurrent transactions execute as if serializable by
//! choosing between several concurrency-control methods at runtime: fully
//! speculative software transactions with bloom-filter read/write sets and
//! remote invalidation, serial fallbacks that guarantee progress, and
//! hardware transactions that coexist with the software ones. Every
//! transactional memory access flows through the method installed for the
//! current attempt; a single process-wide method group decides which one
//! that is.
//!
//! # Examples
//!
//! Running a transaction over raw memory:
//!
//! ```
//! use invalbrid::tx::{self, CodeProperties};
//!
//! let props = CodeProperties::INSTRUMENTED_CODE | CodeProperties::HAS_NO_ABORT;
//! let mut x = 42u32;
//! let p = &mut x as *mut u32;
//! let seen = tx::transaction(props, |tx| unsafe {
//!     let v = tx.load(p)?;
//!     tx.store(p, v + 1)?;
//!     Ok(v)
//! });
//! assert_eq!(seen.committed(), Some(42));
//! assert_eq!(x, 43);
//! ```
//!
//! # Features
//!
//! * Opacity: a doomed transaction never observes an inconsistent snapshot;
//!   every speculative load validates before its value is used.
//! * Read-only speculative transactions commit without touching the commit
//!   lock and therefore in parallel.
//! * A bounded restart budget, after which the transaction is promoted to a
//!   serial method and is guaranteed to finish.
//! * On CPUs with transactional execution, eligible transactions run in
//!   hardware and invalidate conflicting software readers after commit.
//! * Closed nesting with checkpoints; user commit/abort actions; deferred
//!   allocation actions.
//!
//! Configuration: `ITM_DEFAULT_METHOD_GROUP` selects the method group (only
//! `invalbrid` exists); `INVALBRID_STATS=1` prints per-thread counters at
//! thread exit.

#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

#[macro_use]
mod internal;

pub mod abi;
pub mod stats;
pub mod tx;

pub use crate::tx::{transaction, CodeProperties, Error, Outcome, Tx};
#[doc(inline)]
pub use invalbrid_htm as htm;

#[cfg(test)]
mod counter {
    use crate::tx;
    use core::cell::UnsafeCell;
    use crossbeam_utils::thread;

    struct Shared<T>(UnsafeCell<T>);
    unsafe impl<T> Sync for Shared<T> {}

    #[test]
    fn contended_increments() {
        const THREAD_COUNT: usize = 8;
        const ITER_COUNT: usize = 200;

        let x = Shared(UnsafeCell::new(0u64));
        thread::scope(|scope| {
            for _ in 0..THREAD_COUNT {
                let x = &x;
                let _ = scope.spawn(move |_| {
                    for _ in 0..ITER_COUNT {
                        let _ = tx::atomic(|tx| unsafe {
                            let v = tx.load(x.0.get())?;
                            tx.store(x.0.get(), v + 1)?;
                            Ok(())
                        });
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(unsafe { *x.0.get() }, (THREAD_COUNT * ITER_COUNT) as u64);
    }

    #[test]
    fn abortable_counter_still_serializes() {
        const THREAD_COUNT: usize = 4;
        const ITER_COUNT: usize = 100;

        let x = Shared(UnsafeCell::new(0u32));
        thread::scope(|scope| {
            for _ in 0..THREAD_COUNT {
                let x = &x;
                let _ = scope.spawn(move |_| {
                    for _ in 0..ITER_COUNT {
                        let out =
                            tx::transaction(tx::CodeProperties::INSTRUMENTED_CODE, |tx| unsafe {
                                let v = tx.load(x.0.get())?;
                                tx.store(x.0.get(), v + 1)?;
                                Ok(())
                            });
                        assert!(!out.is_aborted());
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(unsafe { *x.0.get() }, (THREAD_COUNT * ITER_COUNT) as u32);
    }
}

#[cfg(test)]
mod panic {
    use crate::tx;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn recovers_from_a_panic_within_a_transaction() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            tx::atomic(|_tx| -> Result<(), tx::Error> { panic!("test panic") })
        }));
        assert!(result.is_err());
        // The thread must be able to run transactions again.
        let v = tx::atomic(|_tx| Ok(7));
        assert_eq!(v, 7);
    }

    #[test]
    fn recovers_from_a_panic_after_buffered_writes() {
        let mut x = 1u32;
        let p = &mut x as *mut u32;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            tx::transaction(
                tx::CodeProperties::INSTRUMENTED_CODE,
                |tx| -> Result<(), tx::Error> {
                    unsafe { tx.store(p, 99)? };
                    panic!("test panic")
                },
            )
        }));
        assert!(result.is_err());
        assert_eq!(x, 1, "failed transaction must not publish writes");
        let out = tx::transaction(tx::CodeProperties::INSTRUMENTED_CODE, |tx| unsafe {
            tx.store(p, 2)?;
            Ok(())
        });
        assert!(!out.is_aborted());
        assert_eq!(x, 2);
    }
}
