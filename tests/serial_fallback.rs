//! Exhausting the speculative restart budget promotes the transaction to a
//! serial method: the single-writer uninstrumented method when no other
//! software transaction is alive, the write-tracking irrevocable method
//! otherwise.
//!
//! One scenario per helper invocation; both run from a single test so their
//! helper transactions cannot skew each other's dispatch decisions.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering::Relaxed};
use crossbeam_utils::thread;
use invalbrid::stats;
use invalbrid::tx::{self, CodeProperties, HowExecuting, Outcome, RestartReason};
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

const SW_RESTARTS: u32 = 5;

fn abortable() -> CodeProperties {
    CodeProperties::INSTRUMENTED_CODE
}

fn no_abort() -> CodeProperties {
    CodeProperties::INSTRUMENTED_CODE | CodeProperties::HAS_NO_ABORT
}

/// Thrashes a speculative victim with `SW_RESTARTS` conflicting commits.
/// `speculator_outlives_victim` controls whether another software
/// transaction is still alive when the budget runs out.
fn thrash(speculator_outlives_victim: bool, expected_dispatch: usize) {
    let x = Shared::new(0u32);
    let y = Shared::new(0u32);

    // Bootstrap: a serial transaction seeds sw_cnt so the long-lived
    // speculator (and then the victim) can start speculative.
    let bootstrap_in = Barrier::new(2); // bootstrap <-> speculator
    let speculator_up = Barrier::new(2); // speculator <-> bootstrap
    let victim_go = Barrier::new(2); // bootstrap exit <-> victim
    let round_start = Barrier::new(2); // victim <-> attacker
    let round_done = Barrier::new(2); // victim <-> attacker
    let speculator_exit = Barrier::new(2); // attacker or victim <-> speculator
    let speculator_done = Barrier::new(2); // speculator <-> attacker or victim

    thread::scope(|scope| {
        // Serial bootstrap: alive only long enough for the speculator to
        // begin with sw_cnt > 0.
        let _ = scope.spawn(|_| {
            let attempt = AtomicU32::new(0);
            let out = tx::transaction(abortable(), |_tx| {
                if attempt.fetch_add(1, Relaxed) == 0 {
                    bootstrap_in.wait();
                    speculator_up.wait();
                }
                Ok(())
            });
            assert_eq!(out, Outcome::Committed(()));
            victim_go.wait();
        });

        // Long-lived read-only speculator: keeps sw_cnt above zero without
        // holding the commit lock.
        let _ = scope.spawn(|_| {
            bootstrap_in.wait();
            let attempt = AtomicU32::new(0);
            let out = tx::transaction(abortable(), |_tx| {
                if attempt.fetch_add(1, Relaxed) == 0 {
                    speculator_up.wait();
                    speculator_exit.wait();
                }
                Ok(())
            });
            assert_eq!(out, Outcome::Committed(()));
            speculator_done.wait();
        });

        // Victim: every speculative attempt reads x, lets the attacker
        // commit a conflicting write, and is doomed at its next load.
        let _ = scope.spawn(|_| {
            victim_go.wait();
            let attempt = AtomicU32::new(0);
            let out = tx::transaction(no_abort(), |tx| {
                let n = attempt.fetch_add(1, Relaxed);
                let v = unsafe { tx.load(x.ptr())? };
                if n < SW_RESTARTS {
                    assert_eq!(tx::how_executing(), HowExecuting::Retryable);
                    round_start.wait();
                    round_done.wait();
                    // The attacker has published a conflicting write; the
                    // next load must notice and restart.
                    let _ = unsafe { tx.load(y.ptr())? };
                    unreachable!("attempt {} survived a conflicting commit", n);
                }
                // Budget exhausted: the method group went serial.
                assert_eq!(tx::how_executing(), HowExecuting::Irrevocable);
                assert_eq!(v, SW_RESTARTS);
                unsafe { tx.store(x.ptr(), 100)? };
                Ok(())
            });
            assert_eq!(out, Outcome::Committed(()));
            let totals = stats::thread_totals();
            assert_eq!(totals.restarts_for(RestartReason::LockedRead), SW_RESTARTS);
            assert_eq!(totals.started[stats::SPEC_SW], SW_RESTARTS);
            assert_eq!(totals.started[expected_dispatch], 1);
            assert_eq!(totals.committed[expected_dispatch], 1);
            if speculator_outlives_victim {
                speculator_exit.wait();
                speculator_done.wait();
            }
        });

        // Attacker: one conflicting commit per speculative attempt.
        let _ = scope.spawn(|_| {
            for round in 0..SW_RESTARTS {
                round_start.wait();
                let out = tx::transaction(abortable(), |tx| {
                    unsafe { tx.store(x.ptr(), round + 1)? };
                    Ok(())
                });
                assert_eq!(out, Outcome::Committed(()));
                if !speculator_outlives_victim && round == SW_RESTARTS - 1 {
                    // Retire the speculator before the victim's final
                    // restart so no software transaction is left alive.
                    speculator_exit.wait();
                    speculator_done.wait();
                }
                round_done.wait();
            }
        });
    })
    .unwrap();

    assert_eq!(unsafe { *x.ptr() }, 100);
}

#[test]
fn budget_exhaustion_falls_back_to_serial() {
    // With no software transaction left, the fallback is the single-writer
    // uninstrumented method.
    thrash(false, stats::SGL_SW);
    // With a speculator still alive, the fallback keeps write tracking.
    thrash(true, stats::IRREVOC_SW);
}
