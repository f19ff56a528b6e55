//! Hardware/software coexistence.
//!
//! Written to pass with or without transactional execution support: a
//! no-abort writer takes the hardware path when the CPU offers one and
//! falls through to software otherwise; in both cases a speculative reader
//! that observed the written location must be doomed. The scenarios run
//! sequentially from one test so no serial transaction can spuriously
//! restart the speculative participants of another.

use core::cell::UnsafeCell;
use core::sync::atomic::{
    AtomicBool,
    Ordering::{Acquire, Release},
};
use crossbeam_utils::thread;
use invalbrid::stats;
use invalbrid::tx::{self, CodeProperties, HowExecuting, Outcome, RestartReason};

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

/// Sticky one-shot signal; safe to re-signal from a restarted transaction
/// attempt.
struct Event(AtomicBool);

impl Event {
    fn new() -> Self {
        Event(AtomicBool::new(false))
    }

    fn set(&self) {
        self.0.store(true, Release);
    }

    fn wait(&self) {
        while !self.0.load(Acquire) {
            std::thread::yield_now();
        }
    }
}

fn abortable() -> CodeProperties {
    CodeProperties::INSTRUMENTED_CODE
}

fn no_abort() -> CodeProperties {
    CodeProperties::INSTRUMENTED_CODE | CodeProperties::HAS_NO_ABORT
}

fn writer_dooms_software_reader() {
    let x = Shared::new(0u32);
    let y = Shared::new(0u32);
    let helper_in = Event::new();
    let helper_out = Event::new();
    let reader_ready = Event::new();
    let writer_done = Event::new();

    thread::scope(|scope| {
        // Seeds sw_cnt so the reader speculates instead of going serial,
        // then leaves before the writer needs the commit lock.
        let _ = scope.spawn(|_| {
            let out = tx::transaction(abortable(), |_tx| {
                helper_in.set();
                reader_ready.wait();
                Ok(())
            });
            assert_eq!(out, Outcome::Committed(()));
            helper_out.set();
        });

        // Reader: speculative, with x in its read set when the writer
        // commits.
        let _ = scope.spawn(|_| {
            helper_in.wait();
            let out = tx::transaction(abortable(), |tx| {
                let v = unsafe { tx.load(x.ptr())? };
                if v == 0 {
                    reader_ready.set();
                    writer_done.wait();
                    // The writer has committed a conflicting write. A
                    // re-read of x would be served from this transaction's
                    // own log, so a fresh location forces the validation
                    // that must notice the kill.
                    let _ = unsafe { tx.load(y.ptr())? };
                    unreachable!("reader survived a conflicting commit");
                }
                Ok(v)
            });
            assert_eq!(out, Outcome::Committed(1));
            let totals = stats::thread_totals();
            assert_eq!(totals.restarts_for(RestartReason::LockedRead), 1);
        });

        // Writer: no-abort and hardware-eligible. The store is published
        // either by a hardware commit with post-commit invalidation, or by
        // a software commit with lock-side invalidation.
        let _ = scope.spawn(|_| {
            reader_ready.wait();
            helper_out.wait();
            let out = tx::transaction(no_abort(), |tx| {
                unsafe { tx.store(x.ptr(), 1u32)? };
                Ok(())
            });
            assert_eq!(out, Outcome::Committed(()));
            writer_done.set();
        });
    })
    .unwrap();

    assert_eq!(unsafe { *x.ptr() }, 1);
}

fn uninstrumented_no_abort_completes(baseline: &stats::Totals) {
    // Hardware-first: a plain hardware transaction when the CPU supports
    // one and the system is quiescent, the serial uninstrumented method
    // otherwise. Either way exactly one method commits it.
    let x = Shared::new(5u32);
    let props = CodeProperties::INSTRUMENTED_CODE
        | CodeProperties::UNINSTRUMENTED_CODE
        | CodeProperties::HAS_NO_ABORT;
    let out = tx::transaction(props, |tx| {
        let v = unsafe { tx.load(x.ptr())? };
        unsafe { tx.store(x.ptr(), v * 2)? };
        Ok(())
    });
    assert_eq!(out, Outcome::Committed(()));
    assert_eq!(unsafe { *x.ptr() }, 10);

    let totals = stats::thread_totals();
    let hw = totals.committed[stats::LITE_HW] + totals.committed[stats::BFHW]
        - baseline.committed[stats::LITE_HW]
        - baseline.committed[stats::BFHW];
    let sw = totals.committed[stats::SGL_SW] + totals.committed[stats::SPEC_SW]
        - baseline.committed[stats::SGL_SW]
        - baseline.committed[stats::SPEC_SW];
    assert_eq!(hw + sw, 1, "exactly one method commits the transaction");
    if !invalbrid::htm::supported() {
        assert_eq!(hw, 0);
    }
}

fn serial_uninstrumented_goes_irrevocable(baseline: &stats::Totals) {
    // On a CPU with transactional execution this legitimately runs as a
    // plain hardware transaction instead (the begin table prefers hardware
    // for any no-abort transaction); only the software path must go
    // irrevocable.
    let hw_first = invalbrid::htm::supported();
    let x = Shared::new(0u32);
    let props = CodeProperties::UNINSTRUMENTED_CODE
        | CodeProperties::HAS_NO_ABORT
        | CodeProperties::DOES_GO_IRREVOCABLE;
    let out = tx::transaction(props, |tx| {
        if !hw_first {
            assert_eq!(tx::how_executing(), HowExecuting::Irrevocable);
        }
        let v = unsafe { tx.load(x.ptr())? };
        unsafe { tx.store(x.ptr(), v + 1)? };
        Ok(())
    });
    assert_eq!(out, Outcome::Committed(()));
    assert_eq!(unsafe { *x.ptr() }, 1);

    let totals = stats::thread_totals();
    if hw_first {
        let committed = totals.committed[stats::SGL_SW] + totals.committed[stats::LITE_HW]
            - baseline.committed[stats::SGL_SW]
            - baseline.committed[stats::LITE_HW];
        assert_eq!(committed, 1);
    } else {
        assert_eq!(
            totals.committed[stats::SGL_SW] - baseline.committed[stats::SGL_SW],
            1
        );
    }
}

#[test]
fn hardware_software_coexistence() {
    writer_dooms_software_reader();
    let baseline = stats::thread_totals();
    uninstrumented_no_abort_completes(&baseline);
    let baseline = stats::thread_totals();
    serial_uninstrumented_goes_irrevocable(&baseline);
}
