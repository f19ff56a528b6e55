//! Runtime counters.
//!
//! Every thread record counts transactions started and committed per
//! dispatch and restarts per reason. The counters are cheap enough to keep
//! unconditionally; at thread exit they are merged into a process-wide
//! registry and, when `INVALBRID_STATS=1` is set in the environment, a
//! per-thread summary is printed.

use crate::{internal::thread, tx::RestartReason};
use core::cell::Cell;
use parking_lot::Mutex;

/// Number of concurrency-control methods; see the index constants below.
pub const NUM_DISPATCHES: usize = 6;

pub const SPEC_SW: usize = 0;
pub const SGL_SW: usize = 1;
pub const IRREVOC_SW: usize = 2;
pub const IRREVOC_ABO_SW: usize = 3;
pub const BFHW: usize = 4;
pub const LITE_HW: usize = 5;

pub const DISPATCH_NAMES: [&str; NUM_DISPATCHES] = [
    "specsw",
    "sglsw",
    "irrevocsw",
    "irrevocabosw",
    "bfhw",
    "litehw",
];

/// Per-thread counter cells, owned by the thread record.
#[derive(Debug)]
pub struct Counters {
    started: [Cell<u32>; NUM_DISPATCHES],
    committed: [Cell<u32>; NUM_DISPATCHES],
    restarts: [Cell<u32>; RestartReason::COUNT],
}

impl Counters {
    pub(crate) fn new() -> Self {
        const ZERO: Cell<u32> = Cell::new(0);
        Counters {
            started: [ZERO; NUM_DISPATCHES],
            committed: [ZERO; NUM_DISPATCHES],
            restarts: [ZERO; RestartReason::COUNT],
        }
    }

    #[inline]
    pub(crate) fn note_started(&self, dispatch: usize) {
        let cell = &self.started[dispatch];
        cell.set(cell.get() + 1);
    }

    #[inline]
    pub(crate) fn note_committed(&self, dispatch: usize) {
        let cell = &self.committed[dispatch];
        cell.set(cell.get() + 1);
    }

    #[inline]
    pub(crate) fn note_restart(&self, reason: RestartReason) {
        let cell = &self.restarts[reason.index()];
        cell.set(cell.get() + 1);
    }

    pub(crate) fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for (out, cell) in totals.started.iter_mut().zip(self.started.iter()) {
            *out = cell.get();
        }
        for (out, cell) in totals.committed.iter_mut().zip(self.committed.iter()) {
            *out = cell.get();
        }
        for (out, cell) in totals.restarts.iter_mut().zip(self.restarts.iter()) {
            *out = cell.get();
        }
        totals
    }
}

/// A copyable snapshot of counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub started: [u32; NUM_DISPATCHES],
    pub committed: [u32; NUM_DISPATCHES],
    pub restarts: [u32; RestartReason::COUNT],
}

impl Totals {
    pub fn merge(&mut self, rhs: &Totals) {
        for (a, b) in self.started.iter_mut().zip(rhs.started.iter()) {
            *a += b;
        }
        for (a, b) in self.committed.iter_mut().zip(rhs.committed.iter()) {
            *a += b;
        }
        for (a, b) in self.restarts.iter_mut().zip(rhs.restarts.iter()) {
            *a += b;
        }
    }

    pub fn restarts_total(&self) -> u32 {
        self.restarts.iter().sum()
    }

    pub fn restarts_for(&self, reason: RestartReason) -> u32 {
        self.restarts[reason.index()]
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: Mutex<Totals> = Mutex::new(Totals::default());
    static ref ENABLED: bool =
        std::env::var_os("INVALBRID_STATS").map_or(false, |value| value == "1");
}

/// True when the `INVALBRID_STATS` summary output is enabled.
#[inline]
pub fn enabled() -> bool {
    *ENABLED
}

/// Counter snapshot of the calling thread, cumulative over its lifetime
/// except for the per-transaction restart budget.
pub fn thread_totals() -> Totals {
    thread::current().counters().totals()
}

/// Counters merged from all exited threads.
pub fn global_totals() -> Totals {
    *GLOBAL.lock()
}

pub(crate) fn merge_thread(counters: &Counters) {
    let totals = counters.totals();
    GLOBAL.lock().merge(&totals);
    if enabled() {
        print_summary(&totals);
    }
}

fn print_summary(totals: &Totals) {
    eprintln!(
        "invalbrid stats for thread {:?}:",
        std::thread::current().id()
    );
    for i in 0..NUM_DISPATCHES {
        if totals.started[i] != 0 || totals.committed[i] != 0 {
            eprintln!(
                "  {:<14} started {:>8} committed {:>8}",
                DISPATCH_NAMES[i], totals.started[i], totals.committed[i],
            );
        }
    }
    for i in 0..RestartReason::COUNT {
        if totals.restarts[i] != 0 {
            let reason = RestartReason::from_index(i as u32)
                .map(RestartReason::name)
                .unwrap_or("unknown");
            eprintln!("  restart {:<22} {:>8}", reason, totals.restarts[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_merge_adds_counters() {
        let counters = Counters::new();
        counters.note_started(SPEC_SW);
        counters.note_started(SPEC_SW);
        counters.note_committed(SGL_SW);
        counters.note_restart(RestartReason::TryAgain);
        let mut totals = counters.totals();
        totals.merge(&counters.totals());
        assert_eq!(totals.started[SPEC_SW], 4);
        assert_eq!(totals.committed[SGL_SW], 2);
        assert_eq!(totals.restarts_for(RestartReason::TryAgain), 2);
        assert_eq!(totals.restarts_total(), 2);
    }
}
