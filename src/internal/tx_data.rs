//! Per-transaction data attached to a thread record.
//!
//! Split the same way the thread record is: the bloom filters and the
//! invalidation flag are shared (committing peers intersect and invalidate
//! concurrently with the owner), the logs and the commit-sequence snapshot
//! are owner-only.

use crate::{
    internal::{
        bloom::{Bloom, FilterImage, HwBloom},
        logs::{UndoLog, WriteLog},
    },
    tx::RestartReason,
};
use core::cell::{Cell, UnsafeCell};
use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

// Sentinel for "not invalidated" in the atomic reason slot.
const NOT_INVALID: u32 = RestartReason::COUNT as u32;

/// Owner-only log state.
#[derive(Debug)]
pub struct TxLogs {
    pub write_log: WriteLog,
    pub undo_log: UndoLog,
    pub log_size: usize,
}

/// Software transaction data.
pub struct TxData {
    readset: Bloom,
    writeset: Bloom,
    // Set by committing peers under the commit lock (or in a hardware
    // post-commit phase); read by the owner at every validate and store.
    invalid_reason: AtomicU32,
    logs: UnsafeCell<TxLogs>,
    local_commit_sequence: Cell<u32>,
}

// The filters and invalid_reason are atomic; everything else is accessed by
// the owning thread only (peers reach a TxData solely through the thread
// list, and only touch the shared part).
unsafe impl Send for TxData {}
unsafe impl Sync for TxData {}

/// Saved image of the owner-visible transaction data, taken at a closed
/// nesting checkpoint. The invalidation flag is deliberately not part of the
/// image: restoring it could erase an invalidation delivered between save
/// and restore.
#[derive(Clone, Debug)]
pub struct TxView {
    pub readset: FilterImage,
    pub writeset: FilterImage,
    pub write_log_len: usize,
    pub undo_log_len: usize,
    pub log_size: usize,
    pub local_commit_sequence: u32,
}

impl TxData {
    pub fn new() -> Self {
        TxData {
            readset: Bloom::new(),
            writeset: Bloom::new(),
            invalid_reason: AtomicU32::new(NOT_INVALID),
            logs: UnsafeCell::new(TxLogs {
                write_log: WriteLog::new(),
                undo_log: UndoLog::new(),
                log_size: 0,
            }),
            local_commit_sequence: Cell::new(0),
        }
    }

    #[inline]
    pub fn readset(&self) -> &Bloom {
        &self.readset
    }

    #[inline]
    pub fn writeset(&self) -> &Bloom {
        &self.writeset
    }

    /// Reason a peer set while invalidating this transaction, if any.
    #[inline]
    pub fn invalid_reason(&self) -> Option<RestartReason> {
        RestartReason::from_index(self.invalid_reason.load(Acquire))
    }

    /// Marks this transaction as doomed. Called by peers holding the commit
    /// lock or finishing a hardware post-commit phase.
    #[inline]
    pub fn set_invalid(&self, reason: RestartReason) {
        self.invalid_reason.store(reason.index() as u32, Release);
    }

    /// Owner-only access to the logs.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this, and the returned borrow must
    /// not outlive the current runtime operation.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn logs(&self) -> &mut TxLogs {
        &mut *self.logs.get()
    }

    #[inline]
    pub fn local_commit_sequence(&self) -> u32 {
        self.local_commit_sequence.get()
    }

    #[inline]
    pub fn set_local_commit_sequence(&self, sequence: u32) {
        self.local_commit_sequence.set(sequence);
    }

    /// Resets everything for the next transaction on this thread.
    ///
    /// # Safety
    ///
    /// Owner thread only; no peer may be relying on the filters (the caller
    /// either holds the commit lock or has made itself invisible first).
    pub unsafe fn clear(&self) {
        self.readset.clear();
        self.writeset.clear();
        self.invalid_reason.store(NOT_INVALID, Relaxed);
        let logs = self.logs();
        logs.write_log.clear();
        logs.undo_log.commit();
        logs.log_size = 0;
        self.local_commit_sequence.set(0);
    }

    /// Saves the owner-visible state for a closed-nesting checkpoint.
    ///
    /// # Safety
    ///
    /// Owner thread only.
    pub unsafe fn view(&self) -> TxView {
        let logs = self.logs();
        TxView {
            readset: self.readset.snapshot(),
            writeset: self.writeset.snapshot(),
            write_log_len: logs.write_log.len(),
            undo_log_len: logs.undo_log.len(),
            log_size: logs.log_size,
            local_commit_sequence: self.local_commit_sequence.get(),
        }
    }

    /// Restores the filters and snapshot scalars saved in `view`. Log
    /// truncation is dispatch-specific and done by the caller.
    ///
    /// # Safety
    ///
    /// Owner thread only.
    pub unsafe fn restore(&self, view: &TxView) {
        self.readset.copy_from(&view.readset);
        self.writeset.copy_from(&view.writeset);
        self.logs().log_size = view.log_size;
        self.local_commit_sequence.set(view.local_commit_sequence);
    }
}

impl Debug for TxData {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TxData")
            .field("invalid_reason", &self.invalid_reason())
            .finish()
    }
}

/// Hardware transaction data: the write-set filter of a bloom-filter
/// hardware transaction. Allocated before the hardware region is entered.
#[derive(Debug)]
pub struct HwTxData {
    pub writeset: HwBloom,
}

impl HwTxData {
    pub fn new() -> Self {
        HwTxData {
            writeset: HwBloom::new(),
        }
    }
}
