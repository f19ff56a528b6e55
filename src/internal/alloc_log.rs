//! Deferred allocation actions.
//!
//! Memory management inside a transaction cannot take effect immediately: a
//! speculative free must wait for the outermost commit, and a speculative
//! allocation must be undone if the transaction aborts. Actions are keyed by
//! address so an allocation and a later free of the same block cancel out
//! regardless of processing order.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

/// Releases the block at the given address.
pub type FreeFn = unsafe fn(*mut u8);

#[derive(Copy, Clone, Debug)]
struct AllocAction {
    free_fn: FreeFn,
    // An allocation is discarded on commit and released on abort; a
    // deallocation is released on commit and discarded on abort.
    allocated: bool,
}

#[derive(Clone, Default)]
pub struct AllocLog {
    actions: BTreeMap<usize, AllocAction>,
}

impl AllocLog {
    #[inline]
    pub fn new() -> Self {
        AllocLog {
            actions: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Notes that `ptr` was allocated inside the transaction.
    pub fn record_allocation(&mut self, ptr: usize, free_fn: FreeFn) {
        let _ = self.actions.insert(
            ptr,
            AllocAction {
                free_fn,
                allocated: true,
            },
        );
    }

    /// Notes that `ptr` should be released if the transaction commits.
    pub fn forget_allocation(&mut self, ptr: usize, free_fn: FreeFn) {
        let _ = self.actions.insert(
            ptr,
            AllocAction {
                free_fn,
                allocated: false,
            },
        );
    }

    /// Drops any pending action for `ptr`.
    pub fn discard(&mut self, ptr: usize) {
        let _ = self.actions.remove(&ptr);
    }

    /// Outermost commit: deferred frees happen now, allocations are kept.
    ///
    /// # Safety
    ///
    /// Recorded pointers must still be valid for their free functions.
    pub unsafe fn commit(&mut self) {
        for (ptr, action) in std::mem::take(&mut self.actions) {
            if !action.allocated {
                (action.free_fn)(ptr as *mut u8);
            }
        }
    }

    /// Abort/restart: allocations made since `saved` are released, deferred
    /// frees since `saved` are forgotten, and the log reverts to `saved`
    /// (empty for a whole-transaction rollback).
    ///
    /// # Safety
    ///
    /// Recorded pointers must still be valid for their free functions.
    pub unsafe fn rollback(&mut self, saved: Option<&AllocLog>) {
        for (ptr, action) in &self.actions {
            let pre_existing = saved.map_or(false, |log| log.actions.contains_key(ptr));
            if action.allocated && !pre_existing {
                (action.free_fn)(*ptr as *mut u8);
            }
        }
        self.actions = saved.map(|log| log.actions.clone()).unwrap_or_default();
    }
}

impl Debug for AllocLog {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AllocLog")
            .field("pending", &self.actions.len())
            .finish()
    }
}
