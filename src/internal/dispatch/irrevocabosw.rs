//! Serial, abortable software transactions.
//!
//! Holds the commit lock like the irrevocable serial method, but writes in
//! place under an undo log so a user abort can restore memory. The write
//! set is still recorded for peer validation. Serial but not irrevocable.

use crate::{
    internal::{
        checkpoint::Checkpoint,
        method_group::method_group,
        thread::{self, ThreadRecord, STATE_SERIAL, STATE_SOFTWARE},
    },
    tx::{Error, RestartReason},
};
use core::mem;
use core::ptr;
use core::sync::atomic::Ordering::{Relaxed, Release};

const STATE: u32 = STATE_SERIAL | STATE_SOFTWARE;

pub fn begin() {
    let mg = method_group();
    let record = thread::current();
    let _ = record.tx_data();
    mg.lock_commit();
    mg.committing_tx
        .store(record as *const ThreadRecord as *mut ThreadRecord, Release);
    let _ = mg.sw_cnt.fetch_add(1, Relaxed);
    record.set_state(STATE);
    record.shared_state.store(STATE, Release);
}

/// # Safety
///
/// `addr` must be valid for reads and writes of `T`.
pub unsafe fn store<T: Copy>(addr: *mut T, value: T) -> Result<(), Error> {
    let data = thread::current().tx_data();
    let size = mem::size_of::<T>();
    data.writeset().add(addr as usize, size);
    let logs = data.logs();
    logs.undo_log.log(addr as usize, size);
    logs.log_size = logs.undo_log.len();
    ptr::write(addr, value);
    Ok(())
}

/// # Safety
///
/// `src` valid for reads, `dst` valid for reads and writes of `len` bytes.
pub unsafe fn memtransfer(
    dst: *mut u8,
    src: *const u8,
    len: usize,
    may_overlap: bool,
) -> Result<(), Error> {
    let data = thread::current().tx_data();
    data.writeset().add(dst as usize, len);
    let logs = data.logs();
    logs.undo_log.log(dst as usize, len);
    logs.log_size = logs.undo_log.len();
    super::copy_raw(dst, src, len, may_overlap);
    Ok(())
}

/// # Safety
///
/// `dst` must be valid for reads and writes of `len` bytes.
pub unsafe fn memset(dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
    let data = thread::current().tx_data();
    data.writeset().add(dst as usize, len);
    let logs = data.logs();
    logs.undo_log.log(dst as usize, len);
    logs.log_size = logs.undo_log.len();
    ptr::write_bytes(dst, c, len);
    Ok(())
}

pub fn trycommit() -> Result<(), RestartReason> {
    let mg = method_group();
    let record = thread::current();
    // Writes are already in place; only the invalidation of conflicting
    // speculative peers remains.
    mg.invalidate(record);
    mg.committing_tx.store(ptr::null_mut(), Release);
    let _ = mg.sw_cnt.fetch_sub(1, Relaxed);
    unsafe { mg.unlock_commit() };
    record.set_state(0);
    record.shared_state.store(0, Release);
    unsafe { record.tx_data().clear() };
    Ok(())
}

pub fn rollback(cp: Option<&Checkpoint>) {
    let mg = method_group();
    let record = thread::current();
    let data = record.tx_data();
    match cp {
        Some(cp) => unsafe {
            let view = match &cp.tx_view {
                Some(view) => view,
                None => fatal!("checkpoint without transaction data"),
            };
            data.restore(view);
            data.logs().undo_log.rollback(view.undo_log_len);
        },
        None => {
            // Outer abort of a serial transaction: unroll memory, then give
            // up the lock.
            unsafe { data.logs().undo_log.rollback(0) };
            mg.committing_tx.store(ptr::null_mut(), Release);
            let _ = mg.sw_cnt.fetch_sub(1, Relaxed);
            unsafe { mg.unlock_commit() };
            record.shared_state.store(0, Release);
            unsafe { data.clear() };
            record.set_state(0);
        }
    }
}
