//! Serial software transactions with write tracking.
//!
//! Like the single-writer method this holds the commit lock for its whole
//! lifetime, but it writes in place while recording the write set, so
//! concurrent speculative readers can be validated against it and
//! invalidated at commit. Irrevocable, hence no rollback.

use crate::{
    internal::{
        method_group::method_group,
        thread::{self, ThreadRecord, STATE_IRREVOCABLE, STATE_SERIAL, STATE_SOFTWARE},
    },
    tx::{Error, RestartReason},
};
use core::mem;
use core::ptr;
use core::sync::atomic::Ordering::{Relaxed, Release};

const STATE: u32 = STATE_SERIAL | STATE_IRREVOCABLE | STATE_SOFTWARE;

pub fn begin() {
    let mg = method_group();
    let record = thread::current();
    mg.lock_commit();
    mg.committing_tx
        .store(record as *const ThreadRecord as *mut ThreadRecord, Release);
    let _ = mg.sw_cnt.fetch_add(1, Relaxed);
    record.set_state(STATE);
    let _ = record.tx_data();
    record.shared_state.store(STATE, Release);
}

/// # Safety
///
/// `addr` must be valid for writes of `T`.
pub unsafe fn store<T: Copy>(addr: *mut T, value: T) -> Result<(), Error> {
    let data = thread::current().tx_data();
    data.writeset().add(addr as usize, mem::size_of::<T>());
    ptr::write(addr, value);
    Ok(())
}

/// # Safety
///
/// `src` valid for reads, `dst` valid for writes of `len` bytes.
pub unsafe fn memtransfer(
    dst: *mut u8,
    src: *const u8,
    len: usize,
    may_overlap: bool,
) -> Result<(), Error> {
    let data = thread::current().tx_data();
    data.writeset().add(dst as usize, len);
    super::copy_raw(dst, src, len, may_overlap);
    Ok(())
}

/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
pub unsafe fn memset(dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
    let data = thread::current().tx_data();
    data.writeset().add(dst as usize, len);
    ptr::write_bytes(dst, c, len);
    Ok(())
}

pub fn trycommit() -> Result<(), RestartReason> {
    let mg = method_group();
    let record = thread::current();
    mg.invalidate(record);
    mg.committing_tx.store(ptr::null_mut(), Release);
    let _ = mg.sw_cnt.fetch_sub(1, Relaxed);
    unsafe { mg.unlock_commit() };
    record.set_state(0);
    record.shared_state.store(0, Release);
    unsafe { record.tx_data().clear() };
    Ok(())
}
