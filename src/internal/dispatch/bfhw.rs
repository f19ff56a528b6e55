//! Hardware transactions with a bloom-filter write set.
//!
//! Runs instrumented code inside a hardware region, recording write
//! addresses in the hardware filter. The hardware commit publishes the
//! writes; the post-commit phase then invalidates speculative readers that
//! overlap the write set. The post-commit counter is raised *inside* the
//! region, making it atomic with the writes becoming visible, and lowered
//! inside a fresh empty region once invalidation is done.

use crate::{
    internal::{
        method_group::{method_group, HW_RESTARTS},
        thread::{self, STATE_HARDWARE, STATE_SOFTWARE},
    },
    tx::{Error, RestartReason},
};
use core::mem;
use core::ptr;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use crossbeam_utils::Backoff;

/// Called inside the freshly started hardware region. The hardware filter
/// was allocated before the region began; heap allocation in here could
/// spuriously abort the transaction.
pub fn begin() {
    thread::current().set_state(STATE_HARDWARE);
}

/// # Safety
///
/// `addr` must be valid for writes of `T`.
pub unsafe fn store<T: Copy>(addr: *mut T, value: T) -> Result<(), Error> {
    let record = thread::current();
    record
        .hw_tx_data()
        .writeset
        .add(addr as usize, mem::size_of::<T>());
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
    let record = thread::current();
    record.hw_tx_data().writeset.add(dst as usize, len);
    super::copy_raw(dst, src, len, may_overlap);
    Ok(())
}

/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
pub unsafe fn memset(dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
    let record = thread::current();
    record.hw_tx_data().writeset.add(dst as usize, len);
    ptr::write_bytes(dst, c, len);
    Ok(())
}

pub fn trycommit() -> Result<(), RestartReason> {
    let mg = method_group();
    let record = thread::current();
    unsafe {
        // Plain load/store: the region makes the increment atomic, and a
        // locked operation could abort it.
        let pending = mg.hw_post_commit.load(Relaxed);
        mg.hw_post_commit.store(pending + 1, Relaxed);
        invalbrid_htm::end();
    }
    // The writes are now visible; speculative readers that observed any of
    // them before publication must be told.
    let writeset = unsafe { &record.hw_tx_data().writeset };
    thread::for_each_peer(record, |peer| {
        if peer.shared_state.load(Acquire) & STATE_SOFTWARE != 0 {
            if let Some(peer_data) = peer.tx_data_shared() {
                if writeset.intersects(peer_data.readset()) {
                    peer_data.set_invalid(RestartReason::LockedRead);
                }
            }
        }
    });
    // Leave the post-commit window from inside an empty hardware region so
    // the decrement is ordered like the increment. An empty region only
    // fails spuriously; after a bounded number of attempts fall back to a
    // plain atomic decrement.
    let backoff = Backoff::new();
    let mut attempts = 0;
    loop {
        let code = unsafe { invalbrid_htm::begin() };
        if code.is_started() {
            unsafe {
                let pending = mg.hw_post_commit.load(Relaxed);
                mg.hw_post_commit.store(pending - 1, Relaxed);
                invalbrid_htm::end();
            }
            break;
        }
        attempts += 1;
        if attempts >= HW_RESTARTS {
            let _ = mg.hw_post_commit.fetch_sub(1, AcqRel);
            break;
        }
        backoff.spin();
    }
    unsafe { record.hw_tx_data().writeset.clear() };
    record.set_state(0);
    Ok(())
}
