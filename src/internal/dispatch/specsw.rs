//! Speculative software transactions.
//!
//! Reads are invisible and validated for opacity on every load; writes are
//! buffered in the write log and published at commit while the commit lock
//! is held. Conflicting peers are invalidated remotely after publication.

use crate::{
    internal::{
        method_group::method_group,
        thread::{self, ThreadRecord, STATE_SERIAL, STATE_SOFTWARE},
    },
    tx::{Error, RestartReason},
};
use core::mem;
use core::ptr;
use core::sync::atomic::{
    fence,
    Ordering::{Acquire, Relaxed, Release},
};
use crossbeam_utils::Backoff;

pub fn begin() {
    let mg = method_group();
    let record = thread::current();
    let _ = mg.sw_cnt.fetch_add(1, Relaxed);
    // A serial uninstrumented transaction may be running; speculation can
    // only start from an even commit sequence.
    let backoff = Backoff::new();
    let mut sequence = mg.commit_sequence.load(Acquire);
    while sequence & 1 != 0 {
        backoff.snooze();
        sequence = mg.commit_sequence.load(Acquire);
    }
    record.set_state(STATE_SOFTWARE);
    let data = record.tx_data();
    data.set_local_commit_sequence(sequence);
    record.shared_state.store(STATE_SOFTWARE, Release);
}

/// Opacity check, in a fixed order:
/// 1. a serial uninstrumented transaction ran (or is running),
/// 2. the thread currently holding the commit lock conflicts with us,
/// 3. a hardware transaction is still in its post-commit window,
/// 4. a committed peer already invalidated us.
pub fn validate(record: &ThreadRecord) -> Result<(), RestartReason> {
    let mg = method_group();
    let data = record.tx_data();
    if data.local_commit_sequence() != mg.commit_sequence.load(Acquire) {
        return Err(RestartReason::TryAgain);
    }
    let committer_conflict = thread::with_reader_lock(|| {
        let committing = mg.committing_tx.load(Acquire);
        if committing.is_null() || ptr::eq(committing, record) {
            return None;
        }
        // The reader lock pins the committing record; its data is reachable
        // until the writer lock is taken for teardown.
        let committing = unsafe { &*committing };
        let committing_data = committing.tx_data_shared()?;
        if data.readset().intersects(committing_data.writeset()) {
            Some(RestartReason::ValidateRead)
        } else if data.writeset().intersects(committing_data.writeset()) {
            Some(RestartReason::ValidateWrite)
        } else {
            None
        }
    });
    if let Some(reason) = committer_conflict {
        return Err(reason);
    }
    if invalbrid_htm::supported() {
        // Reads must not be trusted while a hardware committer is still
        // delivering invalidations.
        let backoff = Backoff::new();
        while mg.hw_post_commit.load(Acquire) != 0 {
            backoff.snooze();
        }
    }
    match data.invalid_reason() {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

/// # Safety
///
/// `addr` must be valid for reads of `T`.
pub unsafe fn load<T: Copy>(addr: *const T) -> Result<T, Error> {
    let record = thread::current();
    let data = record.tx_data();
    let size = mem::size_of::<T>();
    // Reads after writes (and re-reads) are served from the buffered value.
    if let Some(bytes) = data.logs().write_log.lookup(addr as usize, size) {
        let mut value = mem::MaybeUninit::<T>::uninit();
        ptr::copy_nonoverlapping(bytes, value.as_mut_ptr() as *mut u8, size);
        return Ok(value.assume_init());
    }
    data.readset().add(addr as usize, size);
    let value = ptr::read(addr);
    data.logs()
        .write_log
        .log(addr as usize, &value as *const T as *const u8, size);
    if record.state() & STATE_SERIAL == 0 {
        if let Err(reason) = validate(record) {
            return Err(method_group().restart(record, reason));
        }
    }
    Ok(value)
}

/// # Safety
///
/// `addr` must be valid for writes of `T` at commit time.
pub unsafe fn store<T: Copy>(addr: *mut T, value: T) -> Result<(), Error> {
    let record = thread::current();
    let data = record.tx_data();
    if let Some(reason) = data.invalid_reason() {
        return Err(method_group().restart(record, reason));
    }
    let size = mem::size_of::<T>();
    data.writeset().add(addr as usize, size);
    data.logs()
        .write_log
        .log(addr as usize, &value as *const T as *const u8, size);
    Ok(())
}

/// # Safety
///
/// `src` valid for reads, `dst` valid for writes of `len` bytes.
pub unsafe fn memtransfer(
    dst: *mut u8,
    src: *const u8,
    len: usize,
    dst_modifier: crate::tx::LsModifier,
    src_modifier: crate::tx::LsModifier,
) -> Result<(), Error> {
    use crate::tx::LsModifier::NonTxnal;

    let record = thread::current();
    let data = record.tx_data();
    if let Some(reason) = data.invalid_reason() {
        return Err(method_group().restart(record, reason));
    }
    // A transfer is a read of the source range followed by a buffered write
    // of the observed bytes.
    let mut snapshot = vec![0u8; len];
    if src_modifier == NonTxnal {
        ptr::copy_nonoverlapping(src, snapshot.as_mut_ptr(), len);
    } else {
        data.readset().add(src as usize, len);
        data.logs()
            .write_log
            .load_value(snapshot.as_mut_ptr(), src as usize, len);
        if record.state() & STATE_SERIAL == 0 {
            if let Err(reason) = validate(record) {
                return Err(method_group().restart(record, reason));
            }
        }
    }
    if dst_modifier == NonTxnal {
        ptr::copy_nonoverlapping(snapshot.as_ptr(), dst, len);
    } else {
        data.writeset().add(dst as usize, len);
        data.logs()
            .write_log
            .log(dst as usize, snapshot.as_ptr(), len);
    }
    Ok(())
}

/// # Safety
///
/// `dst` must be valid for writes of `len` bytes at commit time.
pub unsafe fn memset(dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
    let record = thread::current();
    let data = record.tx_data();
    if let Some(reason) = data.invalid_reason() {
        return Err(method_group().restart(record, reason));
    }
    data.writeset().add(dst as usize, len);
    data.logs().write_log.log_memset(dst as usize, c, len);
    Ok(())
}

pub fn trycommit() -> Result<(), RestartReason> {
    let mg = method_group();
    let record = thread::current();
    let data = record.tx_data();
    // Read-only transactions need no lock, no validation and no
    // publication: loads were validated as they happened.
    if data.writeset().is_empty() {
        unsafe { data.clear() };
        record.set_state(0);
        record.shared_state.store(0, Release);
        let _ = mg.sw_cnt.fetch_sub(1, Relaxed);
        return Ok(());
    }
    let serial = record.state() & STATE_SERIAL != 0;
    if !serial {
        mg.lock_commit();
    }
    mg.committing_tx
        .store(record as *const ThreadRecord as *mut ThreadRecord, Release);
    if let Err(reason) = validate(record) {
        mg.committing_tx.store(ptr::null_mut(), Release);
        if !serial {
            unsafe { mg.unlock_commit() };
        }
        return Err(reason);
    }
    let _ = mg.sw_cnt.fetch_sub(1, Relaxed);
    unsafe {
        fence(Release);
        data.logs().write_log.commit();
    }
    mg.invalidate(record);
    mg.committing_tx.store(ptr::null_mut(), Release);
    if !serial {
        unsafe { mg.unlock_commit() };
    }
    unsafe { data.clear() };
    record.set_state(0);
    record.shared_state.store(0, Release);
    Ok(())
}

pub fn rollback(cp: Option<&crate::internal::checkpoint::Checkpoint>) {
    let mg = method_group();
    let record = thread::current();
    match cp {
        Some(cp) => unsafe {
            let data = record.tx_data();
            let view = match &cp.tx_view {
                Some(view) => view,
                None => fatal!("checkpoint without transaction data"),
            };
            data.restore(view);
            data.logs().write_log.rollback(view.write_log_len);
        },
        None => {
            if unlikely!(record.state() & STATE_SERIAL != 0) {
                unsafe { mg.unlock_commit() };
            }
            let _ = mg.sw_cnt.fetch_sub(1, Relaxed);
            unsafe { record.tx_data().clear() };
            record.set_state(0);
            record.shared_state.store(0, Release);
        }
    }
}
