//! Entry points in the shape instrumented callers expect.
//!
//! Per-type, per-modifier accessors are generated here and forward to the
//! generic load/store of the active dispatch; none of that fan-out lives in
//! the core. The driver in [`crate::tx`] is a thin client of this module,
//! and so would be a compiler's generated code.

use crate::{
    internal::{dispatch::Dispatch, method_group::method_group, thread},
    tx::{ActionMask, CodeProperties, Error, HowExecuting, JmpBuf, LsModifier},
};

pub use crate::internal::alloc_log::FreeFn;

/// Runtime interface version, in the spirit of `_ITM_versionCompatible`.
pub const VERSION: u32 = 1;

#[inline]
fn active_dispatch() -> Dispatch {
    match thread::current().dispatch() {
        Some(disp) => disp,
        None => fatal!("transactional access outside of a transaction"),
    }
}

/// Enters a transaction (outermost or nested) and reports which code path
/// to run. A nested begin may instead force the outer transaction to
/// restart, surfacing the jump token.
#[inline]
pub fn begin_transaction(prop: CodeProperties, jb: &JmpBuf) -> Result<ActionMask, Error> {
    method_group().begin(prop, jb)
}

/// Leaves the innermost transaction; at the outermost level this runs the
/// full commit protocol. A forced restart surfaces as the jump token after
/// the transaction has been rolled back and re-begun.
#[inline]
pub fn commit_transaction() -> Result<(), Error> {
    method_group().commit(None)
}

/// [`commit_transaction`] with an exception in flight; the exception
/// pointer is stashed for the retry if the commit fails.
#[inline]
pub fn commit_transaction_eh(exc: *mut ()) -> Result<(), Error> {
    method_group().commit(Some(exc))
}

/// Aborts the innermost closed-nested transaction, or the whole transaction
/// when `outer` is set. Fatal for irrevocable transactions.
#[inline]
pub fn abort_transaction(outer: bool) {
    method_group().abort(outer)
}

/// Requests serial-irrevocable execution for the active transaction.
#[inline]
pub fn change_transaction_mode() -> Result<(), Error> {
    method_group().change_transaction_mode()
}

#[inline]
pub fn in_transaction() -> HowExecuting {
    method_group().how_executing()
}

#[inline]
pub fn transaction_id() -> Option<u64> {
    method_group().transaction_id()
}

/// Serial access for global side effects outside the transaction protocol.
#[inline]
pub fn acquire_serial_access() -> Result<(), Error> {
    method_group().acquire_serial_access()
}

#[inline]
pub fn release_serial_access() {
    method_group().release_serial_access()
}

/// Captures `len` bytes at `addr` into the thread's undo buffer, restoring
/// them if the transaction rolls back. The logging entry point of the ABI.
///
/// # Safety
///
/// `addr` must be valid for reads of `len` bytes now and for writes until
/// the transaction ends.
#[inline]
pub unsafe fn log_bytes(addr: *const u8, len: usize) {
    thread::current().with_undolog(|undo| unsafe { undo.log(addr as usize, len) });
}

/// Registers a callback to run after the outermost commit.
#[inline]
pub fn add_user_commit_action(f: Box<dyn FnOnce()>) {
    thread::current().push_user_action(true, f);
}

/// Registers a callback to run if the transaction aborts or restarts.
#[inline]
pub fn add_user_undo_action(f: Box<dyn FnOnce()>) {
    thread::current().push_user_action(false, f);
}

/// Notes a transactional allocation to be released on rollback.
pub fn record_allocation(ptr: *mut u8, free_fn: FreeFn) {
    unsafe {
        thread::current().with_alloc_log(|log| log.record_allocation(ptr as usize, free_fn))
    }
}

/// Notes a transactional free to be performed at commit.
pub fn forget_allocation(ptr: *mut u8, free_fn: FreeFn) {
    unsafe {
        thread::current().with_alloc_log(|log| log.forget_allocation(ptr as usize, free_fn))
    }
}

/// Drops any pending allocation action for `ptr`.
pub fn discard_allocation(ptr: *const u8) {
    unsafe { thread::current().with_alloc_log(|log| log.discard(ptr as usize)) }
}

/// Runtime error reported by the caller; never returns.
#[cold]
pub fn error(location: &str, code: u32) -> ! {
    fatal!("error {} at {}", code, location)
}

#[inline]
pub fn version_compatible(version: u32) -> bool {
    version <= VERSION
}

#[inline]
pub fn library_version() -> &'static str {
    concat!("invalbrid ", env!("CARGO_PKG_VERSION"))
}

#[inline]
pub(crate) fn ranges_overlap(dst: usize, src: usize, len: usize) -> bool {
    src < dst.wrapping_add(len) && dst < src.wrapping_add(len)
}

// Generates the per-type load entry points for the four read modifiers and
// the store entry points for the three write modifiers.
macro_rules! typed_access {
    ($T:ty =>
        $load_r:ident $load_rar:ident $load_raw:ident $load_rfw:ident
        $store_w:ident $store_war:ident $store_waw:ident) => {
        /// # Safety
        ///
        /// `addr` must be valid for reads for the transaction's lifetime.
        #[inline]
        pub unsafe fn $load_r(addr: *const $T) -> Result<$T, Error> {
            active_dispatch().load(addr, LsModifier::R)
        }

        /// # Safety
        ///
        /// `addr` must be valid for reads for the transaction's lifetime.
        #[inline]
        pub unsafe fn $load_rar(addr: *const $T) -> Result<$T, Error> {
            active_dispatch().load(addr, LsModifier::RaR)
        }

        /// # Safety
        ///
        /// `addr` must be valid for reads for the transaction's lifetime.
        #[inline]
        pub unsafe fn $load_raw(addr: *const $T) -> Result<$T, Error> {
            active_dispatch().load(addr, LsModifier::RaW)
        }

        /// # Safety
        ///
        /// `addr` must be valid for reads for the transaction's lifetime.
        #[inline]
        pub unsafe fn $load_rfw(addr: *const $T) -> Result<$T, Error> {
            active_dispatch().load(addr, LsModifier::RfW)
        }

        /// # Safety
        ///
        /// `addr` must be valid for writes for the transaction's lifetime.
        #[inline]
        pub unsafe fn $store_w(addr: *mut $T, value: $T) -> Result<(), Error> {
            active_dispatch().store(addr, value, LsModifier::W)
        }

        /// # Safety
        ///
        /// `addr` must be valid for writes for the transaction's lifetime.
        #[inline]
        pub unsafe fn $store_war(addr: *mut $T, value: $T) -> Result<(), Error> {
            active_dispatch().store(addr, value, LsModifier::WaR)
        }

        /// # Safety
        ///
        /// `addr` must be valid for writes for the transaction's lifetime.
        #[inline]
        pub unsafe fn $store_waw(addr: *mut $T, value: $T) -> Result<(), Error> {
            active_dispatch().store(addr, value, LsModifier::WaW)
        }
    };
}

typed_access!(u8 => load_u8_r load_u8_rar load_u8_raw load_u8_rfw
    store_u8_w store_u8_war store_u8_waw);
typed_access!(u16 => load_u16_r load_u16_rar load_u16_raw load_u16_rfw
    store_u16_w store_u16_war store_u16_waw);
typed_access!(u32 => load_u32_r load_u32_rar load_u32_raw load_u32_rfw
    store_u32_w store_u32_war store_u32_waw);
typed_access!(u64 => load_u64_r load_u64_rar load_u64_raw load_u64_rfw
    store_u64_w store_u64_war store_u64_waw);
typed_access!(f32 => load_f32_r load_f32_rar load_f32_raw load_f32_rfw
    store_f32_w store_f32_war store_f32_waw);
typed_access!(f64 => load_f64_r load_f64_rar load_f64_raw load_f64_rfw
    store_f64_w store_f64_war store_f64_waw);

// Transfer entry points: Rt/Wt operands are transactional, Rn/Wn are not.

/// # Safety
///
/// `src` valid for reads, `dst` valid for writes of `len` bytes; no
/// overlap.
#[inline]
pub unsafe fn memcpy_rt_wt(dst: *mut u8, src: *const u8, len: usize) -> Result<(), Error> {
    active_dispatch().memtransfer(dst, src, len, false, LsModifier::W, LsModifier::R)
}

/// # Safety
///
/// As [`memcpy_rt_wt`]; the source is not transactional memory.
#[inline]
pub unsafe fn memcpy_rn_wt(dst: *mut u8, src: *const u8, len: usize) -> Result<(), Error> {
    active_dispatch().memtransfer(dst, src, len, false, LsModifier::W, LsModifier::NonTxnal)
}

/// # Safety
///
/// As [`memcpy_rt_wt`]; the destination is not transactional memory.
#[inline]
pub unsafe fn memcpy_rt_wn(dst: *mut u8, src: *const u8, len: usize) -> Result<(), Error> {
    active_dispatch().memtransfer(dst, src, len, false, LsModifier::NonTxnal, LsModifier::R)
}

/// # Safety
///
/// `src` valid for reads, `dst` valid for writes of `len` bytes.
#[inline]
pub unsafe fn memmove_rt_wt(dst: *mut u8, src: *const u8, len: usize) -> Result<(), Error> {
    let may_overlap = ranges_overlap(dst as usize, src as usize, len);
    active_dispatch().memtransfer(dst, src, len, may_overlap, LsModifier::W, LsModifier::R)
}

/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
#[inline]
pub unsafe fn memset_w(dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
    active_dispatch().memset(dst, c, len, LsModifier::W)
}

/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
#[inline]
pub unsafe fn memset_war(dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
    active_dispatch().memset(dst, c, len, LsModifier::WaR)
}

/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
#[inline]
pub unsafe fn memset_waw(dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
    active_dispatch().memset(dst, c, len, LsModifier::WaW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{self, CodeProperties, Outcome};

    fn no_abort() -> CodeProperties {
        CodeProperties::INSTRUMENTED_CODE | CodeProperties::HAS_NO_ABORT
    }

    #[test]
    fn typed_accessors_round_trip() {
        let mut a = 1u32;
        let mut b = 2.5f64;
        let pa = &mut a as *mut u32;
        let pb = &mut b as *mut f64;
        let out = tx::transaction(no_abort(), |_tx| unsafe {
            let va = load_u32_r(pa)?;
            store_u32_w(pa, va + 1)?;
            let vb = load_f64_raw(pb)?;
            store_f64_waw(pb, vb * 2.0)?;
            // read-after-write observes the buffered value
            Ok(load_u32_rar(pa)?)
        });
        assert_eq!(out, Outcome::Committed(2));
        assert_eq!(a, 2);
        assert_eq!(b, 5.0);
    }

    #[test]
    fn zero_length_transfers_are_no_ops() {
        let out = tx::transaction(no_abort(), |_tx| unsafe {
            memcpy_rt_wt(core::ptr::null_mut(), core::ptr::null(), 0)?;
            memmove_rt_wt(core::ptr::null_mut(), core::ptr::null(), 0)?;
            memset_w(core::ptr::null_mut(), 0xff, 0)?;
            Ok(())
        });
        assert_eq!(out, Outcome::Committed(()));
    }

    #[test]
    fn queries_outside_any_transaction() {
        assert_eq!(in_transaction(), crate::tx::HowExecuting::Outside);
        assert_eq!(transaction_id(), None);
        assert!(version_compatible(VERSION));
        assert!(!version_compatible(VERSION + 1));
        assert!(library_version().starts_with("invalbrid"));
    }

    #[test]
    fn transaction_ids_are_live_only_inside() {
        let id = tx::atomic(|_tx| Ok(transaction_id()));
        assert!(id.is_some());
        assert_eq!(transaction_id(), None);
    }

    #[test]
    fn serial_access_excludes_commits() {
        acquire_serial_access().unwrap();
        release_serial_access();
        // The lock must be reusable immediately.
        acquire_serial_access().unwrap();
        release_serial_access();
    }
}
