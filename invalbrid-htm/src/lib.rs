//! Raw hardware transactional memory primitives.
//!
//! This crate is the thin unsafe layer between the TM runtime and the CPU's
//! transactional execution facility (Intel RTM on x86_64). Everything here is
//! a direct instruction wrapper; policy (retry budgets, software fallback,
//! subscription reads) lives in the runtime.
//!
//! On targets without a hardware backend, [`supported`] returns `false` and
//! the remaining entry points must not be called.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        use x86_64 as back;
    } else {
        pub mod unsupported;
        use unsupported as back;
    }
}

/// Status of a hardware transaction attempt.
///
/// Contains either the "started" sentinel or the abort status word delivered
/// to the fallback path.
#[repr(transparent)]
#[derive(PartialEq, Eq, Ord, PartialOrd, Copy, Clone, Debug, Hash)]
pub struct BeginCode(u32);

impl BeginCode {
    /// True if the hardware transaction is now executing.
    #[inline]
    pub fn is_started(self) -> bool {
        self.0 == back::STARTED
    }

    /// True if the abort was requested by an explicit abort instruction.
    #[inline]
    pub fn is_explicit(self) -> bool {
        self.0 & back::ABORT_EXPLICIT != 0
    }

    /// True if the hardware suggests the transaction may succeed on retry.
    #[inline]
    pub fn should_retry(self) -> bool {
        self.0 & back::ABORT_RETRY != 0
    }

    /// True if the transaction aborted due to a memory conflict.
    #[inline]
    pub fn is_conflict(self) -> bool {
        self.0 & back::ABORT_CONFLICT != 0
    }

    /// True if the transaction overflowed hardware capacity.
    #[inline]
    pub fn is_capacity(self) -> bool {
        self.0 & back::ABORT_CAPACITY != 0
    }

    /// The 8-bit code passed to the explicit abort, if any.
    #[inline]
    pub fn abort_code(self) -> Option<u8> {
        if self.is_explicit() {
            Some((self.0 >> 24) as u8)
        } else {
            None
        }
    }
}

/// Whether this CPU can execute hardware transactions.
///
/// Cheap after the first call; the runtime must gate every other entry point
/// on this.
#[inline]
pub fn supported() -> bool {
    back::supported()
}

/// Begins a hardware transaction, or returns the abort status of a previous
/// attempt.
///
/// Control returns here twice: once with a started code, and again with an
/// abort code if the transaction aborts. All memory effects of the aborted
/// execution are discarded by the hardware.
///
/// # Safety
///
/// Requires [`supported`]. The caller must commit with [`end`] or abort with
/// [`abort`]; no syscalls or unbounded memory footprints inside the region.
#[inline]
pub unsafe fn begin() -> BeginCode {
    BeginCode(back::begin())
}

/// Commits the current hardware transaction, publishing all of its writes
/// atomically.
///
/// # Safety
///
/// Must be executing inside a hardware transaction.
#[inline]
pub unsafe fn end() {
    back::end()
}

/// Explicitly aborts the current hardware transaction.
///
/// Execution resumes at the matching [`begin`] with an explicit abort code.
///
/// # Safety
///
/// Must be executing inside a hardware transaction; otherwise the abort
/// instruction is a no-op and this function's divergence is violated.
#[inline]
pub unsafe fn abort() -> ! {
    back::abort()
}

/// True if currently executing inside a hardware transaction.
///
/// # Safety
///
/// Requires [`supported`].
#[inline]
pub unsafe fn test() -> bool {
    back::test()
}
