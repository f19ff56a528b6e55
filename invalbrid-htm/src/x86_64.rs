//! Intel RTM backend.
//!
//! Encodes the `xbegin`/`xend`/`xabort`/`xtest` instructions directly so the
//! crate builds on stable; availability is checked at runtime via cpuid.

#![cfg(target_arch = "x86_64")]

use core::arch::asm;
use core::sync::atomic::{AtomicU8, Ordering::Relaxed};

/// Value of `eax` when `xbegin` falls through without aborting.
pub const STARTED: u32 = !0;

pub const ABORT_EXPLICIT: u32 = 1 << 0;
pub const ABORT_RETRY: u32 = 1 << 1;
pub const ABORT_CONFLICT: u32 = 1 << 2;
pub const ABORT_CAPACITY: u32 = 1 << 3;

#[inline]
pub fn supported() -> bool {
    static RTM: AtomicU8 = AtomicU8::new(0);
    match RTM.load(Relaxed) {
        0 => {
            let detected = is_x86_feature_detected!("rtm");
            RTM.store(if detected { 1 } else { 2 }, Relaxed);
            detected
        }
        1 => true,
        _ => false,
    }
}

#[inline]
pub unsafe fn begin() -> u32 {
    let status: u32;
    // The abort status is delivered in eax at the fallback address. eax is
    // preloaded with the started sentinel so the fall-through case is
    // distinguishable.
    asm!(
        "mov eax, -1",
        "xbegin 2f",
        "2:",
        out("eax") status,
        options(nostack),
    );
    status
}

#[inline]
pub unsafe fn end() {
    asm!("xend", options(nostack));
}

#[inline]
pub unsafe fn abort() -> ! {
    asm!("xabort 0xff", options(nostack));
    // xabort transfers control to the xbegin fallback when transactional.
    core::hint::unreachable_unchecked()
}

#[inline]
pub unsafe fn test() -> bool {
    let in_tx: u8;
    asm!(
        "xtest",
        "setnz {0}",
        out(reg_byte) in_tx,
        options(nostack),
    );
    in_tx != 0
}
