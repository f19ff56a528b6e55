//! Plain hardware transactions running uninstrumented code.
//!
//! Available only when no software transaction is alive and the commit lock
//! is free, both of which the begin path reads inside the region; any
//! concurrent change aborts the hardware transaction. No bookkeeping at
//! all: the hardware commit is the whole commit protocol.

use crate::{
    internal::thread::{self, STATE_HARDWARE},
    tx::RestartReason,
};

/// Called inside the freshly started hardware region.
pub fn begin() {
    thread::current().set_state(STATE_HARDWARE);
}

pub fn trycommit() -> Result<(), RestartReason> {
    let record = thread::current();
    unsafe { invalbrid_htm::end() };
    record.set_state(0);
    Ok(())
}
