//! Single-writer serial transactions running uninstrumented code.
//!
//! The commit lock is held for the whole transaction and the commit
//! sequence is odd for its duration, excluding every speculative software
//! transaction (they spin at begin and fail validation afterwards) and
//! every hardware transaction (they subscribe to the lock flag). Memory is
//! accessed directly with no bookkeeping, so there is no rollback.

use crate::{
    internal::{
        method_group::method_group,
        thread::{self, STATE_IRREVOCABLE, STATE_SERIAL},
    },
    tx::RestartReason,
};
use core::sync::atomic::Ordering::Release;

pub fn begin() {
    let mg = method_group();
    let record = thread::current();
    // An irrevocable transaction upgrading in place already owns the lock.
    if record.state() & STATE_SERIAL == 0 {
        mg.lock_commit();
    }
    let _sequence = mg.commit_sequence.fetch_add(1, Release);
    debug_assert!(_sequence & 1 == 0, "commit sequence already odd at begin");
    record.set_state(STATE_SERIAL | STATE_IRREVOCABLE);
    record
        .shared_state
        .store(STATE_SERIAL | STATE_IRREVOCABLE, Release);
}

pub fn trycommit() -> Result<(), RestartReason> {
    let mg = method_group();
    let record = thread::current();
    let _sequence = mg.commit_sequence.fetch_add(1, Release);
    debug_assert!(_sequence & 1 == 1, "commit sequence already even at commit");
    unsafe { mg.unlock_commit() };
    record.set_state(0);
    record.shared_state.store(0, Release);
    Ok(())
}
