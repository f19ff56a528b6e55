//! The method group: process-wide orchestrator of all dispatches.
//!
//! Owns the global synchronization state every method coordinates through:
//! the commit lock (with its hardware-readable availability flag), the
//! commit sequence toggled by serial uninstrumented transactions, the count
//! of live software transactions, the post-commit counter of hardware
//! transactions, and the pointer to the committing thread. Chooses a
//! dispatch at every begin, migrates between dispatches on restart, and
//! drives the commit/abort lifecycle.

use crate::{
    internal::{
        checkpoint::Checkpoint,
        dispatch::Dispatch,
        thread::{
            self, ThreadRecord, STATE_HARDWARE, STATE_IRREVOCABLE, STATE_SERIAL, STATE_SOFTWARE,
        },
    },
    tx::{ActionMask, CodeProperties, Error, HowExecuting, JmpBuf, RestartReason},
};
use core::ptr;
use core::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};
use lock_api::RawMutex as _;
use parking_lot::RawMutex;

/// Restart budget before a speculative transaction is promoted to a serial
/// method.
pub const SW_RESTARTS: u32 = 5;

/// Retry budget for hardware begin attempts before falling through to
/// software.
pub const HW_RESTARTS: u32 = 20;

pub struct MethodGroup {
    commit_lock: RawMutex,
    // Mirror of the lock state that hardware transactions can subscribe to
    // with a plain read.
    commit_lock_available: AtomicBool,
    /// Live software transactions (speculative and serial software).
    pub sw_cnt: AtomicU32,
    /// Odd while a serial uninstrumented transaction runs.
    pub commit_sequence: AtomicU32,
    /// Hardware transactions still delivering post-commit invalidations.
    pub hw_post_commit: AtomicU32,
    /// The thread currently publishing writes under the commit lock.
    pub committing_tx: AtomicPtr<ThreadRecord>,
}

impl MethodGroup {
    const fn new() -> Self {
        MethodGroup {
            commit_lock: RawMutex::INIT,
            commit_lock_available: AtomicBool::new(true),
            sw_cnt: AtomicU32::new(0),
            commit_sequence: AtomicU32::new(0),
            hw_post_commit: AtomicU32::new(0),
            committing_tx: AtomicPtr::new(ptr::null_mut()),
        }
    }

    // --- commit lock ---

    pub(crate) fn lock_commit(&self) {
        self.commit_lock.lock();
        self.commit_lock_available.store(false, Release);
    }

    /// # Safety
    ///
    /// The calling thread must hold the commit lock.
    pub(crate) unsafe fn unlock_commit(&self) {
        self.commit_lock_available.store(true, Release);
        self.commit_lock.unlock();
    }

    #[inline]
    pub fn commit_lock_available(&self) -> bool {
        self.commit_lock_available.load(Relaxed)
    }

    // --- begin ---

    /// Chooses and installs a dispatch for a new transaction (or flattens /
    /// checkpoints a nested one) and reports which code path to run.
    ///
    /// Only a *nested* begin can fail: escalation of a nested property
    /// conflict restarts the outer transaction and surfaces as the jump
    /// token.
    pub fn begin(&self, prop: CodeProperties, jb: &JmpBuf) -> Result<ActionMask, Error> {
        if unlikely!(prop.undo_log_code()) {
            fatal!("undo-logging instrumentation is not supported");
        }
        let record = thread::current();
        if record.nesting() > 0 {
            return self.begin_nested(record, prop);
        }
        record.set_prop(prop);
        record.set_jb(*jb);
        record.set_nesting(1);
        record.alloc_id();
        if invalbrid_htm::supported() && prop.has_no_abort() {
            if let Some(actions) = self.try_begin_hw(record, prop) {
                record.set_actions(actions);
                return Ok(actions);
            }
        }
        let disp = self.select_sw(prop);
        Ok(self.install(record, prop, disp))
    }

    /// Starts a hardware region and picks a hardware dispatch inside it.
    ///
    /// `commit_lock_available` and `sw_cnt` are read *inside* the region:
    /// that subscribes the transaction to them, so any software-side change
    /// aborts it. A precondition miss is reported with an explicit abort,
    /// which falls through to software; spurious aborts retry up to the
    /// hardware budget.
    fn try_begin_hw(&self, record: &ThreadRecord, prop: CodeProperties) -> Option<ActionMask> {
        if prop.instrumented_code() {
            unsafe { record.ensure_hw_tx_data() };
        }
        let mut retries = 0;
        loop {
            let code = unsafe { invalbrid_htm::begin() };
            if code.is_started() {
                let lock_free = self.commit_lock_available.load(Relaxed);
                let sw = self.sw_cnt.load(Relaxed);
                if lock_free
                    && sw == 0
                    && record.state() == 0
                    && prop.uninstrumented_code()
                {
                    record.set_dispatch(Dispatch::LiteHw);
                    Dispatch::LiteHw.begin();
                    record.counters().note_started(Dispatch::LiteHw.index());
                    return Some(ActionMask::RUN_UNINSTRUMENTED_CODE);
                }
                if lock_free
                    && (sw > 0 || !prop.uninstrumented_code())
                    && prop.instrumented_code()
                {
                    record.set_dispatch(Dispatch::Bfhw);
                    Dispatch::Bfhw.begin();
                    record.counters().note_started(Dispatch::Bfhw.index());
                    return Some(ActionMask::RUN_INSTRUMENTED_CODE);
                }
                unsafe { invalbrid_htm::abort() };
            }
            if code.is_explicit() || !code.should_retry() {
                return None;
            }
            retries += 1;
            if retries >= HW_RESTARTS {
                return None;
            }
        }
    }

    /// The software rows of the dispatch selection table, evaluated
    /// top-down.
    fn select_sw(&self, prop: CodeProperties) -> Dispatch {
        let sw = self.sw_cnt.load(Relaxed);
        if prop.has_no_abort() {
            if prop.does_go_irrevocable()
                && (prop.instrumented_code() || prop.read_only())
                && sw > 0
            {
                Dispatch::IrrevocSw
            } else if prop.does_go_irrevocable() {
                Dispatch::SglSw
            } else if prop.instrumented_code()
                && (sw > 0 || self.commit_sequence.load(Acquire) & 1 == 1)
            {
                Dispatch::SpecSw
            } else {
                Dispatch::SglSw
            }
        } else if sw > 0 {
            Dispatch::SpecSw
        } else {
            Dispatch::IrrevocAboSw
        }
    }

    fn install(&self, record: &ThreadRecord, prop: CodeProperties, disp: Dispatch) -> ActionMask {
        record.set_dispatch(disp);
        disp.begin();
        record.counters().note_started(disp.index());
        let mut actions = ActionMask::empty();
        if disp.can_restart() {
            actions |= ActionMask::SAVE_LIVE_VARIABLES;
        }
        if prop.uninstrumented_code() && disp.can_run_uninstrumented() {
            actions |= ActionMask::RUN_UNINSTRUMENTED_CODE;
        } else {
            actions |= ActionMask::RUN_INSTRUMENTED_CODE;
        }
        record.set_actions(actions);
        actions
    }

    fn begin_nested(&self, record: &ThreadRecord, prop: CodeProperties) -> Result<ActionMask, Error> {
        let disp = match record.dispatch() {
            Some(disp) => disp,
            None => fatal!("nested begin without an installed dispatch"),
        };
        if prop.has_no_abort() {
            // Flat nesting: the nest becomes part of the enclosing
            // transaction.
            if prop.uninstrumented_code()
                && !prop.instrumented_code()
                && !disp.can_run_uninstrumented()
            {
                // Serial transactions (irrevocable or not) already own the
                // commit lock and can switch to direct execution in place;
                // only speculative transactions must re-enter.
                if record.state() & (STATE_SERIAL | STATE_IRREVOCABLE) != 0 {
                    self.switch_serial_uninstrumented(record);
                    record.set_nesting(record.nesting() + 1);
                    return Ok(ActionMask::RUN_UNINSTRUMENTED_CODE);
                }
                // A hardware region cannot restart in software from within;
                // tearing it down re-enters the begin path outside it.
                if record.state() & STATE_HARDWARE != 0 {
                    unsafe { invalbrid_htm::abort() };
                }
                return Err(self.restart(record, RestartReason::UninstrumentedCodepath));
            }
            if prop.does_go_irrevocable() && record.state() & STATE_IRREVOCABLE == 0 {
                if record.state() & STATE_SERIAL != 0 {
                    // Already serialized; becoming irrevocable only forbids
                    // rollback from here on.
                    record.set_state(record.state() | STATE_IRREVOCABLE);
                    record.shared_state.store(record.state(), Release);
                } else if record.state() & STATE_HARDWARE != 0 {
                    unsafe { invalbrid_htm::abort() };
                } else {
                    return Err(self.restart(record, RestartReason::SerialIrr));
                }
            }
            record.set_nesting(record.nesting() + 1);
            let actions = if prop.uninstrumented_code() && disp.can_run_uninstrumented() {
                ActionMask::RUN_UNINSTRUMENTED_CODE
            } else {
                ActionMask::RUN_INSTRUMENTED_CODE
            };
            return Ok(actions);
        }
        // Closed nesting takes a checkpoint; hardware methods cannot take
        // one, so the region is torn down and the transaction re-enters in
        // software.
        if record.state() & STATE_HARDWARE != 0 {
            unsafe { invalbrid_htm::abort() };
        }
        let cp = Checkpoint {
            jb: record.jb(),
            alloc_actions: unsafe { record.with_alloc_log(|log| log.clone()) },
            user_actions_len: record.user_actions_len(),
            id: record.id(),
            prop: record.prop(),
            cxa_catch_count: record.cxa_catch_count(),
            cxa_uncaught_count: record.cxa_uncaught_count(),
            disp,
            nesting: record.nesting(),
            tx_view: record
                .tx_data_shared()
                .map(|data| unsafe { data.view() }),
            undolog_len: unsafe { record.with_undolog(|undo| undo.len()) },
        };
        record.push_checkpoint(cp);
        record.set_nesting(record.nesting() + 1);
        record.set_prop(prop);
        record.alloc_id();
        let mut actions = ActionMask::SAVE_LIVE_VARIABLES;
        if prop.uninstrumented_code() && disp.can_run_uninstrumented() {
            actions |= ActionMask::RUN_UNINSTRUMENTED_CODE;
        } else {
            actions |= ActionMask::RUN_INSTRUMENTED_CODE;
        }
        Ok(actions)
    }

    /// In-place switch of an irrevocable transaction to the serial
    /// uninstrumented method. The write set kept so far stops being
    /// maintained, so speculative peers are excluded through the commit
    /// sequence instead.
    fn switch_serial_uninstrumented(&self, record: &ThreadRecord) {
        debug_assert!(record.state() & STATE_SERIAL != 0);
        self.committing_tx.store(ptr::null_mut(), Release);
        let _ = self.commit_sequence.fetch_add(1, Release);
        if record.state() & STATE_SOFTWARE != 0 {
            let _ = self.sw_cnt.fetch_sub(1, Relaxed);
            if let Some(data) = record.tx_data_shared() {
                unsafe { data.clear() };
            }
        }
        record.set_state(STATE_SERIAL | STATE_IRREVOCABLE);
        record
            .shared_state
            .store(STATE_SERIAL | STATE_IRREVOCABLE, Release);
        record.set_dispatch(Dispatch::SglSw);
        record.counters().note_started(Dispatch::SglSw.index());
    }

    // --- commit ---

    pub fn commit(&self, exc: Option<*mut ()>) -> Result<(), Error> {
        let record = thread::current();
        debug_assert!(record.nesting() > 0, "commit outside of a transaction");
        let nesting = record.nesting() - 1;
        record.set_nesting(nesting);
        if nesting > 0 {
            // Leaving a closed nest merges it into the parent: the live
            // allocation and user action logs already carry its effects,
            // only the identity reverts.
            if let Some(cp) = record.pop_checkpoint_at(nesting) {
                record.set_prop(cp.prop);
                record.set_id(cp.id);
                record.set_jb(cp.jb);
            }
            return Ok(());
        }
        let disp = match record.dispatch() {
            Some(disp) => disp,
            None => fatal!("commit without an installed dispatch"),
        };
        match disp.trycommit() {
            Err(reason) => {
                if let Some(exc) = exc {
                    record.set_eh_in_flight(exc);
                }
                Err(self.restart(record, reason))
            }
            Ok(()) => {
                record.counters().note_committed(disp.index());
                record.clear_dispatch();
                unsafe {
                    record.with_undolog(|undo| undo.commit());
                    record.with_alloc_log(|log| unsafe { log.commit() });
                }
                record.commit_user_actions();
                record.reset_restart_total();
                let _ = record.take_eh_in_flight();
                debug_assert!(record.checkpoints_empty(), "checkpoints survived commit");
                Ok(())
            }
        }
    }

    // --- abort ---

    /// User-requested abort; legal only for transactions compiled without
    /// the no-abort property.
    pub fn abort(&self, outer: bool) {
        let record = thread::current();
        if record.nesting() == 0 {
            fatal!("abort outside of a transaction");
        }
        if record.state() & STATE_IRREVOCABLE != 0 {
            fatal!("cannot abort an irrevocable transaction");
        }
        let disp = match record.dispatch() {
            Some(disp) => disp,
            None => fatal!("abort without an installed dispatch"),
        };
        if !outer {
            if let Some(cp) = record.pop_checkpoint() {
                disp.rollback(Some(&cp));
                self.rollback_to_checkpoint(record, cp);
                record.set_actions(
                    ActionMask::ABORT_TRANSACTION | ActionMask::RESTORE_LIVE_VARIABLES,
                );
                return;
            }
        }
        disp.rollback(None);
        self.rollback_outer(record);
        record.set_nesting(0);
        record.clear_dispatch();
        record.set_actions(ActionMask::ABORT_TRANSACTION | ActionMask::RESTORE_LIVE_VARIABLES);
    }

    fn rollback_to_checkpoint(&self, record: &ThreadRecord, cp: Checkpoint) {
        unsafe {
            record.with_undolog(|undo| unsafe { undo.rollback(cp.undolog_len) });
            record.with_alloc_log(|log| unsafe { log.rollback(Some(&cp.alloc_actions)) });
        }
        record.rollback_user_actions(cp.user_actions_len);
        record.set_cxa_counts(cp.cxa_catch_count, cp.cxa_uncaught_count);
        record.set_id(cp.id);
        record.set_prop(cp.prop);
        record.set_jb(cp.jb);
        record.set_nesting(cp.nesting);
    }

    fn rollback_outer(&self, record: &ThreadRecord) {
        unsafe {
            record.with_undolog(|undo| unsafe { undo.rollback(0) });
            record.with_alloc_log(|log| unsafe { log.rollback(None) });
        }
        record.rollback_user_actions(0);
        record.clear_checkpoints();
        record.set_cxa_counts(0, 0);
    }

    // --- restart ---

    /// Rolls the transaction back, re-selects a dispatch, begins it, and
    /// returns the jump token routed back to the transaction's entry.
    pub fn restart(&self, record: &ThreadRecord, reason: RestartReason) -> Error {
        if record.state() & (STATE_SERIAL | STATE_IRREVOCABLE) != 0 {
            fatal!("cannot restart a serial or irrevocable transaction");
        }
        let disp = match record.dispatch() {
            Some(disp) => disp,
            None => fatal!("restart without an installed dispatch"),
        };
        record.bump_restart(reason);
        disp.rollback(None);
        self.rollback_outer(record);
        record.set_nesting(1);
        let prop = record.prop();
        let (next, want_uninstrumented) = match reason {
            RestartReason::UninstrumentedCodepath | RestartReason::SerialIrr => {
                (Dispatch::SglSw, true)
            }
            _ if record.restart_total() < SW_RESTARTS => (Dispatch::SpecSw, false),
            _ if prop.has_no_abort() => {
                if self.sw_cnt.load(Relaxed) == 0 {
                    (Dispatch::SglSw, true)
                } else {
                    (Dispatch::IrrevocSw, false)
                }
            }
            _ => (Dispatch::IrrevocAboSw, false),
        };
        record.set_dispatch(next);
        next.begin();
        record.counters().note_started(next.index());
        let mut actions = ActionMask::RESTORE_LIVE_VARIABLES;
        if want_uninstrumented && prop.uninstrumented_code() && next.can_run_uninstrumented() {
            actions |= ActionMask::RUN_UNINSTRUMENTED_CODE;
        } else {
            actions |= ActionMask::RUN_INSTRUMENTED_CODE;
        }
        if next.can_restart() {
            actions |= ActionMask::SAVE_LIVE_VARIABLES;
        }
        record.set_actions(actions);
        Error::RESTART
    }

    /// Best-effort teardown when a panic unwinds out of a transaction.
    ///
    /// Rollback-capable methods roll back; serial methods cannot undo their
    /// in-place effects, so they are driven through their commit path to
    /// release the global state they hold. Without this, the thread would
    /// exit with a live transaction, which is fatal.
    pub fn panic_cleanup(&self) {
        let record = match thread::current_opt() {
            Some(record) => record,
            None => return,
        };
        if record.nesting() == 0 {
            return;
        }
        if let Some(disp) = record.dispatch() {
            match disp {
                Dispatch::SpecSw | Dispatch::IrrevocAboSw => disp.rollback(None),
                Dispatch::SglSw | Dispatch::IrrevocSw => {
                    // In-place writes stay; releasing through the commit
                    // path also invalidates peers that saw them.
                    let _ = disp.trycommit();
                }
                Dispatch::Bfhw | Dispatch::LiteHw => {
                    // A panic cannot normally escape a hardware region (the
                    // unwind itself aborts it); only the state flag is left.
                    record.set_state(0);
                }
            }
        }
        self.rollback_outer(record);
        record.set_nesting(0);
        record.clear_dispatch();
    }

    // --- invalidation ---

    /// Dooms every software peer whose read or write set overlaps the
    /// caller's write set. Must be called while holding the commit lock, so
    /// no peer is publishing concurrently.
    pub fn invalidate(&self, record: &ThreadRecord) {
        let data = match record.tx_data_shared() {
            Some(data) => data,
            None => return,
        };
        let writeset = data.writeset();
        thread::for_each_peer(record, |peer| {
            if peer.shared_state.load(Acquire) & STATE_SOFTWARE != 0 {
                if let Some(peer_data) = peer.tx_data_shared() {
                    if writeset.intersects(peer_data.writeset()) {
                        peer_data.set_invalid(RestartReason::LockedWrite);
                    }
                    if writeset.intersects(peer_data.readset()) {
                        peer_data.set_invalid(RestartReason::LockedRead);
                    }
                }
            }
        });
    }

    // --- queries and mode changes ---

    pub fn how_executing(&self) -> HowExecuting {
        match thread::current_opt() {
            None => HowExecuting::Outside,
            Some(record) if record.nesting() == 0 => HowExecuting::Outside,
            Some(record) if record.state() & STATE_IRREVOCABLE != 0 => HowExecuting::Irrevocable,
            Some(_) => HowExecuting::Retryable,
        }
    }

    pub fn transaction_id(&self) -> Option<u64> {
        match thread::current_opt() {
            Some(record) if record.nesting() > 0 => Some(record.id()),
            _ => None,
        }
    }

    /// Requests an upgrade to serial-irrevocable execution.
    pub fn change_transaction_mode(&self) -> Result<(), Error> {
        let record = thread::current();
        if record.nesting() == 0 {
            fatal!("mode change outside of a transaction");
        }
        if record.state() & STATE_IRREVOCABLE != 0 {
            return Ok(());
        }
        if record.state() & STATE_SERIAL != 0 {
            record.set_state(record.state() | STATE_IRREVOCABLE);
            record.shared_state.store(record.state(), Release);
            return Ok(());
        }
        if record.state() & STATE_HARDWARE != 0 {
            unsafe { invalbrid_htm::abort() };
        }
        Err(self.restart(record, RestartReason::SerialIrr))
    }

    /// Takes the commit lock without making the transaction serial. Used
    /// for global side effects that must not interleave with any commit.
    pub fn acquire_serial_access(&self) -> Result<(), Error> {
        let record = thread::current_opt();
        if let Some(record) = record {
            if record.state() & STATE_SERIAL != 0 {
                return Ok(());
            }
        }
        self.lock_commit();
        if let Some(record) = record {
            if let Some(disp) = record.dispatch() {
                if let Err(reason) = disp.validate() {
                    unsafe { self.unlock_commit() };
                    return Err(self.restart(record, reason));
                }
            }
        }
        Ok(())
    }

    pub fn release_serial_access(&self) {
        let serial = thread::current_opt()
            .map_or(false, |record| record.state() & STATE_SERIAL != 0);
        if !serial {
            unsafe { self.unlock_commit() };
        }
    }
}

impl core::fmt::Debug for MethodGroup {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter
            .debug_struct("MethodGroup")
            .field("commit_lock_available", &self.commit_lock_available())
            .field("sw_cnt", &self.sw_cnt.load(Relaxed))
            .field("commit_sequence", &self.commit_sequence.load(Relaxed))
            .field("hw_post_commit", &self.hw_post_commit.load(Relaxed))
            .finish()
    }
}

// --- singleton ---

/// Recognized values of `ITM_DEFAULT_METHOD_GROUP`. Only one method group
/// exists; the variable is parsed once to catch configuration mistakes
/// early.
fn parse_method_group(value: Option<&str>) -> Result<(), ()> {
    match value {
        None => Ok(()),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() || trimmed == "invalbrid" {
                Ok(())
            } else {
                Err(())
            }
        }
    }
}

static METHOD_GROUP: MethodGroup = MethodGroup::new();

lazy_static::lazy_static! {
    static ref METHOD_GROUP_INIT: &'static MethodGroup = {
        let value = std::env::var("ITM_DEFAULT_METHOD_GROUP");
        match &value {
            Ok(value) => {
                if parse_method_group(Some(value)).is_err() {
                    fatal!(
                        "unknown method group in ITM_DEFAULT_METHOD_GROUP: {:?}",
                        value
                    );
                }
            }
            Err(std::env::VarError::NotPresent) => {}
            Err(std::env::VarError::NotUnicode(_)) => {
                fatal!("unknown method group in ITM_DEFAULT_METHOD_GROUP");
            }
        }
        &METHOD_GROUP
    };
}

/// The process-wide method group, initialized on first use.
#[inline]
pub fn method_group() -> &'static MethodGroup {
    *METHOD_GROUP_INIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_group_names() {
        assert!(parse_method_group(None).is_ok());
        assert!(parse_method_group(Some("invalbrid")).is_ok());
        assert!(parse_method_group(Some("  invalbrid  ")).is_ok());
        assert!(parse_method_group(Some("")).is_ok());
        assert!(parse_method_group(Some("invalbrid_x")).is_err());
        assert!(parse_method_group(Some("serial")).is_err());
    }

    #[test]
    fn selection_table_software_rows() {
        let mg = MethodGroup::new();
        let instrumented = CodeProperties::INSTRUMENTED_CODE;
        let no_abort = CodeProperties::HAS_NO_ABORT;
        let irrevocable = CodeProperties::DOES_GO_IRREVOCABLE;

        // Quiescent system: no-abort and abortable transactions both
        // serialize.
        assert_eq!(mg.select_sw(instrumented | no_abort), Dispatch::SglSw);
        assert_eq!(mg.select_sw(instrumented), Dispatch::IrrevocAboSw);
        assert_eq!(
            mg.select_sw(instrumented | no_abort | irrevocable),
            Dispatch::SglSw
        );

        // With software transactions alive, speculation is preferred.
        mg.sw_cnt.store(1, Relaxed);
        assert_eq!(mg.select_sw(instrumented | no_abort), Dispatch::SpecSw);
        assert_eq!(mg.select_sw(instrumented), Dispatch::SpecSw);
        assert_eq!(
            mg.select_sw(instrumented | no_abort | irrevocable),
            Dispatch::IrrevocSw
        );
        assert_eq!(
            mg.select_sw(no_abort | irrevocable),
            Dispatch::SglSw,
            "irrevocable without instrumentation cannot track writes"
        );

        // An odd commit sequence also steers no-abort begins into
        // speculation.
        mg.sw_cnt.store(0, Relaxed);
        mg.commit_sequence.store(1, Relaxed);
        assert_eq!(mg.select_sw(instrumented | no_abort), Dispatch::SpecSw);
        assert_eq!(mg.select_sw(instrumented), Dispatch::IrrevocAboSw);
    }
}
