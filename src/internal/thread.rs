//! Per-thread records and the global record list.
//!
//! A thread record is created lazily on the first transactional call,
//! registered in a process-wide intrusive list, and torn down by a
//! thread-local drop hook. Committing peers walk the list under the reader
//! side of the list lock to validate against and invalidate each other, so
//! the record is split into a shared part (atomics only) and an owner-only
//! part behind cells.
//!
//! Owner-only fields are never borrowed across a call back into the
//! runtime; each accessor takes and drops its borrow immediately.

use crate::{
    internal::{
        alloc_log::AllocLog,
        checkpoint::Checkpoint,
        dispatch::Dispatch,
        logs::UndoLog,
        rw_lock::RwAtomicLock,
        tx_data::{HwTxData, TxData},
    },
    stats::{self, Counters},
    tx::{ActionMask, CodeProperties, JmpBuf},
};
use core::cell::{Cell, UnsafeCell};
use core::fmt::{self, Debug, Formatter};
use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicPtr, AtomicU32, AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

/// Set while the transaction owns the commit lock for its whole lifetime.
pub const STATE_SERIAL: u32 = 0x0001;
/// Set while the installed dispatch cannot abort or restart.
pub const STATE_IRREVOCABLE: u32 = 0x0002;
/// Set while the transaction maintains software transaction data peers can
/// validate against.
pub const STATE_SOFTWARE: u32 = 0x0004;
/// Set while the transaction executes inside a hardware region.
pub const STATE_HARDWARE: u32 = 0x0008;

/// Ids are taken from per-thread blocks carved off a global counter, so the
/// shared cacheline is touched once per block.
pub const TID_BLOCK_SIZE: u64 = 1 << 16;

static GLOBAL_TID: AtomicU64 = AtomicU64::new(TID_BLOCK_SIZE);

pub struct UserAction {
    pub on_commit: bool,
    pub f: Box<dyn FnOnce()>,
}

impl Debug for UserAction {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UserAction")
            .field("on_commit", &self.on_commit)
            .finish()
    }
}

pub struct ThreadRecord {
    // *** Shared part: touched by peers under the list reader lock. ***
    pub shared_state: AtomicU32,
    tx_data: AtomicPtr<TxData>,
    next: AtomicPtr<ThreadRecord>,

    // *** Owner-only part. ***
    jb: Cell<JmpBuf>,
    prop: Cell<CodeProperties>,
    nesting: Cell<u32>,
    state: Cell<u32>,
    disp: Cell<Option<Dispatch>>,
    actions: Cell<ActionMask>,
    id: Cell<u64>,
    local_tid: Cell<u64>,
    restart_total: Cell<u32>,
    cxa_catch_count: Cell<u32>,
    cxa_uncaught_count: Cell<u32>,
    eh_in_flight: Cell<*mut ()>,
    hw_tx_data: UnsafeCell<Option<Box<HwTxData>>>,
    checkpoints: UnsafeCell<Vec<Checkpoint>>,
    undolog: UnsafeCell<UndoLog>,
    alloc_actions: UnsafeCell<AllocLog>,
    user_actions: UnsafeCell<Vec<UserAction>>,
    counters: Counters,
}

// Peers only touch the shared part; the owner-only part is confined to the
// thread the record belongs to. Records are unregistered under the list
// writer lock before they are freed.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    fn new() -> Self {
        ThreadRecord {
            shared_state: AtomicU32::new(0),
            tx_data: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            jb: Cell::new(JmpBuf::new()),
            prop: Cell::new(CodeProperties::empty()),
            nesting: Cell::new(0),
            state: Cell::new(0),
            disp: Cell::new(None),
            actions: Cell::new(ActionMask::empty()),
            id: Cell::new(0),
            local_tid: Cell::new(0),
            restart_total: Cell::new(0),
            cxa_catch_count: Cell::new(0),
            cxa_uncaught_count: Cell::new(0),
            eh_in_flight: Cell::new(ptr::null_mut()),
            hw_tx_data: UnsafeCell::new(None),
            checkpoints: UnsafeCell::new(Vec::new()),
            undolog: UnsafeCell::new(UndoLog::new()),
            alloc_actions: UnsafeCell::new(AllocLog::new()),
            user_actions: UnsafeCell::new(Vec::new()),
            counters: Counters::new(),
        }
    }

    // --- shared part ---

    /// The transaction data, as seen by a peer holding the list reader lock.
    #[inline]
    pub fn tx_data_shared(&self) -> Option<&TxData> {
        let data = self.tx_data.load(Acquire);
        if data.is_null() {
            None
        } else {
            // Valid until the record is freed, which requires the list
            // writer lock the peer's read guard excludes.
            Some(unsafe { &*data })
        }
    }

    /// The transaction data of the owning thread, allocated on first use and
    /// reused for the rest of the thread's lifetime.
    #[inline]
    pub fn tx_data(&self) -> &TxData {
        match self.tx_data_shared() {
            Some(data) => data,
            None => self.alloc_tx_data(),
        }
    }

    #[inline(never)]
    #[cold]
    fn alloc_tx_data(&self) -> &TxData {
        let data = Box::into_raw(Box::new(TxData::new()));
        self.tx_data.store(data, Release);
        unsafe { &*data }
    }

    // --- owner-only part ---

    #[inline]
    pub fn jb(&self) -> JmpBuf {
        self.jb.get()
    }

    #[inline]
    pub fn set_jb(&self, jb: JmpBuf) {
        self.jb.set(jb);
    }

    #[inline]
    pub fn prop(&self) -> CodeProperties {
        self.prop.get()
    }

    #[inline]
    pub fn set_prop(&self, prop: CodeProperties) {
        self.prop.set(prop);
    }

    #[inline]
    pub fn nesting(&self) -> u32 {
        self.nesting.get()
    }

    #[inline]
    pub fn set_nesting(&self, nesting: u32) {
        self.nesting.set(nesting);
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.state.get()
    }

    #[inline]
    pub fn set_state(&self, state: u32) {
        self.state.set(state);
    }

    #[inline]
    pub fn dispatch(&self) -> Option<Dispatch> {
        self.disp.get()
    }

    #[inline]
    pub fn set_dispatch(&self, disp: Dispatch) {
        self.disp.set(Some(disp));
    }

    #[inline]
    pub fn clear_dispatch(&self) {
        self.disp.set(None);
    }

    #[inline]
    pub fn actions(&self) -> ActionMask {
        self.actions.get()
    }

    #[inline]
    pub fn set_actions(&self, actions: ActionMask) {
        self.actions.set(actions);
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id.get()
    }

    #[inline]
    pub fn set_id(&self, id: u64) {
        self.id.set(id);
    }

    /// Takes the next transaction id from the thread's block, refilling the
    /// block from the global counter on exhaustion.
    pub fn alloc_id(&self) {
        let local = self.local_tid.get();
        if likely!(local & (TID_BLOCK_SIZE - 1) != 0) {
            self.id.set(local);
            self.local_tid.set(local + 1);
        } else {
            let id = GLOBAL_TID.fetch_add(TID_BLOCK_SIZE, Relaxed);
            self.id.set(id);
            self.local_tid.set(id + 1);
        }
    }

    #[inline]
    pub fn restart_total(&self) -> u32 {
        self.restart_total.get()
    }

    #[inline]
    pub fn reset_restart_total(&self) {
        self.restart_total.set(0);
    }

    #[inline]
    pub fn bump_restart(&self, reason: crate::tx::RestartReason) {
        self.restart_total.set(self.restart_total.get() + 1);
        self.counters.note_restart(reason);
    }

    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    #[inline]
    pub fn cxa_catch_count(&self) -> u32 {
        self.cxa_catch_count.get()
    }

    #[inline]
    pub fn cxa_uncaught_count(&self) -> u32 {
        self.cxa_uncaught_count.get()
    }

    #[inline]
    pub fn set_cxa_counts(&self, catch: u32, uncaught: u32) {
        self.cxa_catch_count.set(catch);
        self.cxa_uncaught_count.set(uncaught);
    }

    #[inline]
    pub fn set_eh_in_flight(&self, exc: *mut ()) {
        self.eh_in_flight.set(exc);
    }

    #[inline]
    pub fn take_eh_in_flight(&self) -> *mut () {
        self.eh_in_flight.replace(ptr::null_mut())
    }

    /// The hardware write-set filter. Allocated outside any hardware region.
    ///
    /// # Safety
    ///
    /// Owner thread only.
    pub unsafe fn ensure_hw_tx_data(&self) {
        let slot = &mut *self.hw_tx_data.get();
        if unlikely!(slot.is_none()) {
            *slot = Some(Box::new(HwTxData::new()));
        }
    }

    /// # Safety
    ///
    /// Owner thread only; [`ThreadRecord::ensure_hw_tx_data`] must have run.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn hw_tx_data(&self) -> &mut HwTxData {
        match &mut *self.hw_tx_data.get() {
            Some(data) => data,
            None => fatal!("hardware transaction data missing"),
        }
    }

    // --- checkpoints ---

    pub fn push_checkpoint(&self, cp: Checkpoint) {
        unsafe { (*self.checkpoints.get()).push(cp) };
    }

    /// Pops the newest checkpoint if it was taken at depth `nesting`.
    pub fn pop_checkpoint_at(&self, nesting: u32) -> Option<Checkpoint> {
        unsafe {
            let checkpoints = &mut *self.checkpoints.get();
            if checkpoints.last().map(|cp| cp.nesting) == Some(nesting) {
                checkpoints.pop()
            } else {
                None
            }
        }
    }

    pub fn pop_checkpoint(&self) -> Option<Checkpoint> {
        unsafe { (*self.checkpoints.get()).pop() }
    }

    pub fn clear_checkpoints(&self) {
        unsafe { (*self.checkpoints.get()).clear() };
    }

    pub fn checkpoints_empty(&self) -> bool {
        unsafe { (*self.checkpoints.get()).is_empty() }
    }

    // --- ABI undo buffer ---

    /// # Safety
    ///
    /// Owner thread only; borrow must not escape `f`.
    pub unsafe fn with_undolog<R>(&self, f: impl FnOnce(&mut UndoLog) -> R) -> R {
        f(&mut *self.undolog.get())
    }

    // --- allocation actions ---

    /// # Safety
    ///
    /// Owner thread only; borrow must not escape `f`.
    pub unsafe fn with_alloc_log<R>(&self, f: impl FnOnce(&mut AllocLog) -> R) -> R {
        f(&mut *self.alloc_actions.get())
    }

    // --- user actions ---

    pub fn push_user_action(&self, on_commit: bool, f: Box<dyn FnOnce()>) {
        unsafe { (*self.user_actions.get()).push(UserAction { on_commit, f }) };
    }

    pub fn user_actions_len(&self) -> usize {
        unsafe { (*self.user_actions.get()).len() }
    }

    /// Runs registered commit actions in registration order and drops the
    /// rest.
    pub fn commit_user_actions(&self) {
        let actions = unsafe { std::mem::take(&mut *self.user_actions.get()) };
        for action in actions {
            if action.on_commit {
                (action.f)();
            }
        }
    }

    /// Runs abort actions registered after `until`, newest first, and drops
    /// everything above the mark.
    pub fn rollback_user_actions(&self, until: usize) {
        let drained: Vec<UserAction> = unsafe {
            let actions = &mut *self.user_actions.get();
            actions.split_off(until)
        };
        for action in drained.into_iter().rev() {
            if !action.on_commit {
                (action.f)();
            }
        }
    }
}

impl Drop for ThreadRecord {
    fn drop(&mut self) {
        let data = *self.tx_data.get_mut();
        if !data.is_null() {
            drop(unsafe { Box::from_raw(data) });
        }
    }
}

impl Debug for ThreadRecord {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ThreadRecord")
            .field("id", &self.id.get())
            .field("nesting", &self.nesting.get())
            .field("state", &self.state.get())
            .finish()
    }
}

// --- global record list ---

struct ListHead {
    head: *mut ThreadRecord,
}

unsafe impl Send for ListHead {}
unsafe impl Sync for ListHead {}

type ListLock = lock_api::RwLock<RwAtomicLock, ListHead>;

static THREAD_LIST: ListLock = lock_api::RwLock::const_new(
    <RwAtomicLock as lock_api::RawRwLock>::INIT,
    ListHead {
        head: ptr::null_mut(),
    },
);

fn register(record: &'static ThreadRecord) {
    let mut list = THREAD_LIST.write();
    record.next.store(list.head, Relaxed);
    list.head = record as *const ThreadRecord as *mut ThreadRecord;
}

fn unregister(record: &ThreadRecord) {
    let mut list = THREAD_LIST.write();
    let target = record as *const ThreadRecord as *mut ThreadRecord;
    if list.head == target {
        list.head = record.next.load(Relaxed);
        return;
    }
    let mut cursor = list.head;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        if entry.next.load(Relaxed) == target {
            entry.next.store(record.next.load(Relaxed), Relaxed);
            return;
        }
        cursor = entry.next.load(Relaxed);
    }
    fatal!("thread record missing from the thread list");
}

/// Walks every other registered record under the list reader lock. The lock
/// is held for the whole walk, so `&TxData` borrows obtained from peers stay
/// valid inside `f`.
pub fn for_each_peer(me: &ThreadRecord, mut f: impl FnMut(&ThreadRecord)) {
    let list = THREAD_LIST.read();
    let mut cursor = list.head;
    while !cursor.is_null() {
        let record = unsafe { &*cursor };
        if !ptr::eq(record, me) {
            f(record);
        }
        cursor = record.next.load(Relaxed);
    }
}

/// Takes the list reader lock for the duration of `f`, without iterating.
/// Used by validation to pin the committing peer's record.
pub fn with_reader_lock<R>(f: impl FnOnce() -> R) -> R {
    let _list = THREAD_LIST.read();
    f()
}

// --- thread-local access ---

struct RecordHandle {
    record: NonNull<ThreadRecord>,
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        let record = unsafe { self.record.as_ref() };
        if record.nesting() != 0 {
            fatal!("thread exited with an active transaction");
        }
        stats::merge_thread(record.counters());
        // Destructor order between thread locals is unspecified.
        let _ = CURRENT.try_with(|current| current.set(ptr::null()));
        unregister(record);
        drop(unsafe { Box::from_raw(self.record.as_ptr()) });
    }
}

thread_local! {
    static CURRENT: Cell<*const ThreadRecord> = Cell::new(ptr::null());
    static HANDLE: Cell<Option<RecordHandle>> = Cell::new(None);
}

/// The calling thread's record, created and registered on first use.
#[inline]
pub fn current() -> &'static ThreadRecord {
    CURRENT.with(|current| {
        let record = current.get();
        if likely!(!record.is_null()) {
            // Records live until the thread's drop hook runs; the runtime
            // never hands this reference to code that outlives the thread.
            unsafe { &*record }
        } else {
            init_record()
        }
    })
}

/// The calling thread's record, if one was ever created.
#[inline]
pub fn current_opt() -> Option<&'static ThreadRecord> {
    CURRENT.with(|current| {
        let record = current.get();
        if record.is_null() {
            None
        } else {
            Some(unsafe { &*record })
        }
    })
}

#[inline(never)]
#[cold]
fn init_record() -> &'static ThreadRecord {
    let record: &'static ThreadRecord = Box::leak(Box::new(ThreadRecord::new()));
    register(record);
    let handle = RecordHandle {
        record: record.into(),
    };
    match HANDLE.try_with(move |slot| slot.set(Some(handle))) {
        Ok(()) => {}
        // No drop hook can be installed anymore, and an unregistered record
        // would dangle in the list.
        Err(_) => fatal!("transactional operation during thread teardown"),
    }
    CURRENT.with(|current| current.set(record));
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_len() -> usize {
        let list = THREAD_LIST.read();
        let mut len = 0;
        let mut cursor = list.head;
        while !cursor.is_null() {
            len += 1;
            cursor = unsafe { (*cursor).next.load(Relaxed) };
        }
        len
    }

    #[test]
    fn record_registers_and_unregisters() {
        crossbeam_utils::thread::scope(|scope| {
            scope
                .spawn(|_| {
                    let record = current();
                    assert_eq!(record.nesting(), 0);
                    let mut seen_self = false;
                    let list = THREAD_LIST.read();
                    let mut cursor = list.head;
                    while !cursor.is_null() {
                        let entry = unsafe { &*cursor };
                        if ptr::eq(entry, record) {
                            seen_self = true;
                        }
                        cursor = entry.next.load(Relaxed);
                    }
                    assert!(seen_self, "record must be registered");
                })
                .join()
                .unwrap();
        })
        .unwrap();

        // Exited threads must not accumulate in the list. Other tests run
        // concurrently, so allow a little churn.
        let before = list_len();
        for _ in 0..32 {
            crossbeam_utils::thread::scope(|scope| {
                scope.spawn(|_| drop(current())).join().unwrap();
            })
            .unwrap();
        }
        let after = list_len();
        assert!(
            after <= before + 8,
            "thread records leaked: {} -> {}",
            before,
            after
        );
    }

    #[test]
    fn id_blocks_are_distinct_across_threads() {
        let a = crossbeam_utils::thread::scope(|scope| {
            scope
                .spawn(|_| {
                    let record = current();
                    record.alloc_id();
                    record.id()
                })
                .join()
                .unwrap()
        })
        .unwrap();
        let b = crossbeam_utils::thread::scope(|scope| {
            scope
                .spawn(|_| {
                    let record = current();
                    record.alloc_id();
                    record.id()
                })
                .join()
                .unwrap()
        })
        .unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[test]
    fn user_actions_run_in_the_right_order() {
        use std::cell::RefCell;
        use std::rc::Rc;

        crossbeam_utils::thread::scope(|scope| {
            let _ = scope.spawn(|_| {
                let record = current();
                let ran: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
                let (r1, r2, r3) = (ran.clone(), ran.clone(), ran.clone());
                record.push_user_action(true, Box::new(move || r1.borrow_mut().push("commit-1")));
                record.push_user_action(false, Box::new(move || r2.borrow_mut().push("abort-1")));
                record.push_user_action(true, Box::new(move || r3.borrow_mut().push("commit-2")));
                record.commit_user_actions();
                assert_eq!(&*ran.borrow(), &["commit-1", "commit-2"]);

                ran.borrow_mut().clear();
                let (r1, r2) = (ran.clone(), ran.clone());
                record.push_user_action(false, Box::new(move || r1.borrow_mut().push("abort-a")));
                record.push_user_action(false, Box::new(move || r2.borrow_mut().push("abort-b")));
                record.rollback_user_actions(0);
                assert_eq!(&*ran.borrow(), &["abort-b", "abort-a"]);
            });
        })
        .unwrap();
    }
}
