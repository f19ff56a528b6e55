//! Transaction control: code properties, action masks, restart reasons, and
//! the closure-based transaction driver.
//!
//! A transaction runs as a closure handed a [`Tx`] capability. Transactional
//! accesses return `Result`; an `Err` is the runtime's jump token and must be
//! propagated with `?` immediately. The driver in [`transaction`] re-enters
//! the closure whenever the runtime forces a restart, so the closure body
//! plays the role the saved jump buffer plays for compiled code.

use crate::{
    abi,
    internal::{
        dispatch::Dispatch,
        method_group::method_group,
        thread::{self, STATE_IRREVOCABLE},
    },
};
use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ops::{BitOr, BitOrAssign};

/// The `_ITM_codeProperties` bit set handed to [`abi::begin_transaction`] by
/// the caller, describing the code paths it compiled for this transaction.
#[derive(Copy, Clone, PartialEq, Eq, Default, Hash)]
pub struct CodeProperties(u32);

impl CodeProperties {
    /// An instrumented code path is available.
    pub const INSTRUMENTED_CODE: Self = CodeProperties(0x0001);
    /// An uninstrumented code path is available.
    pub const UNINSTRUMENTED_CODE: Self = CodeProperties(0x0002);
    /// The transaction never calls abort.
    pub const HAS_NO_ABORT: Self = CodeProperties(0x0008);
    /// The transaction always becomes irrevocable.
    pub const DOES_GO_IRREVOCABLE: Self = CodeProperties(0x0040);
    /// Compiled for an undo-logging runtime; not supported here.
    pub const UNDO_LOG_CODE: Self = CodeProperties(0x0400);
    /// The transaction performs no writes.
    pub const READ_ONLY: Self = CodeProperties(0x4000);

    #[inline]
    pub const fn empty() -> Self {
        CodeProperties(0)
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        CodeProperties(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn instrumented_code(self) -> bool {
        self.contains(Self::INSTRUMENTED_CODE)
    }

    #[inline]
    pub fn uninstrumented_code(self) -> bool {
        self.contains(Self::UNINSTRUMENTED_CODE)
    }

    #[inline]
    pub fn has_no_abort(self) -> bool {
        self.contains(Self::HAS_NO_ABORT)
    }

    #[inline]
    pub fn does_go_irrevocable(self) -> bool {
        self.contains(Self::DOES_GO_IRREVOCABLE)
    }

    #[inline]
    pub fn undo_log_code(self) -> bool {
        self.contains(Self::UNDO_LOG_CODE)
    }

    #[inline]
    pub fn read_only(self) -> bool {
        self.contains(Self::READ_ONLY)
    }
}

impl BitOr for CodeProperties {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for CodeProperties {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl Debug for CodeProperties {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "CodeProperties({:#06x})", self.0)
    }
}

/// The action bit set returned by [`abi::begin_transaction`], telling the
/// caller which code path to run and what to do with live variables.
#[derive(Copy, Clone, PartialEq, Eq, Default, Hash)]
pub struct ActionMask(u32);

impl ActionMask {
    pub const RUN_INSTRUMENTED_CODE: Self = ActionMask(0x01);
    pub const RUN_UNINSTRUMENTED_CODE: Self = ActionMask(0x02);
    pub const SAVE_LIVE_VARIABLES: Self = ActionMask(0x04);
    pub const RESTORE_LIVE_VARIABLES: Self = ActionMask(0x08);
    pub const ABORT_TRANSACTION: Self = ActionMask(0x10);

    #[inline]
    pub const fn empty() -> Self {
        ActionMask(0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ActionMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        ActionMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ActionMask {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Debug for ActionMask {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "ActionMask({:#04x})", self.0)
    }
}

/// Why a transaction was forced to restart. Drives the next dispatch choice
/// and is visible in the per-thread counters.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(u32)]
pub enum RestartReason {
    Reallocate = 0,
    LockedRead,
    LockedWrite,
    ValidateRead,
    ValidateWrite,
    ValidateCommit,
    SerialIrr,
    NotReadonly,
    ClosedNesting,
    InitMethodGroup,
    UninstrumentedCodepath,
    TryAgain,
}

impl RestartReason {
    pub const COUNT: usize = 12;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub(crate) fn from_index(index: u32) -> Option<Self> {
        use RestartReason::*;
        Some(match index {
            0 => Reallocate,
            1 => LockedRead,
            2 => LockedWrite,
            3 => ValidateRead,
            4 => ValidateWrite,
            5 => ValidateCommit,
            6 => SerialIrr,
            7 => NotReadonly,
            8 => ClosedNesting,
            9 => InitMethodGroup,
            10 => UninstrumentedCodepath,
            11 => TryAgain,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use RestartReason::*;
        match self {
            Reallocate => "reallocate",
            LockedRead => "locked-read",
            LockedWrite => "locked-write",
            ValidateRead => "validate-read",
            ValidateWrite => "validate-write",
            ValidateCommit => "validate-commit",
            SerialIrr => "serial-irrevocable",
            NotReadonly => "not-readonly",
            ClosedNesting => "closed-nesting",
            InitMethodGroup => "init-method-group",
            UninstrumentedCodepath => "uninstrumented-codepath",
            TryAgain => "try-again",
        }
    }
}

/// Access modifier attached to each transactional load/store by the caller.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum LsModifier {
    /// The source or destination is not transactional memory.
    NonTxnal,
    R,
    RaR,
    RaW,
    RfW,
    W,
    WaR,
    WaW,
}

/// Transactional status of the calling thread.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum HowExecuting {
    Outside,
    Retryable,
    Irrevocable,
}

/// Opaque saved-entry handle passed to [`abi::begin_transaction`].
///
/// Re-entry is performed by the driver loop in [`transaction`]; the handle
/// exists so the begin interface matches what compiled callers pass.
#[derive(Copy, Clone, Default, Debug)]
pub struct JmpBuf {
    _private: (),
}

impl JmpBuf {
    #[inline]
    pub const fn new() -> Self {
        JmpBuf { _private: () }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ErrorKind {
    Restart,
    Abort { outer: bool },
}

/// The runtime's jump token.
///
/// A `Restart` is produced only by the runtime, deep inside a transactional
/// access or a failed commit, after the transaction has already been rolled
/// back and re-begun; the closure must route it back to [`transaction`]
/// immediately with `?`. Performing further transactional work after
/// swallowing one is a logic error. `ABORT` / `ABORT_OUTER` are returned by
/// user code to abort the innermost, respectively outermost, transaction.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Abort the innermost abortable transaction.
    pub const ABORT: Self = Error {
        kind: ErrorKind::Abort { outer: false },
    };

    /// Abort the outermost transaction.
    pub const ABORT_OUTER: Self = Error {
        kind: ErrorKind::Abort { outer: true },
    };

    pub(crate) const RESTART: Self = Error {
        kind: ErrorKind::Restart,
    };

    #[inline]
    pub(crate) fn is_restart(self) -> bool {
        self.kind == ErrorKind::Restart
    }

    #[inline]
    pub(crate) fn is_outer_abort(self) -> bool {
        self.kind == (ErrorKind::Abort { outer: true })
    }
}

impl Debug for Error {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Restart => formatter.pad("Error::RESTART"),
            ErrorKind::Abort { outer: false } => formatter.pad("Error::ABORT"),
            ErrorKind::Abort { outer: true } => formatter.pad("Error::ABORT_OUTER"),
        }
    }
}

/// How a transaction finished.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Outcome<O> {
    Committed(O),
    Aborted,
}

impl<O> Outcome<O> {
    #[inline]
    pub fn committed(self) -> Option<O> {
        match self {
            Outcome::Committed(o) => Some(o),
            Outcome::Aborted => None,
        }
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted)
    }
}

/// Capability to perform transactional memory accesses.
///
/// Neither `Send` nor `Sync`: it stands for the calling thread's active
/// transaction.
pub struct Tx<'env> {
    _not_send: PhantomData<*mut ()>,
    _env: PhantomData<&'env ()>,
}

impl Debug for Tx<'_> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.pad("Tx { .. }")
    }
}

impl<'env> Tx<'env> {
    #[inline]
    fn new() -> Self {
        Tx {
            _not_send: PhantomData,
            _env: PhantomData,
        }
    }

    #[inline]
    fn dispatch(&self) -> Dispatch {
        match thread::current().dispatch() {
            Some(disp) => disp,
            None => fatal!("transactional access outside of a transaction"),
        }
    }

    /// The action mask of the current attempt.
    #[inline]
    pub fn actions(&self) -> ActionMask {
        thread::current().actions()
    }

    /// Transactional load.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads of `T` and remain so for the
    /// transaction's lifetime.
    #[inline]
    pub unsafe fn load<T: Copy>(&self, addr: *const T) -> Result<T, Error> {
        self.dispatch().load(addr, LsModifier::R)
    }

    /// Transactional store.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for writes of `T` and remain so for the
    /// transaction's lifetime.
    #[inline]
    pub unsafe fn store<T: Copy>(&mut self, addr: *mut T, value: T) -> Result<(), Error> {
        self.dispatch().store(addr, value, LsModifier::W)
    }

    /// Transactional `memcpy`; `dst` and `src` must not overlap.
    ///
    /// # Safety
    ///
    /// `src` valid for reads and `dst` valid for writes of `len` bytes, for
    /// the transaction's lifetime.
    #[inline]
    pub unsafe fn memcpy(&mut self, dst: *mut u8, src: *const u8, len: usize) -> Result<(), Error> {
        self.dispatch()
            .memtransfer(dst, src, len, false, LsModifier::W, LsModifier::R)
    }

    /// Transactional `memmove`.
    ///
    /// # Safety
    ///
    /// As [`Tx::memcpy`], overlap allowed.
    #[inline]
    pub unsafe fn memmove(&mut self, dst: *mut u8, src: *const u8, len: usize) -> Result<(), Error> {
        let may_overlap = abi::ranges_overlap(dst as usize, src as usize, len);
        self.dispatch()
            .memtransfer(dst, src, len, may_overlap, LsModifier::W, LsModifier::R)
    }

    /// Transactional `memset`.
    ///
    /// # Safety
    ///
    /// `dst` valid for writes of `len` bytes for the transaction's lifetime.
    #[inline]
    pub unsafe fn memset(&mut self, dst: *mut u8, c: u8, len: usize) -> Result<(), Error> {
        self.dispatch().memset(dst, c, len, LsModifier::W)
    }

    /// Upgrades the transaction to serial-irrevocable mode, restarting it if
    /// it is currently speculative.
    #[inline]
    pub fn set_irrevocable(&mut self) -> Result<(), Error> {
        abi::change_transaction_mode()
    }

    /// True once the transaction is irrevocable.
    #[inline]
    pub fn is_irrevocable(&self) -> bool {
        thread::current().state() & STATE_IRREVOCABLE != 0
    }

    /// Registers a callback to run after the outermost commit.
    #[inline]
    pub fn on_commit(&mut self, f: impl FnOnce() + 'static) {
        thread::current().push_user_action(true, Box::new(f));
    }

    /// Registers a callback to run if the transaction aborts.
    #[inline]
    pub fn on_abort(&mut self, f: impl FnOnce() + 'static) {
        thread::current().push_user_action(false, Box::new(f));
    }

    /// Runs `g` as a nested transaction.
    ///
    /// With [`CodeProperties::HAS_NO_ABORT`] the nest is flattened into this
    /// transaction; without it a checkpoint is taken and `g` may abort
    /// independently, yielding `Ok(Outcome::Aborted)` while this transaction
    /// continues.
    pub fn nested<O>(
        &mut self,
        props: CodeProperties,
        mut g: impl FnMut(&mut Tx<'env>) -> Result<O, Error>,
    ) -> Result<Outcome<O>, Error> {
        let jb = JmpBuf::new();
        let _actions = abi::begin_transaction(props, &jb)?;
        let mut tx = Tx::new();
        match g(&mut tx) {
            Ok(o) => {
                abi::commit_transaction()?;
                Ok(Outcome::Committed(o))
            }
            Err(err) if err.is_restart() || err.is_outer_abort() => Err(err),
            Err(_abort) => {
                abi::abort_transaction(false);
                Ok(Outcome::Aborted)
            }
        }
    }
}

// Unwinding out of an active transaction would otherwise make thread exit
// fatal; tear the transaction down on the way through.
struct PanicGuard;

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            method_group().panic_cleanup();
        }
    }
}

/// Runs `f` as an outermost transaction, retrying it until it commits or
/// aborts.
///
/// The closure is re-entered from the top on every forced restart, possibly
/// under a different concurrency-control method; any state it mutates
/// outside transactional accesses must be re-derivable (the moral equivalent
/// of `saveLiveVariables`).
pub fn transaction<O>(
    props: CodeProperties,
    mut f: impl FnMut(&mut Tx<'_>) -> Result<O, Error>,
) -> Outcome<O> {
    let _guard = PanicGuard;
    let jb = JmpBuf::new();
    match abi::begin_transaction(props, &jb) {
        Ok(_actions) => {}
        // The outermost begin always installs a dispatch.
        Err(_) => fatal!("outermost begin refused to start a transaction"),
    }
    loop {
        let mut tx = Tx::new();
        match f(&mut tx) {
            Ok(o) => match abi::commit_transaction() {
                Ok(()) => return Outcome::Committed(o),
                Err(_restart) => continue,
            },
            Err(err) if err.is_restart() => continue,
            Err(err) => {
                abi::abort_transaction(err.is_outer_abort());
                return Outcome::Aborted;
            }
        }
    }
}

/// Runs `f` as a transaction that never aborts, returning its result.
///
/// Equivalent to [`transaction`] with
/// `INSTRUMENTED_CODE | HAS_NO_ABORT` properties.
pub fn atomic<O>(f: impl FnMut(&mut Tx<'_>) -> Result<O, Error>) -> O {
    let props = CodeProperties::INSTRUMENTED_CODE | CodeProperties::HAS_NO_ABORT;
    match transaction(props, f) {
        Outcome::Committed(o) => o,
        Outcome::Aborted => fatal!("a transaction without abort aborted"),
    }
}

/// Transactional status of the calling thread.
#[inline]
pub fn how_executing() -> HowExecuting {
    method_group().how_executing()
}

/// Identifier of the active transaction, if any.
#[inline]
pub fn transaction_id() -> Option<u64> {
    method_group().transaction_id()
}
