//! The closed set of concurrency-control methods.
//!
//! Each variant is a stateless strategy; all of its state lives in the
//! thread record and the method group. The enum fans the generic
//! load/store/memtransfer/memset contract out to the per-variant modules.

pub mod bfhw;
pub mod irrevocabosw;
pub mod irrevocsw;
pub mod litehw;
pub mod sglsw;
pub mod specsw;

use crate::{
    internal::checkpoint::Checkpoint,
    stats,
    tx::{Error, LsModifier, RestartReason},
};
use core::ptr;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Dispatch {
    SpecSw,
    SglSw,
    IrrevocSw,
    IrrevocAboSw,
    Bfhw,
    LiteHw,
}

impl Dispatch {
    /// Index into the per-dispatch counters.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Dispatch::SpecSw => stats::SPEC_SW,
            Dispatch::SglSw => stats::SGL_SW,
            Dispatch::IrrevocSw => stats::IRREVOC_SW,
            Dispatch::IrrevocAboSw => stats::IRREVOC_ABO_SW,
            Dispatch::Bfhw => stats::BFHW,
            Dispatch::LiteHw => stats::LITE_HW,
        }
    }

    /// Whether the method tolerates running the caller's uninstrumented code
    /// path.
    #[inline]
    pub fn can_run_uninstrumented(self) -> bool {
        matches!(self, Dispatch::SglSw | Dispatch::LiteHw)
    }

    /// Whether the method can undo its effects and restart.
    #[inline]
    pub fn can_restart(self) -> bool {
        matches!(self, Dispatch::SpecSw | Dispatch::Bfhw | Dispatch::LiteHw)
    }

    pub fn begin(self) {
        match self {
            Dispatch::SpecSw => specsw::begin(),
            Dispatch::SglSw => sglsw::begin(),
            Dispatch::IrrevocSw => irrevocsw::begin(),
            Dispatch::IrrevocAboSw => irrevocabosw::begin(),
            Dispatch::Bfhw => bfhw::begin(),
            Dispatch::LiteHw => litehw::begin(),
        }
    }

    pub fn trycommit(self) -> Result<(), RestartReason> {
        match self {
            Dispatch::SpecSw => specsw::trycommit(),
            Dispatch::SglSw => sglsw::trycommit(),
            Dispatch::IrrevocSw => irrevocsw::trycommit(),
            Dispatch::IrrevocAboSw => irrevocabosw::trycommit(),
            Dispatch::Bfhw => bfhw::trycommit(),
            Dispatch::LiteHw => litehw::trycommit(),
        }
    }

    pub fn rollback(self, cp: Option<&Checkpoint>) {
        match self {
            Dispatch::SpecSw => specsw::rollback(cp),
            Dispatch::SglSw => {
                fatal!("a serial irrevocable transaction cannot roll back")
            }
            Dispatch::IrrevocSw => {
                fatal!("an irrevocable transaction cannot roll back")
            }
            Dispatch::IrrevocAboSw => irrevocabosw::rollback(cp),
            Dispatch::Bfhw | Dispatch::LiteHw => {
                fatal!("a hardware transaction cannot roll back")
            }
        }
    }

    /// Consistency check against concurrent committers; used on every
    /// speculative load and when serial access is requested mid-flight.
    pub fn validate(self) -> Result<(), RestartReason> {
        match self {
            Dispatch::SpecSw => specsw::validate(crate::internal::thread::current()),
            _ => Ok(()),
        }
    }

    /// # Safety
    ///
    /// `addr` must be valid for reads of `T`.
    #[inline]
    pub unsafe fn load<T: Copy>(self, addr: *const T, _modifier: LsModifier) -> Result<T, Error> {
        match self {
            Dispatch::SpecSw => specsw::load(addr),
            Dispatch::SglSw
            | Dispatch::IrrevocSw
            | Dispatch::IrrevocAboSw
            | Dispatch::Bfhw
            | Dispatch::LiteHw => Ok(ptr::read(addr)),
        }
    }

    /// # Safety
    ///
    /// `addr` must be valid for writes of `T`.
    #[inline]
    pub unsafe fn store<T: Copy>(
        self,
        addr: *mut T,
        value: T,
        _modifier: LsModifier,
    ) -> Result<(), Error> {
        match self {
            Dispatch::SpecSw => specsw::store(addr, value),
            Dispatch::SglSw | Dispatch::LiteHw => {
                ptr::write(addr, value);
                Ok(())
            }
            Dispatch::IrrevocSw => irrevocsw::store(addr, value),
            Dispatch::IrrevocAboSw => irrevocabosw::store(addr, value),
            Dispatch::Bfhw => bfhw::store(addr, value),
        }
    }

    /// # Safety
    ///
    /// `src` valid for reads and `dst` valid for writes of `len` bytes.
    pub unsafe fn memtransfer(
        self,
        dst: *mut u8,
        src: *const u8,
        len: usize,
        may_overlap: bool,
        dst_modifier: LsModifier,
        src_modifier: LsModifier,
    ) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        match self {
            Dispatch::SpecSw => specsw::memtransfer(dst, src, len, dst_modifier, src_modifier),
            Dispatch::SglSw | Dispatch::LiteHw => {
                copy_raw(dst, src, len, may_overlap);
                Ok(())
            }
            Dispatch::IrrevocSw => irrevocsw::memtransfer(dst, src, len, may_overlap),
            Dispatch::IrrevocAboSw => irrevocabosw::memtransfer(dst, src, len, may_overlap),
            Dispatch::Bfhw => bfhw::memtransfer(dst, src, len, may_overlap),
        }
    }

    /// # Safety
    ///
    /// `dst` must be valid for writes of `len` bytes.
    pub unsafe fn memset(
        self,
        dst: *mut u8,
        c: u8,
        len: usize,
        _modifier: LsModifier,
    ) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        match self {
            Dispatch::SpecSw => specsw::memset(dst, c, len),
            Dispatch::SglSw | Dispatch::LiteHw => {
                ptr::write_bytes(dst, c, len);
                Ok(())
            }
            Dispatch::IrrevocSw => irrevocsw::memset(dst, c, len),
            Dispatch::IrrevocAboSw => irrevocabosw::memset(dst, c, len),
            Dispatch::Bfhw => bfhw::memset(dst, c, len),
        }
    }
}

#[inline]
pub(crate) unsafe fn copy_raw(dst: *mut u8, src: *const u8, len: usize, may_overlap: bool) {
    if may_overlap {
        ptr::copy(src, dst, len);
    } else {
        ptr::copy_nonoverlapping(src, dst, len);
    }
}
