//! Closed-nesting checkpoints.
//!
//! Entering a closed-nested transaction snapshots everything an abort of the
//! nest must restore without disturbing the enclosing transaction. The
//! transaction data image lives in [`TxView`]; note that the invalidation
//! flag is excluded from it on purpose.

use crate::{
    internal::{alloc_log::AllocLog, dispatch::Dispatch, tx_data::TxView},
    tx::{CodeProperties, JmpBuf},
};

#[derive(Debug)]
pub struct Checkpoint {
    pub jb: JmpBuf,
    pub alloc_actions: AllocLog,
    pub user_actions_len: usize,
    pub id: u64,
    pub prop: CodeProperties,
    pub cxa_catch_count: u32,
    pub cxa_uncaught_count: u32,
    pub disp: Dispatch,
    /// Nesting depth at which the checkpoint was taken (1 = child of the
    /// outermost transaction).
    pub nesting: u32,
    pub tx_view: Option<TxView>,
    pub undolog_len: usize,
}
