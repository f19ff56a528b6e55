#[macro_use]
pub mod optim;

pub mod alloc_log;
pub mod bloom;
pub mod checkpoint;
pub mod dispatch;
pub mod logs;
pub mod method_group;
pub mod rw_lock;
pub mod thread;
pub mod tx_data;
