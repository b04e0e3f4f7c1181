//! Transaction layer: record-level 2PL locking and the transaction table.

pub mod lock;
pub mod transaction;

pub use lock::{LockManager, LockMode, LockRequest, RecordId};
pub use transaction::TransactionManager;
