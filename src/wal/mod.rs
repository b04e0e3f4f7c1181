//! Write-ahead log: record format, buffered append/flush, and ARIES
//! analysis/redo/undo recovery.

pub mod manager;
pub mod record;
pub mod recovery;

pub use manager::LogManager;
pub use record::{ImageDelta, LogRecord, LogRecordBody, LogRecordType};
pub use recovery::RecoveryMode;
