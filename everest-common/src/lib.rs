//! Backup metadata types and storage conventions shared by Everest services.

pub mod backup;
pub mod storage;

pub use backup::{object_key, BackupDisk, BackupRecord, DaemonNode, ServerRef};
pub use storage::StorageError;
