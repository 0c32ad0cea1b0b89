use crate::backup::BackupDisk;

/// Failure reported by a backup storage backend.
///
/// Backends must keep the HTTP status they were answered with so callers can
/// tell an artifact that is already gone apart from one that could not be
/// reached.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("backup archive not found on {disk}")]
    NotFound { disk: BackupDisk },
    #[error("{disk} storage request failed: {message}")]
    Connection {
        disk: BackupDisk,
        status: Option<u16>,
        message: String,
    },
    #[error("no storage adapter configured for disk '{0}'")]
    NotConfigured(BackupDisk),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// HTTP status returned by the backend, if it answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::NotFound { .. } => Some(404),
            StorageError::Connection { status, .. } => *status,
            StorageError::NotConfigured(_) => None,
        }
    }
}
