//! Backups kept on the node's own disk, removed through the Wings daemon.

use everest_common::{ServerRef, StorageError};
use uuid::Uuid;

use crate::daemon::DaemonBackupRepository;

pub struct WingsAdapter {
    daemon: DaemonBackupRepository,
}

impl WingsAdapter {
    pub fn new(daemon: DaemonBackupRepository) -> Self {
        Self { daemon }
    }

    /// The daemon resolves the archive path itself; only the identities are sent.
    pub async fn delete(&self, server: &ServerRef, backup_uuid: Uuid) -> Result<(), StorageError> {
        self.daemon
            .set_server(server)
            .delete(backup_uuid)
            .await
            .map_err(StorageError::from)
    }
}
