use std::sync::Arc;
use std::time::Instant;

use crate::backend::BackupManager;
use crate::services::delete_backup::DeleteBackupService;
use crate::store::BackupStore;

/// Shared application state
pub struct AppState {
    pub store: BackupStore,
    pub delete_backups: DeleteBackupService,
    /// Server startup time for uptime calculation
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: BackupStore, manager: Arc<BackupManager>) -> Self {
        Self {
            delete_backups: DeleteBackupService::new(store.clone(), manager),
            store,
            started_at: Instant::now(),
        }
    }
}
