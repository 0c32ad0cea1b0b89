pub mod s3;
pub mod wings;

use everest_common::{object_key, BackupDisk, ServerRef, StorageError};
use tracing::info;
use uuid::Uuid;

use crate::config::PanelConfig;
use crate::daemon::DaemonBackupRepository;

use self::s3::{S3Adapter, S3Config};
use self::wings::WingsAdapter;

/// Storage backend for one disk. Adding a disk means adding a variant here
/// and an arm in every match below.
pub enum BackupAdapter<'a> {
    Wings(&'a WingsAdapter),
    S3(&'a S3Adapter),
}

impl BackupAdapter<'_> {
    pub fn disk(&self) -> BackupDisk {
        match self {
            BackupAdapter::Wings(_) => BackupDisk::Wings,
            BackupAdapter::S3(_) => BackupDisk::S3,
        }
    }

    /// Physically remove a backup archive. No retries.
    pub async fn delete(&self, server: &ServerRef, backup_uuid: Uuid) -> Result<(), StorageError> {
        match self {
            BackupAdapter::Wings(adapter) => adapter.delete(server, backup_uuid).await,
            BackupAdapter::S3(adapter) => {
                adapter.delete_object(&object_key(server.uuid, backup_uuid)).await
            }
        }
    }
}

/// Owns the configured adapters and hands them out by disk.
pub struct BackupManager {
    wings: WingsAdapter,
    s3: Option<S3Adapter>,
}

impl BackupManager {
    pub fn new(wings: WingsAdapter, s3: Option<S3Adapter>) -> Self {
        Self { wings, s3 }
    }

    /// Build every adapter the config enables. Wings is always available.
    pub fn from_config(config: &PanelConfig) -> anyhow::Result<Self> {
        let wings = WingsAdapter::new(DaemonBackupRepository::new(&config.http)?);
        let s3 = match &config.backups.s3 {
            Some(settings) => {
                let adapter = S3Adapter::new(S3Config::from_settings(settings)?, &config.http)?;
                info!(bucket = %adapter.bucket(), "S3 backup storage enabled");
                Some(adapter)
            }
            None => None,
        };
        Ok(Self::new(wings, s3))
    }

    pub fn adapter(&self, disk: BackupDisk) -> Result<BackupAdapter<'_>, StorageError> {
        match disk {
            BackupDisk::Wings => Ok(BackupAdapter::Wings(&self.wings)),
            BackupDisk::S3 => self
                .s3
                .as_ref()
                .map(BackupAdapter::S3)
                .ok_or(StorageError::NotConfigured(BackupDisk::S3)),
        }
    }
}
