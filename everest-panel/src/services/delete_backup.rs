use std::sync::Arc;

use everest_common::{BackupDisk, BackupRecord, StorageError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{BackupAdapter, BackupManager};
use crate::store::{BackupStore, StoreError, StoreTransaction};

#[derive(Debug, thiserror::Error)]
pub enum DeletionError {
    #[error("Cannot delete a backup that is marked as locked")]
    Locked,
    #[error("Backup {0} no longer exists")]
    NotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Backup metadata transaction failed: {0}")]
    Transaction(#[from] StoreError),
    #[error("Backup deletion task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Removes a backup's archive from its disk together with its metadata row.
///
/// Both happen inside one store transaction, so the row only disappears when
/// the archive is gone as well (or was never there).
#[derive(Clone)]
pub struct DeleteBackupService {
    store: BackupStore,
    manager: Arc<BackupManager>,
}

impl DeleteBackupService {
    pub fn new(store: BackupStore, manager: Arc<BackupManager>) -> Self {
        Self { store, manager }
    }

    /// Run [`Self::handle`] on its own task. Dropping the returned future
    /// (a client hanging up) does not interrupt the deletion, so a remote
    /// delete that was already sent is always followed by its commit.
    pub async fn handle_detached(&self, backup: BackupRecord) -> Result<(), DeletionError> {
        let service = self.clone();
        tokio::spawn(async move { service.handle(&backup).await }).await?
    }

    pub async fn handle(&self, backup: &BackupRecord) -> Result<(), DeletionError> {
        let tx = self.store.begin().await?;

        // Act on the current row, not the caller's copy: the lock may have
        // changed, or a concurrent request may already have removed it.
        let backup = tx
            .get_backup(backup.id)?
            .ok_or(DeletionError::NotFound(backup.uuid))?;

        // A failed or unfinished backup is deletable even when locked. Marking
        // a backup failed clears its lock, so that combination should not
        // occur anyway.
        if backup.is_delete_protected() {
            return Err(DeletionError::Locked);
        }

        let result = match self.manager.adapter(backup.disk) {
            Ok(adapter) => match adapter.disk() {
                BackupDisk::S3 => self.delete_from_s3(tx, &adapter, &backup).await,
                BackupDisk::Wings => self.delete_from_daemon(tx, &adapter, &backup).await,
            },
            Err(e) => Err(e.into()),
        };

        match &result {
            Ok(()) => {
                info!(backup = %backup.uuid, server = %backup.server.uuid, disk = %backup.disk, "Backup deleted");
            }
            Err(e) => {
                error!(backup = %backup.uuid, server = %backup.server.uuid, disk = %backup.disk, error = %e, "Backup deletion failed");
            }
        }
        result
    }

    /// The row goes first. If the bucket refuses the delete, the transaction
    /// is rolled back and the row comes back.
    async fn delete_from_s3(
        &self,
        tx: StoreTransaction,
        adapter: &BackupAdapter<'_>,
        backup: &BackupRecord,
    ) -> Result<(), DeletionError> {
        tx.delete_backup(backup.id)?;

        if let Err(e) = adapter.delete(&backup.server, backup.uuid).await {
            tx.rollback()?;
            return Err(e.into());
        }

        tx.commit()?;
        Ok(())
    }

    /// The daemon must confirm the archive is gone before the row is removed.
    async fn delete_from_daemon(
        &self,
        tx: StoreTransaction,
        adapter: &BackupAdapter<'_>,
        backup: &BackupRecord,
    ) -> Result<(), DeletionError> {
        match adapter.delete(&backup.server, backup.uuid).await {
            Ok(()) => {}
            // Don't fail the request if the daemon no longer has the archive,
            // just drop our reference to it as well.
            Err(e) if e.is_not_found() => {
                warn!(backup = %backup.uuid, server = %backup.server.uuid, "Daemon has no archive for backup, removing record only");
            }
            Err(e) => return Err(e.into()),
        }

        tx.delete_backup(backup.id)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::s3::{S3Adapter, S3Config};
    use crate::backend::wings::WingsAdapter;
    use crate::config::HttpConfig;
    use crate::daemon::DaemonBackupRepository;
    use crate::store::NewBackup;
    use crate::test_support::{seeded_store, spawn_stub, unused_port, Stub, StubResponse};
    use std::time::Duration;
    use chrono::{TimeZone, Utc};

    fn service(store: &BackupStore, s3: Option<&Stub>) -> DeleteBackupService {
        let http = HttpConfig::default();
        let wings = WingsAdapter::new(DaemonBackupRepository::new(&http).unwrap());
        let s3 = s3.map(|stub| {
            S3Adapter::new(
                S3Config {
                    bucket: "backups".to_string(),
                    region: "us-east-1".to_string(),
                    endpoint: Some(stub.url()),
                    access_key_id: "AKID".to_string(),
                    secret_access_key: "secret".to_string(),
                },
                &http,
            )
            .unwrap()
        });
        DeleteBackupService::new(store.clone(), Arc::new(BackupManager::new(wings, s3)))
    }

    #[tokio::test]
    async fn test_locked_backup_is_not_deleted() {
        let daemon = spawn_stub(StubResponse::status(204)).await;
        let (store, server, _) = seeded_store(daemon.port()).await;
        let backup = store
            .insert_backup(
                server,
                NewBackup {
                    is_locked: true,
                    completed_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                    ..NewBackup::completed(BackupDisk::Wings)
                },
            )
            .await;

        let err = service(&store, None).handle(&backup).await.unwrap_err();

        assert!(matches!(err, DeletionError::Locked));
        assert_eq!(store.count_backups().await, 1);
        assert!(daemon.hits().is_empty());
    }

    #[tokio::test]
    async fn test_locked_s3_backup_is_not_deleted() {
        let bucket = spawn_stub(StubResponse::status(204)).await;
        let (store, server, _) = seeded_store(1).await;
        let backup = store
            .insert_backup(
                server,
                NewBackup {
                    is_locked: true,
                    ..NewBackup::completed(BackupDisk::S3)
                },
            )
            .await;

        let err = service(&store, Some(&bucket)).handle(&backup).await.unwrap_err();

        assert!(matches!(err, DeletionError::Locked));
        assert!(store.get_backup(backup.id).await.unwrap().is_some());
        assert!(bucket.hits().is_empty());
    }

    #[tokio::test]
    async fn test_failed_backup_is_deleted_even_if_locked() {
        let daemon = spawn_stub(StubResponse::status(204)).await;
        let (store, server, _) = seeded_store(daemon.port()).await;
        let failed = store
            .insert_backup(
                server,
                NewBackup {
                    is_locked: true,
                    is_successful: false,
                    ..NewBackup::completed(BackupDisk::Wings)
                },
            )
            .await;
        let unfinished = store
            .insert_backup(
                server,
                NewBackup {
                    is_locked: true,
                    completed_at: None,
                    ..NewBackup::completed(BackupDisk::Wings)
                },
            )
            .await;

        let service = service(&store, None);
        service.handle(&failed).await.unwrap();
        service.handle(&unfinished).await.unwrap();

        assert_eq!(store.count_backups().await, 0);
        assert_eq!(daemon.hits().len(), 2);
    }

    #[tokio::test]
    async fn test_lock_is_reread_from_store() {
        let daemon = spawn_stub(StubResponse::status(204)).await;
        let (store, server, _) = seeded_store(daemon.port()).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;

        // Locked after the caller loaded its copy.
        store.set_locked(backup.id, true).await;
        let err = service(&store, None).handle(&backup).await.unwrap_err();

        assert!(matches!(err, DeletionError::Locked));
        assert!(daemon.hits().is_empty());
    }

    #[tokio::test]
    async fn test_s3_backup_deleted_with_object() {
        let bucket = spawn_stub(StubResponse::status(204)).await;
        let (store, server, server_uuid) = seeded_store(1).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::S3))
            .await;

        service(&store, Some(&bucket)).handle(&backup).await.unwrap();

        assert!(store.get_backup(backup.id).await.unwrap().is_none());
        let hits = bucket.hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].method, "DELETE");
        assert_eq!(
            hits[0].path,
            format!("/backups/{}/{}.tar.gz", server_uuid, backup.uuid)
        );
    }

    #[tokio::test]
    async fn test_s3_failure_rolls_back_record() {
        let bucket = spawn_stub(StubResponse::status(500)).await;
        let (store, server, _) = seeded_store(1).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::S3))
            .await;

        let err = service(&store, Some(&bucket)).handle(&backup).await.unwrap_err();

        match err {
            DeletionError::Storage(e) => assert_eq!(e.status(), Some(500)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.get_backup(backup.id).await.unwrap().is_some());
        assert_eq!(bucket.hits().len(), 1);
    }

    #[tokio::test]
    async fn test_s3_not_configured_keeps_record() {
        let (store, server, _) = seeded_store(1).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::S3))
            .await;

        let err = service(&store, None).handle(&backup).await.unwrap_err();

        assert!(matches!(
            err,
            DeletionError::Storage(StorageError::NotConfigured(BackupDisk::S3))
        ));
        assert!(store.get_backup(backup.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_daemon_backup_deleted() {
        let daemon = spawn_stub(StubResponse::status(204)).await;
        let (store, server, server_uuid) = seeded_store(daemon.port()).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;

        service(&store, None).handle(&backup).await.unwrap();

        assert!(store.get_backup(backup.id).await.unwrap().is_none());
        let hits = daemon.hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].path,
            format!("/api/servers/{}/backup/{}", server_uuid, backup.uuid)
        );
    }

    #[tokio::test]
    async fn test_daemon_not_found_still_removes_record() {
        let daemon = spawn_stub(StubResponse::status(404)).await;
        let (store, server, _) = seeded_store(daemon.port()).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;

        service(&store, None).handle(&backup).await.unwrap();

        assert!(store.get_backup(backup.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_daemon_failure_keeps_record() {
        for status in [400, 401, 500, 502] {
            let daemon = spawn_stub(StubResponse::status(status)).await;
            let (store, server, _) = seeded_store(daemon.port()).await;
            let backup = store
                .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
                .await;

            let err = service(&store, None).handle(&backup).await.unwrap_err();

            match err {
                DeletionError::Storage(e) => assert_eq!(e.status(), Some(status)),
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(store.get_backup(backup.id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_unreachable_daemon_keeps_record() {
        let (store, server, _) = seeded_store(unused_port().await).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;

        let err = service(&store, None).handle(&backup).await.unwrap_err();

        assert!(matches!(
            err,
            DeletionError::Storage(StorageError::Connection { status: None, .. })
        ));
        assert_eq!(store.count_backups().await, 1);
    }

    #[tokio::test]
    async fn test_second_delete_sees_missing_record() {
        let daemon = spawn_stub(StubResponse::status(204)).await;
        let (store, server, _) = seeded_store(daemon.port()).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;
        let service = service(&store, None);

        service.handle(&backup).await.unwrap();
        let err = service.handle(&backup).await.unwrap_err();

        assert!(matches!(err, DeletionError::NotFound(uuid) if uuid == backup.uuid));
        assert_eq!(daemon.hits().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deletes_issue_one_remote_call() {
        let daemon = spawn_stub(StubResponse::status(204)).await;
        let (store, server, _) = seeded_store(daemon.port()).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;
        let service = service(&store, None);

        let (first, second) = tokio::join!(service.handle(&backup), service.handle(&backup));

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(DeletionError::NotFound(_)))));
        assert_eq!(daemon.hits().len(), 1);
        assert_eq!(store.count_backups().await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_undo_s3_delete() {
        let bucket = spawn_stub(StubResponse::delayed(204, Duration::from_millis(500))).await;
        let (store, server, _) = seeded_store(1).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::S3))
            .await;
        let service = service(&store, Some(&bucket));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            service.handle_detached(backup.clone()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(bucket.hits().len(), 1);

        // The deletion carries on without its caller and commits.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(store.get_backup(backup.id).await.unwrap().is_none());
        assert_eq!(bucket.hits().len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_undo_daemon_delete() {
        let daemon = spawn_stub(StubResponse::delayed(204, Duration::from_millis(500))).await;
        let (store, server, _) = seeded_store(daemon.port()).await;
        let backup = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;
        let service = service(&store, None);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            service.handle_detached(backup.clone()),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(store.get_backup(backup.id).await.unwrap().is_none());
        assert_eq!(daemon.hits().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_node_does_not_block_readers() {
        let daemon = spawn_stub(StubResponse::delayed(204, Duration::from_millis(800))).await;
        let (store, server, server_uuid) = seeded_store(daemon.port()).await;
        let slow = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;
        let other = store
            .insert_backup(server, NewBackup::completed(BackupDisk::Wings))
            .await;
        let service = service(&store, None);

        let in_flight = tokio::spawn({
            let service = service.clone();
            async move { service.handle(&slow).await }
        });
        while daemon.hits().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let timeout = Duration::from_millis(300);
        tokio::time::timeout(timeout, store.ping()).await.unwrap().unwrap();
        let page = tokio::time::timeout(timeout, store.list_backups(server_uuid, 1, 20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.total, 2);
        let found = tokio::time::timeout(timeout, store.find_backup(server_uuid, other.uuid))
            .await
            .unwrap()
            .unwrap();
        assert!(found.is_some());

        in_flight.await.unwrap().unwrap();
        assert_eq!(store.count_backups().await, 1);
    }
}
