//! Client for the Wings daemon's backup endpoints.
//!
//! Every backup call is scoped to one server: bind with
//! [`DaemonBackupRepository::set_server`] first, then issue the request.

use everest_common::{BackupDisk, ServerRef, StorageError};
use reqwest::{Client, StatusCode};
use tracing::debug;
use uuid::Uuid;

use crate::config::HttpConfig;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Daemon responded with HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Could not reach daemon: {0}")]
    Transport(#[from] reqwest::Error),
}

impl DaemonError {
    /// Status code the daemon answered with. `None` when it never answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DaemonError::Status { status, .. } => Some(*status),
            DaemonError::Transport(e) => e.status(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

impl From<DaemonError> for StorageError {
    fn from(e: DaemonError) -> Self {
        if e.is_not_found() {
            return StorageError::NotFound {
                disk: BackupDisk::Wings,
            };
        }
        StorageError::Connection {
            disk: BackupDisk::Wings,
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct DaemonBackupRepository {
    client: Client,
}

impl DaemonBackupRepository {
    pub fn new(config: &HttpConfig) -> Result<Self, DaemonError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client })
    }

    pub fn set_server<'a>(&'a self, server: &'a ServerRef) -> ScopedDaemonClient<'a> {
        ScopedDaemonClient {
            client: &self.client,
            server,
        }
    }
}

/// Daemon client bound to a single server.
pub struct ScopedDaemonClient<'a> {
    client: &'a Client,
    server: &'a ServerRef,
}

impl ScopedDaemonClient<'_> {
    fn backup_url(&self, backup_uuid: Uuid) -> String {
        format!(
            "{}/api/servers/{}/backup/{}",
            self.server.node.base_url().trim_end_matches('/'),
            self.server.uuid,
            backup_uuid
        )
    }

    /// Ask the daemon to remove a backup archive from the node's disk.
    pub async fn delete(&self, backup_uuid: Uuid) -> Result<(), DaemonError> {
        let url = self.backup_url(backup_uuid);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.server.node.daemon_token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DaemonError::Status { status, body });
        }

        debug!(server = %self.server.uuid, backup = %backup_uuid, "Daemon backup delete complete");
        Ok(())
    }
}
