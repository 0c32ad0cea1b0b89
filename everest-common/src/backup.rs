use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Storage disk ──

/// Where the physical archive of a backup lives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackupDisk {
    /// On the node's own disk, managed by the Wings daemon.
    #[serde(rename = "wings")]
    Wings,
    /// In an S3-compatible bucket.
    #[serde(rename = "s3")]
    S3,
}

impl BackupDisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupDisk::Wings => "wings",
            BackupDisk::S3 => "s3",
        }
    }
}

impl fmt::Display for BackupDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown backup disk: {0}")]
pub struct UnknownDisk(pub String);

impl FromStr for BackupDisk {
    type Err = UnknownDisk;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wings" => Ok(BackupDisk::Wings),
            "s3" => Ok(BackupDisk::S3),
            other => Err(UnknownDisk(other.to_string())),
        }
    }
}

// ── Owning server ──

/// Connection details for the daemon running on a node.
#[derive(Clone, PartialEq, Eq)]
pub struct DaemonNode {
    pub id: i64,
    pub scheme: String,
    pub fqdn: String,
    pub daemon_listen: u16,
    pub daemon_token: String,
}

impl DaemonNode {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.fqdn, self.daemon_listen)
    }
}

// Keep the bearer token out of logs.
impl fmt::Debug for DaemonNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonNode")
            .field("id", &self.id)
            .field("scheme", &self.scheme)
            .field("fqdn", &self.fqdn)
            .field("daemon_listen", &self.daemon_listen)
            .field("daemon_token", &"<redacted>")
            .finish()
    }
}

/// The server a backup belongs to. Its `uuid` namespaces the backup's
/// physical storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRef {
    pub id: i64,
    pub uuid: Uuid,
    pub node: DaemonNode,
}

// ── Backup record ──

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub id: i64,
    /// Addresses the archive on its disk; independent of `id`.
    pub uuid: Uuid,
    pub server: ServerRef,
    pub disk: BackupDisk,
    pub name: String,
    pub checksum: Option<String>,
    pub bytes: u64,
    pub is_locked: bool,
    pub is_successful: bool,
    pub created_at: DateTime<Utc>,
    /// `None` while the backup is running or when it never finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    /// A completed backup that the user explicitly locked. Failed or
    /// unfinished backups are never protected, whatever their lock flag says.
    pub fn is_delete_protected(&self) -> bool {
        self.is_locked && self.is_successful && self.completed_at.is_some()
    }

    pub fn object_key(&self) -> String {
        object_key(self.server.uuid, self.uuid)
    }
}

/// Object key of a backup archive in a bucket.
/// Scheme: `{server_uuid}/{backup_uuid}.tar.gz`
pub fn object_key(server_uuid: impl fmt::Display, backup_uuid: impl fmt::Display) -> String {
    format!("{}/{}.tar.gz", server_uuid, backup_uuid)
}

#[cfg(test)]
pub(crate) fn sample_record() -> BackupRecord {
    BackupRecord {
        id: 1,
        uuid: Uuid::new_v4(),
        server: ServerRef {
            id: 1,
            uuid: Uuid::new_v4(),
            node: DaemonNode {
                id: 1,
                scheme: "https".to_string(),
                fqdn: "node1.example.com".to_string(),
                daemon_listen: 8080,
                daemon_token: "secret-token".to_string(),
            },
        },
        disk: BackupDisk::Wings,
        name: "nightly".to_string(),
        checksum: None,
        bytes: 0,
        is_locked: false,
        is_successful: true,
        created_at: Utc::now(),
        completed_at: Some(Utc::now()),
    }
}
