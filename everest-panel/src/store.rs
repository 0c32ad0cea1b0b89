//! Backup metadata backed by SQLite.
//!
//! The database runs in WAL mode and every operation gets its own connection,
//! opened on the blocking pool. Readers never wait on a writer. A
//! [`StoreTransaction`] takes the write lock with `BEGIN IMMEDIATE` and keeps
//! it across awaited network calls, so concurrent writers queue on SQLite's
//! busy timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use everest_common::{BackupDisk, BackupRecord, DaemonNode, ServerRef};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

const SCHEMA: &str = "
    PRAGMA journal_mode=WAL;

    CREATE TABLE IF NOT EXISTS nodes (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        scheme          TEXT NOT NULL DEFAULT 'https',
        fqdn            TEXT NOT NULL,
        daemon_listen   INTEGER NOT NULL DEFAULT 8080,
        daemon_token    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS servers (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid            TEXT NOT NULL UNIQUE,
        node_id         INTEGER NOT NULL REFERENCES nodes (id)
    );

    CREATE TABLE IF NOT EXISTS backups (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid            TEXT NOT NULL UNIQUE,
        server_id       INTEGER NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        disk            TEXT NOT NULL,
        name            TEXT NOT NULL,
        checksum        TEXT,
        bytes           INTEGER NOT NULL DEFAULT 0,
        is_locked       INTEGER NOT NULL DEFAULT 0,
        is_successful   INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL,
        completed_at    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_backups_server ON backups (server_id, created_at);
";

const SELECT_BACKUP: &str = "
    SELECT b.id, b.uuid, b.disk, b.name, b.checksum, b.bytes, b.is_locked,
           b.is_successful, b.created_at, b.completed_at,
           s.id, s.uuid,
           n.id, n.scheme, n.fqdn, n.daemon_listen, n.daemon_token
    FROM backups b
    JOIN servers s ON s.id = b.server_id
    JOIN nodes n ON n.id = s.node_id";

/// One page of a server's backups.
#[derive(Debug, Clone)]
pub struct BackupPage {
    pub items: Vec<BackupRecord>,
    pub total: u64,
    /// Backups counting against the server's limit: successful or still running.
    pub backup_count: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Clone)]
pub struct BackupStore {
    path: Arc<PathBuf>,
    busy_timeout: Duration,
    #[cfg(test)]
    _dir: Option<Arc<tempfile::TempDir>>,
}

impl BackupStore {
    /// Create the schema if needed. `busy_timeout` bounds how long a writer
    /// waits for another writer's transaction to finish.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let store = Self {
            path: Arc::new(path.to_path_buf()),
            busy_timeout,
            #[cfg(test)]
            _dir: None,
        };
        store.connect()?.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Opened panel database");
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(self.path.as_path())?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    /// Run `f` on a fresh connection without blocking the runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = store.connect()?;
            f(&conn)
        })
        .await?
    }

    /// Cheap round trip for health checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    pub async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>, StoreError> {
        self.with_conn(move |conn| Ok(query_backup_by_id(conn, id)?)).await
    }

    /// Look up a backup through its owning server, the way the client API
    /// addresses it.
    pub async fn find_backup(
        &self,
        server_uuid: Uuid,
        backup_uuid: Uuid,
    ) -> Result<Option<BackupRecord>, StoreError> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!("{SELECT_BACKUP} WHERE s.uuid = ?1 AND b.uuid = ?2"),
                    params![server_uuid.to_string(), backup_uuid.to_string()],
                    backup_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Newest first. `page` is 1-based; a page past the addressable range is
    /// returned empty.
    pub async fn list_backups(
        &self,
        server_uuid: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<BackupPage, StoreError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let offset = (page - 1)
            .checked_mul(per_page)
            .and_then(|offset| i64::try_from(offset).ok());
        let server = server_uuid.to_string();

        self.with_conn(move |conn| {
            let (total, backup_count): (i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN b.is_successful = 1 OR b.completed_at IS NULL
                                          THEN 1 ELSE 0 END), 0)
                 FROM backups b JOIN servers s ON s.id = b.server_id
                 WHERE s.uuid = ?1",
                params![server],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let items = match offset {
                Some(offset) => {
                    let mut stmt = conn.prepare(&format!(
                        "{SELECT_BACKUP} WHERE s.uuid = ?1 ORDER BY b.created_at DESC, b.id DESC
                         LIMIT ?2 OFFSET ?3"
                    ))?;
                    let rows = stmt
                        .query_map(params![server, per_page as i64, offset], backup_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => Vec::new(),
            };

            Ok(BackupPage {
                items,
                total: total as u64,
                backup_count: backup_count as u64,
                page,
                per_page,
            })
        })
        .await
    }

    /// Flip `is_locked` in a single statement and return the new value.
    /// `None` if no such backup exists.
    pub async fn toggle_locked(&self, id: i64) -> Result<Option<bool>, StoreError> {
        self.with_conn(move |conn| {
            let locked = conn
                .query_row(
                    "UPDATE backups SET is_locked = NOT is_locked WHERE id = ?1 RETURNING is_locked",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(locked)
        })
        .await
    }

    /// Start a write transaction on a dedicated connection. Waits up to the
    /// busy timeout for another writer to finish.
    pub async fn begin(&self) -> Result<StoreTransaction, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || -> Result<StoreTransaction, StoreError> {
            let conn = store.connect()?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(StoreTransaction { conn, open: true })
        })
        .await?
    }
}

/// An open write transaction. Dropping it without calling
/// [`StoreTransaction::commit`] rolls every change back.
pub struct StoreTransaction {
    conn: Connection,
    open: bool,
}

impl StoreTransaction {
    pub fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>, StoreError> {
        Ok(query_backup_by_id(&self.conn, id)?)
    }

    /// Returns whether a row was removed.
    pub fn delete_backup(&self, id: i64) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.open = false;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            // A failed COMMIT can leave the transaction open.
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.open = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}

fn query_backup_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<BackupRecord>> {
    conn.query_row(
        &format!("{SELECT_BACKUP} WHERE b.id = ?1"),
        params![id],
        backup_from_row,
    )
    .optional()
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let disk: String = row.get(2)?;
    let completed_at: Option<String> = row.get(9)?;
    let bytes: i64 = row.get(5)?;
    let daemon_listen: i64 = row.get(15)?;

    Ok(BackupRecord {
        id: row.get(0)?,
        uuid: parse_uuid(row, 1)?,
        disk: disk
            .parse::<BackupDisk>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        name: row.get(3)?,
        checksum: row.get(4)?,
        bytes: bytes.max(0) as u64,
        is_locked: row.get(6)?,
        is_successful: row.get(7)?,
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        completed_at: completed_at
            .map(|ts| parse_timestamp(9, &ts))
            .transpose()?,
        server: ServerRef {
            id: row.get(10)?,
            uuid: parse_uuid(row, 11)?,
            node: DaemonNode {
                id: row.get(12)?,
                scheme: row.get(13)?,
                fqdn: row.get(14)?,
                daemon_listen: u16::try_from(daemon_listen).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(15, Type::Integer, Box::new(e))
                })?,
                daemon_token: row.get(16)?,
            },
        },
    })
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ── Fixtures ──────────────────────────────────────────────────────────────────
// Nodes, servers and backups are created by other parts of the panel; tests
// need a way to seed them.

#[cfg(test)]
pub struct NewBackup {
    pub uuid: Uuid,
    pub disk: BackupDisk,
    pub is_locked: bool,
    pub is_successful: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
impl NewBackup {
    pub fn completed(disk: BackupDisk) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            disk,
            is_locked: false,
            is_successful: true,
            completed_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
impl BackupStore {
    /// A store in a fresh temporary directory, removed when the last clone
    /// is dropped.
    pub fn open_temporary() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Self::open(&dir.path().join("panel.db"), Duration::from_secs(5)).unwrap();
        Self {
            _dir: Some(Arc::new(dir)),
            ..store
        }
    }

    pub async fn insert_node(&self, scheme: &str, fqdn: &str, port: u16, token: &str) -> i64 {
        let conn = self.connect().unwrap();
        conn.execute(
            "INSERT INTO nodes (scheme, fqdn, daemon_listen, daemon_token) VALUES (?1, ?2, ?3, ?4)",
            params![scheme, fqdn, port, token],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    pub async fn insert_server(&self, node_id: i64, uuid: Uuid) -> i64 {
        let conn = self.connect().unwrap();
        conn.execute(
            "INSERT INTO servers (uuid, node_id) VALUES (?1, ?2)",
            params![uuid.to_string(), node_id],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    pub async fn insert_backup(&self, server_id: i64, new: NewBackup) -> BackupRecord {
        let id = {
            let conn = self.connect().unwrap();
            conn.execute(
                "INSERT INTO backups (uuid, server_id, disk, name, bytes, is_locked,
                                      is_successful, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, 1024, ?5, ?6, ?7, ?8)",
                params![
                    new.uuid.to_string(),
                    server_id,
                    new.disk.as_str(),
                    format!("Backup at {}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
                    new.is_locked,
                    new.is_successful,
                    Utc::now().to_rfc3339(),
                    new.completed_at.map(|ts| ts.to_rfc3339()),
                ],
            )
            .unwrap();
            conn.last_insert_rowid()
        };
        self.get_backup(id).await.unwrap().unwrap()
    }

    pub async fn set_locked(&self, id: i64, locked: bool) {
        self.connect()
            .unwrap()
            .execute(
                "UPDATE backups SET is_locked = ?1 WHERE id = ?2",
                params![locked, id],
            )
            .unwrap();
    }

    pub async fn count_backups(&self) -> i64 {
        self.connect()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM backups", [], |row| row.get(0))
            .unwrap()
    }
}
