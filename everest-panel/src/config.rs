use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub database_path: PathBuf,
    /// How long a deletion waits for another one holding the database's
    /// write lock. Must outlast a full remote call.
    #[serde(default = "default_database_busy_timeout_secs")]
    pub database_busy_timeout_secs: u64,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub backups: BackupsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupsConfig {
    #[serde(default)]
    pub s3: Option<S3Settings>,
}

/// `[backups.s3]` section. Credentials fall back to the standard AWS
/// environment variables when omitted.
#[derive(Clone, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_busy_timeout_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl PanelConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let mut config: PanelConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        if let Ok(db_path) = std::env::var("EVEREST_DATABASE_PATH") {
            config.database_path = PathBuf::from(db_path);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.database_path.as_os_str().is_empty() {
            anyhow::bail!("database_path must not be empty");
        }
        self.listen_addr()?;
        if self.http.timeout_secs == 0 || self.http.connect_timeout_secs == 0 {
            anyhow::bail!("http timeouts must be greater than zero");
        }
        let remote_call_secs = self.http.timeout_secs + self.http.connect_timeout_secs;
        if self.database_busy_timeout_secs <= remote_call_secs {
            anyhow::bail!(
                "database_busy_timeout_secs ({}) must exceed the http request and connect timeouts combined",
                self.database_busy_timeout_secs
            );
        }
        if let Some(s3) = &self.backups.s3 {
            if s3.bucket.is_empty() {
                anyhow::bail!("backups.s3.bucket must not be empty");
            }
            if s3.region.is_empty() {
                anyhow::bail!("backups.s3.region must not be empty");
            }
        }
        Ok(())
    }

    pub fn database_busy_timeout(&self) -> Duration {
        Duration::from_secs(self.database_busy_timeout_secs)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen_addr '{}': {}", self.listen_addr, e))
    }
}
