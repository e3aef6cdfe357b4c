//! Settings file for transports, the ledger and the replica set.
//!
//! ```toml
//! [transfer]
//! kind = "session"
//! retries = 3
//!
//! [transfer.session]
//! host = "archive-gw.example.org"
//! port = 8021
//! user = "bitrep"
//! password = "secret"
//!
//! [ledger]
//! path = "/var/lib/bitrep/ledger"
//!
//! [[replicas]]
//! id = "R1"
//! directory = "/mnt/replica-one"
//! ```

use crate::checksum::ChecksumAlgorithm;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which transport variant new transfer handles use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Producer and consumer share a host; bytes are read from disk
    Local,
    /// Content is exposed at an ephemeral URL and pulled by the consumer
    #[default]
    Http,
    /// Content is pushed to a session server and fetched by name
    Session,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transfer: TransferSettings,
    pub ledger: LedgerSettings,
    pub replicas: Vec<ReplicaSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub kind: TransportKind,
    pub use_checksums: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Attempts per remote operation (connect, login, upload, download)
    pub retries: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// Limit on a single remote read/reply
    pub data_timeout_secs: u64,
    /// Limit on one whole per-replica attempt
    pub attempt_timeout_secs: u64,
    pub session: Option<SessionSettings>,
    pub http: HttpSettings,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            use_checksums: true,
            checksum_algorithm: ChecksumAlgorithm::default(),
            retries: 3,
            backoff_min_ms: 1_000,
            backoff_max_ms: 60_000,
            data_timeout_secs: 600,
            attempt_timeout_secs: 6 * 3600,
            session: None,
            http: HttpSettings::default(),
        }
    }
}

impl TransferSettings {
    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Connection parameters for a session server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub host: String,
    #[serde(default = "default_session_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_session_port() -> u16 {
    8021
}

impl SessionSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn masked_password(&self) -> String {
        "*".repeat(self.password.len())
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.masked_password())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Where the registry serves files; port 0 picks an ephemeral port
    pub bind: SocketAddr,
    /// Host name put into URLs; defaults to this machine's host name
    pub advertised_host: Option<String>,
    /// Attempts per download
    pub retries: u32,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertised_host: None,
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// On-disk ledger directory. In-memory when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSettings {
    pub id: String,
    pub directory: PathBuf,
    /// Session server this replica is reached through, if not the default one
    #[serde(default)]
    pub session: Option<SessionSettings>,
}

impl Settings {
    /// Default settings location (~/.config/bitrep/bitrep.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bitrep").join("bitrep.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path`, or from the default location, or fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::load(&p),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.retries == 0 {
            return Err(ConfigError::Invalid(
                "transfer.retries must be at least 1".to_string(),
            ));
        }
        if t.http.retries == 0 {
            return Err(ConfigError::Invalid(
                "transfer.http.retries must be at least 1".to_string(),
            ));
        }
        if t.backoff_min_ms > t.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "transfer.backoff_min_ms ({}) exceeds transfer.backoff_max_ms ({})",
                t.backoff_min_ms, t.backoff_max_ms
            )));
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if replica.id.trim().is_empty() {
                return Err(ConfigError::Invalid("replica id must not be empty".to_string()));
            }
            if !seen.insert(replica.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate replica id '{}'",
                    replica.id
                )));
            }
            if t.kind == TransportKind::Session && t.session.is_none() && replica.session.is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "replica '{}' uses the session transport but no [transfer.session] is configured",
                    replica.id
                )));
            }
        }
        Ok(())
    }
}
