//! Error taxonomy for transfers, the replica ledger and the coordinator.

use std::path::PathBuf;
use thiserror::Error;

use crate::ledger::StoreState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while moving bytes between producer and replica.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {server} after {attempts} attempts: {message}")]
    Connect {
        server: String,
        attempts: u32,
        message: String,
    },

    #[error("Login to {server} as '{user}' rejected: {message}")]
    Login {
        server: String,
        user: String,
        message: String,
    },

    #[error("Remote error {code}: '{message}'")]
    Remote { code: u16, message: String },

    #[error("HTTP transfer of {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer of '{name}' timed out after {secs}s")]
    Timeout { name: String, secs: u64 },

    #[error("Checksums of '{name}' do not match! Should be {expected} but was {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Transfer handle for '{0}' has already been consumed")]
    Consumed(String),

    #[error("'{0}' is not readable on this host")]
    NotLocal(String),

    #[error("Destination '{dest}' is not writable for '{name}'")]
    InvalidDestination { dest: PathBuf, name: String },

    #[error("Transport not configured: {0}")]
    NotConfigured(String),

    #[error("Cannot read source file {path}: {source}")]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl TransferError {
    /// Whether a failed operation may be attempted again within the same
    /// transfer attempt. Integrity failures are a corruption signal and never
    /// qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Io(_)
                | TransferError::Connect { .. }
                | TransferError::Login { .. }
                | TransferError::Remote { .. }
                | TransferError::Http { .. }
                | TransferError::Protocol(_)
                | TransferError::Timeout { .. }
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, TransferError::Integrity { .. })
    }
}

/// Failures reported by the replica ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger already has an entry for '{0}'")]
    Conflict(String),

    #[error("Ledger has no entry for '{0}'")]
    NotFound(String),

    #[error("No pending reply for '{0}'")]
    NoReplyInfo(String),

    #[error("No store state for '{filename}' in replica '{replica}'")]
    NoState { filename: String, replica: String },

    #[error("Illegal store state change for '{filename}' in replica '{replica}': {from} -> {to}")]
    InvalidTransition {
        filename: String,
        replica: String,
        from: String,
        to: StoreState,
    },

    #[error("Ledger is closed")]
    Closed,

    #[error("Ledger storage error: {0}")]
    Storage(String),

    #[error("Corrupt ledger record for '{key}': {source}")]
    Codec {
        key: String,
        source: serde_json::Error,
    },
}

impl From<fjall::Error> for LedgerError {
    fn from(e: fjall::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// Failures of the ingestion coordinator itself.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unknown replica '{0}'")]
    UnknownReplica(String),

    #[error("No replicas targeted for '{0}'")]
    NoReplicas(String),

    #[error("'{filename}' cannot be re-ingested into '{replica}' from state {state}")]
    NotReingestable {
        filename: String,
        replica: String,
        state: String,
    },

    #[error("'{filename}' is already being ingested into '{replica}' ({state})")]
    InProgress {
        filename: String,
        replica: String,
        state: String,
    },

    #[error("Source of '{0}' is unknown; re-ingest it from a path")]
    UnknownSource(String),

    #[error("Checksum of '{filename}' is {actual}, expected {expected}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("'{filename}' failed in replicas: {}", .replicas.join(", "))]
    Failed {
        filename: String,
        replicas: Vec<String>,
    },

    #[error("Submission of '{0}' was cancelled")]
    Cancelled(String),

    #[error("Coordinator has shut down")]
    Shutdown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_is_never_retryable() {
        let err = TransferError::Integrity {
            name: "capture-001.warc".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_integrity());
        assert!(err.to_string().contains("Should be aa but was bb"));
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        let err = TransferError::Remote {
            code: 550,
            message: "no such blob".to_string(),
        };
        assert!(err.is_retryable());
        assert!(TransferError::Timeout {
            name: "x".into(),
            secs: 1
        }
        .is_retryable());
        assert!(!TransferError::Consumed("x".into()).is_retryable());
    }

    #[test]
    fn test_failed_lists_replicas() {
        let err = CoordinatorError::Failed {
            filename: "f".into(),
            replicas: vec!["R1".into(), "R2".into()],
        };
        assert_eq!(err.to_string(), "'f' failed in replicas: R1, R2");
    }
}
