//! Store state of one file in one replica.
//!
//! ```text
//!            (none)
//!              │ attempt begins
//!              ▼
//!       UPLOAD_STARTED ──────────────┐
//!              │ bytes arrived       │
//!              ▼                     ▼
//!       DATA_UPLOADED ──────────► UPLOAD_FAILED
//!              │ confirmed           │ reingest
//!              ▼                     └──► UPLOAD_STARTED
//!      UPLOAD_COMPLETED
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreState {
    UploadStarted,
    DataUploaded,
    UploadFailed,
    UploadCompleted,
}

impl StoreState {
    pub const ALL: [StoreState; 4] = [
        StoreState::UploadStarted,
        StoreState::DataUploaded,
        StoreState::UploadFailed,
        StoreState::UploadCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreState::UploadStarted => "UPLOAD_STARTED",
            StoreState::DataUploaded => "DATA_UPLOADED",
            StoreState::UploadFailed => "UPLOAD_FAILED",
            StoreState::UploadCompleted => "UPLOAD_COMPLETED",
        }
    }

    /// Completed, or failed until someone re-ingests
    pub fn is_terminal(self) -> bool {
        matches!(self, StoreState::UploadCompleted | StoreState::UploadFailed)
    }

    /// States reachable in one step from `self`. Rewriting the current state
    /// is not a transition and is always accepted by the ledger.
    pub fn successors(self) -> &'static [StoreState] {
        match self {
            StoreState::UploadStarted => &[StoreState::DataUploaded, StoreState::UploadFailed],
            StoreState::DataUploaded => &[StoreState::UploadCompleted, StoreState::UploadFailed],
            StoreState::UploadFailed => &[StoreState::UploadStarted],
            StoreState::UploadCompleted => &[],
        }
    }
}

/// Whether a replica may move from `from` (`None` when it has no state yet)
/// to `to`.
pub fn transition_allowed(from: Option<StoreState>, to: StoreState) -> bool {
    match from {
        None => matches!(to, StoreState::UploadStarted | StoreState::UploadFailed),
        Some(from) if from == to => true,
        Some(from) => from.successors().contains(&to),
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown store state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for StoreState {
    type Err = UnknownState;

    /// Accepts `UPLOAD_FAILED`, `upload_failed` and `upload-failed`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        StoreState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_started_only_uploaded_or_failed() {
        let reachable: Vec<_> = StoreState::ALL
            .into_iter()
            .filter(|&to| to != StoreState::UploadStarted)
            .filter(|&to| transition_allowed(Some(StoreState::UploadStarted), to))
            .collect();
        assert_eq!(
            reachable,
            vec![StoreState::DataUploaded, StoreState::UploadFailed]
        );
    }

    #[test]
    fn test_completed_is_final() {
        for to in StoreState::ALL {
            let allowed = transition_allowed(Some(StoreState::UploadCompleted), to);
            assert_eq!(allowed, to == StoreState::UploadCompleted, "{}", to);
        }
    }

    #[test]
    fn test_failed_restarts_only_through_started() {
        assert!(transition_allowed(
            Some(StoreState::UploadFailed),
            StoreState::UploadStarted
        ));
        assert!(!transition_allowed(
            Some(StoreState::UploadFailed),
            StoreState::DataUploaded
        ));
        assert!(!transition_allowed(
            Some(StoreState::UploadFailed),
            StoreState::UploadCompleted
        ));
    }

    #[test]
    fn test_initial_states() {
        assert!(transition_allowed(None, StoreState::UploadStarted));
        assert!(transition_allowed(None, StoreState::UploadFailed));
        assert!(!transition_allowed(None, StoreState::DataUploaded));
        assert!(!transition_allowed(None, StoreState::UploadCompleted));
    }

    #[test]
    fn test_parse_and_display() {
        for state in StoreState::ALL {
            assert_eq!(state.to_string().parse::<StoreState>().unwrap(), state);
        }
        assert_eq!(
            "upload-failed".parse::<StoreState>().unwrap(),
            StoreState::UploadFailed
        );
        assert!("done".parse::<StoreState>().is_err());
        assert_eq!(
            serde_json::to_string(&StoreState::DataUploaded).unwrap(),
            "\"DATA_UPLOADED\""
        );
    }
}
