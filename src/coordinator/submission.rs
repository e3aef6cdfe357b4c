use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CoordinatorError;
use crate::ledger::{ReplicaId, StoreState};

/// Latest known state per targeted replica
pub type Progress = BTreeMap<ReplicaId, StoreState>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReport {
    pub filename: String,
    pub token: String,
    pub states: Progress,
}

impl SubmissionReport {
    pub fn is_complete(&self) -> bool {
        self.states
            .values()
            .all(|s| *s == StoreState::UploadCompleted)
    }

    pub fn failed(&self) -> Vec<ReplicaId> {
        self.states
            .iter()
            .filter(|(_, s)| **s != StoreState::UploadCompleted)
            .map(|(r, _)| r.clone())
            .collect()
    }

    fn into_result(self) -> Result<Self, CoordinatorError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(CoordinatorError::Failed {
                filename: self.filename.clone(),
                replicas: self.failed().iter().map(ToString::to_string).collect(),
            })
        }
    }
}

fn settled(targets: &BTreeSet<ReplicaId>, progress: &Progress) -> bool {
    targets
        .iter()
        .all(|r| progress.get(r).is_some_and(|s| s.is_terminal()))
}

/// Caller's view of a submitted file.
#[derive(Debug)]
pub struct Submission {
    token: String,
    filename: String,
    targets: BTreeSet<ReplicaId>,
    progress: watch::Receiver<Progress>,
    cancel: CancellationToken,
}

impl Submission {
    /// Correlation token, also recorded in the ledger's reply marker
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn targets(&self) -> &BTreeSet<ReplicaId> {
        &self.targets
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// Abandon the outstanding attempts. Their transfer handles are still
    /// cleaned up; the ledger keeps the last recorded states.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn report(&mut self) -> Option<SubmissionReport> {
        let progress = self.progress.borrow_and_update();
        settled(&self.targets, &progress).then(|| SubmissionReport {
            filename: self.filename.clone(),
            token: self.token.clone(),
            states: progress.clone(),
        })
    }

    /// Wait until every targeted replica is completed or failed. Succeeds
    /// only when all of them completed.
    pub async fn wait(&mut self) -> Result<SubmissionReport, CoordinatorError> {
        loop {
            if let Some(report) = self.report() {
                return report.into_result();
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(CoordinatorError::Cancelled(self.filename.clone()));
                }
                changed = self.progress.changed() => {
                    if changed.is_err() {
                        return match self.report() {
                            Some(report) => report.into_result(),
                            None => Err(CoordinatorError::Shutdown),
                        };
                    }
                }
            }
        }
    }
}

/// Coordinator-side bookkeeping for one submission
#[derive(Debug)]
pub(crate) struct Tracker {
    pub(crate) token: String,
    pub(crate) filename: String,
    pub(crate) targets: BTreeSet<ReplicaId>,
    pub(crate) cancel: CancellationToken,
    /// Owns a reply marker to consume on completion
    pub(crate) reply: bool,
    progress: watch::Sender<Progress>,
    finished: AtomicBool,
}

impl Tracker {
    pub(crate) fn new(
        token: String,
        filename: String,
        progress: Progress,
        cancel: CancellationToken,
        reply: bool,
    ) -> Arc<Self> {
        let targets = progress.keys().cloned().collect();
        let (tx, _) = watch::channel(progress);
        Arc::new(Self {
            token,
            filename,
            targets,
            cancel,
            reply,
            progress: tx,
            finished: AtomicBool::new(false),
        })
    }

    pub(crate) fn submission(&self) -> Submission {
        Submission {
            token: self.token.clone(),
            filename: self.filename.clone(),
            targets: self.targets.clone(),
            progress: self.progress.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    pub(crate) fn update(&self, replica: &ReplicaId, state: StoreState) {
        if self.targets.contains(replica) {
            self.progress.send_modify(|p| {
                p.insert(replica.clone(), state);
            });
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        settled(&self.targets, &self.progress.borrow())
    }

    /// True exactly once, for the caller that gets to finish the submission
    pub(crate) fn claim_finish(&self) -> bool {
        self.is_settled() && !self.finished.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn failed(&self) -> Vec<ReplicaId> {
        self.progress
            .borrow()
            .iter()
            .filter(|(_, s)| **s == StoreState::UploadFailed)
            .map(|(r, _)| r.clone())
            .collect()
    }
}
