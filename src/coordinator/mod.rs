//! Ingestion coordinator.
//!
//! `submit` records the file in the ledger, marks every targeted replica
//! `UPLOAD_STARTED` and returns. Each replica then gets its own task: build a
//! transfer handle for that replica's transport, let the replica take the
//! bytes, clean the handle up. A successful store moves the replica to
//! `DATA_UPLOADED`; the replica's confirmation on the bus, checked against the
//! ledger's checksum, settles it as `UPLOAD_COMPLETED` or `UPLOAD_FAILED`.
//!
//! Replicas never wait on each other and a failure in one never touches
//! another. Failed replicas stay failed until someone calls `reingest`.

mod submission;

pub use submission::{Progress, Submission, SubmissionReport};

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::bus::{BusEvent, MessageBus, Subscription};
use crate::checksum::{checksum_file, Checksum};
use crate::config::{SessionSettings, TransportKind};
use crate::error::{CoordinatorError, Error, LedgerError, Result, TransferError};
use crate::ledger::{ReplicaId, ReplicaLedger, ReplyInfo, StoreState};
use crate::replica::ReplicaSink;
use crate::transfer::{TransferFactory, TransferHandle, TransferOptions};
use submission::Tracker;

/// A replica together with the transport used to reach it
#[derive(Clone)]
pub struct ReplicaTarget {
    pub sink: Arc<dyn ReplicaSink>,
    pub kind: TransportKind,
    pub session: Option<SessionSettings>,
}

impl ReplicaTarget {
    pub fn new(sink: Arc<dyn ReplicaSink>, kind: TransportKind) -> Self {
        Self {
            sink,
            kind,
            session: None,
        }
    }

    pub fn with_session(mut self, session: Option<SessionSettings>) -> Self {
        self.session = session;
        self
    }
}

impl std::fmt::Debug for ReplicaTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaTarget")
            .field("id", self.sink.id())
            .field("kind", &self.kind)
            .field("session", &self.session)
            .finish()
    }
}

enum AttemptOutcome {
    Stored,
    Failed(Error),
    Cancelled,
}

struct Shared {
    ledger: Arc<ReplicaLedger>,
    bus: Arc<dyn MessageBus>,
    factory: TransferFactory,
    replicas: BTreeMap<ReplicaId, ReplicaTarget>,
    trackers: Mutex<HashMap<String, Arc<Tracker>>>,
    sources: Mutex<HashMap<String, PathBuf>>,
    admissions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    root: CancellationToken,
    tasks: TaskTracker,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct IngestionCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("replicas", &self.shared.replicas.keys().collect::<Vec<_>>())
            .field("pending", &self.shared.trackers.lock().len())
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish()
    }
}

fn file_name_of(path: &Path) -> std::result::Result<String, TransferError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::Source {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
        })
}

impl IngestionCoordinator {
    /// Build the coordinator and start consuming bus events. Must be called
    /// from within a tokio runtime.
    pub fn start(
        ledger: Arc<ReplicaLedger>,
        bus: Arc<dyn MessageBus>,
        factory: TransferFactory,
        targets: Vec<ReplicaTarget>,
    ) -> Self {
        let replicas = targets
            .into_iter()
            .map(|t| (t.sink.id().clone(), t))
            .collect();
        let events = bus.subscribe();
        let coordinator = Self {
            shared: Arc::new(Shared {
                ledger,
                bus,
                factory,
                replicas,
                trackers: Mutex::new(HashMap::new()),
                sources: Mutex::new(HashMap::new()),
                admissions: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                tasks: TaskTracker::new(),
                running: AtomicBool::new(true),
            }),
        };
        let this = coordinator.clone();
        coordinator
            .shared
            .tasks
            .spawn(async move { this.event_loop(events).await });
        let ids: Vec<&str> = coordinator.shared.replicas.keys().map(ReplicaId::as_str).collect();
        tracing::info!(replicas = ?ids, "ingestion coordinator started");
        coordinator
    }

    pub fn ledger(&self) -> &Arc<ReplicaLedger> {
        &self.shared.ledger
    }

    pub fn factory(&self) -> &TransferFactory {
        &self.shared.factory
    }

    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        self.shared.replicas.keys().cloned().collect()
    }

    /// Number of submissions still waiting for a decision
    pub fn pending(&self) -> usize {
        self.shared.trackers.lock().len()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinatorError::Shutdown.into())
        }
    }

    fn resolve_targets(&self, filename: &str, replicas: &[ReplicaId]) -> Result<BTreeSet<ReplicaId>> {
        if replicas.is_empty() {
            return Err(CoordinatorError::NoReplicas(filename.to_string()).into());
        }
        replicas
            .iter()
            .map(|r| {
                if self.shared.replicas.contains_key(r) {
                    Ok(r.clone())
                } else {
                    Err(Error::from(CoordinatorError::UnknownReplica(r.to_string())))
                }
            })
            .collect()
    }

    async fn verified_checksum(&self, path: &Path, filename: &str) -> Result<(Checksum, u64)> {
        let source_error = |source| TransferError::Source {
            path: path.to_path_buf(),
            source,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(source_error)?;
        let algorithm = self.shared.factory.settings().checksum_algorithm;
        let checksum = checksum_file(algorithm, path).await.map_err(source_error)?;
        if self.shared.ledger.has_entry(filename)? {
            let recorded = self.shared.ledger.get_checksum(filename)?;
            if recorded != checksum {
                return Err(CoordinatorError::ChecksumMismatch {
                    filename: filename.to_string(),
                    expected: recorded.to_string(),
                    actual: checksum.to_string(),
                }
                .into());
            }
        }
        Ok((checksum, metadata.len()))
    }

    /// Preserve `path` in `replicas`.
    ///
    /// Returns once the ledger holds the entry and every replica is marked
    /// started; the transfers run in the background.
    pub async fn submit(&self, path: &Path, replicas: &[ReplicaId]) -> Result<Submission> {
        self.submit_request(path, replicas, None, None).await
    }

    /// [`submit`](Self::submit) for an external request that announced its
    /// own checksum and where to send the decision.
    ///
    /// Requests for the same filename are admitted one at a time, so a
    /// repeated request sees the first one's ledger entry and is refused with
    /// `InProgress` while that one is in flight.
    pub async fn submit_request(
        &self,
        path: &Path,
        replicas: &[ReplicaId],
        announced: Option<Checksum>,
        reply_to: Option<String>,
    ) -> Result<Submission> {
        self.ensure_running()?;
        let filename = file_name_of(path)?;
        let targets = self.resolve_targets(&filename, replicas)?;

        let lock = Arc::clone(
            self.shared
                .admissions
                .lock()
                .entry(filename.clone())
                .or_default(),
        );
        let guard = lock.lock_owned().await;
        let admitted = self.admit(path, &filename, targets, announced, reply_to).await;
        drop(guard);
        self.shared
            .admissions
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        let (tracker, size, to_start) = admitted?;

        let submission = tracker.submission();
        tracing::info!(
            filename = %tracker.filename,
            token = %tracker.token,
            size,
            "submitted for ingestion"
        );
        self.launch(&tracker, path, size, to_start).await;
        self.finish_if_settled(&tracker);
        Ok(submission)
    }

    /// Record the submission in the ledger and mark the replicas to transfer
    /// as started.
    async fn admit(
        &self,
        path: &Path,
        filename: &str,
        targets: BTreeSet<ReplicaId>,
        announced: Option<Checksum>,
        reply_to: Option<String>,
    ) -> Result<(Arc<Tracker>, u64, Vec<ReplicaId>)> {
        let (checksum, size) = self.verified_checksum(path, filename).await?;
        if let Some(announced) = announced {
            if announced != checksum {
                return Err(CoordinatorError::ChecksumMismatch {
                    filename: filename.to_string(),
                    expected: announced.to_string(),
                    actual: checksum.to_string(),
                }
                .into());
            }
        }

        let ledger = &self.shared.ledger;
        let in_progress = |replica: &str, state: StoreState| -> Error {
            CoordinatorError::InProgress {
                filename: filename.to_string(),
                replica: replica.to_string(),
                state: state.to_string(),
            }
            .into()
        };
        let token = Uuid::new_v4().to_string();
        let reply = ReplyInfo::new(token.clone(), reply_to);
        if ledger.has_entry(filename)? {
            for replica in &targets {
                match ledger.get_state(filename, replica) {
                    Ok(state @ (StoreState::UploadStarted | StoreState::DataUploaded)) => {
                        return Err(in_progress(replica.as_str(), state));
                    }
                    Ok(_) | Err(LedgerError::NoState { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            ledger.set_reply_info(filename, reply)?;
        } else {
            match ledger.add_entry(filename, Some(reply), checksum.clone()) {
                Ok(()) => {}
                // Another process sharing the ledger got there first
                Err(LedgerError::Conflict(_)) => {
                    let recorded = ledger.get_checksum(filename)?;
                    if recorded != checksum {
                        return Err(CoordinatorError::ChecksumMismatch {
                            filename: filename.to_string(),
                            expected: recorded.to_string(),
                            actual: checksum.to_string(),
                        }
                        .into());
                    }
                    let first = targets.iter().next().map(ReplicaId::as_str).unwrap_or_default();
                    return Err(in_progress(first, StoreState::UploadStarted));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.shared
            .sources
            .lock()
            .insert(filename.to_string(), path.to_path_buf());

        let mut progress = Progress::new();
        let mut to_start = Vec::new();
        for replica in targets {
            if let Ok(StoreState::UploadCompleted) = ledger.get_state(filename, &replica) {
                tracing::debug!("'{}' is already preserved in {}", filename, replica);
                progress.insert(replica, StoreState::UploadCompleted);
                continue;
            }
            ledger.set_state(filename, &replica, StoreState::UploadStarted)?;
            progress.insert(replica.clone(), StoreState::UploadStarted);
            to_start.push(replica);
        }

        let tracker = self.track(token, filename.to_string(), progress, true);
        Ok((tracker, size, to_start))
    }

    /// Administrative retry of a failed replica, using the path the file was
    /// submitted from.
    pub async fn reingest(&self, filename: &str, replica: &ReplicaId) -> Result<Submission> {
        let path = self
            .shared
            .sources
            .lock()
            .get(filename)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownSource(filename.to_string()))?;
        self.reingest_from(&path, replica).await
    }

    /// Administrative retry of a failed replica from `path`. Only valid while
    /// the replica is `UPLOAD_FAILED`.
    pub async fn reingest_from(&self, path: &Path, replica: &ReplicaId) -> Result<Submission> {
        self.ensure_running()?;
        let filename = file_name_of(path)?;
        let targets = self.resolve_targets(&filename, std::slice::from_ref(replica))?;
        let ledger = &self.shared.ledger;

        let not_reingestable = |state: String| CoordinatorError::NotReingestable {
            filename: filename.clone(),
            replica: replica.to_string(),
            state,
        };
        let state = match ledger.get_state(&filename, replica) {
            Ok(state) => state,
            Err(LedgerError::NotFound(_) | LedgerError::NoState { .. }) => {
                return Err(not_reingestable("(none)".into()).into())
            }
            Err(e) => return Err(e.into()),
        };
        if state != StoreState::UploadFailed {
            return Err(not_reingestable(state.to_string()).into());
        }
        let (_, size) = self.verified_checksum(path, &filename).await?;
        if !ledger.set_state_if(
            &filename,
            replica,
            StoreState::UploadFailed,
            StoreState::UploadStarted,
        )? {
            let now = ledger.get_state(&filename, replica)?;
            return Err(not_reingestable(now.to_string()).into());
        }
        self.shared
            .sources
            .lock()
            .insert(filename.clone(), path.to_path_buf());

        let progress: Progress = targets
            .into_iter()
            .map(|r| (r, StoreState::UploadStarted))
            .collect();
        let tracker = self.track(Uuid::new_v4().to_string(), filename, progress, false);
        let submission = tracker.submission();
        tracing::info!("Re-ingesting '{}' into {}", tracker.filename, replica);
        self.launch(&tracker, path, size, vec![replica.clone()]).await;
        self.finish_if_settled(&tracker);
        Ok(submission)
    }

    fn track(&self, token: String, filename: String, progress: Progress, reply: bool) -> Arc<Tracker> {
        let tracker = Tracker::new(token, filename, progress, self.shared.root.child_token(), reply);
        self.shared
            .trackers
            .lock()
            .insert(tracker.token.clone(), Arc::clone(&tracker));
        tracker
    }

    async fn launch(&self, tracker: &Arc<Tracker>, path: &Path, size: u64, replicas: Vec<ReplicaId>) {
        if size == 0 {
            for replica in replicas {
                self.settle_empty(tracker, path, &replica).await;
            }
            return;
        }
        for replica in replicas {
            let this = self.clone();
            let tracker = Arc::clone(tracker);
            let path = path.to_path_buf();
            self.shared.tasks.spawn(async move {
                this.run_attempt(&tracker, &path, &replica).await;
            });
        }
    }

    /// Zero-length files need no transport: the replica writes an empty file
    /// and the states are recorded on the spot.
    async fn settle_empty(&self, tracker: &Tracker, path: &Path, replica: &ReplicaId) {
        let filename = &tracker.filename;
        let stored = match self.shared.replicas.get(replica) {
            Some(target) => {
                let options = TransferOptions::from_settings(self.shared.factory.settings());
                match self
                    .shared
                    .factory
                    .create_with(path, options, target.kind, target.session.as_ref())
                    .await
                {
                    Ok(handle) => target.sink.store(&handle).await,
                    Err(e) => Err(e),
                }
            }
            None => return,
        };
        if let Err(e) = stored {
            self.fail(filename, replica, &e.to_string());
            return;
        }
        let ledger = &self.shared.ledger;
        let settled = ledger
            .set_state_if(filename, replica, StoreState::UploadStarted, StoreState::DataUploaded)
            .and_then(|_| {
                ledger.set_state_if(
                    filename,
                    replica,
                    StoreState::DataUploaded,
                    StoreState::UploadCompleted,
                )
            });
        match settled {
            Ok(true) => self.settled(filename, replica, StoreState::UploadCompleted),
            Ok(false) => tracing::debug!("'{}' in {} moved on concurrently", filename, replica),
            Err(e) => tracing::warn!("Cannot record empty '{}' in {}: {}", filename, replica, e),
        }
    }

    async fn run_attempt(&self, tracker: &Tracker, path: &Path, replica: &ReplicaId) {
        let filename = &tracker.filename;
        match self.attempt(tracker, path, replica).await {
            AttemptOutcome::Stored => {
                match self.shared.ledger.set_state_if(
                    filename,
                    replica,
                    StoreState::UploadStarted,
                    StoreState::DataUploaded,
                ) {
                    Ok(_) => tracing::debug!(
                        "'{}' uploaded to {}, awaiting confirmation",
                        filename,
                        replica
                    ),
                    Err(e) => tracing::warn!("Cannot record upload of '{}' to {}: {}", filename, replica, e),
                }
            }
            AttemptOutcome::Failed(e) => {
                tracing::warn!("Ingestion of '{}' into {} failed: {}", filename, replica, e);
                self.fail(filename, replica, &e.to_string());
            }
            AttemptOutcome::Cancelled => {
                tracing::info!(
                    "Ingestion of '{}' into {} cancelled; ledger left as recorded",
                    filename,
                    replica
                );
                self.shared.trackers.lock().remove(&tracker.token);
                self.release_source(filename);
            }
        }
    }

    /// One transfer attempt for one replica. The handle is cleaned up however
    /// the attempt ends.
    async fn attempt(&self, tracker: &Tracker, path: &Path, replica: &ReplicaId) -> AttemptOutcome {
        let Some(target) = self.shared.replicas.get(replica) else {
            return AttemptOutcome::Failed(CoordinatorError::UnknownReplica(replica.to_string()).into());
        };
        let settings = self.shared.factory.settings();
        let deadline = Instant::now() + settings.attempt_timeout();
        let timed_out = || -> Error {
            TransferError::Timeout {
                name: tracker.filename.clone(),
                secs: settings.attempt_timeout_secs,
            }
            .into()
        };
        let expected = match self.shared.ledger.get_checksum(&tracker.filename) {
            Ok(c) => c,
            Err(e) => return AttemptOutcome::Failed(e.into()),
        };

        let options = TransferOptions::from_settings(settings);
        let created = tokio::select! {
            biased;
            _ = tracker.cancel.cancelled() => return AttemptOutcome::Cancelled,
            created = tokio::time::timeout_at(
                deadline,
                self.shared.factory.create_with(path, options, target.kind, target.session.as_ref()),
            ) => created,
        };
        let handle: TransferHandle = match created {
            Err(_) => return AttemptOutcome::Failed(timed_out()),
            Ok(Err(e)) => return AttemptOutcome::Failed(e.into()),
            Ok(Ok(handle)) => handle,
        };
        if let Some(actual) = handle.checksum() {
            if *actual != expected {
                handle.cleanup().await;
                return AttemptOutcome::Failed(
                    TransferError::Integrity {
                        name: tracker.filename.clone(),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    }
                    .into(),
                );
            }
        }

        let stored = tokio::select! {
            biased;
            _ = tracker.cancel.cancelled() => None,
            stored = tokio::time::timeout_at(deadline, target.sink.store(&handle)) => Some(stored),
        };
        handle.cleanup().await;
        match stored {
            None => AttemptOutcome::Cancelled,
            Some(Err(_)) => AttemptOutcome::Failed(timed_out()),
            Some(Ok(Err(e))) => {
                if let Some(last) = handle.last_error() {
                    tracing::debug!("Last transport error for '{}': {}", tracker.filename, last);
                }
                AttemptOutcome::Failed(e.into())
            }
            Some(Ok(Ok(()))) => AttemptOutcome::Stored,
        }
    }

    fn fail(&self, filename: &str, replica: &ReplicaId, reason: &str) {
        match self
            .shared
            .ledger
            .set_state(filename, replica, StoreState::UploadFailed)
        {
            Ok(_) => {
                tracing::warn!(replica = %replica, "'{}' failed: {}", filename, reason);
                self.settled(filename, replica, StoreState::UploadFailed);
            }
            Err(e) => tracing::warn!("Cannot mark '{}' failed in {}: {}", filename, replica, e),
        }
    }

    /// Publish a terminal state and let the waiting submissions know.
    fn settled(&self, filename: &str, replica: &ReplicaId, state: StoreState) {
        self.shared.bus.publish(BusEvent::StoreOutcome {
            filename: filename.to_string(),
            replica: replica.clone(),
            state,
        });
        let trackers: Vec<_> = self
            .shared
            .trackers
            .lock()
            .values()
            .filter(|t| t.filename == filename && t.targets.contains(replica))
            .cloned()
            .collect();
        for tracker in trackers {
            tracker.update(replica, state);
            self.finish_if_settled(&tracker);
        }
    }

    fn finish_if_settled(&self, tracker: &Tracker) {
        if !tracker.claim_finish() {
            return;
        }
        self.shared.trackers.lock().remove(&tracker.token);
        self.release_source(&tracker.filename);
        let failed = tracker.failed();
        if tracker.reply {
            match self.shared.ledger.remove_reply_info(&tracker.filename) {
                Ok(reply) => self.shared.bus.publish(BusEvent::StoreReply {
                    filename: tracker.filename.clone(),
                    token: reply.token,
                    reply_to: reply.reply_to,
                    failed: failed.clone(),
                }),
                Err(LedgerError::NoReplyInfo(_)) => {
                    tracing::debug!("Reply for '{}' was already sent", tracker.filename)
                }
                Err(e) => tracing::warn!("Cannot take reply for '{}': {}", tracker.filename, e),
            }
        }
        if failed.is_empty() {
            tracing::info!("'{}' is preserved in every targeted replica", tracker.filename);
        } else {
            tracing::warn!(
                "'{}' failed in {}",
                tracker.filename,
                failed.iter().map(ReplicaId::as_str).collect::<Vec<_>>().join(", ")
            );
        }
    }

    /// Forget where `filename` came from once no replica is left failed and no
    /// submission for it is pending. A failed replica keeps the path around
    /// for `reingest`.
    fn release_source(&self, filename: &str) {
        if self
            .shared
            .trackers
            .lock()
            .values()
            .any(|t| t.filename == filename)
        {
            return;
        }
        let failed = match self.shared.ledger.get_entry(filename) {
            Ok(entry) => entry.states.values().any(|s| *s == StoreState::UploadFailed),
            Err(LedgerError::NotFound(_)) => false,
            Err(e) => {
                tracing::debug!("Keeping source of '{}': {}", filename, e);
                return;
            }
        };
        if !failed {
            self.shared.sources.lock().remove(filename);
        }
    }

    fn confirm(&self, filename: &str, replica: &ReplicaId, checksum: &Checksum) -> std::result::Result<(), LedgerError> {
        let ledger = &self.shared.ledger;
        let mut state = match ledger.get_state(filename, replica) {
            Ok(state) => state,
            Err(LedgerError::NotFound(_) | LedgerError::NoState { .. }) => {
                tracing::debug!("Ignoring confirmation of unknown '{}' from {}", filename, replica);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        // The confirmation may overtake the attempt's own DATA_UPLOADED write
        if state == StoreState::UploadStarted {
            ledger.set_state_if(filename, replica, StoreState::UploadStarted, StoreState::DataUploaded)?;
            state = ledger.get_state(filename, replica)?;
        }
        if state != StoreState::DataUploaded {
            tracing::debug!("Ignoring confirmation of '{}' from {} in state {}", filename, replica, state);
            return Ok(());
        }

        let expected = ledger.get_checksum(filename)?;
        if *checksum == expected {
            if ledger.set_state_if(
                filename,
                replica,
                StoreState::DataUploaded,
                StoreState::UploadCompleted,
            )? {
                self.settled(filename, replica, StoreState::UploadCompleted);
            }
        } else {
            tracing::warn!(
                "Checksums of '{}' do not match in {}! Should be {} but was {}",
                filename,
                replica,
                expected,
                checksum
            );
            self.fail(filename, replica, "replica checksum differs from the ledger");
        }
        Ok(())
    }

    fn reject(&self, filename: &str, replica: &ReplicaId, reason: &str) {
        match self.shared.ledger.get_state(filename, replica) {
            Ok(StoreState::UploadStarted | StoreState::DataUploaded) => {
                self.fail(filename, replica, reason)
            }
            Ok(state) => tracing::debug!("Ignoring rejection of '{}' from {} in state {}", filename, replica, state),
            Err(e) => tracing::debug!("Ignoring rejection of '{}' from {}: {}", filename, replica, e),
        }
    }

    async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::ReplicaConfirmed {
                filename,
                replica,
                checksum,
            } => {
                if let Err(e) = self.confirm(&filename, &replica, &checksum) {
                    tracing::error!("Cannot settle '{}' in {}: {}", filename, replica, e);
                }
            }
            BusEvent::ReplicaRejected {
                filename,
                replica,
                reason,
            } => self.reject(&filename, &replica, &reason),
            BusEvent::StoreRequested {
                path,
                checksum,
                replicas,
                reply_to,
            } => {
                let this = self.clone();
                self.shared.tasks.spawn(async move {
                    match this
                        .submit_request(&path, &replicas, checksum, reply_to.clone())
                        .await
                    {
                        Ok(submission) => {
                            tracing::debug!(token = submission.token(), "accepted store request")
                        }
                        // At-least-once delivery: the first copy of the request answers
                        Err(Error::Coordinator(e @ CoordinatorError::InProgress { .. })) => {
                            tracing::debug!("Duplicate store request for {}: {}", path.display(), e)
                        }
                        Err(e) => {
                            tracing::warn!("Rejected store request for {}: {}", path.display(), e);
                            this.shared.bus.publish(BusEvent::StoreReply {
                                filename: file_name_of(&path).unwrap_or_default(),
                                token: Uuid::new_v4().to_string(),
                                reply_to,
                                failed: replicas,
                            });
                        }
                    }
                });
            }
            BusEvent::StoreOutcome { .. } | BusEvent::StoreReply { .. } => {}
        }
    }

    async fn event_loop(&self, mut events: Subscription) {
        loop {
            tokio::select! {
                _ = self.shared.root.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("coordinator event loop stopped");
    }

    /// Stop accepting work, cancel outstanding attempts and wait for every
    /// task to finish its cleanup.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.root.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.shared.sources.lock().clear();
        tracing::info!("ingestion coordinator stopped");
    }
}
