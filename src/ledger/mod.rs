//! The replica ledger: per file, the authoritative checksum, a pending reply
//! marker and one store state per replica.
//!
//! Each entry is one JSON record under `entry/<filename>`, so every operation
//! is a single-key read-modify-write. Operations on one filename are
//! serialized through a per-key lock; different filenames never wait on each
//! other.

pub mod state;
pub mod store;

pub use state::{transition_allowed, StoreState};
pub use store::{FjallStore, KvStore, MemoryStore};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::config::LedgerSettings;
use crate::error::LedgerError;

const ENTRY_PREFIX: &str = "entry/";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A pending external request waiting for a store decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyInfo {
    /// Correlation token handed back to the requester
    pub token: String,
    /// Where the decision is to be reported
    pub reply_to: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl ReplyInfo {
    pub fn new(token: impl Into<String>, reply_to: Option<String>) -> Self {
        Self {
            token: token.into(),
            reply_to,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub checksum: Checksum,
    #[serde(default)]
    pub reply: Option<ReplyInfo>,
    #[serde(default)]
    pub states: BTreeMap<ReplicaId, StoreState>,
    pub updated: DateTime<Utc>,
}

/// Who authorised an administrative change, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAction {
    pub operator: String,
    pub reason: String,
}

impl AdminAction {
    pub fn new(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

pub struct ReplicaLedger {
    store: Box<dyn KvStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl fmt::Debug for ReplicaLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaLedger")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn entry_key(filename: &str) -> String {
    format!("{}{}", ENTRY_PREFIX, filename)
}

impl ReplicaLedger {
    pub fn with_store(store: Box<dyn KvStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_store(Box::new(MemoryStore::new()))
    }

    /// On disk when `settings.path` is set, in memory otherwise.
    pub fn open(settings: &LedgerSettings) -> Result<Self, LedgerError> {
        match &settings.path {
            Some(path) => {
                std::fs::create_dir_all(path).map_err(|e| {
                    LedgerError::Storage(format!("Cannot create {}: {}", path.display(), e))
                })?;
                Ok(Self::with_store(Box::new(FjallStore::open(path)?)))
            }
            None => Ok(Self::in_memory()),
        }
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LedgerError::Closed);
        }
        Ok(())
    }

    /// Run `f` while holding the lock for `filename`.
    fn with_key_lock<T>(&self, filename: &str, f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(filename.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let result = {
            let _guard = lock.lock();
            f()
        };
        let mut locks = self.locks.lock();
        drop(lock);
        if locks
            .get(filename)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(filename);
        }
        result
    }

    fn load(&self, filename: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let key = entry_key(filename);
        match self.store.get(&key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| LedgerError::Codec { key, source }),
            None => Ok(None),
        }
    }

    fn load_existing(&self, filename: &str) -> Result<LedgerEntry, LedgerError> {
        self.load(filename)?
            .ok_or_else(|| LedgerError::NotFound(filename.to_string()))
    }

    fn save(&self, filename: &str, entry: &mut LedgerEntry) -> Result<(), LedgerError> {
        let key = entry_key(filename);
        entry.updated = Utc::now();
        let bytes = serde_json::to_vec(entry).map_err(|source| LedgerError::Codec {
            key: key.clone(),
            source,
        })?;
        self.store.put(&key, &bytes)
    }

    /// Locked read-modify-write of an existing entry
    fn update<T>(
        &self,
        filename: &str,
        f: impl FnOnce(&mut LedgerEntry) -> Result<(T, bool), LedgerError>,
    ) -> Result<T, LedgerError> {
        self.ensure_open()?;
        self.with_key_lock(filename, || {
            let mut entry = self.load_existing(filename)?;
            let (out, dirty) = f(&mut entry)?;
            if dirty {
                self.save(filename, &mut entry)?;
            }
            Ok(out)
        })
    }

    pub fn has_entry(&self, filename: &str) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        Ok(self.store.get(&entry_key(filename))?.is_some())
    }

    pub fn get_entry(&self, filename: &str) -> Result<LedgerEntry, LedgerError> {
        self.ensure_open()?;
        self.load_existing(filename)
    }

    /// Create the entry for `filename`. An existing entry is never touched.
    pub fn add_entry(
        &self,
        filename: &str,
        reply: Option<ReplyInfo>,
        checksum: Checksum,
    ) -> Result<(), LedgerError> {
        self.ensure_open()?;
        self.with_key_lock(filename, || {
            if self.load(filename)?.is_some() {
                return Err(LedgerError::Conflict(filename.to_string()));
            }
            let mut entry = LedgerEntry {
                checksum,
                reply,
                states: BTreeMap::new(),
                updated: Utc::now(),
            };
            self.save(filename, &mut entry)?;
            tracing::debug!(filename, checksum = %entry.checksum, "added ledger entry");
            Ok(())
        })
    }

    pub fn get_checksum(&self, filename: &str) -> Result<Checksum, LedgerError> {
        Ok(self.get_entry(filename)?.checksum)
    }

    /// Replace the recorded checksum. This can hide real corruption, so it
    /// takes an explicit [`AdminAction`] and is written to the audit log.
    /// Returns the previous checksum.
    pub fn set_checksum(
        &self,
        filename: &str,
        checksum: Checksum,
        action: &AdminAction,
    ) -> Result<Checksum, LedgerError> {
        self.update(filename, |entry| {
            let previous = std::mem::replace(&mut entry.checksum, checksum.clone());
            tracing::warn!(
                target: "bitrep::audit",
                filename,
                operator = %action.operator,
                reason = %action.reason,
                previous = %previous,
                checksum = %checksum,
                "checksum overridden"
            );
            Ok((previous, true))
        })
    }

    pub fn has_reply_info(&self, filename: &str) -> Result<bool, LedgerError> {
        Ok(self.get_entry(filename)?.reply.is_some())
    }

    pub fn set_reply_info(&self, filename: &str, reply: ReplyInfo) -> Result<(), LedgerError> {
        self.update(filename, |entry| {
            entry.reply = Some(reply);
            Ok(((), true))
        })
    }

    /// Take the reply marker. Succeeds once per marker; later calls get
    /// `NoReplyInfo`.
    pub fn remove_reply_info(&self, filename: &str) -> Result<ReplyInfo, LedgerError> {
        self.update(filename, |entry| match entry.reply.take() {
            Some(reply) => Ok((reply, true)),
            None => Err(LedgerError::NoReplyInfo(filename.to_string())),
        })
    }

    pub fn has_state(&self, filename: &str, replica: &ReplicaId) -> Result<bool, LedgerError> {
        Ok(self.get_entry(filename)?.states.contains_key(replica))
    }

    pub fn get_state(&self, filename: &str, replica: &ReplicaId) -> Result<StoreState, LedgerError> {
        self.get_entry(filename)?
            .states
            .get(replica)
            .copied()
            .ok_or_else(|| LedgerError::NoState {
                filename: filename.to_string(),
                replica: replica.to_string(),
            })
    }

    /// Record `state` for `replica`. Rewriting the current state is a no-op
    /// (returns `false`) so that duplicate deliveries are harmless; anything
    /// outside the state machine fails with `InvalidTransition`.
    pub fn set_state(
        &self,
        filename: &str,
        replica: &ReplicaId,
        state: StoreState,
    ) -> Result<bool, LedgerError> {
        self.update(filename, |entry| {
            let current = entry.states.get(replica).copied();
            if current == Some(state) {
                return Ok((false, false));
            }
            if !transition_allowed(current, state) {
                return Err(LedgerError::InvalidTransition {
                    filename: filename.to_string(),
                    replica: replica.to_string(),
                    from: current.map_or_else(|| "(none)".to_string(), |s| s.to_string()),
                    to: state,
                });
            }
            entry.states.insert(replica.clone(), state);
            tracing::info!(
                filename,
                replica = %replica,
                from = current.map(StoreState::as_str).unwrap_or("(none)"),
                to = %state,
                "store state changed"
            );
            Ok((true, true))
        })
    }

    /// Move `replica` from `expected` to `state`, atomically. Returns `false`
    /// and writes nothing when the replica is no longer in `expected`.
    pub fn set_state_if(
        &self,
        filename: &str,
        replica: &ReplicaId,
        expected: StoreState,
        state: StoreState,
    ) -> Result<bool, LedgerError> {
        self.update(filename, |entry| {
            let current = entry.states.get(replica).copied();
            if current != Some(expected) {
                return Ok((false, false));
            }
            if expected != state && !transition_allowed(current, state) {
                return Err(LedgerError::InvalidTransition {
                    filename: filename.to_string(),
                    replica: replica.to_string(),
                    from: expected.to_string(),
                    to: state,
                });
            }
            entry.states.insert(replica.clone(), state);
            tracing::info!(
                filename,
                replica = %replica,
                from = %expected,
                to = %state,
                "store state changed"
            );
            Ok((true, expected != state))
        })
    }

    fn scan_entries(&self) -> Result<Vec<(String, LedgerEntry)>, LedgerError> {
        self.ensure_open()?;
        self.store
            .scan(ENTRY_PREFIX)?
            .into_iter()
            .map(|(key, bytes)| {
                let entry = serde_json::from_slice(&bytes).map_err(|source| LedgerError::Codec {
                    key: key.clone(),
                    source,
                })?;
                let filename = key
                    .strip_prefix(ENTRY_PREFIX)
                    .unwrap_or(&key)
                    .to_string();
                Ok((filename, entry))
            })
            .collect()
    }

    pub fn all_file_names(&self) -> Result<BTreeSet<String>, LedgerError> {
        Ok(self
            .scan_entries()?
            .into_iter()
            .map(|(filename, _)| filename)
            .collect())
    }

    /// Files whose state in `replica` is `state`
    pub fn file_names_in(
        &self,
        replica: &ReplicaId,
        state: StoreState,
    ) -> Result<BTreeSet<String>, LedgerError> {
        Ok(self
            .scan_entries()?
            .into_iter()
            .filter(|(_, entry)| entry.states.get(replica) == Some(&state))
            .map(|(filename, _)| filename)
            .collect())
    }

    /// Administrative removal of a whole entry. Returns what was removed.
    pub fn remove_entry(
        &self,
        filename: &str,
        action: &AdminAction,
    ) -> Result<LedgerEntry, LedgerError> {
        self.ensure_open()?;
        self.with_key_lock(filename, || {
            let entry = self.load_existing(filename)?;
            self.store.delete(&entry_key(filename))?;
            tracing::warn!(
                target: "bitrep::audit",
                filename,
                operator = %action.operator,
                reason = %action.reason,
                "ledger entry removed"
            );
            Ok(entry)
        })
    }

    /// Flush and stop serving requests. Later calls do nothing.
    pub fn close(&self) -> Result<(), LedgerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.flush()?;
        tracing::debug!("ledger closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
