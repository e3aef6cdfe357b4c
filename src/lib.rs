//! Replicated, checksum-verified ingestion of archive files into independent
//! bit archives.
//!
//! A producer offers a finished file through a [`TransferHandle`]; the
//! [`IngestionCoordinator`] fans it out to every targeted replica and tracks
//! each replica's progress in the [`ReplicaLedger`] until all of them hold a
//! byte-identical, checksum-verified copy.

pub mod bus;
pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod replica;
pub mod session;
pub mod transfer;

pub use bus::{BusEvent, LocalBus, MessageBus, Subscription};
pub use checksum::{Checksum, ChecksumAlgorithm};
pub use config::{Settings, TransportKind};
pub use coordinator::{IngestionCoordinator, ReplicaTarget, Submission, SubmissionReport};
pub use error::{Error, Result};
pub use ledger::{ReplicaId, ReplicaLedger, StoreState};
pub use replica::{DirectoryReplica, ReplicaSink};
pub use transfer::{TransferFactory, TransferHandle, TransferOptions, TransferRegistry};
