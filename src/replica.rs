//! Replica side of an ingestion: pull the bytes through a transfer handle and
//! confirm durable storage on the bus.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bus::{BusEvent, MessageBus};
use crate::checksum::{checksum_file, ChecksumAlgorithm};
use crate::error::TransferError;
use crate::ledger::ReplicaId;
use crate::transfer::TransferHandle;

#[async_trait]
pub trait ReplicaSink: Send + Sync {
    fn id(&self) -> &ReplicaId;

    /// Take the file behind `handle`. Returning `Ok` means the bytes arrived
    /// and passed the transport's integrity check; confirmation of durable
    /// storage travels separately as a [`BusEvent::ReplicaConfirmed`], which
    /// may be published before or after `store` returns.
    async fn store(&self, handle: &TransferHandle) -> Result<(), TransferError>;
}

/// A bit archive kept in a plain directory.
pub struct DirectoryReplica {
    id: ReplicaId,
    root: PathBuf,
    algorithm: ChecksumAlgorithm,
    bus: Arc<dyn MessageBus>,
}

impl std::fmt::Debug for DirectoryReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryReplica")
            .field("id", &self.id)
            .field("root", &self.root)
            .finish()
    }
}

impl DirectoryReplica {
    pub fn new(
        id: ReplicaId,
        root: impl Into<PathBuf>,
        algorithm: ChecksumAlgorithm,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            id,
            root: root.into(),
            algorithm,
            bus,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }
}

#[async_trait]
impl ReplicaSink for DirectoryReplica {
    fn id(&self) -> &ReplicaId {
        &self.id
    }

    async fn store(&self, handle: &TransferHandle) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let dest = self.path_of(handle.name());
        handle.copy_to(&dest).await?;
        tracing::debug!(replica = %self.id, "stored {} ({} bytes)", dest.display(), handle.size());

        // Empty files are settled by the coordinator without a confirmation
        if handle.size() == 0 {
            return Ok(());
        }

        let filename = handle.name().to_string();
        let replica = self.id.clone();
        let event = match checksum_file(self.algorithm, &dest).await {
            Ok(checksum) => BusEvent::ReplicaConfirmed {
                filename,
                replica,
                checksum,
            },
            Err(e) => BusEvent::ReplicaRejected {
                filename,
                replica,
                reason: format!("Cannot verify {}: {}", dest.display(), e),
            },
        };
        self.bus.publish(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::checksum::checksum_bytes;
    use crate::config::{TransferSettings, TransportKind};
    use crate::transfer::{TransferFactory, TransferOptions, TransferRegistry};

    #[tokio::test]
    async fn test_store_copies_and_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("capture-001.warc");
        std::fs::write(&source, b"archived bytes").unwrap();

        let bus = Arc::new(LocalBus::new());
        let mut events = bus.subscribe();
        let replica = DirectoryReplica::new(
            ReplicaId::from("R1"),
            dir.path().join("r1"),
            ChecksumAlgorithm::Md5,
            bus.clone(),
        );

        let settings = TransferSettings {
            kind: TransportKind::Local,
            ..TransferSettings::default()
        };
        let factory = TransferFactory::new(settings, TransferRegistry::new());
        let handle = factory
            .create(&source, TransferOptions::default())
            .await
            .unwrap();

        replica.store(&handle).await.unwrap();
        // The confirmation is on the bus by the time store returns
        let confirmed = events.try_recv().expect("no confirmation queued");
        assert_eq!(
            std::fs::read(replica.path_of("capture-001.warc")).unwrap(),
            b"archived bytes"
        );
        // The source is not deletable and stays put
        assert!(source.exists());

        match confirmed {
            BusEvent::ReplicaConfirmed {
                filename,
                replica,
                checksum,
            } => {
                assert_eq!(filename, "capture-001.warc");
                assert_eq!(replica.as_str(), "R1");
                assert_eq!(checksum, checksum_bytes(ChecksumAlgorithm::Md5, b"archived bytes"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
