//! Same-host transport: the consumer reads the producer's file from disk.

use std::path::PathBuf;
use std::sync::Arc;

use super::registry::{TransferId, TransferRegistry};
use super::BoxReader;
use crate::error::TransferError;

pub struct LocalTransport {
    id: TransferId,
    origin_host: String,
    registry: Arc<TransferRegistry>,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("id", &self.id)
            .field("origin_host", &self.origin_host)
            .finish()
    }
}

impl LocalTransport {
    pub(crate) fn register(
        registry: &Arc<TransferRegistry>,
        path: &std::path::Path,
        size: u64,
        deletable: bool,
    ) -> Self {
        let id = registry.register(path, size, deletable);
        Self {
            id,
            origin_host: registry.hostname().to_string(),
            registry: Arc::clone(registry),
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn colocated_path(&self) -> Option<PathBuf> {
        self.registry.colocated_path(&self.id, &self.origin_host)
    }

    /// Open the source file. There is no network to fall back on, so a
    /// consumer on another host gets `NotLocal`.
    pub async fn open(&self, name: &str) -> Result<BoxReader, TransferError> {
        let path = self
            .colocated_path()
            .ok_or_else(|| TransferError::NotLocal(name.to_string()))?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| TransferError::Source { path, source })?;
        Ok(Box::pin(file))
    }

    pub async fn cleanup(&self) {
        self.registry.release(&self.id).await;
    }
}
