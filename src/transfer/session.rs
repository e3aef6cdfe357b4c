//! Push transport: the producer uploads to a session server up front and the
//! consumer later fetches the blob by name.

use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWrite;

use super::registry::local_hostname;
use super::{BoxReader, RetryPolicy, TransportStats};
use crate::checksum::{Checksum, ChecksumAlgorithm};
use crate::config::{SessionSettings, TransferSettings};
use crate::error::TransferError;
use crate::session::SessionClient;

#[derive(Debug)]
pub struct SessionTransport {
    client: SessionClient,
    remote_name: String,
}

/// `<name>-<random>-<millis>`, so that repeated uploads of one file never
/// collide on the server.
pub fn unique_remote_name(name: &str) -> String {
    let salt: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("{}-{}-{}", name, salt, chrono::Utc::now().timestamp_millis())
}

/// A server configured as `localhost` is unreachable for a consumer on
/// another machine.
fn rewrite_localhost(mut settings: SessionSettings) -> SessionSettings {
    if settings.host == "localhost" {
        let host = local_hostname();
        tracing::debug!("Replacing 'localhost' with '{}' as session server host", host);
        settings.host = host;
    }
    settings
}

impl SessionTransport {
    /// Upload `path` and digest it on the way out. The returned checksum
    /// describes exactly the bytes the server accepted.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn upload(
        session: SessionSettings,
        settings: &TransferSettings,
        stats: Arc<TransportStats>,
        path: &Path,
        name: &str,
        algorithm: Option<ChecksumAlgorithm>,
        deletable: bool,
    ) -> Result<(Self, Option<Checksum>), TransferError> {
        let client = SessionClient::new(
            rewrite_localhost(session),
            RetryPolicy::from_settings(settings),
            settings.data_timeout(),
            stats,
        );
        let remote_name = unique_remote_name(name);
        let checksum = client.upload(&remote_name, path, algorithm).await?;
        tracing::debug!(
            "Uploaded '{}' to session://{}/{}",
            path.display(),
            client.settings().address(),
            remote_name
        );

        if deletable {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!("Couldn't delete uploaded file {}: {}", path.display(), e);
            }
        }
        Ok((
            Self {
                client,
                remote_name,
            },
            checksum,
        ))
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.client.retry_policy()
    }

    pub fn last_error(&self) -> Option<String> {
        self.client.last_error()
    }

    pub async fn download(&self) -> Result<BoxReader, TransferError> {
        let blob = self.client.download(&self.remote_name).await?;
        Ok(Box::pin(blob))
    }

    pub(crate) async fn download_to<W>(&self, sink: &mut W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.client.download_to(&self.remote_name, sink).await
    }

    pub async fn cleanup(&self) {
        if let Err(e) = self.client.delete(&self.remote_name).await {
            tracing::warn!(
                "Could not delete remote file '{}' on {}: {}",
                self.remote_name,
                self.client.settings().address(),
                e
            );
        }
    }
}
