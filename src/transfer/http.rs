//! Pull transport: the file is offered at a URL on the producer's registry
//! endpoint and the consumer fetches it.

use futures::TryStreamExt;
use parking_lot::Mutex;
use reqwest::header::CACHE_CONTROL;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use url::Url;

use super::registry::{TransferId, TransferRegistry};
use super::{BoxReader, RetryPolicy, TransportStats};
use crate::config::TransferSettings;
use crate::error::TransferError;

pub struct HttpTransport {
    id: TransferId,
    origin_host: String,
    url: Url,
    registry: Arc<TransferRegistry>,
    client: reqwest::Client,
    retry: RetryPolicy,
    stats: Arc<TransportStats>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url.as_str())
            .field("origin_host", &self.origin_host)
            .field("retry", &self.retry)
            .finish()
    }
}

impl HttpTransport {
    /// Register `path` and make sure the registry endpoint is serving.
    pub(crate) async fn register(
        registry: &Arc<TransferRegistry>,
        settings: &TransferSettings,
        stats: Arc<TransportStats>,
        path: &Path,
        size: u64,
        deletable: bool,
    ) -> Result<Self, TransferError> {
        registry
            .start_http(settings.http.bind, settings.http.advertised_host.as_deref())
            .await?;
        let client = reqwest::Client::builder()
            .connect_timeout(settings.data_timeout())
            .build()
            .map_err(|e| TransferError::Http {
                url: String::new(),
                message: e.to_string(),
            })?;

        let id = registry.register(path, size, deletable);
        let Some(url) = registry.file_url(&id) else {
            registry.release(&id).await;
            return Err(TransferError::NotConfigured(
                "transfer registry has no HTTP endpoint".to_string(),
            ));
        };
        tracing::debug!("Offering '{}' at {}", path.display(), url);

        Ok(Self {
            id,
            origin_host: registry.hostname().to_string(),
            url,
            registry: Arc::clone(registry),
            client,
            retry: RetryPolicy::http(settings),
            stats,
            last_error: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn colocated_path(&self) -> Option<PathBuf> {
        self.registry.colocated_path(&self.id, &self.origin_host)
    }

    fn remember(&self, err: &TransferError) {
        let text = match err {
            TransferError::Http { message, .. } => message.clone(),
            other => other.to_string(),
        };
        *self.last_error.lock() = Some(text);
    }

    fn http_error(&self, message: impl ToString) -> TransferError {
        TransferError::Http {
            url: self.url.to_string(),
            message: message.to_string(),
        }
    }

    /// One GET, no retries.
    pub(crate) async fn fetch_once(&self) -> Result<BoxReader, TransferError> {
        self.stats.record_download();
        let response = self
            .client
            .get(self.url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| self.http_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.http_error(status));
        }
        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }

    /// Open the remote body, retrying per the HTTP budget.
    pub async fn download(&self) -> Result<BoxReader, TransferError> {
        let what = format!("Download of {}", self.url);
        self.retry
            .run(&what, || async move {
                self.fetch_once().await.inspect_err(|e| self.remember(e))
            })
            .await
    }

    /// Release the registration: directly when co-located, through the
    /// cleanup URL otherwise. Failures are logged.
    pub async fn cleanup(&self) {
        if self.colocated_path().is_some() {
            self.registry.release(&self.id).await;
            return;
        }
        let Some(cleanup) = TransferRegistry::cleanup_url(&self.url) else {
            tracing::warn!("No cleanup URL for {}", self.url);
            return;
        };
        self.stats.record_delete();
        match self.client.get(cleanup.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("Cleaned up {}", self.url);
            }
            Ok(response) => {
                let err = self.http_error(response.status());
                self.remember(&err);
                tracing::warn!("Could not clean up {}: {}", cleanup, err);
            }
            Err(e) => {
                let err = self.http_error(e);
                self.remember(&err);
                tracing::warn!("Could not clean up {}: {}", cleanup, err);
            }
        }
    }
}
