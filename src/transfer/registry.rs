//! Process-scoped table of files offered for transfer.
//!
//! Created once at process start and handed to every transfer handle. Besides
//! recognising co-located producer and consumer, it serves the registered
//! files over HTTP for the pull transport:
//!
//! ```text
//! GET /files/<id>     file contents
//! GET /cleanup/<id>   unregister (and delete the source if it was deletable)
//! ```
//!
//! Call [`TransferRegistry::shutdown`] at process shutdown to stop the server.

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use url::Url;
use uuid::Uuid;

pub type TransferId = Uuid;

/// What the registry knows about an offered file. Holding one does not keep
/// the transfer alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredFile {
    pub path: PathBuf,
    pub size: u64,
    pub deletable: bool,
}

struct HttpEndpoint {
    base: Url,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct TransferRegistry {
    hostname: String,
    files: RwLock<HashMap<TransferId, RegisteredFile>>,
    endpoint: Mutex<Option<Url>>,
    server: tokio::sync::Mutex<Option<HttpEndpoint>>,
}

impl std::fmt::Debug for TransferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRegistry")
            .field("hostname", &self.hostname)
            .field("files", &self.files.read().len())
            .field("endpoint", &*self.endpoint.lock())
            .finish()
    }
}

/// This machine's host name
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

impl TransferRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_hostname(local_hostname())
    }

    /// Registry that stamps handles with `hostname` as their origin.
    pub fn with_hostname(hostname: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            hostname: hostname.into(),
            files: RwLock::new(HashMap::new()),
            endpoint: Mutex::new(None),
            server: tokio::sync::Mutex::new(None),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn register(&self, path: &Path, size: u64, deletable: bool) -> TransferId {
        let id = Uuid::new_v4();
        self.files.write().insert(
            id,
            RegisteredFile {
                path: path.to_path_buf(),
                size,
                deletable,
            },
        );
        tracing::trace!(%id, path = %path.display(), "registered file");
        id
    }

    pub fn lookup(&self, id: &TransferId) -> Option<RegisteredFile> {
        self.files.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Path to read directly when `origin_host` is this machine and the file
    /// is still registered and readable here.
    pub fn colocated_path(&self, id: &TransferId, origin_host: &str) -> Option<PathBuf> {
        if origin_host != local_hostname() {
            return None;
        }
        let entry = self.lookup(id)?;
        std::fs::File::open(&entry.path)
            .ok()
            .filter(|f| f.metadata().map(|m| m.is_file()).unwrap_or(false))
            .map(|_| entry.path)
    }

    /// Unregister `id`, deleting the source when it was registered as
    /// deletable. Never fails; returns whether `id` was registered.
    pub async fn release(&self, id: &TransferId) -> bool {
        let entry = self.files.write().remove(id);
        let Some(entry) = entry else {
            return false;
        };
        if entry.deletable {
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => tracing::debug!(path = %entry.path.display(), "removed transferred source"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Couldn't remove tmp file {}: {}", entry.path.display(), e),
            }
        }
        true
    }

    /// Base URL of the HTTP endpoint, once started
    pub fn base_url(&self) -> Option<Url> {
        self.endpoint.lock().clone()
    }

    pub fn file_url(&self, id: &TransferId) -> Option<Url> {
        self.base_url()
            .and_then(|base| base.join(&format!("files/{}", id)).ok())
    }

    /// Derive the cleanup URL from a file URL
    pub fn cleanup_url(file_url: &Url) -> Option<Url> {
        let id = file_url.path_segments()?.next_back()?.to_string();
        file_url.join(&format!("../cleanup/{}", id)).ok()
    }

    /// Start serving registered files. Idempotent: a running endpoint is
    /// reused and its base URL returned.
    pub async fn start_http(
        self: &Arc<Self>,
        bind: SocketAddr,
        advertised_host: Option<&str>,
    ) -> io::Result<Url> {
        let mut server = self.server.lock().await;
        if let Some(endpoint) = server.as_ref() {
            return Ok(endpoint.base.clone());
        }

        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let host = advertised_host.unwrap_or(self.hostname.as_str());
        let base = Url::parse(&format!("http://{}:{}/", host, addr.port()))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let app = Router::new()
            .route("/files/{id}", get(serve_file))
            .route("/cleanup/{id}", get(cleanup_file))
            .with_state(Arc::clone(self));
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("transfer registry endpoint failed: {}", e);
            }
        });

        tracing::info!(%base, %addr, "transfer registry serving files");
        *self.endpoint.lock() = Some(base.clone());
        *server = Some(HttpEndpoint {
            base: base.clone(),
            shutdown: tx,
            handle,
        });
        Ok(base)
    }

    /// Stop the HTTP endpoint and forget every registration.
    pub async fn shutdown(&self) {
        let endpoint = self.server.lock().await.take();
        *self.endpoint.lock() = None;
        if let Some(endpoint) = endpoint {
            let _ = endpoint.shutdown.send(true);
            let _ = endpoint.handle.await;
        }
        let dropped = {
            let mut files = self.files.write();
            let n = files.len();
            files.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(dropped, "registry shut down with files still registered");
        }
    }
}

async fn serve_file(
    State(registry): State<Arc<TransferRegistry>>,
    UrlPath(id): UrlPath<TransferId>,
) -> Response {
    let Some(entry) = registry.lookup(&id) else {
        return (StatusCode::NOT_FOUND, format!("Unknown transfer {}", id)).into_response();
    };
    match tokio::fs::File::open(&entry.path).await {
        Ok(file) => {
            let body = Body::from_stream(ReaderStream::new(file));
            (
                [
                    (header::CONTENT_LENGTH, entry.size.to_string()),
                    (header::CACHE_CONTROL, "no-store".to_string()),
                ],
                body,
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::GONE,
            format!("Cannot read {}: {}", entry.path.display(), e),
        )
            .into_response(),
    }
}

async fn cleanup_file(
    State(registry): State<Arc<TransferRegistry>>,
    UrlPath(id): UrlPath<TransferId>,
) -> StatusCode {
    // Unknown ids are fine: cleanup is idempotent
    registry.release(&id).await;
    StatusCode::NO_CONTENT
}
