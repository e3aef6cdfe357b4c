//! Transfer handles: "the bytes of file F, obtainable from somewhere".
//!
//! A [`TransferHandle`] hides which transport moves the bytes. The variant is
//! chosen once, when [`TransferFactory::create`] builds the handle:
//!
//! - `Local`: producer and consumer share a host, bytes are read from disk
//! - `Http`: the producer's registry serves the file, the consumer pulls it
//! - `Session`: the producer pushes to a session server, the consumer fetches
//!   the blob by name
//!
//! Zero-length files never touch a transport. Checksum verification,
//! single-use enforcement and idempotent cleanup live here, once, for all
//! variants.

pub mod http;
pub mod local;
pub mod registry;
pub mod retry;
pub mod session;
pub mod stats;

pub use self::http::HttpTransport;
pub use local::LocalTransport;
pub use registry::{local_hostname, TransferId, TransferRegistry};
pub use retry::RetryPolicy;
pub use session::SessionTransport;
pub use stats::{TransportStats, TransportStatsSnapshot};

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::checksum::{checksum_bytes, checksum_file, Checksum, ChecksumAlgorithm, ChecksumWriter, Hasher};
use crate::config::{SessionSettings, TransferSettings, TransportKind};
use crate::error::TransferError;

/// Buffer size for stream copies
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Copy `reader` to `writer` through a fixed buffer and flush. Returns the
/// number of bytes copied.
pub async fn copy_stream<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Record a checksum and verify every read against it
    pub use_checksums: bool,
    /// The producer's copy may be removed once transferred
    pub deletable: bool,
    /// Keep the handle readable after a successful read
    pub multiple_downloads: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            use_checksums: true,
            deletable: false,
            multiple_downloads: false,
        }
    }
}

impl TransferOptions {
    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self {
            use_checksums: settings.use_checksums,
            ..Self::default()
        }
    }

    pub fn deletable(mut self, deletable: bool) -> Self {
        self.deletable = deletable;
        self
    }

    pub fn multiple_downloads(mut self, multiple: bool) -> Self {
        self.multiple_downloads = multiple;
        self
    }
}

#[derive(Debug)]
enum Transport {
    /// Zero-length file, nothing to move
    Empty,
    Local(LocalTransport),
    Http(HttpTransport),
    Session(SessionTransport),
}

#[derive(Debug)]
struct HandleInner {
    name: String,
    source: PathBuf,
    size: u64,
    checksum: Option<Checksum>,
    algorithm: ChecksumAlgorithm,
    options: TransferOptions,
    kind: TransportKind,
    transport: Transport,
    consumed: AtomicBool,
    cleaned: AtomicBool,
}

/// Cheap to clone; clones share consumption and cleanup state.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    inner: Arc<HandleInner>,
}

impl TransferHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The producer-side file this handle was created from
    pub fn source_path(&self) -> &Path {
        &self.inner.source
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Recorded checksum, absent when checksums were not requested
    pub fn checksum(&self) -> Option<&Checksum> {
        self.inner.checksum.as_ref()
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.inner.algorithm
    }

    pub fn options(&self) -> TransferOptions {
        self.inner.options
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// Attempts a remote operation gets before the handle gives up
    pub fn retry_budget(&self) -> u32 {
        match &self.inner.transport {
            Transport::Empty | Transport::Local(_) => 1,
            Transport::Http(h) => h.retry_policy().attempts,
            Transport::Session(s) => s.retry_policy().attempts,
        }
    }

    /// Human-readable description of the transport's last failure
    pub fn last_error(&self) -> Option<String> {
        match &self.inner.transport {
            Transport::Empty | Transport::Local(_) => None,
            Transport::Http(h) => h.last_error(),
            Transport::Session(s) => s.last_error(),
        }
    }

    /// Whether the bytes can be read straight from this host's disk
    pub fn is_local(&self) -> bool {
        self.colocated_path().is_some()
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.consumed.load(Ordering::SeqCst)
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.inner.cleaned.load(Ordering::SeqCst)
    }

    /// Name of the blob on the session server, for session handles
    pub fn remote_name(&self) -> Option<&str> {
        match &self.inner.transport {
            Transport::Session(s) => Some(s.remote_name()),
            _ => None,
        }
    }

    fn colocated_path(&self) -> Option<PathBuf> {
        match &self.inner.transport {
            Transport::Local(l) => l.colocated_path(),
            Transport::Http(h) => h.colocated_path(),
            Transport::Empty | Transport::Session(_) => None,
        }
    }

    fn check_usable(&self) -> Result<(), TransferError> {
        if !self.inner.options.multiple_downloads && self.is_consumed() {
            return Err(TransferError::Consumed(self.inner.name.clone()));
        }
        Ok(())
    }

    fn mark_consumed(&self) {
        self.inner.consumed.store(true, Ordering::SeqCst);
    }

    fn verifying_hasher(&self) -> Option<Hasher> {
        match (&self.inner.checksum, self.inner.options.use_checksums) {
            (Some(_), true) => Some(Hasher::new(self.inner.algorithm)),
            _ => None,
        }
    }

    fn verify(&self, actual: &Checksum) -> Result<(), TransferError> {
        let Some(expected) = self.inner.checksum.as_ref() else {
            return Ok(());
        };
        if !self.inner.options.use_checksums || expected == actual {
            return Ok(());
        }
        tracing::warn!(
            "Checksums of '{}' do not match! Should be {} but was {}",
            self.inner.name,
            expected,
            actual
        );
        Err(TransferError::Integrity {
            name: self.inner.name.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }

    async fn open_colocated(path: PathBuf) -> Result<BoxReader, TransferError> {
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| TransferError::Source { path, source })?;
        Ok(Box::pin(file))
    }

    /// Open a stream over the file's bytes.
    ///
    /// Closing the stream with [`TransferStream::close`] verifies the
    /// checksum (when recorded) and, for single-use handles, cleans up.
    pub async fn open(&self) -> Result<TransferStream, TransferError> {
        if self.inner.size == 0 {
            return Ok(TransferStream::new(
                self.clone(),
                Box::pin(tokio::io::empty()),
                None,
            ));
        }
        self.check_usable()?;
        let reader = match &self.inner.transport {
            Transport::Empty => Box::pin(tokio::io::empty()) as BoxReader,
            Transport::Local(l) => l.open(&self.inner.name).await?,
            Transport::Http(h) => match h.colocated_path() {
                Some(path) => {
                    tracing::debug!("Reading '{}' directly from {}", self.inner.name, path.display());
                    Self::open_colocated(path).await?
                }
                None => h.download().await?,
            },
            Transport::Session(s) => s.download().await?,
        };
        Ok(TransferStream::new(self.clone(), reader, self.verifying_hasher()))
    }

    /// Write the whole file into `sink` in a single attempt.
    ///
    /// Nothing is retried and a failure part way through leaves `sink` with
    /// an undefined prefix; the caller discards it.
    pub async fn append_to<W>(&self, sink: &mut W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if self.inner.size == 0 {
            return Ok(0);
        }
        self.check_usable()?;
        let result = self.append_once(sink).await;
        if result.is_ok() {
            self.mark_consumed();
        }
        if !self.inner.options.multiple_downloads {
            self.cleanup().await;
        }
        result
    }

    async fn append_once<W>(&self, sink: &mut W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut writer = ChecksumWriter::new(&mut *sink, self.inner.algorithm);
        let written = match &self.inner.transport {
            Transport::Empty => 0,
            Transport::Local(l) => {
                let mut reader = l.open(&self.inner.name).await?;
                copy_stream(&mut reader, &mut writer).await?
            }
            Transport::Http(h) => {
                let mut reader = match h.colocated_path() {
                    Some(path) => Self::open_colocated(path).await?,
                    None => h.fetch_once().await?,
                };
                copy_stream(&mut reader, &mut writer).await?
            }
            Transport::Session(s) => {
                let n = s.download_to(&mut writer).await?;
                writer.flush().await?;
                n
            }
        };
        let (_, actual, _) = writer.into_parts();
        self.verify(&actual)?;
        Ok(written)
    }

    /// Write the file to `dest`.
    ///
    /// A co-located, deletable, single-use handle without checksum checking
    /// is moved with a rename. Everything else is streamed through a
    /// temporary sibling of `dest` that is renamed into place on success.
    pub async fn copy_to(&self, dest: &Path) -> Result<(), TransferError> {
        let dest = if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            std::env::current_dir()?.join(dest)
        };
        check_destination(&dest, &self.inner.name)?;

        let opts = self.inner.options;
        if opts.deletable && !opts.multiple_downloads && !opts.use_checksums && self.inner.size > 0 {
            if let Some(src) = self.colocated_path() {
                match tokio::fs::rename(&src, &dest).await {
                    Ok(()) => {
                        tracing::debug!("Moved '{}' to {}", src.display(), dest.display());
                        self.mark_consumed();
                        self.cleanup().await;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!("Rename to {} failed, copying instead: {}", dest.display(), e)
                    }
                }
            }
        }

        let partial = partial_path(&dest);
        let result = self.copy_via(&partial, &dest).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result
    }

    async fn copy_via(&self, partial: &Path, dest: &Path) -> Result<(), TransferError> {
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = self.open().await?;
        match copy_stream(&mut stream, &mut file).await {
            Ok(_) => stream.close().await?,
            Err(e) => {
                stream.abandon().await;
                return Err(e.into());
            }
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(partial, dest).await?;
        Ok(())
    }

    /// Remove whatever the transport materialised for this handle. Safe to
    /// call any number of times; failures are logged, never returned.
    pub async fn cleanup(&self) {
        if self.inner.size == 0 {
            return;
        }
        if self.inner.cleaned.swap(true, Ordering::SeqCst) {
            tracing::trace!("'{}' already cleaned up", self.inner.name);
            return;
        }
        match &self.inner.transport {
            Transport::Empty => {}
            Transport::Local(l) => l.cleanup().await,
            Transport::Http(h) => h.cleanup().await,
            Transport::Session(s) => s.cleanup().await,
        }
        tracing::debug!("Cleaned up transfer of '{}'", self.inner.name);
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn is_writable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

/// `dest` must be a writable file or a new name in a writable directory
fn check_destination(dest: &Path, name: &str) -> Result<(), TransferError> {
    let ok = if dest.is_file() {
        is_writable(dest)
    } else if dest.exists() {
        false
    } else {
        dest.parent().is_some_and(|p| p.is_dir() && is_writable(p))
    };
    if ok {
        Ok(())
    } else {
        Err(TransferError::InvalidDestination {
            dest: dest.to_path_buf(),
            name: name.to_string(),
        })
    }
}

/// Readable side of an open handle.
///
/// Dropping the stream skips verification and cleanup; call
/// [`close`](TransferStream::close) (or [`abandon`](TransferStream::abandon)).
pub struct TransferStream {
    handle: TransferHandle,
    reader: BoxReader,
    hasher: Option<Hasher>,
    bytes: u64,
}

impl TransferStream {
    fn new(handle: TransferHandle, reader: BoxReader, hasher: Option<Hasher>) -> Self {
        Self {
            handle,
            reader,
            hasher,
            bytes: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Finish reading. Compares the digest of everything read with the
    /// recorded checksum and cleans up single-use handles either way.
    pub async fn close(self) -> Result<(), TransferError> {
        let TransferStream {
            handle,
            reader,
            hasher,
            ..
        } = self;
        drop(reader);
        if handle.size() == 0 {
            return Ok(());
        }
        let verdict = match hasher {
            Some(hasher) => handle.verify(&hasher.finalize()),
            None => Ok(()),
        };
        if verdict.is_ok() {
            handle.mark_consumed();
        }
        if !handle.options().multiple_downloads {
            handle.cleanup().await;
        }
        verdict
    }

    /// Give up on the read. Single-use handles are still cleaned up.
    pub async fn abandon(self) {
        let handle = self.handle.clone();
        drop(self);
        if !handle.options().multiple_downloads {
            handle.cleanup().await;
        }
    }
}

impl std::fmt::Debug for TransferStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferStream")
            .field("name", &self.handle.name())
            .field("bytes", &self.bytes)
            .field("verifying", &self.hasher.is_some())
            .finish()
    }
}

impl AsyncRead for TransferStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(self.reader.as_mut().poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if !fresh.is_empty() {
            let this = &mut *self;
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(fresh);
            }
            this.bytes += fresh.len() as u64;
        }
        Poll::Ready(Ok(()))
    }
}

/// Builds transfer handles for one process.
#[derive(Debug, Clone)]
pub struct TransferFactory {
    settings: TransferSettings,
    registry: Arc<TransferRegistry>,
    stats: Arc<TransportStats>,
}

impl TransferFactory {
    pub fn new(settings: TransferSettings, registry: Arc<TransferRegistry>) -> Self {
        Self {
            settings,
            registry,
            stats: Arc::new(TransportStats::new()),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    /// Network calls made by every handle this factory has built
    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// Handle over `path` using the configured transport and session server.
    pub async fn create(
        &self,
        path: &Path,
        options: TransferOptions,
    ) -> Result<TransferHandle, TransferError> {
        self.create_with(path, options, self.settings.kind, self.settings.session.as_ref())
            .await
    }

    /// Handle over `path` with an explicit transport and session server.
    pub async fn create_with(
        &self,
        path: &Path,
        options: TransferOptions,
        kind: TransportKind,
        session: Option<&SessionSettings>,
    ) -> Result<TransferHandle, TransferError> {
        let source_error = |source| TransferError::Source {
            path: path.to_path_buf(),
            source,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(source_error)?;
        if !metadata.is_file() {
            return Err(source_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                source_error(io::Error::new(io::ErrorKind::InvalidInput, "no file name"))
            })?;
        let size = metadata.len();
        let algorithm = self.settings.checksum_algorithm;

        let (transport, checksum) = if size == 0 {
            let checksum = options
                .use_checksums
                .then(|| checksum_bytes(algorithm, &[]));
            (Transport::Empty, checksum)
        } else {
            match kind {
                TransportKind::Local | TransportKind::Http => {
                    let checksum = if options.use_checksums {
                        Some(checksum_file(algorithm, path).await.map_err(source_error)?)
                    } else {
                        None
                    };
                    let transport = if kind == TransportKind::Local {
                        Transport::Local(LocalTransport::register(
                            &self.registry,
                            path,
                            size,
                            options.deletable,
                        ))
                    } else {
                        Transport::Http(
                            HttpTransport::register(
                                &self.registry,
                                &self.settings,
                                self.stats(),
                                path,
                                size,
                                options.deletable,
                            )
                            .await?,
                        )
                    };
                    (transport, checksum)
                }
                TransportKind::Session => {
                    let session = session.cloned().ok_or_else(|| {
                        TransferError::NotConfigured(format!(
                            "no session server configured for '{}'",
                            name
                        ))
                    })?;
                    let (transport, checksum) = SessionTransport::upload(
                        session,
                        &self.settings,
                        self.stats(),
                        path,
                        &name,
                        options.use_checksums.then_some(algorithm),
                        options.deletable,
                    )
                    .await?;
                    (Transport::Session(transport), checksum)
                }
            }
        };

        tracing::debug!(
            name = %name,
            size,
            %kind,
            checksum = ?checksum.as_ref().map(Checksum::as_str),
            "created transfer handle"
        );
        Ok(TransferHandle {
            inner: Arc::new(HandleInner {
                name,
                source: path.to_path_buf(),
                size,
                checksum,
                algorithm,
                options,
                kind,
                transport,
                consumed: AtomicBool::new(false),
                cleaned: AtomicBool::new(false),
            }),
        })
    }
}
