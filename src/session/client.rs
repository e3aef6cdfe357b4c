//! Session client - logs on to a session server and moves named blobs.
//!
//! Every operation runs on its own connection: log on, do the work, log out.
//! Log-on and whole operations are retried per the [`RetryPolicy`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, Take};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::checksum::{Checksum, ChecksumAlgorithm, ChecksumReader};
use crate::config::SessionSettings;
use crate::error::TransferError;
use crate::session::protocol::{
    self as wire, Delete, Get, GetOk, Hello, MessageType, Put, CODE_NOT_LOGGED_IN,
    CODE_UNAVAILABLE,
};
use crate::transfer::{RetryPolicy, TransportStats};

/// A logged-on connection
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct SessionClient {
    settings: SessionSettings,
    retry: RetryPolicy,
    data_timeout: Duration,
    stats: Arc<TransportStats>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("server", &self.settings.address())
            .field("user", &self.settings.user)
            .field("retry", &self.retry)
            .finish()
    }
}

impl SessionClient {
    pub fn new(
        settings: SessionSettings,
        retry: RetryPolicy,
        data_timeout: Duration,
        stats: Arc<TransportStats>,
    ) -> Self {
        Self {
            settings,
            retry,
            data_timeout,
            stats,
            last_error: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// The server's last failure reply, `Error <code>: '<message>'`
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn remember(&self, err: &TransferError) {
        let text = match err {
            TransferError::Remote { code, message } => format!("Error {}: '{}'", code, message),
            other => other.to_string(),
        };
        *self.last_error.lock() = Some(text);
    }

    fn protocol_error(e: anyhow::Error) -> TransferError {
        TransferError::Protocol(format!("{:#}", e))
    }

    async fn with_timeout<T, F>(&self, what: &str, fut: F) -> Result<T, TransferError>
    where
        F: std::future::Future<Output = Result<T, TransferError>>,
    {
        match tokio::time::timeout(self.data_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout {
                name: what.to_string(),
                secs: self.data_timeout.as_secs(),
            }),
        }
    }

    async fn read_reply(&self, conn: &mut Connection, what: &str) -> Result<(MessageType, Bytes), TransferError> {
        let (msg_type, payload) = self
            .with_timeout(what, async {
                wire::read_frame(&mut conn.reader)
                    .await
                    .map_err(Self::protocol_error)
            })
            .await?;
        if msg_type == MessageType::Error {
            let err = wire::Error::decode(payload).map_err(Self::protocol_error)?;
            return Err(TransferError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok((msg_type, payload))
    }

    async fn send(&self, conn: &mut Connection, frame: &Bytes) -> Result<(), TransferError> {
        wire::write_frame(&mut conn.writer, frame)
            .await
            .map_err(Self::protocol_error)
    }

    async fn log_on_once(&self) -> Result<Connection, TransferError> {
        let server = self.settings.address();
        tracing::trace!(
            "Try to logon to session://{}:{}@{}",
            self.settings.user,
            self.settings.masked_password(),
            server
        );
        self.stats.record_connect();
        let stream = self
            .with_timeout(&server, async {
                TcpStream::connect(&server)
                    .await
                    .map_err(|e| TransferError::Connect {
                        server: server.clone(),
                        attempts: 1,
                        message: e.to_string(),
                    })
            })
            .await?;
        let (read_half, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer,
        };

        let hello = Hello::new(&self.settings.user, &self.settings.password);
        self.send(&mut conn, &hello.encode()).await?;
        match self.read_reply(&mut conn, &server).await {
            Ok((MessageType::HelloOk, _)) => {}
            Ok((other, _)) => {
                return Err(TransferError::Protocol(format!(
                    "Expected HELLO_OK from {}, got {:?}",
                    server, other
                )))
            }
            Err(TransferError::Remote { code, message }) if code == CODE_NOT_LOGGED_IN => {
                return Err(TransferError::Login {
                    server,
                    user: self.settings.user.clone(),
                    message: format!("Error {}: '{}'", code, message),
                })
            }
            Err(e) => return Err(e),
        }
        tracing::debug!("Logged onto session://{}@{}", self.settings.user, server);
        Ok(conn)
    }

    async fn log_out(&self, mut conn: Connection) {
        tracing::trace!("Trying to log out.");
        if let Err(e) = self.send(&mut conn, &wire::quit_frame()).await {
            tracing::debug!("Disconnect from '{}' failed: {}", self.settings.address(), e);
        }
        let _ = conn.writer.shutdown().await;
    }

    async fn upload_once(
        &self,
        name: &str,
        path: &Path,
        algorithm: Option<ChecksumAlgorithm>,
    ) -> Result<Option<Checksum>, TransferError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| TransferError::Source {
                path: path.to_path_buf(),
                source,
            })?;
        let size = file.metadata().await?.len();

        let mut conn = self.log_on_once().await?;
        self.stats.record_upload();
        self.send(
            &mut conn,
            &Put {
                name: name.to_string(),
                size,
            }
            .encode(),
        )
        .await?;

        let checksum = match algorithm {
            Some(algorithm) => {
                let mut reader = ChecksumReader::new(file, algorithm);
                let sent = tokio::io::copy(&mut (&mut reader).take(size), &mut conn.writer).await?;
                if sent != size {
                    return Err(TransferError::Protocol(format!(
                        "'{}' changed size during upload: expected {} bytes, sent {}",
                        path.display(),
                        size,
                        sent
                    )));
                }
                Some(reader.digest())
            }
            None => {
                let sent = tokio::io::copy(&mut file.take(size), &mut conn.writer).await?;
                if sent != size {
                    return Err(TransferError::Protocol(format!(
                        "'{}' changed size during upload: expected {} bytes, sent {}",
                        path.display(),
                        size,
                        sent
                    )));
                }
                None
            }
        };
        conn.writer.flush().await?;

        match self.read_reply(&mut conn, name).await? {
            (MessageType::Ok, _) => {}
            (other, _) => {
                return Err(TransferError::Protocol(format!(
                    "Expected OK after upload of '{}', got {:?}",
                    name, other
                )))
            }
        }
        self.log_out(conn).await;
        Ok(checksum)
    }

    /// Store the file at `path` under `name`, digesting the bytes as they go
    /// over the wire. Each retry re-reads the file from the start.
    pub async fn upload(
        &self,
        name: &str,
        path: &Path,
        algorithm: Option<ChecksumAlgorithm>,
    ) -> Result<Option<Checksum>, TransferError> {
        let what = format!("Upload of '{}' as '{}'", path.display(), name);
        self.retry
            .run(&what, || async move {
                self.upload_once(name, path, algorithm)
                    .await
                    .inspect_err(|e| self.remember(e))
            })
            .await
    }

    async fn request_blob(&self, name: &str) -> Result<BlobReader, TransferError> {
        let mut conn = self.log_on_once().await?;
        self.stats.record_download();
        self.send(
            &mut conn,
            &Get {
                name: name.to_string(),
            }
            .encode(),
        )
        .await?;
        let (msg_type, payload) = self.read_reply(&mut conn, name).await?;
        if msg_type != MessageType::GetOk {
            return Err(TransferError::Protocol(format!(
                "Expected GET_OK for '{}', got {:?}",
                name, msg_type
            )));
        }
        let size = GetOk::decode(payload).map_err(Self::protocol_error)?.size;
        Ok(BlobReader {
            body: conn.reader.take(size),
            _writer: conn.writer,
        })
    }

    /// Open a stream over the blob `name`. Connecting and the request itself
    /// are retried; the body is not.
    pub async fn download(&self, name: &str) -> Result<BlobReader, TransferError> {
        let what = format!("Retrieving '{}'", name);
        self.retry
            .run(&what, || async move {
                self.request_blob(name)
                    .await
                    .inspect_err(|e| self.remember(e))
            })
            .await
    }

    /// Write the blob `name` into `sink` in a single attempt. A failure part
    /// way through leaves `sink` holding a prefix of the blob.
    pub async fn download_to<W>(&self, name: &str, sink: &mut W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut body = self
            .request_blob(name)
            .await
            .inspect_err(|e| self.remember(e))?;
        let n = tokio::io::copy(&mut body, sink).await?;
        sink.flush().await?;
        Ok(n)
    }

    async fn delete_once(&self, name: &str) -> Result<(), TransferError> {
        let mut conn = self.log_on_once().await?;
        self.stats.record_delete();
        self.send(
            &mut conn,
            &Delete {
                name: name.to_string(),
            }
            .encode(),
        )
        .await?;
        let result = match self.read_reply(&mut conn, name).await {
            Ok(_) => Ok(()),
            // Already gone counts as deleted
            Err(TransferError::Remote { code, .. }) if code == CODE_UNAVAILABLE => Ok(()),
            Err(e) => Err(e),
        };
        self.log_out(conn).await;
        result
    }

    /// Delete the blob `name`. Deleting a missing blob succeeds.
    pub async fn delete(&self, name: &str) -> Result<(), TransferError> {
        let what = format!("Delete of '{}'", name);
        self.retry
            .run(&what, || async move {
                self.delete_once(name)
                    .await
                    .inspect_err(|e| self.remember(e))
            })
            .await
    }
}

/// Body of a GET, read straight off the connection.
#[derive(Debug)]
pub struct BlobReader {
    body: Take<BufReader<OwnedReadHalf>>,
    _writer: OwnedWriteHalf,
}

impl BlobReader {
    /// Bytes still expected from the server
    pub fn remaining(&self) -> u64 {
        self.body.limit()
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.body).poll_read(cx, buf))?;
        if buf.filled().len() == before && buf.remaining() > 0 && self.body.limit() > 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Connection closed with {} bytes of the blob outstanding",
                    self.body.limit()
                ),
            )));
        }
        Poll::Ready(Ok(()))
    }
}
