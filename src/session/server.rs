//! Session server - runs when invoked as `bitrep session-server <root>`
//!
//! Holds named blobs in a flat directory. Every connection must log on before
//! it may PUT, GET or DELETE.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::protocol::{
    self as wire, Delete, Get, GetOk, Hello, HelloOk, MessageType, Put, CODE_BAD_NAME,
    CODE_BAD_SEQUENCE, CODE_LOCAL_ERROR, CODE_NOT_LOGGED_IN, CODE_UNAVAILABLE, CODE_VERSION,
};

/// Blob server shared by every connection
#[derive(Clone)]
pub struct SessionServer {
    root: PathBuf,
    users: Arc<RwLock<HashMap<String, String>>>,
}

/// A server accepting connections in the background
pub struct RunningSessionServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningSessionServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections. In-flight connections finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl SessionServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_user(self, user: &str, password: &str) -> Self {
        self.add_user(user, password);
        self
    }

    pub fn add_user(&self, user: &str, password: &str) {
        self.users
            .write()
            .insert(user.to_string(), password.to_string());
    }

    pub fn remove_user(&self, user: &str) {
        self.users.write().remove(user);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn authenticate(&self, hello: &Hello) -> bool {
        self.users
            .read()
            .get(&hello.user)
            .is_some_and(|pw| *pw == hello.password)
    }

    /// Bind and accept connections on a background task.
    pub async fn start(self, addr: SocketAddr) -> Result<RunningSessionServer> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create blob root {}", self.root.display()))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind session server to {}", addr))?;
        let addr = listener.local_addr()?;
        let (tx, rx) = watch::channel(false);
        tracing::info!(%addr, root = %self.root.display(), "session server listening");

        let handle = tokio::spawn(async move { self.accept_loop(listener, rx).await });
        Ok(RunningSessionServer {
            addr,
            shutdown: tx,
            handle,
        })
    }

    /// Accept connections until the process is interrupted.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let running = self.start(addr).await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("session server shutting down");
        running.shutdown().await;
        Ok(())
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                tracing::debug!(%peer, "session connection ended with error: {:#}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                },
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Read Hello frame
        let (msg_type, payload) = wire::read_frame(&mut reader).await?;
        if msg_type != MessageType::Hello {
            let err = wire::Error::new(
                CODE_BAD_SEQUENCE,
                format!("Expected HELLO, got {:?}", msg_type),
            );
            wire::write_frame(&mut writer, &err.encode()).await?;
            return Ok(());
        }
        let hello = Hello::decode(payload)?;
        if hello.version != wire::PROTOCOL_VERSION {
            let err = wire::Error::new(
                CODE_VERSION,
                format!("Unsupported protocol version {}", hello.version),
            );
            wire::write_frame(&mut writer, &err.encode()).await?;
            return Ok(());
        }
        if !self.authenticate(&hello) {
            tracing::debug!(user = %hello.user, "login rejected");
            let err = wire::Error::new(CODE_NOT_LOGGED_IN, "Login incorrect.");
            wire::write_frame(&mut writer, &err.encode()).await?;
            return Ok(());
        }
        let resp = HelloOk {
            version: wire::PROTOCOL_VERSION,
        };
        wire::write_frame(&mut writer, &resp.encode()).await?;

        loop {
            let (msg_type, payload) = match wire::read_frame(&mut reader).await {
                Ok(frame) => frame,
                // Client hung up without QUIT
                Err(_) => return Ok(()),
            };
            match msg_type {
                MessageType::Put => {
                    let put = Put::decode(payload)?;
                    self.handle_put(put, &mut reader, &mut writer).await?;
                }
                MessageType::Get => {
                    let get = Get::decode(payload)?;
                    self.handle_get(get, &mut writer).await?;
                }
                MessageType::Delete => {
                    let delete = Delete::decode(payload)?;
                    self.handle_delete(delete, &mut writer).await?;
                }
                MessageType::Quit => {
                    wire::write_frame(&mut writer, &wire::ok_frame()).await?;
                    return Ok(());
                }
                other => {
                    let err =
                        wire::Error::new(CODE_BAD_SEQUENCE, format!("Unexpected {:?}", other));
                    wire::write_frame(&mut writer, &err.encode()).await?;
                }
            }
        }
    }

    async fn handle_put<R, W>(&self, put: Put, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if !wire::is_valid_blob_name(&put.name) {
            // The body is on its way regardless, drain it to stay in sync
            io::copy(&mut reader.take(put.size), &mut io::sink()).await?;
            let err = wire::Error::new(CODE_BAD_NAME, format!("Invalid name '{}'", put.name));
            wire::write_frame(writer, &err.encode()).await?;
            return Ok(());
        }

        let final_path = self.root.join(&put.name);
        let temp_path = self.root.join(format!(".{}.part", put.name));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;

        let copied = io::copy(&mut reader.take(put.size), &mut file).await;
        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e).context("Upload interrupted");
            }
        };
        if copied != put.size {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!(
                "Upload of '{}' truncated: expected {} bytes, got {}",
                put.name,
                put.size,
                copied
            );
        }
        file.sync_all().await?;
        drop(file);

        match fs::rename(&temp_path, &final_path).await {
            Ok(()) => {
                tracing::debug!(name = %put.name, bytes = copied, "stored blob");
                wire::write_frame(writer, &wire::ok_frame()).await
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                let err = wire::Error::new(CODE_LOCAL_ERROR, format!("Cannot store: {}", e));
                wire::write_frame(writer, &err.encode()).await
            }
        }
    }

    async fn handle_get<W: AsyncWrite + Unpin>(&self, get: Get, writer: &mut W) -> Result<()> {
        let file = if wire::is_valid_blob_name(&get.name) {
            fs::File::open(self.root.join(&get.name)).await.ok()
        } else {
            None
        };
        let Some(mut file) = file else {
            let err = wire::Error::new(CODE_UNAVAILABLE, format!("No such blob '{}'", get.name));
            return wire::write_frame(writer, &err.encode()).await;
        };

        let size = file.metadata().await?.len();
        wire::write_frame(writer, &GetOk { size }.encode()).await?;
        let sent = io::copy(&mut (&mut file).take(size), writer).await?;
        writer.flush().await?;
        if sent != size {
            // The client will see a short body; nothing more we can do here
            anyhow::bail!("Blob '{}' shrank while sending", get.name);
        }
        tracing::debug!(name = %get.name, bytes = sent, "served blob");
        Ok(())
    }

    async fn handle_delete<W: AsyncWrite + Unpin>(
        &self,
        delete: Delete,
        writer: &mut W,
    ) -> Result<()> {
        if !wire::is_valid_blob_name(&delete.name) {
            let err = wire::Error::new(CODE_BAD_NAME, format!("Invalid name '{}'", delete.name));
            return wire::write_frame(writer, &err.encode()).await;
        }
        match fs::remove_file(self.root.join(&delete.name)).await {
            Ok(()) => {
                tracing::debug!(name = %delete.name, "deleted blob");
                wire::write_frame(writer, &wire::ok_frame()).await
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let err =
                    wire::Error::new(CODE_UNAVAILABLE, format!("No such blob '{}'", delete.name));
                wire::write_frame(writer, &err.encode()).await
            }
            Err(e) => {
                let err = wire::Error::new(CODE_LOCAL_ERROR, format!("Cannot delete: {}", e));
                wire::write_frame(writer, &err.encode()).await
            }
        }
    }
}
