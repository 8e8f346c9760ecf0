//! Passive Read Server
//!
//! Serves an endpoint's last remote message on a Unix stream socket at
//! `<runtime_dir>/<endpoint>.last`:
//! - every accepted connection is one open of the read surface
//! - the message is written in `read_chunk` pieces from a fresh cursor
//! - the connection is closed at end of data
//!
//! ```text
//!                    ReaderServer
//!                         │
//!        ┌────────────────┼────────────────┐
//!        │                │                │
//!   reader-1          reader-2         reader-3
//!  (cursor 0)        (cursor 0)       (cursor 0)
//!        │                │                │
//!        └────────────────┴────────────────┘
//!                         │
//!                 LastMessageBuffer
//! ```
//!
//! The buffer is looked up in the registry per connection, so readers follow
//! re-establishment and can still drain a torn down endpoint.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn, Instrument};

use relay_core::RelayRegistry;

/// Identifier of one reader connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was accepted
    connected_at: std::time::Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the read server
pub struct ServerConfig {
    /// Maximum number of concurrent readers
    pub max_connections: usize,
    /// Bytes taken from the cursor per write
    pub read_chunk: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            read_chunk: 4096,
        }
    }
}

/// Unix stream server exposing one endpoint's passive read surface
pub struct ReaderServer {
    socket_path: PathBuf,
    endpoint: String,
    registry: RelayRegistry,
    server_config: ServerConfig,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl ReaderServer {
    /// Create a server for `endpoint` bound at `socket_path`
    pub fn new(
        socket_path: PathBuf,
        endpoint: impl Into<String>,
        registry: RelayRegistry,
        server_config: ServerConfig,
    ) -> Self {
        Self {
            socket_path,
            endpoint: endpoint.into(),
            registry,
            server_config,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Socket path this server binds
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Bind the socket, owner-only
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the socket cannot be bound.
    pub fn bind(&self) -> Result<UnixListener> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        info!(path = ?self.socket_path, endpoint = %self.endpoint, "Read surface listening");
        Ok(listener)
    }

    /// Accept readers until `shutdown` is set
    ///
    /// # Errors
    ///
    /// Fails only if the socket file cannot be removed on shutdown.
    pub async fn run(&self, listener: UnixListener, shutdown: Arc<AtomicBool>) -> Result<()> {
        let our_uid = nix::unistd::getuid().as_raw();

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting reader");
                drop(stream);
                continue;
            }

            let peer_uid = stream.peer_cred().ok().map(|cred| cred.uid());
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting reader from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = ConnectionId::next();
            debug!(conn_id = %conn_id, peer_uid = ?peer_uid, "Reader connected");

            // The reader waits until its state entry exists so its own removal wins
            let (registered_tx, registered_rx) = tokio::sync::oneshot::channel();
            let task_handle = tokio::spawn(
                Self::serve_reader(
                    conn_id,
                    stream,
                    registered_rx,
                    self.registry.clone(),
                    self.endpoint.clone(),
                    self.server_config.read_chunk,
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("reader", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: std::time::Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        self.shutdown()
    }

    /// Stream one fresh cursor to the client, then close
    async fn serve_reader(
        conn_id: ConnectionId,
        mut stream: UnixStream,
        registered: tokio::sync::oneshot::Receiver<()>,
        registry: RelayRegistry,
        endpoint: String,
        read_chunk: usize,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    ) {
        let _ = registered.await;
        let mut written = 0usize;

        if let Some(reader) = registry.reader(&endpoint) {
            let mut cursor = reader.open();
            loop {
                let chunk = cursor.read(read_chunk);
                if chunk.is_empty() {
                    break;
                }
                if let Err(e) = stream.write_all(&chunk).await {
                    warn!(error = %e, "Reader write failed");
                    break;
                }
                written += chunk.len();
            }
            cursor.close();
        } else {
            debug!(endpoint = %endpoint, "Endpoint never established, nothing to read");
        }

        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Reader shutdown failed");
        }

        connection_states.remove(&conn_id);
        debug!(bytes = written, "Reader served");
    }

    /// Abort readers still being served and remove the socket
    fn shutdown(&self) -> Result<()> {
        info!(readers = self.connection_count(), "Stopping read surface");
        for (conn_id, stats) in self.connection_stats() {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                debug!(
                    conn_id = %conn_id,
                    peer_uid = ?stats.peer_uid,
                    uptime_ms = stats.uptime_ms,
                    "Aborting reader"
                );
                conn_state.abort_handle.abort();
            }
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }
        Ok(())
    }

    /// Number of readers currently being served
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Per-reader statistics
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let conn_state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        peer_uid: conn_state.peer_uid,
                        uptime_ms: u64::try_from(conn_state.connected_at.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for one reader connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Peer UID
    pub peer_uid: Option<u32>,
    /// Time since the reader connected
    pub uptime_ms: u64,
}
