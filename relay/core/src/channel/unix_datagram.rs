//! Unix Datagram Local Channel
//!
//! Local channel on a Unix domain datagram socket, one socket per protocol id.
//!
//! # Socket Location
//!
//! `<runtime_dir>/nl-<protocol_id>.sock`, created with mode 0600 and removed
//! on release.
//!
//! # Addressing
//!
//! Clients bind their own socket to a path and send framed datagrams (see
//! [`frame`](super::frame)) carrying their pid. The channel learns the
//! pid → address mapping from inbound traffic; a client that never sent
//! anything cannot be unicast to.
//!
//! Replies only ever go to the bound client, which is the sender of the
//! latest datagram the relay has processed. Sending to a pid therefore
//! forgets every address learned before that pid's latest datagram: those
//! senders can only be bound again by sending again.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::UnixDatagram;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::{self, KIND_DONE, MAX_DATAGRAM_LEN};
use super::{LocalChannel, LocalChannelProvider, ProcessId};
use crate::error::ChannelError;
use crate::relay::RelayHandle;

/// Socket paths currently owned by a live channel in this process
static ACTIVE_SOCKETS: Mutex<Vec<PathBuf>> = parking_lot::const_mutex(Vec::new());

/// Upper bound on remembered addresses between two replies
const MAX_PEERS: usize = 64;

/// Reply address of a sender and the arrival order of its latest datagram
#[derive(Debug, Clone)]
struct Peer {
    path: PathBuf,
    seq: u64,
}

type PeerTable = Arc<RwLock<HashMap<ProcessId, Peer>>>;

/// Creates [`UnixDatagramChannel`]s under a runtime directory
#[derive(Debug, Clone)]
pub struct UnixDatagramProvider {
    runtime_dir: PathBuf,
}

impl UnixDatagramProvider {
    /// Create a provider placing sockets in `runtime_dir`
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Socket path for `protocol_id`
    #[must_use]
    pub fn socket_path(&self, protocol_id: u32) -> PathBuf {
        self.runtime_dir.join(format!("nl-{protocol_id}.sock"))
    }

    fn bind(path: &Path) -> Result<UnixDatagram, ChannelError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            warn!(path = ?path, "Removing stale socket file");
            std::fs::remove_file(path)?;
        }

        let socket = UnixDatagram::bind(path).map_err(|e| match e.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                ChannelError::Exhausted(e.to_string())
            }
            _ => ChannelError::Io(e),
        })?;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(socket)
    }
}

#[async_trait]
impl LocalChannelProvider for UnixDatagramProvider {
    async fn create(
        &self,
        protocol_id: u32,
        handle: RelayHandle,
    ) -> Result<Arc<dyn LocalChannel>, ChannelError> {
        let path = self.socket_path(protocol_id);

        {
            let mut active = ACTIVE_SOCKETS.lock();
            if active.contains(&path) {
                return Err(ChannelError::Unavailable(format!(
                    "protocol {protocol_id} already in use"
                )));
            }
            active.push(path.clone());
        }

        let socket = match Self::bind(&path) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                unclaim(&path);
                return Err(e);
            }
        };

        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let task = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&peers),
            handle,
        ));

        info!(path = ?path, protocol_id = protocol_id, "Local channel created");

        Ok(Arc::new(UnixDatagramChannel {
            path,
            socket,
            peers,
            recv_task: Mutex::new(Some(task)),
            released: AtomicBool::new(false),
        }))
    }
}

/// Local channel over a bound Unix datagram socket
pub struct UnixDatagramChannel {
    path: PathBuf,
    socket: Arc<UnixDatagram>,
    peers: PeerTable,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl UnixDatagramChannel {
    /// Path of the bound socket
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn release_now(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        if self.path.exists() {
            std::fs::remove_file(&self.path).ok();
        }
        unclaim(&self.path);
        info!(path = ?self.path, "Local channel released");
    }
}

#[async_trait]
impl LocalChannel for UnixDatagramChannel {
    async fn send(&self, payload: &[u8], dest: ProcessId) -> Result<(), ChannelError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let peer = {
            let mut peers = self.peers.write();
            let peer = peers.get(&dest).cloned().ok_or_else(|| {
                ChannelError::SendFailed(format!("no address known for pid {dest}"))
            })?;
            peers.retain(|_, p| p.seq >= peer.seq);
            peer
        };

        let datagram = frame::encode(KIND_DONE, 0, payload)?;
        self.socket
            .send_to(&datagram, &peer.path)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn release(&self) {
        self.release_now();
    }
}

impl Drop for UnixDatagramChannel {
    fn drop(&mut self) {
        self.release_now();
    }
}

fn unclaim(path: &Path) {
    ACTIVE_SOCKETS.lock().retain(|p| p != path);
}

fn remember_peer(peers: &PeerTable, sender: ProcessId, path: Option<&Path>, seq: u64) {
    let mut peers = peers.write();
    let Some(path) = path else {
        debug!(pid = %sender, "Sender socket is unbound, replies impossible");
        peers.remove(&sender);
        return;
    };

    peers.insert(
        sender,
        Peer {
            path: path.to_path_buf(),
            seq,
        },
    );

    if peers.len() > MAX_PEERS {
        let oldest = peers
            .iter()
            .min_by_key(|(_, p)| p.seq)
            .map(|(pid, _)| *pid);
        if let Some(pid) = oldest {
            debug!(pid = %pid, "Forgetting oldest client address");
            peers.remove(&pid);
        }
    }
}

/// Read datagrams and post them to the relay until it stops accepting
async fn receive_loop(socket: Arc<UnixDatagram>, peers: PeerTable, handle: RelayHandle) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut seq: u64 = 0;

    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "Local socket read error");
                break;
            }
        };

        let (header, payload) = match frame::decode(&buf[..n]) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, len = n, "Discarding malformed datagram");
                continue;
            }
        };

        let sender = ProcessId(header.pid);
        if sender.is_addressable() {
            seq += 1;
            remember_peer(&peers, sender, addr.as_pathname(), seq);
        }

        let payload = payload.to_vec();
        if handle.notify_local(payload, sender).await.is_err() {
            debug!("Relay no longer accepting local datagrams");
            break;
        }
    }
}
