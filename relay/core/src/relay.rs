//! Relay State Machine
//!
//! Owns one local/remote channel pairing and forwards messages between them.
//!
//! # Architecture
//!
//! ```text
//!   LocalChannel ──notify_local──┐                 ┌──► RemoteChannel.send
//!                                ▼                 │
//!                        ┌───────────────┐         │
//!                        │ command queue │──► RelayState (single consumer)
//!                        └───────────────┘         │
//!                                ▲                 ├──► LastMessageBuffer.write
//!   RemoteChannel ─notify_remote─┘                 └──► LocalChannel.send(bound pid)
//! ```
//!
//! Notifications never run on the channel's own context. They are posted as
//! [`RelayCommand`]s and applied one at a time by the relay task, so binding
//! and buffer updates are never interleaved.
//!
//! # Lifecycle
//!
//! `Uninitialized → Established → Torn down`. [`establish`] creates the local
//! channel and starts the relay task. [`RelayHandle::teardown`] revokes the
//! handle (new posts fail), lets the task drain what was already queued, then
//! releases both channels. Teardown is idempotent; a torn down pairing is
//! never revived, a new [`establish`] is required.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

use crate::buffer::LastMessageBuffer;
use crate::channel::{LocalChannel, LocalChannelProvider, ProcessId, RemoteChannel};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::reader::PassiveReader;

/// Sync message sent to the remote side right after establishment
pub const ANNOUNCE_MESSAGE: &[u8] = b"\0";

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// The local client currently eligible for remote-to-local forwards
///
/// Overwritten by every local datagram; never merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientBinding(Option<ProcessId>);

impl ClientBinding {
    /// Record `sender` as the bound client
    ///
    /// The kernel identity leaves the binding absent.
    pub fn bind(&mut self, sender: ProcessId) {
        self.0 = sender.is_addressable().then_some(sender);
    }

    /// Forget the bound client
    pub fn clear(&mut self) {
        self.0 = None;
    }

    /// The bound client, if any
    #[must_use]
    pub fn current(&self) -> Option<ProcessId> {
        self.0
    }
}

/// Work item for the relay task
#[derive(Debug)]
pub(crate) enum RelayCommand {
    /// Datagram from a local client
    Local {
        payload: Vec<u8>,
        sender: ProcessId,
    },
    /// Message from the remote processor
    Remote { payload: Vec<u8> },
    /// Stop after everything queued before this command
    Shutdown,
}

/// What the relay did with one notification
#[derive(Debug)]
pub enum RelayOutcome {
    /// Sent on to the other channel
    Forwarded,
    /// Kept in the last-message buffer only (no client bound)
    Buffered,
    /// Not delivered; the error says why
    Dropped(RelayError),
}

impl RelayOutcome {
    /// Whether the message reached the other channel
    #[must_use]
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Self::Forwarded)
    }
}

/// Snapshot of relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Datagrams received from local clients
    pub local_received: u64,
    /// Local datagrams sent on to the remote processor
    pub forwarded_to_remote: u64,
    /// Messages received from the remote processor
    pub remote_received: u64,
    /// Remote messages unicast to the bound client
    pub forwarded_to_local: u64,
    /// Local datagrams dropped for exceeding the remote MTU
    pub dropped_oversize: u64,
    /// Remote messages that arrived with no client bound
    pub no_bound_client: u64,
    /// Remote messages cut to the buffer capacity
    pub truncated: u64,
    /// Failed sends on either channel
    pub send_failures: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    local_received: AtomicU64,
    forwarded_to_remote: AtomicU64,
    remote_received: AtomicU64,
    forwarded_to_local: AtomicU64,
    dropped_oversize: AtomicU64,
    no_bound_client: AtomicU64,
    truncated: AtomicU64,
    send_failures: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            local_received: self.local_received.load(Ordering::Relaxed),
            forwarded_to_remote: self.forwarded_to_remote.load(Ordering::Relaxed),
            remote_received: self.remote_received.load(Ordering::Relaxed),
            forwarded_to_local: self.forwarded_to_local.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
            no_bound_client: self.no_bound_client.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// State of one established pairing
///
/// Exclusively owned by the relay task. The binding sits behind a lock so
/// handles can observe it; only this struct writes it.
pub struct RelayState {
    endpoint: String,
    remote: Arc<dyn RemoteChannel>,
    local: Arc<dyn LocalChannel>,
    binding: Arc<Mutex<ClientBinding>>,
    last_message: Arc<LastMessageBuffer>,
    stats: Arc<StatsCounters>,
    released: bool,
}

impl RelayState {
    /// Handle a datagram from local client `sender`
    ///
    /// The binding is updated first, whatever happens to the payload.
    /// Payloads over the remote MTU are dropped before transmission.
    pub async fn on_local_message(&mut self, payload: &[u8], sender: ProcessId) -> RelayOutcome {
        if self.released {
            return RelayOutcome::Dropped(RelayError::TornDown);
        }

        StatsCounters::bump(&self.stats.local_received);
        self.binding.lock().bind(sender);
        debug!(pid = %sender, len = payload.len(), "Received from local client");

        let mtu = self.remote.mtu();
        if payload.len() > mtu {
            StatsCounters::bump(&self.stats.dropped_oversize);
            warn!(
                pid = %sender,
                len = payload.len(),
                mtu = mtu,
                "Message too long for remote, dropped"
            );
            return RelayOutcome::Dropped(RelayError::PayloadTooLarge {
                len: payload.len(),
                mtu,
            });
        }

        match self.remote.send(payload).await {
            Ok(()) => {
                StatsCounters::bump(&self.stats.forwarded_to_remote);
                debug!(len = payload.len(), mtu = mtu, "Forwarded to remote");
                RelayOutcome::Forwarded
            }
            Err(e) => {
                let err = RelayError::from_send(e);
                if matches!(err, RelayError::PayloadTooLarge { .. }) {
                    StatsCounters::bump(&self.stats.dropped_oversize);
                } else {
                    StatsCounters::bump(&self.stats.send_failures);
                }
                warn!(error = %err, "Remote send failed");
                RelayOutcome::Dropped(err)
            }
        }
    }

    /// Handle a message from the remote processor
    ///
    /// The message always lands in the last-message buffer (truncated to its
    /// capacity). It is unicast in full to the bound client, if there is one.
    pub async fn on_remote_message(&mut self, payload: &[u8]) -> RelayOutcome {
        if self.released {
            return RelayOutcome::Dropped(RelayError::TornDown);
        }

        StatsCounters::bump(&self.stats.remote_received);
        let stored = self.last_message.write(payload);
        if stored < payload.len() {
            StatsCounters::bump(&self.stats.truncated);
            debug!(
                len = payload.len(),
                stored = stored,
                "Remote message truncated in buffer"
            );
        }

        let bound = self.binding.lock().current();
        let Some(client) = bound else {
            StatsCounters::bump(&self.stats.no_bound_client);
            info!(len = payload.len(), "No local client bound, message buffered only");
            return RelayOutcome::Buffered;
        };

        match self.local.send(payload, client).await {
            Ok(()) => {
                StatsCounters::bump(&self.stats.forwarded_to_local);
                debug!(pid = %client, len = payload.len(), "Forwarded to local client");
                RelayOutcome::Forwarded
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.send_failures);
                warn!(pid = %client, error = %e, "Local send failed");
                RelayOutcome::Dropped(RelayError::TransportSendFailure(e))
            }
        }
    }

    /// Release both channels and clear the binding; idempotent
    ///
    /// The last-message buffer keeps its content for readers to drain.
    pub async fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.binding.lock().clear();
        self.local.release().await;
        self.remote.release().await;
        info!(endpoint = %self.endpoint, "Relay channels released");
    }

    /// The currently bound client
    #[must_use]
    pub fn binding(&self) -> Option<ProcessId> {
        self.binding.lock().current()
    }

    /// Whether the channels have been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

struct HandleShared {
    endpoint: String,
    epoch: u64,
    tx: mpsc::Sender<RelayCommand>,
    revoked: Arc<AtomicBool>,
    finished: watch::Receiver<bool>,
    binding: Arc<Mutex<ClientBinding>>,
    last_message: Arc<LastMessageBuffer>,
    stats: Arc<StatsCounters>,
}

/// Cloneable entry point into an established pairing
///
/// Channels post notifications through it; owners query and tear down
/// through it.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<HandleShared>,
}

/// Pieces the relay task needs alongside the handle
pub(crate) struct HandleParts {
    pub(crate) handle: RelayHandle,
    pub(crate) rx: mpsc::Receiver<RelayCommand>,
    pub(crate) finished: watch::Sender<bool>,
}

impl RelayHandle {
    pub(crate) fn build(
        endpoint: &str,
        buffer_capacity: usize,
        queue_capacity: usize,
    ) -> HandleParts {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (finished_tx, finished_rx) = watch::channel(false);

        let shared = HandleShared {
            endpoint: endpoint.to_string(),
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::SeqCst),
            tx,
            revoked: Arc::new(AtomicBool::new(false)),
            finished: finished_rx,
            binding: Arc::new(Mutex::new(ClientBinding::default())),
            last_message: Arc::new(LastMessageBuffer::new(buffer_capacity)),
            stats: Arc::new(StatsCounters::default()),
        };

        HandleParts {
            handle: Self {
                shared: Arc::new(shared),
            },
            rx,
            finished: finished_tx,
        }
    }

    /// Post a datagram received from local client `sender`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::TornDown` once teardown has started.
    pub async fn notify_local(&self, payload: Vec<u8>, sender: ProcessId) -> Result<(), RelayError> {
        self.post(RelayCommand::Local { payload, sender }).await
    }

    /// Post a message received from the remote processor
    ///
    /// # Errors
    ///
    /// Returns `RelayError::TornDown` once teardown has started.
    pub async fn notify_remote(&self, payload: Vec<u8>) -> Result<(), RelayError> {
        self.post(RelayCommand::Remote { payload }).await
    }

    async fn post(&self, command: RelayCommand) -> Result<(), RelayError> {
        if self.shared.revoked.load(Ordering::SeqCst) {
            return Err(RelayError::TornDown);
        }
        self.shared
            .tx
            .send(command)
            .await
            .map_err(|_| RelayError::TornDown)
    }

    /// Revoke, drain, release
    ///
    /// Notifications already queued are still applied; later ones are
    /// refused. Returns once both channels are released. Safe to call more
    /// than once and from several tasks.
    pub async fn teardown(&self) {
        if !self.shared.revoked.swap(true, Ordering::SeqCst) {
            info!(
                endpoint = %self.shared.endpoint,
                epoch = self.shared.epoch,
                "Tearing down relay"
            );
            if self.shared.tx.send(RelayCommand::Shutdown).await.is_err() {
                debug!("Relay task already stopped");
            }
        }
        self.closed().await;
    }

    /// Wait until the relay task has released its channels
    pub async fn closed(&self) {
        let mut finished = self.shared.finished.clone();
        // An error means the task is gone, which is just as final
        let _ = finished.wait_for(|done| *done).await;
    }

    fn revoke(&self) {
        self.shared.revoked.store(true, Ordering::SeqCst);
    }

    /// Whether teardown has started
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.shared.revoked.load(Ordering::SeqCst)
    }

    /// Remote endpoint name this pairing serves
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Establishment number, unique per process
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    /// The currently bound local client
    #[must_use]
    pub fn binding(&self) -> Option<ProcessId> {
        self.shared.binding.lock().current()
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.shared.stats.snapshot()
    }

    /// Buffer holding the last remote message
    #[must_use]
    pub fn last_message(&self) -> Arc<LastMessageBuffer> {
        Arc::clone(&self.shared.last_message)
    }

    /// Passive read surface over the last remote message
    #[must_use]
    pub fn reader(&self) -> PassiveReader {
        PassiveReader::new(self.last_message())
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("endpoint", &self.shared.endpoint)
            .field("epoch", &self.shared.epoch)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

/// Bring up a pairing for `remote`
///
/// Creates the local channel, attaches the remote channel's notifications,
/// optionally announces to the remote side, and starts the relay task. The
/// binding starts absent and the buffer empty.
///
/// # Errors
///
/// - `RelayError::ChannelUnavailable` if the local channel cannot be
///   created or the remote channel refuses to attach
/// - `RelayError::AllocationFailure` on resource exhaustion
///
/// On error nothing stays registered and the local channel is released.
pub async fn establish(
    config: &RelayConfig,
    remote: Arc<dyn RemoteChannel>,
    provider: &dyn LocalChannelProvider,
) -> Result<RelayHandle, RelayError> {
    let HandleParts {
        handle,
        rx,
        finished,
    } = RelayHandle::build(
        &config.endpoint_name,
        config.buffer_capacity,
        config.command_queue_capacity,
    );

    info!(
        endpoint = %config.endpoint_name,
        protocol_id = config.protocol_id,
        mtu = remote.mtu(),
        epoch = handle.epoch(),
        "New remote channel"
    );

    let local = match provider.create(config.protocol_id, handle.clone()).await {
        Ok(local) => local,
        Err(e) => {
            handle.revoke();
            error!(protocol_id = config.protocol_id, error = %e, "Error creating local channel");
            return Err(RelayError::from_establish(e));
        }
    };

    if let Err(e) = remote.attach(handle.clone()) {
        handle.revoke();
        local.release().await;
        error!(error = %e, "Remote channel refused to attach");
        return Err(RelayError::from_establish(e));
    }

    if config.announce_on_establish {
        if let Err(e) = remote.send(ANNOUNCE_MESSAGE).await {
            warn!(error = %e, "Announce to remote failed");
        }
    }

    let state = RelayState {
        endpoint: config.endpoint_name.clone(),
        remote,
        local,
        binding: Arc::clone(&handle.shared.binding),
        last_message: handle.last_message(),
        stats: Arc::clone(&handle.shared.stats),
        released: false,
    };

    let revoked = Arc::clone(&handle.shared.revoked);
    let span = tracing::info_span!(
        "relay",
        endpoint = %config.endpoint_name,
        epoch = handle.epoch()
    );
    tokio::spawn(run(state, rx, finished, revoked).instrument(span));

    Ok(handle)
}

/// Relay task: apply commands one at a time until shutdown
async fn run(
    mut state: RelayState,
    mut rx: mpsc::Receiver<RelayCommand>,
    finished: watch::Sender<bool>,
    revoked: Arc<AtomicBool>,
) {
    debug!("Relay task started");

    while let Some(command) = rx.recv().await {
        match command {
            RelayCommand::Local { payload, sender } => {
                state.on_local_message(&payload, sender).await;
            }
            RelayCommand::Remote { payload } => {
                state.on_remote_message(&payload).await;
            }
            RelayCommand::Shutdown => {
                rx.close();
                break;
            }
        }
    }

    revoked.store(true, Ordering::SeqCst);
    state.teardown().await;
    finished.send_replace(true);
    debug!("Relay task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryLocalChannel, MemoryLocalProvider, MemoryRemoteChannel};
    use pretty_assertions::assert_eq;

    fn state_with(
        mtu: usize,
        capacity: usize,
    ) -> (RelayState, Arc<MemoryRemoteChannel>, Arc<MemoryLocalChannel>) {
        let remote = Arc::new(MemoryRemoteChannel::new(mtu));
        let local = Arc::new(MemoryLocalChannel::new());
        let state = RelayState {
            endpoint: "test".into(),
            remote: remote.clone(),
            local: local.clone(),
            binding: Arc::new(Mutex::new(ClientBinding::default())),
            last_message: Arc::new(LastMessageBuffer::new(capacity)),
            stats: Arc::new(StatsCounters::default()),
            released: false,
        };
        (state, remote, local)
    }

    #[test]
    fn test_binding_overwrites() {
        let mut binding = ClientBinding::default();
        assert_eq!(binding.current(), None);

        binding.bind(ProcessId(42));
        binding.bind(ProcessId(7));
        assert_eq!(binding.current(), Some(ProcessId(7)));

        binding.bind(ProcessId::KERNEL);
        assert_eq!(binding.current(), None);
    }

    #[tokio::test]
    async fn test_local_message_forwarded_verbatim() {
        let (mut state, remote, _local) = state_with(512, 1024);

        let outcome = state.on_local_message(b"init", ProcessId(42)).await;
        assert!(outcome.is_forwarded());
        assert_eq!(remote.sent(), vec![b"init".to_vec()]);
        assert_eq!(state.binding(), Some(ProcessId(42)));
    }

    #[tokio::test]
    async fn test_payload_at_mtu_is_forwarded() {
        let (mut state, remote, _local) = state_with(8, 1024);
        let outcome = state.on_local_message(&[1u8; 8], ProcessId(3)).await;
        assert!(outcome.is_forwarded());
        assert_eq!(remote.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_oversize_dropped_but_binding_updated() {
        let (mut state, remote, _local) = state_with(512, 1024);

        let outcome = state.on_local_message(&[0u8; 600], ProcessId(42)).await;
        assert!(matches!(
            outcome,
            RelayOutcome::Dropped(RelayError::PayloadTooLarge { len: 600, mtu: 512 })
        ));
        assert!(remote.sent().is_empty());
        assert_eq!(state.binding(), Some(ProcessId(42)));
        assert_eq!(state.stats.snapshot().dropped_oversize, 1);
    }

    #[tokio::test]
    async fn test_remote_message_unicast_to_bound_client() {
        let (mut state, _remote, local) = state_with(512, 1024);
        state.on_local_message(b"init", ProcessId(42)).await;

        let outcome = state.on_remote_message(b"ack").await;
        assert!(outcome.is_forwarded());
        assert_eq!(local.sent(), vec![(ProcessId(42), b"ack".to_vec())]);
        assert_eq!(state.last_message.snapshot(), b"ack".to_vec());
    }

    #[tokio::test]
    async fn test_remote_message_without_client_is_buffered() {
        let (mut state, _remote, local) = state_with(512, 1024);

        let outcome = state.on_remote_message(b"hello").await;
        assert!(matches!(outcome, RelayOutcome::Buffered));
        assert!(local.sent().is_empty());
        assert_eq!(state.last_message.snapshot(), b"hello".to_vec());
        assert_eq!(state.stats.snapshot().no_bound_client, 1);
    }

    #[tokio::test]
    async fn test_remote_message_truncated_in_buffer_but_sent_whole() {
        let (mut state, _remote, local) = state_with(512, 4);
        state.on_local_message(b"x", ProcessId(5)).await;

        state.on_remote_message(b"abcdefgh").await;
        assert_eq!(state.last_message.snapshot(), b"abcd".to_vec());
        assert_eq!(local.sent()[0].1, b"abcdefgh".to_vec());
        assert_eq!(state.stats.snapshot().truncated, 1);
    }

    #[tokio::test]
    async fn test_send_failures_are_contained() {
        let (mut state, remote, local) = state_with(512, 1024);
        remote.set_fail_sends(true);
        local.set_fail_sends(true);

        let outcome = state.on_local_message(b"x", ProcessId(9)).await;
        assert!(matches!(
            outcome,
            RelayOutcome::Dropped(RelayError::TransportSendFailure(_))
        ));
        assert_eq!(state.binding(), Some(ProcessId(9)));

        let outcome = state.on_remote_message(b"y").await;
        assert!(matches!(
            outcome,
            RelayOutcome::Dropped(RelayError::TransportSendFailure(_))
        ));
        assert_eq!(state.last_message.snapshot(), b"y".to_vec());
        assert_eq!(state.stats.snapshot().send_failures, 2);
    }

    #[tokio::test]
    async fn test_teardown_releases_and_is_idempotent() {
        let (mut state, remote, local) = state_with(512, 1024);
        state.on_local_message(b"x", ProcessId(9)).await;
        state.on_remote_message(b"kept").await;

        state.teardown().await;
        state.teardown().await;

        assert!(state.is_released());
        assert!(remote.is_released());
        assert!(local.is_released());
        assert_eq!(state.binding(), None);
        assert_eq!(state.last_message.snapshot(), b"kept".to_vec());

        let outcome = state.on_remote_message(b"late").await;
        assert!(matches!(outcome, RelayOutcome::Dropped(RelayError::TornDown)));
        assert_eq!(state.last_message.snapshot(), b"kept".to_vec());
    }

    #[tokio::test]
    async fn test_handle_post_after_revoke_fails() {
        let parts = RelayHandle::build("test", 16, 4);
        parts.handle.revoke();

        let result = parts.handle.notify_remote(b"x".to_vec()).await;
        assert!(matches!(result, Err(RelayError::TornDown)));
        assert!(parts.handle.is_torn_down());
    }

    #[tokio::test]
    async fn test_stats_snapshot_counts_traffic() {
        let (mut state, _remote, _local) = state_with(8, 64);
        assert_eq!(state.stats.snapshot(), RelayStats::default());

        state.on_local_message(b"hi", ProcessId(42)).await;
        state.on_remote_message(b"ack").await;

        let stats = state.stats.snapshot();
        assert_eq!(
            stats,
            RelayStats {
                local_received: 1,
                forwarded_to_remote: 1,
                remote_received: 1,
                forwarded_to_local: 1,
                ..RelayStats::default()
            }
        );
    }

    #[tokio::test]
    async fn test_epochs_are_unique() {
        let a = RelayHandle::build("a", 16, 4).handle;
        let b = RelayHandle::build("a", 16, 4).handle;
        assert_ne!(a.epoch(), b.epoch());
    }

    #[tokio::test]
    async fn test_establish_and_relay_through_queue() {
        let config = RelayConfig::default();
        let remote = Arc::new(MemoryRemoteChannel::new(512));
        let provider = MemoryLocalProvider::new();

        let handle = establish(&config, remote.clone(), &provider).await.unwrap();
        let local = provider.last_channel().unwrap();

        local.deliver(b"init".to_vec(), ProcessId(42)).await.unwrap();
        remote.deliver(b"ack".to_vec()).await.unwrap();
        handle.teardown().await;

        assert_eq!(remote.sent(), vec![b"init".to_vec()]);
        assert_eq!(local.sent(), vec![(ProcessId(42), b"ack".to_vec())]);
        assert_eq!(handle.reader().open().read(64), b"ack".to_vec());
        assert_eq!(handle.binding(), None);
    }

    #[tokio::test]
    async fn test_establish_fails_cleanly_when_local_unavailable() {
        let config = RelayConfig::default();
        let remote = Arc::new(MemoryRemoteChannel::new(512));
        let provider = MemoryLocalProvider::new();
        provider.set_fail_create(true);

        let result = establish(&config, remote.clone(), &provider).await;
        assert!(matches!(result, Err(RelayError::ChannelUnavailable(_))));
        assert!(!remote.is_attached());
        assert!(provider.last_channel().is_none());
    }

    #[tokio::test]
    async fn test_establish_fails_when_remote_already_bound() {
        let config = RelayConfig::default();
        let remote = Arc::new(MemoryRemoteChannel::new(512));
        let previous = RelayHandle::build("previous", 16, 4).handle;
        remote.attach(previous.clone()).unwrap();
        let provider = MemoryLocalProvider::new();

        let result = establish(&config, remote.clone(), &provider).await;
        assert!(matches!(result, Err(RelayError::ChannelUnavailable(_))));
        assert!(provider.last_channel().unwrap().is_released());
        assert!(remote.sent().is_empty());
        assert!(!previous.is_torn_down());
    }

    #[tokio::test]
    async fn test_establish_announces_when_configured() {
        let config = RelayConfig {
            announce_on_establish: true,
            ..RelayConfig::default()
        };
        let remote = Arc::new(MemoryRemoteChannel::new(512));
        let provider = MemoryLocalProvider::new();

        let handle = establish(&config, remote.clone(), &provider).await.unwrap();
        assert_eq!(remote.sent(), vec![ANNOUNCE_MESSAGE.to_vec()]);
        handle.teardown().await;
    }
}
