//! In-Memory Channels
//!
//! Channels that live entirely inside the process. They record everything
//! sent through them and let the caller inject inbound traffic and send
//! failures. Used by tests and by the daemon's loopback mode, where the
//! "remote processor" echoes every message back.
//!
//! # Usage
//!
//! ```ignore
//! let remote = Arc::new(MemoryRemoteChannel::new(512));
//! let provider = MemoryLocalProvider::new();
//! let handle = relay::establish(&config, remote.clone(), &provider).await?;
//!
//! let local = provider.last_channel().unwrap();
//! local.deliver(b"init".to_vec(), ProcessId(42)).await?;
//! remote.deliver(b"ack".to_vec()).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LocalChannel, LocalChannelProvider, ProcessId, RemoteChannel};
use crate::error::{ChannelError, RelayError};
use crate::relay::RelayHandle;

/// Remote channel backed by memory
pub struct MemoryRemoteChannel {
    mtu: usize,
    echo: bool,
    sent: Mutex<Vec<Vec<u8>>>,
    handle: Mutex<Option<RelayHandle>>,
    fail_sends: AtomicBool,
    released: AtomicBool,
}

impl MemoryRemoteChannel {
    /// Create a channel advertising `mtu`
    #[must_use]
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            echo: false,
            sent: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Create a channel whose remote side echoes every message back
    #[must_use]
    pub fn loopback(mtu: usize) -> Self {
        Self {
            echo: true,
            ..Self::new(mtu)
        }
    }

    /// Simulate a message arriving from the remote processor
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ChannelUnavailable` if no relay is attached, or
    /// `RelayError::TornDown` if the attached relay no longer accepts posts.
    pub async fn deliver(&self, payload: Vec<u8>) -> Result<(), RelayError> {
        let handle = self.handle.lock().clone();
        match handle {
            Some(handle) => handle.notify_remote(payload).await,
            None => Err(RelayError::ChannelUnavailable(
                "remote channel not attached".into(),
            )),
        }
    }

    /// Every payload sent so far, in order
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Make subsequent sends fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Whether a relay is attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Whether the channel has been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteChannel for MemoryRemoteChannel {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.is_released() {
            return Err(ChannelError::Closed);
        }
        if payload.len() > self.mtu {
            return Err(ChannelError::PayloadTooLarge {
                len: payload.len(),
                mtu: self.mtu,
            });
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed("injected failure".into()));
        }

        self.sent.lock().push(payload.to_vec());

        if self.echo {
            let handle = self.handle.lock().clone();
            if let Some(handle) = handle {
                // Posting inline would wait on the queue this send is draining
                let reply = payload.to_vec();
                tokio::spawn(async move {
                    if let Err(e) = handle.notify_remote(reply).await {
                        tracing::debug!(error = %e, "Loopback echo dropped");
                    }
                });
            }
        }
        Ok(())
    }

    fn attach(&self, handle: RelayHandle) -> Result<(), ChannelError> {
        if self.is_released() {
            return Err(ChannelError::Closed);
        }
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return Err(ChannelError::Unavailable(
                "remote channel already attached".into(),
            ));
        }
        *slot = Some(handle);
        Ok(())
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Local channel backed by memory
pub struct MemoryLocalChannel {
    sent: Mutex<Vec<(ProcessId, Vec<u8>)>>,
    handle: Mutex<Option<RelayHandle>>,
    fail_sends: AtomicBool,
    released: AtomicBool,
}

impl MemoryLocalChannel {
    /// Create a detached channel
    #[must_use]
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    fn with_handle(handle: RelayHandle) -> Self {
        let channel = Self::new();
        *channel.handle.lock() = Some(handle);
        channel
    }

    /// Simulate a datagram from local client `sender`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::TornDown` if the channel was released or the
    /// relay no longer accepts posts.
    pub async fn deliver(&self, payload: Vec<u8>, sender: ProcessId) -> Result<(), RelayError> {
        if self.is_released() {
            return Err(RelayError::TornDown);
        }
        let handle = self.handle.lock().clone();
        match handle {
            Some(handle) => handle.notify_local(payload, sender).await,
            None => Err(RelayError::ChannelUnavailable(
                "local channel not attached".into(),
            )),
        }
    }

    /// Every datagram sent so far with its destination, in order
    #[must_use]
    pub fn sent(&self) -> Vec<(ProcessId, Vec<u8>)> {
        self.sent.lock().clone()
    }

    /// Make subsequent sends fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Whether the channel has been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Default for MemoryLocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalChannel for MemoryLocalChannel {
    async fn send(&self, payload: &[u8], dest: ProcessId) -> Result<(), ChannelError> {
        if self.is_released() {
            return Err(ChannelError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed("injected failure".into()));
        }
        self.sent.lock().push((dest, payload.to_vec()));
        Ok(())
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Creates [`MemoryLocalChannel`]s, one active per protocol id
#[derive(Default)]
pub struct MemoryLocalProvider {
    active: Mutex<HashMap<u32, Arc<MemoryLocalChannel>>>,
    last: Mutex<Option<Arc<MemoryLocalChannel>>>,
    fail_create: AtomicBool,
}

impl MemoryLocalProvider {
    /// Create a provider
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent creations fail
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// The most recently created channel
    #[must_use]
    pub fn last_channel(&self) -> Option<Arc<MemoryLocalChannel>> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl LocalChannelProvider for MemoryLocalProvider {
    async fn create(
        &self,
        protocol_id: u32,
        handle: RelayHandle,
    ) -> Result<Arc<dyn LocalChannel>, ChannelError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable(format!(
                "cannot create channel for protocol {protocol_id}"
            )));
        }

        let mut active = self.active.lock();
        if active.get(&protocol_id).is_some_and(|c| !c.is_released()) {
            return Err(ChannelError::Unavailable(format!(
                "protocol {protocol_id} already in use"
            )));
        }

        let channel = Arc::new(MemoryLocalChannel::with_handle(handle));
        active.insert(protocol_id, Arc::clone(&channel));
        *self.last.lock() = Some(Arc::clone(&channel));
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remote_rejects_over_mtu() {
        let remote = MemoryRemoteChannel::new(4);
        let result = remote.send(b"12345").await;
        assert!(matches!(
            result,
            Err(ChannelError::PayloadTooLarge { len: 5, mtu: 4 })
        ));
        assert!(remote.sent().is_empty());
    }

    #[tokio::test]
    async fn test_remote_send_after_release() {
        let remote = MemoryRemoteChannel::new(16);
        remote.release().await;
        assert!(matches!(remote.send(b"x").await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_remote_deliver_requires_attach() {
        let remote = MemoryRemoteChannel::new(16);
        let result = remote.deliver(b"x".to_vec()).await;
        assert!(matches!(result, Err(RelayError::ChannelUnavailable(_))));
    }

    #[tokio::test]
    async fn test_remote_attach_once() {
        let remote = MemoryRemoteChannel::new(16);
        let first = RelayHandle::build("a", 16, 4).handle;
        let second = RelayHandle::build("a", 16, 4).handle;

        remote.attach(first).unwrap();
        assert!(matches!(
            remote.attach(second),
            Err(ChannelError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_local_records_sends() {
        let local = MemoryLocalChannel::new();
        local.send(b"ack", ProcessId(42)).await.unwrap();
        assert_eq!(local.sent(), vec![(ProcessId(42), b"ack".to_vec())]);

        local.set_fail_sends(true);
        assert!(matches!(
            local.send(b"x", ProcessId(42)).await,
            Err(ChannelError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_one_active_per_protocol() {
        let provider = MemoryLocalProvider::new();
        let handle = RelayHandle::build("a", 16, 4).handle;

        let first = provider.create(17, handle.clone()).await.unwrap();
        assert!(matches!(
            provider.create(17, handle.clone()).await,
            Err(ChannelError::Unavailable(_))
        ));

        // A different protocol is independent
        assert!(provider.create(19, handle.clone()).await.is_ok());

        // Released identity can be reused
        first.release().await;
        assert!(provider.create(17, handle).await.is_ok());
    }
}
