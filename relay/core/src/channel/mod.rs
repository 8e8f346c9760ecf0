//! Channel Layer
//!
//! Thin capabilities over the two transports the relay bridges:
//! - [`RemoteChannel`]: message link to the remote processor, bounded by an MTU
//! - [`LocalChannel`]: datagram socket addressed by process identity
//!
//! Implementations:
//! - `memory`: in-process channels that record traffic (tests, loopback mode)
//! - `unix_datagram`: local channel on a Unix datagram socket
//! - `rpmsg_char`: remote channel on an rpmsg character device
//!
//! # Notifications
//!
//! Inbound traffic is never handled inline. Channels post it through the
//! [`RelayHandle`] they were given; the relay consumes posts one at a time.

pub mod frame;
pub mod memory;
#[cfg(unix)]
pub mod rpmsg_char;
#[cfg(unix)]
pub mod unix_datagram;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::relay::RelayHandle;

pub use memory::{MemoryLocalChannel, MemoryLocalProvider, MemoryRemoteChannel};
#[cfg(unix)]
pub use rpmsg_char::RpmsgCharChannel;
#[cfg(unix)]
pub use unix_datagram::{UnixDatagramChannel, UnixDatagramProvider};

/// Default MTU of a virtio rpmsg endpoint
///
/// 512-byte vring buffers minus the 16-byte rpmsg header.
pub const DEFAULT_RPMSG_MTU: usize = 496;

/// Identity of a local client process
///
/// `0` is reserved for the kernel / an unidentified sender and never
/// becomes a unicast target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Identity carried by datagrams without a user-space sender
    pub const KERNEL: Self = Self(0);

    /// Whether this identity can receive unicast datagrams
    #[must_use]
    pub fn is_addressable(&self) -> bool {
        self.0 != 0
    }

    /// Raw numeric value
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message link to the remote processor
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Maximum payload accepted by [`send`](Self::send); fixed for the
    /// lifetime of the channel
    fn mtu(&self) -> usize;

    /// Send one message verbatim
    ///
    /// Must reject payloads longer than [`mtu`](Self::mtu) with
    /// [`ChannelError::PayloadTooLarge`] without sending any part of them.
    async fn send(&self, payload: &[u8]) -> Result<(), ChannelError>;

    /// Start delivering inbound messages through `handle`
    fn attach(&self, handle: RelayHandle) -> Result<(), ChannelError>;

    /// Stop delivery and release the link; idempotent
    async fn release(&self);
}

/// Datagram socket shared with local client processes
#[async_trait]
pub trait LocalChannel: Send + Sync {
    /// Unicast one datagram to `dest`
    async fn send(&self, payload: &[u8], dest: ProcessId) -> Result<(), ChannelError>;

    /// Close the socket and give up its identity; idempotent
    async fn release(&self);
}

/// Creates the local channel when a pairing is established
#[async_trait]
pub trait LocalChannelProvider: Send + Sync {
    /// Create a channel bound to `protocol_id`, delivering inbound
    /// datagrams through `handle`
    ///
    /// At most one channel per protocol id may be active at a time.
    async fn create(
        &self,
        protocol_id: u32,
        handle: RelayHandle,
    ) -> Result<Arc<dyn LocalChannel>, ChannelError>;
}
