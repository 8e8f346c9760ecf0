//! Error Types
//!
//! Two layers of errors:
//! - [`ChannelError`]: what a single channel implementation reports
//! - [`RelayError`]: what the relay reports about a message or a lifecycle step
//!
//! Failures inside notification handling are terminal for that one message
//! only. They are logged and counted, never propagated back to the client.

use thiserror::Error;

/// Errors reported by a local or remote channel implementation
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Payload exceeds the channel's maximum transfer unit
    #[error("payload of {len} bytes exceeds mtu of {mtu} bytes")]
    PayloadTooLarge {
        /// Length of the rejected payload
        len: usize,
        /// Advertised MTU of the channel
        mtu: usize,
    },

    /// The underlying transport refused the message
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The channel has been released
    #[error("channel closed")]
    Closed,

    /// The channel could not be created or is already in use
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// Resources ran out while creating the channel
    #[error("resources exhausted: {0}")]
    Exhausted(String),

    /// Malformed datagram on the wire
    #[error("invalid frame: {0}")]
    Frame(String),

    /// IO error from the underlying socket or device
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Establishment failed; nothing was registered
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// A pairing for this endpoint is already active
    #[error("endpoint {endpoint} is already established")]
    AlreadyEstablished {
        /// Endpoint name that is already bound
        endpoint: String,
    },

    /// The registry does not accept another active pairing
    #[error("registry limited to {limit} active pairing(s)")]
    RegistryFull {
        /// Maximum number of active pairings
        limit: usize,
    },

    /// Resource exhaustion during establishment
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// Outbound message exceeds the remote MTU; dropped before transmission
    #[error("payload of {len} bytes exceeds remote mtu of {mtu} bytes")]
    PayloadTooLarge {
        /// Length of the dropped payload
        len: usize,
        /// Remote channel MTU
        mtu: usize,
    },

    /// Remote message arrived with no local client bound; buffered only
    #[error("no local client bound")]
    NoBoundClient,

    /// Underlying channel send failed; not retried
    #[error("transport send failure: {0}")]
    TransportSendFailure(#[source] ChannelError),

    /// The pairing was torn down; the notification was not accepted
    #[error("relay torn down")]
    TornDown,
}

impl RelayError {
    /// Map a channel creation failure to an establishment error
    pub(crate) fn from_establish(err: ChannelError) -> Self {
        match err {
            ChannelError::Exhausted(msg) => Self::AllocationFailure(msg),
            ChannelError::Io(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                Self::AllocationFailure(e.to_string())
            }
            other => Self::ChannelUnavailable(other.to_string()),
        }
    }

    /// Map a send failure, keeping the MTU rejection distinct
    pub(crate) fn from_send(err: ChannelError) -> Self {
        match err {
            ChannelError::PayloadTooLarge { len, mtu } => Self::PayloadTooLarge { len, mtu },
            other => Self::TransportSendFailure(other),
        }
    }
}
