//! Datagram Framing
//!
//! Each local datagram carries a fixed header shaped like a netlink message
//! header, followed by the opaque payload.
//!
//! # Frame Format
//!
//! ```text
//! +------------+----------+-----------+-----------+-----------+----------------+
//! | Length (4) | Kind (2) | Flags (2) | Seq (4)   | Pid (4)   | Payload        |
//! | u32        | u16      | u16       | u32       | u32       | variable       |
//! +------------+----------+-----------+-----------+-----------+----------------+
//! ```
//!
//! All header fields are in host byte order. `Length` covers header and
//! payload. Inbound `Pid` is the sending process; replies carry pid 0.

use crate::error::ChannelError;

/// Header size in bytes
pub const HEADER_LEN: usize = 16;

/// Kind used for relay-to-client datagrams
pub const KIND_DONE: u16 = 3;

/// Largest datagram accepted on the local socket
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Decoded datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total length (header + payload)
    pub len: u32,
    /// Message kind
    pub kind: u16,
    /// Message flags
    pub flags: u16,
    /// Sequence number chosen by the sender
    pub seq: u32,
    /// Sender process identity
    pub pid: u32,
}

/// Build a datagram carrying `payload`
///
/// # Errors
///
/// Returns `ChannelError::Frame` if the frame would exceed `MAX_DATAGRAM_LEN`.
pub fn encode(kind: u16, pid: u32, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let total = HEADER_LEN + payload.len();
    if total > MAX_DATAGRAM_LEN {
        return Err(ChannelError::Frame(format!(
            "frame too large: {total} bytes (max: {MAX_DATAGRAM_LEN})"
        )));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&pid.to_ne_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a received datagram into header and payload
///
/// Bytes past the header's declared length are ignored.
///
/// # Errors
///
/// Returns `ChannelError::Frame` if the datagram is shorter than a header or
/// the declared length is out of range.
pub fn decode(datagram: &[u8]) -> Result<(Header, &[u8]), ChannelError> {
    if datagram.len() < HEADER_LEN {
        return Err(ChannelError::Frame(format!(
            "datagram of {} bytes is shorter than header",
            datagram.len()
        )));
    }

    let u32_at = |at: usize| {
        u32::from_ne_bytes([
            datagram[at],
            datagram[at + 1],
            datagram[at + 2],
            datagram[at + 3],
        ])
    };
    let u16_at = |at: usize| u16::from_ne_bytes([datagram[at], datagram[at + 1]]);

    let header = Header {
        len: u32_at(0),
        kind: u16_at(4),
        flags: u16_at(6),
        seq: u32_at(8),
        pid: u32_at(12),
    };

    let len = header.len as usize;
    if len < HEADER_LEN || len > datagram.len() {
        return Err(ChannelError::Frame(format!(
            "declared length {len} out of range for {} byte datagram",
            datagram.len()
        )));
    }

    Ok((header, &datagram[HEADER_LEN..len]))
}
