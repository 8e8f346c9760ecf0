//! Last Message Buffer
//!
//! Fixed-capacity copy of the most recently relayed remote message.
//!
//! Writes replace the whole content. A message longer than the capacity is
//! truncated silently: only the first `capacity` bytes are kept and the rest
//! is dropped. Callers that care compare [`LastMessageBuffer::write`]'s return
//! value with the payload length.
//!
//! Every write bumps a generation number. Readers remember the generation
//! their cursor belongs to, so a cursor never continues into the bytes of a
//! different message.

use parking_lot::RwLock;

/// Default capacity in bytes
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Contents {
    data: Vec<u8>,
    generation: u64,
}

/// Thread-safe holder of the last remote message
#[derive(Debug)]
pub struct LastMessageBuffer {
    capacity: usize,
    inner: RwLock<Contents>,
}

/// A consistent copy of a slice of the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    /// Bytes read, possibly empty (end of data)
    pub bytes: Vec<u8>,
    /// Cursor position after this read
    pub cursor: usize,
    /// Generation of the message the bytes came from
    pub generation: u64,
}

impl LastMessageBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Contents {
                data: Vec::with_capacity(capacity),
                generation: 0,
            }),
        }
    }

    /// Maximum number of bytes kept per message
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Length of the current content
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    /// Whether the buffer holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation of the current content (0 until the first write)
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Replace the content with `payload`, truncated to the capacity
    ///
    /// Returns the number of bytes actually stored.
    pub fn write(&self, payload: &[u8]) -> usize {
        let stored = payload.len().min(self.capacity);
        let mut inner = self.inner.write();
        inner.data.clear();
        inner.data.extend_from_slice(&payload[..stored]);
        inner.generation += 1;
        stored
    }

    /// Empty the buffer
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.data.clear();
        inner.generation += 1;
    }

    /// Read up to `max_len` bytes starting at `cursor`
    ///
    /// Returns `min(max_len, len - cursor)` bytes. Once `cursor >= len` the
    /// chunk is empty, which signals end of data.
    #[must_use]
    pub fn read_from(&self, cursor: usize, max_len: usize) -> ReadChunk {
        let inner = self.inner.read();
        Self::chunk(&inner, cursor, max_len)
    }

    /// Read like [`read_from`](Self::read_from), but restart at 0 if the
    /// content changed since `generation`
    pub(crate) fn read_since(&self, generation: u64, cursor: usize, max_len: usize) -> ReadChunk {
        let inner = self.inner.read();
        let cursor = if inner.generation == generation {
            cursor
        } else {
            0
        };
        Self::chunk(&inner, cursor, max_len)
    }

    /// Copy of the full current content
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.read().data.clone()
    }

    fn chunk(inner: &Contents, cursor: usize, max_len: usize) -> ReadChunk {
        let len = inner.data.len();
        if cursor >= len {
            return ReadChunk {
                bytes: Vec::new(),
                cursor,
                generation: inner.generation,
            };
        }
        let end = cursor + max_len.min(len - cursor);
        ReadChunk {
            bytes: inner.data[cursor..end].to_vec(),
            cursor: end,
            generation: inner.generation,
        }
    }
}

impl Default for LastMessageBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = LastMessageBuffer::new(8);
        assert!(buf.is_empty());
        assert_eq!(buf.generation(), 0);
        assert!(buf.read_from(0, 8).bytes.is_empty());
    }

    #[test]
    fn test_write_and_read_whole() {
        let buf = LastMessageBuffer::new(16);
        assert_eq!(buf.write(b"hello"), 5);

        let chunk = buf.read_from(0, 16);
        assert_eq!(chunk.bytes, b"hello".to_vec());
        assert_eq!(chunk.cursor, 5);

        // End of data
        let chunk = buf.read_from(chunk.cursor, 16);
        assert!(chunk.bytes.is_empty());
        assert_eq!(chunk.cursor, 5);
    }

    #[test]
    fn test_truncates_at_capacity() {
        let buf = LastMessageBuffer::new(4);
        assert_eq!(buf.write(b"abcdefgh"), 4);
        assert_eq!(buf.snapshot(), b"abcd".to_vec());
        assert_eq!(buf.read_from(0, 100).bytes, b"abcd".to_vec());
    }

    #[test]
    fn test_read_in_chunks() {
        let buf = LastMessageBuffer::new(16);
        buf.write(b"0123456789");

        let first = buf.read_from(0, 4);
        assert_eq!(first.bytes, b"0123".to_vec());
        let second = buf.read_from(first.cursor, 4);
        assert_eq!(second.bytes, b"4567".to_vec());
        let third = buf.read_from(second.cursor, 4);
        assert_eq!(third.bytes, b"89".to_vec());
        assert!(buf.read_from(third.cursor, 4).bytes.is_empty());
    }

    #[test]
    fn test_new_write_replaces_shorter() {
        let buf = LastMessageBuffer::new(16);
        buf.write(b"long message");
        buf.write(b"ack");
        assert_eq!(buf.snapshot(), b"ack".to_vec());
        assert_eq!(buf.generation(), 2);
    }

    #[test]
    fn test_read_since_restarts_on_new_generation() {
        let buf = LastMessageBuffer::new(16);
        buf.write(b"first");
        let chunk = buf.read_from(0, 2);
        assert_eq!(chunk.bytes, b"fi".to_vec());

        buf.write(b"second");
        let next = buf.read_since(chunk.generation, chunk.cursor, 16);
        assert_eq!(next.bytes, b"second".to_vec());
        assert_eq!(next.generation, 2);
    }

    #[test]
    fn test_zero_length_write() {
        let buf = LastMessageBuffer::new(16);
        buf.write(b"data");
        assert_eq!(buf.write(b""), 0);
        assert!(buf.is_empty());
    }
}
