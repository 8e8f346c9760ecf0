//! Passive Read Surface
//!
//! Byte-stream view of the [`LastMessageBuffer`], independent of the relay
//! path. Every `open()` gets its own cursor at 0; all openers share the same
//! buffer content.
//!
//! ```ignore
//! let mut cursor = reader.open();
//! loop {
//!     let bytes = cursor.read(256);
//!     if bytes.is_empty() {
//!         break; // end of data
//!     }
//!     out.extend(bytes);
//! }
//! cursor.close();
//! ```

use std::sync::Arc;

use crate::buffer::LastMessageBuffer;

/// Factory for read cursors over a shared buffer
#[derive(Debug, Clone)]
pub struct PassiveReader {
    buffer: Arc<LastMessageBuffer>,
}

impl PassiveReader {
    /// Create a reader over `buffer`
    #[must_use]
    pub fn new(buffer: Arc<LastMessageBuffer>) -> Self {
        Self { buffer }
    }

    /// Open a fresh cursor at offset 0
    #[must_use]
    pub fn open(&self) -> ReadCursor {
        ReadCursor {
            buffer: Arc::clone(&self.buffer),
            offset: 0,
            generation: self.buffer.generation(),
            exhausted: false,
        }
    }

    /// The buffer this reader serves
    #[must_use]
    pub fn buffer(&self) -> &Arc<LastMessageBuffer> {
        &self.buffer
    }
}

/// One opener's position in the buffer
///
/// If a new message replaces the content while the cursor is part way
/// through, the next read restarts at the beginning of the new message.
/// Once a read has returned end of data the cursor stays exhausted.
#[derive(Debug)]
pub struct ReadCursor {
    buffer: Arc<LastMessageBuffer>,
    offset: usize,
    generation: u64,
    exhausted: bool,
}

impl ReadCursor {
    /// Read up to `max_len` bytes; an empty result means end of data
    pub fn read(&mut self, max_len: usize) -> Vec<u8> {
        if self.exhausted || max_len == 0 {
            return Vec::new();
        }

        let chunk = self
            .buffer
            .read_since(self.generation, self.offset, max_len);
        if chunk.generation != self.generation {
            tracing::debug!(
                from = self.generation,
                to = chunk.generation,
                "Buffer replaced mid-read, restarting cursor"
            );
        }

        self.generation = chunk.generation;
        self.offset = chunk.cursor;
        if chunk.bytes.is_empty() {
            self.exhausted = true;
        }
        chunk.bytes
    }

    /// Current offset into the message
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether end of data has been reached
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Release the cursor
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reader_with(content: &[u8], capacity: usize) -> PassiveReader {
        let buffer = Arc::new(LastMessageBuffer::new(capacity));
        buffer.write(content);
        PassiveReader::new(buffer)
    }

    #[test]
    fn test_read_until_end_of_data() {
        let reader = reader_with(b"hello", 64);
        let mut cursor = reader.open();

        assert_eq!(cursor.read(3), b"hel".to_vec());
        assert_eq!(cursor.read(3), b"lo".to_vec());
        assert!(cursor.read(3).is_empty());
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.offset(), 5);
    }

    #[test]
    fn test_openers_have_independent_cursors() {
        let reader = reader_with(b"shared", 64);
        let mut a = reader.open();
        let mut b = reader.open();

        assert_eq!(a.read(2), b"sh".to_vec());
        assert_eq!(b.read(64), b"shared".to_vec());
        assert_eq!(a.read(64), b"ared".to_vec());
    }

    #[test]
    fn test_empty_buffer_is_immediately_exhausted() {
        let reader = PassiveReader::new(Arc::new(LastMessageBuffer::new(16)));
        let mut cursor = reader.open();
        assert!(cursor.read(16).is_empty());
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_replacement_mid_read_restarts() {
        let reader = reader_with(b"old message", 64);
        let mut cursor = reader.open();
        assert_eq!(cursor.read(4), b"old ".to_vec());

        reader.buffer().write(b"new");
        assert_eq!(cursor.read(64), b"new".to_vec());
        assert!(cursor.read(64).is_empty());
    }

    #[test]
    fn test_exhausted_cursor_stays_exhausted() {
        let reader = reader_with(b"ack", 64);
        let mut cursor = reader.open();
        assert_eq!(cursor.read(64), b"ack".to_vec());
        assert!(cursor.read(64).is_empty());

        reader.buffer().write(b"later");
        assert!(cursor.read(64).is_empty());

        // A fresh open sees the new content
        assert_eq!(reader.open().read(64), b"later".to_vec());
    }
}
