//! Message framing for the coverage stream.
//!
//! Frames are UTF-8 text terminated by `\r\n\r\n`. There is no length
//! prefix, so the reader accumulates bytes in a growable arena and scans
//! for the delimiter after every read. A delimiter can straddle two reads,
//! which is why rescans start up to three bytes before the new data.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame terminator. Also the shutdown command when sent on its own.
pub const DELIMITER: [u8; 4] = *b"\r\n\r\n";

/// Initial arena size; large enough for a typical coverage report.
pub const DEFAULT_BUFFER_SIZE: usize = 100 * 1024;

/// Find the first delimiter inside `buf[start..start + len]`.
///
/// Returns the absolute offset of the delimiter's first byte. The region is
/// clamped to the buffer, and a delimiter must lie entirely inside it.
pub fn find_message_break(buf: &[u8], start: usize, len: usize) -> Option<usize> {
    let end = start.saturating_add(len).min(buf.len());
    if start >= end {
        return None;
    }
    buf[start..end]
        .windows(DELIMITER.len())
        .position(|w| w == DELIMITER)
        .map(|pos| start + pos)
}

/// Per-connection reassembly arena.
///
/// Holds the bytes of the message currently being received plus any bytes
/// that arrived after the last delimiter. The arena doubles its target
/// capacity whenever it is more than 80% full.
#[derive(Debug)]
pub struct FrameBuffer {
    data: BytesMut,
    /// Target capacity, doubled by the growth policy.
    capacity: usize,
    /// Bytes at the front already known to contain no delimiter.
    scanned: usize,
}

impl FrameBuffer {
    /// Create an empty arena.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(DELIMITER.len() * 2);
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            scanned: 0,
        }
    }

    /// Create an arena seeded with bytes already taken off the stream.
    ///
    /// The seed is treated as unread input and scanned like any other data.
    pub fn with_prefix(prefix: &[u8], capacity: usize) -> Self {
        let mut buffer = Self::with_capacity(capacity);
        buffer.data.extend_from_slice(prefix);
        buffer.grow_if_needed();
        buffer
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current target capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read whatever the peer has available into the arena.
    ///
    /// Returns the byte count from the underlying read; `0` means end of stream.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let spare = self.capacity.saturating_sub(self.data.len());
        self.data.reserve(spare.max(1));
        let n = reader.read_buf(&mut self.data).await?;
        self.grow_if_needed();
        Ok(n)
    }

    /// Append bytes directly, as if they had been read.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.grow_if_needed();
    }

    /// Split off the next complete frame, without its delimiter.
    ///
    /// Bytes after the delimiter stay at the front of the arena and are
    /// rescanned in full on the next call.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = self.scanned.saturating_sub(DELIMITER.len() - 1);
        let len = self.data.len() - start;
        match find_message_break(&self.data, start, len) {
            Some(split) => {
                let frame = self.data.split_to(split).freeze();
                self.data.advance(DELIMITER.len());
                self.scanned = 0;
                Some(frame)
            }
            None => {
                self.scanned = self.data.len();
                None
            }
        }
    }

    fn grow_if_needed(&mut self) {
        while self.data.len() * 5 > self.capacity * 4 {
            self.capacity *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_break_at_start() {
        assert_eq!(find_message_break(b"\r\n\r\nabc", 0, 7), Some(0));
    }

    #[test]
    fn test_find_break_after_message() {
        let buf = b"{\"id\":\"a\"}\r\n\r\n";
        assert_eq!(find_message_break(buf, 0, buf.len()), Some(10));
    }

    #[test]
    fn test_find_break_returns_first() {
        let buf = b"one\r\n\r\ntwo\r\n\r\n";
        assert_eq!(find_message_break(buf, 0, buf.len()), Some(3));
        assert_eq!(find_message_break(buf, 5, buf.len() - 5), Some(10));
    }

    #[test]
    fn test_find_break_ignores_single_crlf() {
        let buf = b"0\r\n1\r\n2\n\r\n";
        assert_eq!(find_message_break(buf, 0, buf.len()), None);
    }

    #[test]
    fn test_find_break_partial_delimiter() {
        assert_eq!(find_message_break(b"abc\r\n\r", 0, 6), None);
    }

    #[test]
    fn test_find_break_region_clamped() {
        let buf = b"ab\r\n\r\n";
        assert_eq!(find_message_break(buf, 0, 100), Some(2));
        assert_eq!(find_message_break(buf, 0, 5), None);
        assert_eq!(find_message_break(buf, 10, 4), None);
    }

    #[test]
    fn test_frame_straddling_reads() {
        let mut buffer = FrameBuffer::with_capacity(64);

        buffer.extend_from_slice(b"hello\r\n");
        assert!(buffer.next_frame().is_none());

        buffer.extend_from_slice(b"\r\nworld");
        let frame = buffer.next_frame().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert_eq!(buffer.len(), 5);
        assert!(buffer.next_frame().is_none());
    }

    #[test]
    fn test_delimiter_split_one_byte_at_a_time() {
        let mut buffer = FrameBuffer::with_capacity(64);
        buffer.extend_from_slice(b"msg");
        for byte in DELIMITER {
            assert!(buffer.next_frame().is_none());
            buffer.extend_from_slice(&[byte]);
        }
        assert_eq!(&buffer.next_frame().unwrap()[..], b"msg");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut buffer = FrameBuffer::with_capacity(64);
        buffer.extend_from_slice(b"a\r\n\r\nb\r\n\r\nc");

        assert_eq!(&buffer.next_frame().unwrap()[..], b"a");
        assert_eq!(&buffer.next_frame().unwrap()[..], b"b");
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_empty_frame_at_start() {
        let mut buffer = FrameBuffer::with_prefix(&DELIMITER, 64);
        let frame = buffer.next_frame().unwrap();
        assert!(frame.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_doubles_past_eighty_percent() {
        let mut buffer = FrameBuffer::with_capacity(100);
        buffer.extend_from_slice(&[b'x'; 80]);
        assert_eq!(buffer.capacity(), 100);

        buffer.extend_from_slice(b"x");
        assert_eq!(buffer.capacity(), 200);
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.len(), 81);
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"abc\r")
            .read(b"\n\r\n")
            .build();
        let mut buffer = FrameBuffer::with_capacity(16);

        assert_eq!(buffer.read_from(&mut reader).await.unwrap(), 4);
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.read_from(&mut reader).await.unwrap(), 3);
        assert_eq!(&buffer.next_frame().unwrap()[..], b"abc");
        assert_eq!(buffer.read_from(&mut reader).await.unwrap(), 0);
    }
}
