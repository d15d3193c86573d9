//! `StreamBuffer`: a bounded contiguous byte buffer with read/write cursors.
//!
//! A single occupied region of length `len` sits at offset 0 of a
//! fixed-capacity array. `commit_read` compacts the remaining bytes
//! forward with a `copy_within` rather than using a ring, so `read`/
//! `write` syscalls can operate on the occupied region directly without
//! scatter/gather. Capacity never grows after construction: a write that
//! would exceed it is the backpressure signal, not an error to recover
//! from by reallocating.

use crate::error::{Error, Result};

pub struct StreamBuffer {
    data: Vec<u8>,
    len: usize,
}

impl StreamBuffer {
    /// Allocate a buffer of fixed `capacity`. Capacity never changes afterward.
    pub fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity], len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes occupied in `[0, len)`.
    pub fn read_available(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The occupied region, valid to read.
    pub fn read_data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Shift the remaining `len - n` unread bytes to offset 0.
    pub fn commit_read(&mut self, n: usize) -> Result<()> {
        if n > self.len {
            return Err(Error::ShortRead { requested: n, available: self.len });
        }
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
        Ok(())
    }

    /// Free space at the tail of the occupied region.
    pub fn write_capacity(&self) -> usize {
        self.data.len() - self.len
    }

    /// The writable tail, sized to `write_capacity()`.
    pub fn write_data(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data[len..]
    }

    pub fn commit_write(&mut self, n: usize) -> Result<()> {
        if n > self.write_capacity() {
            return Err(Error::BufferFull);
        }
        self.len += n;
        Ok(())
    }

    /// Append `bytes`, failing with `BufferFull` rather than truncating
    /// or growing the buffer if they don't fit.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.write_capacity() {
            return Err(Error::BufferFull);
        }
        let start = self.len;
        self.write_data()[..bytes.len()].copy_from_slice(bytes);
        self.commit_write(bytes.len())
    }

    /// Reset to empty without deallocating.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn append_and_read() {
        let mut buf = StreamBuffer::new(16);
        buf.append(b"hello").unwrap();
        assert_eq!(buf.read_available(), 5);
        assert_eq!(buf.read_data(), b"hello");
    }

    #[test]
    fn commit_read_compacts_remaining_bytes() {
        let mut buf = StreamBuffer::new(16);
        buf.append(b"hello world").unwrap();
        buf.commit_read(6).unwrap();
        assert_eq!(buf.read_data(), b"world");
        assert_eq!(buf.write_capacity(), 11);
    }

    #[test]
    fn commit_read_past_len_fails() {
        let mut buf = StreamBuffer::new(16);
        buf.append(b"hi").unwrap();
        assert!(matches!(buf.commit_read(3), Err(Error::ShortRead { .. })));
    }

    #[test]
    fn write_beyond_capacity_signals_buffer_full() {
        let mut buf = StreamBuffer::new(4);
        assert!(matches!(buf.append(b"toolong"), Err(Error::BufferFull)));
        assert_eq!(buf.read_available(), 0);
    }

    #[test]
    fn clear_resets_without_deallocating() {
        let mut buf = StreamBuffer::new(8);
        buf.append(b"abcd").unwrap();
        buf.clear();
        assert_eq!(buf.read_available(), 0);
        assert_eq!(buf.capacity(), 8);
        buf.append(b"abcdefgh").unwrap();
        assert_eq!(buf.read_available(), 8);
    }

    #[test]
    fn fills_exactly_to_capacity() {
        let mut buf = StreamBuffer::new(4);
        buf.append(b"abcd").unwrap();
        assert_eq!(buf.write_capacity(), 0);
        assert!(matches!(buf.append(b"e"), Err(Error::BufferFull)));
    }

    proptest! {
        /// Occupied plus free space always equals capacity, and never
        /// exceeds it, no matter the sequence of appends and reads.
        #[test]
        fn occupied_and_free_always_sum_to_capacity(
            capacity in 1usize..256,
            ops in prop::collection::vec((prop::collection::vec(any::<u8>(), 0..64), 0usize..64), 0..32),
        ) {
            let mut buf = StreamBuffer::new(capacity);
            for (chunk, read_n) in ops {
                let _ = buf.append(&chunk[..chunk.len().min(buf.write_capacity())]);
                prop_assert_eq!(buf.read_available() + buf.write_capacity(), capacity);
                let n = read_n.min(buf.read_available());
                buf.commit_read(n).unwrap();
                prop_assert_eq!(buf.read_available() + buf.write_capacity(), capacity);
            }
        }

        /// Every byte that goes in via `append` comes back out via
        /// `read_data`/`commit_read` in the same order, regardless of how
        /// the reads are chunked — the conservation property the stack
        /// and SOCKS relay directions both depend on.
        #[test]
        fn bytes_survive_append_and_chunked_read(
            capacity in 8usize..256,
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..16),
            read_sizes in prop::collection::vec(1usize..16, 0..32),
        ) {
            let mut buf = StreamBuffer::new(capacity);
            let mut fed = Vec::new();
            let mut drained = Vec::new();
            let mut reads = read_sizes.into_iter().cycle();

            for chunk in chunks {
                if buf.append(&chunk).is_ok() {
                    fed.extend_from_slice(&chunk);
                }
                while buf.read_available() > 0 {
                    let n = reads.next().unwrap().min(buf.read_available());
                    if n == 0 {
                        break;
                    }
                    drained.extend_from_slice(&buf.read_data()[..n]);
                    buf.commit_read(n).unwrap();
                }
            }
            prop_assert_eq!(drained, fed);
        }
    }
}
