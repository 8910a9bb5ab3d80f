//! Cyclic byte ring carrying length-prefixed tuple records

use std::ptr::NonNull;

/// Size of the native-endian length prefix preceding every tuple record
pub const TUPLE_LEN_SIZE: usize = std::mem::size_of::<u32>();

/// Sentinel stored in the tuple counter while a tuple larger than the ring
/// is being streamed through in fragments
pub const LONG_TUPLE: i32 = -42;

/// A cyclic byte ring over a carved range of the shared data region.
///
/// Reads and writes wrap across the ring length with at most two copies.
/// `read_pos == write_pos` is ambiguous between full and empty; the tuple
/// counter disambiguates. The record format (native-endian `u32` length
/// followed by the payload) is strictly in-memory and not portable
/// off-process.
#[derive(Debug)]
pub struct RingBuf {
    start: NonNull<u8>,
    pub(crate) length: usize,
    pub(crate) read_pos: usize,
    pub(crate) write_pos: usize,
    pub(crate) ntuples: i32,
}

impl RingBuf {
    /// Create a ring over `length` bytes at `start`.
    ///
    /// # Safety
    ///
    /// `start..start + length` must stay valid for the life of the ring and
    /// must only be touched through this ring while its owning lock is held.
    pub unsafe fn from_raw(start: NonNull<u8>, length: usize) -> Self {
        Self {
            start,
            length,
            read_pos: 0,
            write_pos: 0,
            ntuples: 0,
        }
    }

    /// A ring not (yet) attached to any region range
    pub fn detached() -> Self {
        Self {
            start: NonNull::dangling(),
            length: 0,
            read_pos: 0,
            write_pos: 0,
            ntuples: 0,
        }
    }

    /// Ring capacity in bytes
    pub fn length(&self) -> usize {
        self.length
    }

    /// Number of complete tuples queued, or [`LONG_TUPLE`] while a fragment
    /// transfer is in progress
    pub fn ntuples(&self) -> i32 {
        self.ntuples
    }

    /// Free bytes available for writing.
    ///
    /// While the ring holds no complete tuple (including long-tuple mode,
    /// where the consumer has drained everything written so far) the whole
    /// ring is writable.
    pub fn free_space(&self) -> usize {
        if self.ntuples > 0 {
            if self.read_pos >= self.write_pos {
                self.read_pos - self.write_pos
            } else {
                self.length + self.read_pos - self.write_pos
            }
        } else {
            self.length
        }
    }

    /// Bytes currently occupied by queued records
    pub fn used_space(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.length + self.write_pos - self.read_pos
        }
    }

    /// Append `src` at the write position, wrapping if needed
    pub fn write(&mut self, src: &[u8]) {
        let len = src.len();
        debug_assert!(len <= self.length);
        unsafe {
            if self.write_pos + len <= self.length {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    self.start.as_ptr().add(self.write_pos),
                    len,
                );
                self.write_pos += len;
                if self.write_pos == self.length {
                    self.write_pos = 0;
                }
            } else {
                let part = self.length - self.write_pos;
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    self.start.as_ptr().add(self.write_pos),
                    part,
                );
                self.write_pos = len - part;
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(part),
                    self.start.as_ptr(),
                    self.write_pos,
                );
            }
        }
    }

    /// Consume `dst.len()` bytes from the read position, wrapping if needed
    pub fn read_into(&mut self, dst: &mut [u8]) {
        let len = dst.len();
        debug_assert!(len <= self.length);
        unsafe {
            if self.read_pos + len <= self.length {
                std::ptr::copy_nonoverlapping(
                    self.start.as_ptr().add(self.read_pos),
                    dst.as_mut_ptr(),
                    len,
                );
                self.read_pos += len;
                if self.read_pos == self.length {
                    self.read_pos = 0;
                }
            } else {
                let part = self.length - self.read_pos;
                std::ptr::copy_nonoverlapping(
                    self.start.as_ptr().add(self.read_pos),
                    dst.as_mut_ptr(),
                    part,
                );
                self.read_pos = len - part;
                std::ptr::copy_nonoverlapping(
                    self.start.as_ptr(),
                    dst.as_mut_ptr().add(part),
                    self.read_pos,
                );
            }
        }
    }

    /// Append a native-endian record length prefix
    pub fn write_u32(&mut self, value: u32) {
        self.write(&value.to_ne_bytes());
    }

    /// Consume a native-endian record length prefix
    pub fn read_u32(&mut self) -> u32 {
        let mut bytes = [0u8; TUPLE_LEN_SIZE];
        self.read_into(&mut bytes);
        u32::from_ne_bytes(bytes)
    }

    /// Store the long-tuple progress offset at the ring base, outside the
    /// read/write positions. This is the consumer's cue to the producer.
    pub fn store_base_u32(&mut self, value: u32) {
        debug_assert!(self.length >= TUPLE_LEN_SIZE);
        unsafe {
            std::ptr::copy_nonoverlapping(
                value.to_ne_bytes().as_ptr(),
                self.start.as_ptr(),
                TUPLE_LEN_SIZE,
            );
        }
    }

    /// Load the long-tuple progress offset from the ring base
    pub fn load_base_u32(&self) -> u32 {
        debug_assert!(self.length >= TUPLE_LEN_SIZE);
        let mut bytes = [0u8; TUPLE_LEN_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(self.start.as_ptr(), bytes.as_mut_ptr(), TUPLE_LEN_SIZE);
        }
        u32::from_ne_bytes(bytes)
    }

    /// Discard all queued bytes and reset positions
    pub fn clear(&mut self) {
        self.ntuples = 0;
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

// Safety: the ring is only reachable through the consumer lock that guards it.
unsafe impl Send for RingBuf {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_over(buf: &mut [u8]) -> RingBuf {
        let start = NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe { RingBuf::from_raw(start, buf.len()) }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut buf = vec![0u8; 32];
        let mut ring = ring_over(&mut buf);

        ring.write(b"hello");
        ring.ntuples = 1;
        let mut out = [0u8; 5];
        ring.read_into(&mut out);
        assert_eq!(&out, b"hello");
        assert_eq!(ring.read_pos, ring.write_pos);
    }

    #[test]
    fn test_split_wrap_copies() {
        let mut buf = vec![0u8; 8];
        let mut ring = ring_over(&mut buf);

        // Walk the positions near the end so the next record wraps.
        ring.write(&[0; 6]);
        let mut sink = [0u8; 6];
        ring.read_into(&mut sink);
        assert_eq!(ring.write_pos, 6);

        ring.write(&[1, 2, 3, 4]);
        assert_eq!(ring.write_pos, 2);
        let mut out = [0u8; 4];
        ring.read_into(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ring.read_pos, 2);
    }

    #[test]
    fn test_length_prefix_spans_wrap() {
        let mut buf = vec![0u8; 10];
        let mut ring = ring_over(&mut buf);

        ring.write(&[0; 8]);
        let mut sink = [0u8; 8];
        ring.read_into(&mut sink);

        // Prefix occupies bytes 8, 9, 0, 1.
        ring.write_u32(0xDEAD_BEEF);
        assert_eq!(ring.write_pos, 2);
        assert_eq!(ring.read_u32(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_free_space_identity() {
        let mut buf = vec![0u8; 64];
        let mut ring = ring_over(&mut buf);
        assert_eq!(ring.free_space(), 64);

        // Three 20-byte records fill 60 bytes.
        for i in 0..3u8 {
            ring.write_u32(16);
            ring.write(&[i; 16]);
            ring.ntuples += 1;
            assert_eq!(ring.free_space(), 64 - 20 * (i as usize + 1));
        }
        assert_eq!(ring.free_space(), 4);

        // Draining one record frees exactly its footprint.
        let len = ring.read_u32() as usize;
        let mut out = vec![0u8; len];
        ring.read_into(&mut out);
        ring.ntuples -= 1;
        assert_eq!(out, vec![0u8; 16]);
        assert_eq!(ring.free_space(), 24);
    }

    #[test]
    fn test_full_vs_empty_disambiguation() {
        let mut buf = vec![0u8; 16];
        let mut ring = ring_over(&mut buf);

        // Exactly filling the ring leaves read_pos == write_pos while full.
        ring.write(&[7; 16]);
        ring.ntuples = 1;
        assert_eq!(ring.read_pos, ring.write_pos);
        assert_eq!(ring.free_space(), 0);

        let mut out = [0u8; 16];
        ring.read_into(&mut out);
        ring.ntuples = 0;
        assert_eq!(ring.free_space(), 16);
    }

    #[test]
    fn test_base_offset_slot() {
        let mut buf = vec![0u8; 16];
        let mut ring = ring_over(&mut buf);
        ring.store_base_u32(12345);
        assert_eq!(ring.load_base_u32(), 12345);
        // Long-tuple mode treats the whole ring as writable.
        ring.ntuples = LONG_TUPLE;
        assert_eq!(ring.free_space(), 16);
    }

    #[test]
    fn test_clear() {
        let mut buf = vec![0u8; 16];
        let mut ring = ring_over(&mut buf);
        ring.write(&[1; 10]);
        ring.ntuples = 2;
        ring.clear();
        assert_eq!(ring.ntuples, 0);
        assert_eq!(ring.read_pos, 0);
        assert_eq!(ring.write_pos, 0);
        assert_eq!(ring.free_space(), 16);
    }
}
