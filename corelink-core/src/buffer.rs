//! Zero-copy byte-chain buffer used for assembling and cutting frames.
//!
//! A non-shared chain of [`Bytes`] slices. Appending never copies the
//! underlying bytes of another `IOBuffer` — it clones the refcounted
//! `Bytes` handles into this chain. Cutting front bytes off pops whole
//! slices and, when a cut falls mid-slice, re-slices the remainder in
//! place (again without copying the tail bytes). A single `IOBuffer`
//! is only ever touched by one thread at a time; the socket's receive
//! buffer is owned exclusively by its reactor.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};

/// Minimum read hint used when filling from a file descriptor.
pub const READ_CHUNK_HINT: usize = 4096;

#[derive(Debug, Default, Clone)]
pub struct IoBuffer {
    slices: VecDeque<Bytes>,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self {
            slices: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    pub fn clear(&mut self) {
        self.slices.clear();
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Append raw bytes, copying them into the chain as a new slice.
    pub fn append(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.slices.push_back(Bytes::copy_from_slice(data));
        }
    }

    /// Append an owned `Bytes`, which is cheap to clone (refcounted).
    pub fn append_bytes(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.slices.push_back(data);
        }
    }

    /// Append the contents of another buffer, cloning slice references
    /// rather than copying the underlying bytes.
    pub fn append_buffer(&mut self, other: &IoBuffer) {
        for slice in &other.slices {
            self.slices.push_back(slice.clone());
        }
    }

    /// Append another buffer by moving its slices in, leaving `other`
    /// empty.
    pub fn append_buffer_take(&mut self, other: &mut IoBuffer) {
        self.slices.append(&mut other.slices);
    }

    /// Fill from a readable file descriptor-like source, reading at
    /// least [`READ_CHUNK_HINT`] bytes per call. Returns the number of
    /// bytes read; `Ok(0)` means the peer closed (EOF).
    pub fn append_from_reader<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = BytesMut::zeroed(READ_CHUNK_HINT);
        let n = reader.read(&mut chunk)?;
        if n > 0 {
            chunk.truncate(n);
            self.slices.push_back(chunk.freeze());
        }
        Ok(n)
    }

    /// Remove up to `n` bytes from the front, returning how many were
    /// actually removed (less than `n` if the buffer was shorter).
    pub fn pop_front(&mut self, n: usize) -> usize {
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.slices.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.slices.pop_front();
            } else {
                front.advance_and_keep(remaining);
                remaining = 0;
            }
        }
        n - remaining
    }

    /// Cut exactly up to `n` bytes from the front into a new buffer,
    /// without copying underlying bytes.
    pub fn cut(&mut self, n: usize) -> IoBuffer {
        let mut out = IoBuffer::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.slices.front().cloned() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.slices.pop_front();
                out.slices.push_back(front);
            } else {
                let head = front.slice(0..remaining);
                out.slices.push_back(head);
                let new_front = front.slice(remaining..);
                self.slices.pop_front();
                self.slices.push_front(new_front);
                remaining = 0;
            }
        }
        out
    }

    /// Cut up to `n` bytes from the front into a freshly-allocated
    /// contiguous `Vec<u8>`.
    pub fn cut_into_vec(&mut self, n: usize) -> Vec<u8> {
        let cut = self.cut(n);
        cut.to_vec()
    }

    /// Copy (non-destructively) the first `n` bytes into a contiguous
    /// `Vec<u8>` without consuming them.
    pub fn copy_to_vec(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.min(self.len()));
        let mut remaining = n;
        for slice in &self.slices {
            if remaining == 0 {
                break;
            }
            let take = slice.len().min(remaining);
            out.extend_from_slice(&slice[..take]);
            remaining -= take;
        }
        out
    }

    /// Render the whole buffer as a contiguous owned `Vec<u8>`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }

    /// Write the whole buffer out via gathered writes, looping on
    /// `WouldBlock`/`Interrupted` as the caller directs via `retry_on`.
    /// Returns the number of bytes actually written before the first
    /// unretried error or a short write signalling backpressure.
    pub fn write_into<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.slices.is_empty() {
            return Ok(0);
        }
        let io_slices: Vec<IoSlice<'_>> = self.slices.iter().map(|s| IoSlice::new(s)).collect();
        let n = writer.write_vectored(&io_slices)?;
        self.pop_front(n);
        Ok(n)
    }

    /// Non-destructive iterator over the underlying slices, for
    /// zero-copy inspection (e.g. `parse_frame` header peeking).
    pub fn iter_slices(&self) -> impl Iterator<Item = &Bytes> {
        self.slices.iter()
    }
}

/// Small helper trait so `pop_front` can shrink a `Bytes` in place by
/// re-slicing rather than reconstructing.
trait AdvanceInPlace {
    fn advance_and_keep(&mut self, n: usize);
}

impl AdvanceInPlace for Bytes {
    fn advance_and_keep(&mut self, n: usize) {
        let rest = self.slice(n..);
        *self = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_len() {
        let mut buf = IoBuffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.to_vec(), b"hello world");
    }

    #[test]
    fn append_buffer_shares_slices_not_bytes() {
        let mut a = IoBuffer::new();
        a.append(b"shared");
        let mut b = IoBuffer::new();
        b.append_buffer(&a);
        assert_eq!(b.to_vec(), b"shared");
        assert_eq!(a.len(), 6, "original buffer untouched by the copy");
    }

    #[test]
    fn pop_front_partial_slice() {
        let mut buf = IoBuffer::new();
        buf.append(b"abcdef");
        let removed = buf.pop_front(3);
        assert_eq!(removed, 3);
        assert_eq!(buf.to_vec(), b"def");
    }

    #[test]
    fn pop_front_more_than_available() {
        let mut buf = IoBuffer::new();
        buf.append(b"abc");
        let removed = buf.pop_front(10);
        assert_eq!(removed, 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn cut_spans_multiple_slices() {
        let mut buf = IoBuffer::new();
        buf.append(b"abc");
        buf.append(b"def");
        buf.append(b"ghi");
        let cut = buf.cut(7);
        assert_eq!(cut.to_vec(), b"abcdefg");
        assert_eq!(buf.to_vec(), b"hi");
    }

    #[test]
    fn cut_exact_slice_boundary() {
        let mut buf = IoBuffer::new();
        buf.append(b"abc");
        buf.append(b"def");
        let cut = buf.cut(3);
        assert_eq!(cut.to_vec(), b"abc");
        assert_eq!(buf.to_vec(), b"def");
    }

    #[test]
    fn copy_to_vec_is_non_destructive() {
        let mut buf = IoBuffer::new();
        buf.append(b"abcdef");
        let copy = buf.copy_to_vec(3);
        assert_eq!(copy, b"abc");
        assert_eq!(buf.len(), 6, "copy must not consume");
    }

    #[test]
    fn write_into_drains_on_success() {
        let mut buf = IoBuffer::new();
        buf.append(b"abc");
        let mut sink = Vec::new();
        let n = buf.write_into(&mut sink).unwrap();
        assert_eq!(n, 3);
        assert!(buf.is_empty());
        assert_eq!(sink, b"abc");
    }
}
