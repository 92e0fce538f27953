//! Fixed-length, pre-allocated buffers for packet assembly. Their purpose is to minimize
//!  copying and allow pooled reuse: they are backed by a fixed-capacity allocation, implement
//!  `BufMut` to fit into the `bytes` ecosystem, and implement `aead::Buffer` (directly and
//!  through limited-lifetime tail views) to support in-place AEAD sealing.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};

use bytes::buf::UninitSlice;

/// A fixed-capacity, dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so we trade the one-time cost of zero
            //  initialization for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    /// a limited-lifetime view of this buffer starting at a given offset, for sealing the
    ///  packet while leaving the envelope prefix untouched
    pub fn tail(&mut self, start_offset: usize) -> TailBuf {
        assert!(start_offset <= self.len);
        TailBuf {
            inner: self,
            start_offset,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// make the entire underlying allocation available through as_mut(), e.g. as a receive target
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

impl aead::Buffer for FixedBuf {
    fn extend_from_slice(&mut self, other: &[u8]) -> aead::Result<()> {
        if self.len + other.len() > self.capacity() {
            return Err(aead::Error);
        }
        self.buf[self.len..self.len + other.len()].copy_from_slice(other);
        self.len += other.len();
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }
}


/// A view of a [`FixedBuf`]'s tail, starting at a fixed offset. All `aead::Buffer` operations
///  are relative to that offset, while length changes write through to the underlying buffer.
pub struct TailBuf<'a> {
    inner: &'a mut FixedBuf,
    start_offset: usize,
}

impl AsRef<[u8]> for TailBuf<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.inner.as_ref()[self.start_offset..]
    }
}

impl AsMut<[u8]> for TailBuf<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        let start_offset = self.start_offset;
        &mut self.inner.as_mut()[start_offset..]
    }
}

impl aead::Buffer for TailBuf<'_> {
    fn extend_from_slice(&mut self, other: &[u8]) -> aead::Result<()> {
        self.inner.extend_from_slice(other)
    }

    fn truncate(&mut self, len: usize) {
        aead::Buffer::truncate(self.inner, self.start_offset + len);
    }
}
