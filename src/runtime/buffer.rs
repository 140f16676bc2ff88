//! Per-connection byte buffers with a fixed logical capacity.
//!
//! Storage is a `BytesMut`; the capacity bound is enforced here rather than by
//! the allocation, so the same type serves the append-only read side and the
//! FIFO write side of a connection.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Appending would take a buffer past its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer overflow: {pending} pending + {incoming} incoming exceeds capacity {capacity}")]
pub struct BufferOverflow {
    pub capacity: usize,
    pub pending: usize,
    pub incoming: usize,
}

/// FIFO byte buffer bounded to `capacity` pending bytes.
#[derive(Debug)]
pub struct BoundedBuffer {
    data: BytesMut,
    capacity: usize,
}

impl BoundedBuffer {
    /// Create an empty buffer that holds at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes currently pending.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Room left before an append overflows.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Pending bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append `bytes` at the tail.
    ///
    /// Nothing is appended when the whole slice does not fit.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), BufferOverflow> {
        if bytes.len() > self.remaining() {
            return Err(BufferOverflow {
                capacity: self.capacity,
                pending: self.data.len(),
                incoming: bytes.len(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Drop `n` bytes from the head after they have been written out.
    ///
    /// The retained bytes become the new head; consumed bytes are never
    /// handed out again.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.data.len(), "consumed past pending data");
        self.data.advance(n.min(self.data.len()));
    }

    /// Move every pending byte to the tail of `dst`, leaving `self` empty.
    ///
    /// On overflow neither buffer is modified.
    pub fn drain_into(&mut self, dst: &mut BoundedBuffer) -> Result<usize, BufferOverflow> {
        let moved = self.data.len();
        dst.extend(&self.data)?;
        self.data.clear();
        Ok(moved)
    }
}
