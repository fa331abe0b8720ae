//! Pooled receive buffers and the outbound send chain.
//!
//! Receive buffers are fixed-size `BytesMut` blocks recycled through a
//! process-wide pool so the hot read path does not allocate per message.
//! Outbound data is queued on a per-connection FIFO chain of `Bytes`
//! segments: the producer appends at the tail, the owning worker drains
//! from the head.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Fixed-size buffer pool.
///
/// `acquire` hands out a cleared buffer with at least `buf_size` capacity;
/// `release` recycles it. Buffers beyond `capacity` are dropped instead of
/// retained, bounding idle memory.
pub struct BufferPool {
    buf_size: usize,
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, capacity: usize) -> Self {
        Self {
            buf_size,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Size of buffers handed out by this pool.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn acquire(&self) -> BytesMut {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn release(&self, mut buf: BytesMut) {
        // A buffer that grew past the pool size or still shares its backing
        // storage is not worth keeping.
        if buf.capacity() < self.buf_size {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// FIFO chain of outbound byte segments for one connection.
///
/// Only the owning worker drains this; the head segment may be partially
/// written, tracked by `head_offset`.
#[derive(Default)]
pub struct SendChain {
    segments: VecDeque<Bytes>,
    head_offset: usize,
    queued_bytes: usize,
}

impl SendChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.queued_bytes += segment.len();
        self.segments.push_back(segment);
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// The unwritten remainder of the head segment, if any.
    pub fn head(&self) -> Option<&[u8]> {
        self.segments.front().map(|s| &s[self.head_offset..])
    }

    /// Record `n` bytes of the head segment as written, dropping the segment
    /// once fully consumed.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self
            .segments
            .front()
            .is_some_and(|s| self.head_offset + n <= s.len()));
        self.queued_bytes -= n;
        self.head_offset += n;
        if let Some(head) = self.segments.front() {
            if self.head_offset == head.len() {
                self.segments.pop_front();
                self.head_offset = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.head_offset = 0;
        self.queued_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_buffers() {
        let pool = BufferPool::new(64, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 2);
        // Third release beyond capacity is dropped.
        pool.release(BytesMut::with_capacity(64));
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn pool_drops_undersized_buffers() {
        let pool = BufferPool::new(64, 4);
        pool.release(BytesMut::with_capacity(8));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn chain_drains_in_fifo_order() {
        let mut chain = SendChain::new();
        chain.push(Bytes::from_static(b"hello"));
        chain.push(Bytes::from_static(b"world"));
        assert_eq!(chain.queued_bytes(), 10);

        assert_eq!(chain.head().unwrap(), b"hello");
        chain.advance(3);
        assert_eq!(chain.head().unwrap(), b"lo");
        chain.advance(2);
        assert_eq!(chain.head().unwrap(), b"world");
        chain.advance(5);
        assert!(chain.is_empty());
        assert_eq!(chain.queued_bytes(), 0);
    }
}
