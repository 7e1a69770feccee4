//! miragekit-pool — bounded pool of reusable byte buffers (spec §4.2).
//!
//! Grounded on the teacher's `BytesMut`-based frame assembly in
//! `duallink-transport::PartialFrame::assemble` — that code allocates a
//! fresh `BytesMut` per frame and lets it go; this crate generalizes that
//! into an explicit pool so the reassembler can reuse allocations across
//! frames instead of allocating `totalFragments * maxPayloadSize` bytes
//! for every single frame.
//!
//! Ownership follows the single-writer buffer-token pattern from spec §9:
//! a [`PooledBuffer`] has exactly one outstanding owner at a time; it
//! returns its storage to the pool on `Drop`, so "release exactly once"
//! falls out of normal Rust ownership rather than needing a manual call.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

struct Inner {
    capacity: usize,
    idle: Mutex<Vec<BytesMut>>,
}

impl Inner {
    fn release_buffer(&self, mut buf: BytesMut) {
        buf.clear();
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.capacity {
            idle.push(buf);
        }
    }

    fn release_capacity(&self, capacity: usize) {
        self.release_buffer(BytesMut::with_capacity(capacity));
    }
}

/// A bounded pool of reusable [`BytesMut`] buffers.
///
/// `acquire` never blocks: when the idle list is empty or has nothing big
/// enough, it allocates directly (spec §4.2 "exhaustion MUST fall back to
/// heap allocation rather than block").
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// `capacity` bounds how many idle buffers are retained; it is not a
    /// limit on how many buffers may be outstanding at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner { capacity, idle: Mutex::new(Vec::with_capacity(capacity)) }),
        }
    }

    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let mut idle = self.inner.idle.lock().unwrap();
        let pos = idle.iter().position(|b| b.capacity() >= min_capacity);
        let buf = match pos {
            Some(i) => idle.swap_remove(i),
            None => {
                drop(idle);
                tracing::trace!(min_capacity, "buffer pool miss, allocating");
                BytesMut::with_capacity(min_capacity)
            }
        };
        PooledBuffer { buf: Some(buf), pool: Arc::clone(&self.inner) }
    }

    /// Number of buffers currently idle in the pool (test/diagnostic use).
    pub fn idle_len(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }
}

/// An outstanding buffer checked out of a [`BufferPool`].
///
/// Dropping it (without calling [`PooledBuffer::finalize`]) returns the
/// backing storage to the pool unchanged — this is the discard path used
/// when a pending frame times out or is superseded.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<Inner>,
}

impl PooledBuffer {
    pub fn as_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer already finalized")
    }

    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(BytesMut::capacity).unwrap_or(0)
    }

    /// Truncate to `len` and split the buffer into an immutable `Bytes`
    /// view plus a [`ReleaseGuard`] that returns storage to the pool once
    /// the downstream consumer (decoder, render queue, …) is done with
    /// the frame.
    ///
    /// The guard returns an equivalent-capacity buffer rather than the
    /// exact same allocation: the `Bytes` keeps the original allocation
    /// alive (possibly shared with clones) for as long as the consumer
    /// holds it, so the pool cannot reclaim that specific allocation
    /// deterministically.
    pub fn finalize(mut self, len: usize) -> (Bytes, ReleaseGuard) {
        let mut buf = self.buf.take().expect("buffer already finalized");
        buf.truncate(len);
        let capacity = buf.capacity();
        let pool = Arc::clone(&self.pool);
        (buf.freeze(), ReleaseGuard { pool: Some(pool), capacity })
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release_buffer(buf);
        }
    }
}

/// Returned by [`PooledBuffer::finalize`]; releases pool capacity exactly
/// once, on drop or via the explicit [`ReleaseGuard::release`].
pub struct ReleaseGuard {
    pool: Option<Arc<Inner>>,
    capacity: usize,
}

impl ReleaseGuard {
    /// Explicit release, for callers that want the return to happen at a
    /// precise point rather than whenever the guard happens to drop.
    pub fn release(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_capacity(self.capacity);
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_capacity(self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffer() {
        let pool = BufferPool::new(4);
        let buf = pool.acquire(128);
        drop(buf);
        assert_eq!(pool.idle_len(), 1);
        let buf2 = pool.acquire(64);
        assert_eq!(pool.idle_len(), 0);
        assert!(buf2.capacity() >= 64);
    }

    #[test]
    fn exhaustion_falls_back_to_heap_allocation() {
        let pool = BufferPool::new(0);
        let buf = pool.acquire(256);
        assert!(buf.capacity() >= 256);
        drop(buf);
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn finalize_returns_capacity_on_guard_drop() {
        let pool = BufferPool::new(4);
        let mut buf = pool.acquire(32);
        buf.as_mut().extend_from_slice(&[1, 2, 3, 4]);
        let (bytes, guard) = buf.finalize(4);
        assert_eq!(&bytes[..], &[1, 2, 3, 4]);
        assert_eq!(pool.idle_len(), 0);
        drop(guard);
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn finalize_release_is_explicit_and_idempotent_safe() {
        let pool = BufferPool::new(4);
        let buf = pool.acquire(16);
        let (_bytes, guard) = buf.finalize(0);
        guard.release();
        assert_eq!(pool.idle_len(), 1);
    }
}
