//! Bounded pool of encode buffers.
//!
//! Buffers are handed out as [`PooledBuffer`] guards and go back to the pool
//! when the guard is dropped, whatever path the holder leaves by. At most
//! `capacity` idle buffers are retained; a miss allocates a fresh buffer.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Returned buffers that grew past this multiple of the configured size are
/// dropped instead of kept idle.
const MAX_RETAINED_GROWTH: usize = 4;

pub struct BufferPool {
    queue: ArrayQueue<BytesMut>,
    buffer_capacity: usize,
    stats: PoolStats,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
    pub drops: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

impl BufferPool {
    /// Creates a pool holding up to `capacity` idle buffers of
    /// `buffer_capacity` bytes. Buffers are allocated lazily.
    pub fn new(capacity: usize, buffer_capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            buffer_capacity,
            stats: PoolStats::default(),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buffer = match self.queue.pop() {
            Some(buffer) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_capacity)
            }
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        // buffers that were split or shrunk would make later callers regrow
        let capacity = buffer.capacity();
        let oversized = capacity > self.buffer_capacity.saturating_mul(MAX_RETAINED_GROWTH);
        if capacity < self.buffer_capacity || oversized || self.queue.push(buffer).is_err() {
            self.stats.drops.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.returns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn available(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// Buffer borrowed from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buffer: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buffer
            .as_ref()
            .unwrap_or_else(|| unreachable!("buffer is only taken on drop"))
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buffer
            .as_mut()
            .unwrap_or_else(|| unreachable!("buffer is only taken on drop"))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
