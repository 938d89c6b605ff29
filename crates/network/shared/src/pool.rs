//! Size-class buffer pool for message payloads.
//!
//! Each pipeline owns one pool; buffers never cross connections. Stages take
//! a buffer with at least the capacity they need and hand their input buffer
//! back once the transformed output exists.

use bytes::BytesMut;
use tracing::trace;

use crate::config::PoolSettings;

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquisitions served from a retained buffer.
    pub hits: u64,
    /// Acquisitions that had to allocate.
    pub misses: u64,
    /// Buffers currently retained across all classes.
    pub retained: usize,
}

#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<usize>,
    free: Vec<Vec<BytesMut>>,
    retained_per_class: usize,
    stats: PoolStats,
}

impl BufferPool {
    /// `classes` must be strictly ascending (validated by `NetworkSettings::validate`).
    pub fn new(classes: Vec<usize>, retained_per_class: usize) -> Self {
        let free = classes.iter().map(|_| Vec::new()).collect();
        Self {
            classes,
            free,
            retained_per_class,
            stats: PoolStats::default(),
        }
    }

    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self::new(settings.size_classes.clone(), settings.retained_per_class)
    }

    /// Smallest class that fits `len`, if any.
    fn class_for(&self, len: usize) -> Option<usize> {
        self.classes.iter().position(|&c| c >= len)
    }

    /// Returns an empty buffer with capacity for at least `min_capacity` bytes.
    pub fn acquire(&mut self, min_capacity: usize) -> BytesMut {
        match self.class_for(min_capacity) {
            Some(idx) => {
                if let Some(buf) = self.free[idx].pop() {
                    self.stats.hits += 1;
                    self.stats.retained -= 1;
                    buf
                } else {
                    self.stats.misses += 1;
                    BytesMut::with_capacity(self.classes[idx])
                }
            }
            None => {
                // Larger than every class: plain allocation, never retained.
                self.stats.misses += 1;
                BytesMut::with_capacity(min_capacity)
            }
        }
    }

    /// Gives a buffer back. Buffers are filed under the largest class their
    /// capacity still satisfies; undersized or surplus buffers are dropped.
    pub fn release(&mut self, mut buf: BytesMut) {
        buf.clear();
        // Stripped headers advance the start; asking for one byte more than the
        // visible capacity moves the start back without allocating.
        let visible = buf.capacity();
        if !buf.try_reclaim(visible + 1) && !self.classes.contains(&visible) {
            trace!(target: "net::pool", visible, "buffer not reclaimed, filed by visible capacity");
        }
        let capacity = buf.capacity();
        let Some(idx) = self.classes.iter().rposition(|&c| c <= capacity) else {
            return;
        };
        if self.free[idx].len() >= self.retained_per_class {
            return;
        }
        self.free[idx].push(buf);
        self.stats.retained += 1;
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Drops every retained buffer (pipeline teardown).
    pub fn clear(&mut self) {
        for class in &mut self.free {
            class.clear();
        }
        self.stats.retained = 0;
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_rounds_up_to_class() {
        let mut pool = BufferPool::new(vec![64, 256], 4);
        let buf = pool.acquire(100);
        assert!(buf.capacity() >= 256);
        assert!(buf.is_empty());
        assert_eq!(pool.stats().misses, 1);
    }

    #[test]
    fn released_buffers_are_reused() {
        let mut pool = BufferPool::new(vec![64, 256], 4);
        let mut buf = pool.acquire(200);
        buf.extend_from_slice(&[7; 200]);
        pool.release(buf);
        assert_eq!(pool.stats().retained, 1);

        let again = pool.acquire(10);
        // The 256-class buffer does not serve a 64-class request.
        assert_eq!(pool.stats().hits, 0);
        pool.release(again);

        let reused = pool.acquire(256);
        assert!(reused.is_empty(), "released buffers are cleared");
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn advanced_buffers_regain_their_class() {
        use bytes::Buf;

        let mut pool = BufferPool::new(vec![64, 256], 4);
        let mut buf = pool.acquire(256);
        buf.extend_from_slice(&[1; 100]);
        buf.advance(24);
        pool.release(buf);
        assert_eq!(pool.stats().retained, 1);
        let again = pool.acquire(256);
        assert!(again.capacity() >= 256);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn shared_buffers_fall_back_to_visible_capacity() {
        let mut pool = BufferPool::new(vec![64, 256], 4);
        let mut buf = pool.acquire(256);
        buf.extend_from_slice(&[1; 100]);
        // The split head keeps the allocation shared, so reclaim fails.
        let head = buf.split_to(24);
        pool.release(buf);
        assert_eq!(pool.stats().retained, 1);

        let small = pool.acquire(64);
        assert_eq!(pool.stats().hits, 1);
        assert!(small.capacity() < 256);
        drop(head);
    }

    #[test]
    fn oversized_and_surplus_buffers_are_dropped() {
        let mut pool = BufferPool::new(vec![64], 1);
        pool.release(BytesMut::with_capacity(16));
        assert_eq!(pool.stats().retained, 0);

        pool.release(BytesMut::with_capacity(64));
        pool.release(BytesMut::with_capacity(64));
        assert_eq!(pool.stats().retained, 1);

        let big = pool.acquire(10_000);
        assert!(big.capacity() >= 10_000);
        pool.clear();
        assert_eq!(pool.stats().retained, 0);
    }
}
