use bytes::BytesMut;
use parking_lot::Mutex;

/// Maximum number of buffers retained for reuse. Excess releases are dropped.
const MAX_POOLED: usize = 64;

/// Thread-safe pool of reusable byte buffers for streaming copies.
///
/// Buffers are handed out cleared with capacity at least the requested size.
/// A request larger than the pool's default capacity is served by a fresh
/// allocation; such buffers are not retained on release. Unusable values
/// (shrunk below the default capacity) are silently dropped.
pub struct BufferPool {
    default_capacity: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    /// Acquire a cleared buffer with capacity at least `n`.
    pub fn acquire(&self, n: usize) -> BytesMut {
        if n <= self.default_capacity {
            if let Some(mut buf) = self.free.lock().pop() {
                buf.clear();
                return buf;
            }
            return BytesMut::with_capacity(self.default_capacity);
        }
        // Oversized request: fresh allocation, never pooled.
        BytesMut::with_capacity(n)
    }

    /// Return a buffer to the pool. Undersized buffers, oversized one-off
    /// allocations, and anything beyond the retention limit are dropped.
    pub fn release(&self, buf: BytesMut) {
        if buf.capacity() < self.default_capacity || buf.capacity() >= self.default_capacity * 2 {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

/// RAII handle that returns its buffer to the pool on drop, covering every
/// exit path of the stream loop.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<BytesMut>,
}

impl<'a> PooledBuf<'a> {
    pub fn new(pool: &'a BufferPool, n: usize) -> Self {
        Self {
            pool,
            buf: Some(pool.acquire(n)),
        }
    }

    pub fn get_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire(512);
        assert!(buf.capacity() >= 1024);
        pool.release(buf);
        assert_eq!(pool.pooled(), 1);
        let again = pool.acquire(1024);
        assert_eq!(pool.pooled(), 0);
        assert!(again.capacity() >= 1024);
    }

    #[test]
    fn test_oversized_not_pooled() {
        let pool = BufferPool::new(1024);
        let big = pool.acquire(64 * 1024);
        assert!(big.capacity() >= 64 * 1024);
        pool.release(big);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_undersized_release_dropped() {
        let pool = BufferPool::new(4096);
        pool.release(BytesMut::with_capacity(16));
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_acquired_buffer_is_cleared() {
        let pool = BufferPool::new(64);
        let mut buf = pool.acquire(64);
        buf.extend_from_slice(b"leftover");
        pool.release(buf);
        let buf = pool.acquire(64);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pooled_guard_returns_on_drop() {
        let pool = BufferPool::new(256);
        {
            let mut guard = PooledBuf::new(&pool, 256);
            guard.get_mut().extend_from_slice(b"abc");
        }
        assert_eq!(pool.pooled(), 1);
    }
}
