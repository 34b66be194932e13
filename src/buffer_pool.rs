use std::sync::{Mutex, OnceLock, PoisonError};

const MAX_POOL_SIZE: usize = 256;

/// Size of each relay buffer
pub const RELAY_BUFFER_SIZE: usize = 16_384;

/// Pool of fixed-size relay buffers reused across tunnels
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
        }
    }

    /// Take a buffer from the pool or allocate a fresh one
    pub fn take(&self) -> Vec<u8> {
        let pooled = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        pooled.unwrap_or_else(|| vec![0u8; RELAY_BUFFER_SIZE])
    }

    /// Return a buffer; wrong-sized buffers and overflow are discarded
    pub fn give_back(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < RELAY_BUFFER_SIZE || buffer.capacity() > RELAY_BUFFER_SIZE * 2 {
            return;
        }
        // Zero on return so no tunnel sees another's bytes
        buffer.clear();
        buffer.resize(RELAY_BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(MAX_POOL_SIZE)
    }
}

static BUFFER_POOL: OnceLock<BufferPool> = OnceLock::new();

fn global_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::default)
}

/// RAII lease that returns its buffer to the global pool on drop
#[derive(Debug)]
pub struct BufferLease {
    buffer: Vec<u8>,
}

impl BufferLease {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        global_pool().give_back(std::mem::take(&mut self.buffer));
    }
}

/// Lease a relay buffer from the global pool
pub fn lease_buffer() -> BufferLease {
    BufferLease {
        buffer: global_pool().take(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_and_zeroes_buffers() {
        let pool = BufferPool::new(4);
        let mut buf = pool.take();
        assert_eq!(buf.len(), RELAY_BUFFER_SIZE);

        buf.fill(0xAA);
        buf.truncate(100);
        pool.give_back(buf);
        assert_eq!(pool.available(), 1);

        let reused = pool.take();
        assert_eq!(reused.len(), RELAY_BUFFER_SIZE);
        assert!(reused.iter().all(|&b| b == 0));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn rejects_wrong_size_and_caps_pool() {
        let pool = BufferPool::new(2);
        pool.give_back(vec![0u8; 1024]);
        assert_eq!(pool.available(), 0);

        let bufs: Vec<_> = (0..5).map(|_| pool.take()).collect();
        for b in bufs {
            pool.give_back(b);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn lease_has_full_buffer() {
        let mut lease = lease_buffer();
        assert_eq!(lease.as_mut_slice().len(), RELAY_BUFFER_SIZE);
    }
}
