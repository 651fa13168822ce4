use super::RingBuffer;
use crate::atomic;
use std::sync::Mutex;

/// Process-wide pool of ring buffers.
///
/// Connections acquire their two buffers at construction and release them
/// exactly once in the terminal transition. The outstanding count tracks
/// acquire/release balance.
#[derive(Debug)]
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<RingBuffer>>,
    buffer_capacity: usize,
    outstanding: atomic::Int64,
}

impl BufferPool {
    pub(crate) fn new(buffer_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_capacity,
            outstanding: atomic::Int64::default(),
        }
    }

    pub(crate) fn acquire(&self) -> RingBuffer {
        self.outstanding.add(1);
        self.buffers
            .lock()
            .expect("Buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| RingBuffer::new(self.buffer_capacity))
    }

    pub(crate) fn release(&self, mut buffer: RingBuffer) {
        buffer.reset();
        self.outstanding.add(-1);
        self.buffers
            .lock()
            .expect("Buffer pool lock poisoned")
            .push(buffer);
    }

    /// Buffers acquired but not yet released.
    pub(crate) fn outstanding(&self) -> i64 {
        self.outstanding.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_balances() {
        let pool = BufferPool::new(128);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.outstanding(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn released_buffers_are_reused_empty() {
        let pool = BufferPool::new(128);
        let mut a = pool.acquire();
        a.write(b"leftover");
        pool.release(a);
        let again = pool.acquire();
        assert!(again.is_empty());
        assert_eq!(pool.outstanding(), 1);
    }
}
