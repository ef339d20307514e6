use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// A bounded pool of reusable byte buffers.
///
/// The codec keeps one pool for read scratch space and one for write scratch
/// space, each sized to the configured frame maximum. Buffers travel through
/// the [`PooledBuf`] guard, which returns them on every exit path; a buffer
/// handed back is never touched again by the borrower.
#[derive(Clone)]
pub struct BufferPool {
    bufs: Arc<Mutex<VecDeque<Vec<u8>>>>,
    buf_len: usize,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool holding up to `capacity` buffers of `buf_len` bytes.
    pub fn new(capacity: usize, buf_len: usize) -> Self {
        let mut bufs = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            bufs.push_back(vec![0u8; buf_len]);
        }
        BufferPool {
            bufs: Arc::new(Mutex::new(bufs)),
            buf_len,
            capacity,
        }
    }

    /// Takes a buffer out of the pool, allocating a fresh one when every
    /// pooled buffer is in flight.
    pub fn acquire(&self) -> PooledBuf {
        let buf = self.bufs.lock().unwrap().pop_front();
        let buf = buf.unwrap_or_else(|| vec![0u8; self.buf_len]);
        PooledBuf {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// Number of buffers currently resting in the pool.
    pub fn available(&self) -> usize {
        self.bufs.lock().unwrap().len()
    }

    pub fn buf_len(&self) -> usize {
        self.buf_len
    }
}

/// Guard that hands its buffer back to the pool on drop, capacity permitting.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().expect("pooled buffer already returned")
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().expect("pooled buffer already returned")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut bufs = self.pool.bufs.lock().unwrap();
            if bufs.len() < self.pool.capacity {
                bufs.push_back(buf);
            }
        }
    }
}
