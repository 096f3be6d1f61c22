//! Recycling pool of per-connection frame buffers.
//!
//! Each buffer holds one full frame (header + largest allowed payload).
//! Buffers are pre-allocated and handed out by value: while a connection is
//! open it owns its buffer exclusively, and teardown returns it here.

/// Pool of fixed-size buffers.
///
/// Buffers are reused to avoid allocation on the accept path. The pool keeps
/// at most `capacity` buffers alive at once.
#[derive(Debug)]
pub struct BufferPool {
    /// Idle buffers (LIFO for cache locality).
    free_list: Vec<Vec<u8>>,
    /// Buffers currently owned by connections.
    outstanding: usize,
    /// Maximum number of buffers alive at once.
    capacity: usize,
    /// Size of each buffer.
    buffer_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of buffers alive at once
    /// * `size` - Size of each buffer in bytes
    /// * `preallocate` - Number of buffers to allocate up front
    pub fn new(capacity: usize, size: usize, preallocate: usize) -> Self {
        let preallocate = preallocate.min(capacity);
        let free_list = (0..preallocate).map(|_| vec![0u8; size]).collect();

        Self {
            free_list,
            outstanding: 0,
            capacity,
            buffer_size: size,
        }
    }

    /// Take a buffer from the pool.
    ///
    /// Returns `None` when `capacity` buffers are already handed out.
    pub fn alloc(&mut self) -> Option<Vec<u8>> {
        if self.outstanding >= self.capacity {
            return None;
        }
        self.outstanding += 1;
        Some(
            self.free_list
                .pop()
                .unwrap_or_else(|| vec![0u8; self.buffer_size]),
        )
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers of the wrong size are dropped rather than recycled.
    pub fn free(&mut self, buf: Vec<u8>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if buf.len() == self.buffer_size {
            self.free_list.push(buf);
        }
    }

    /// Get the size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers that can still be handed out.
    pub fn available(&self) -> usize {
        self.capacity - self.outstanding
    }

    /// Number of buffers currently owned by connections.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}
