// THEORY:
// The `BufferPool` recycles the byte buffers that carry encoded JPEG frames from
// the network source to the decode stage. An MJPEG camera pushes tens of frames a
// second, each tens or hundreds of kilobytes; allocating a fresh `Vec` for every
// one of them churns the allocator for no benefit, since frames are roughly the
// same size from one to the next.
//
// Key architectural principles:
// 1.  **Move-only ownership**: A `RawFrameBuffer` is not `Clone`. Whoever holds it
//     owns it, so a buffer can never be forwarded downstream and returned to the
//     pool at the same time. Every fill ends in exactly one of the two.
// 2.  **Reset on reuse**: `acquire` hands out a buffer with length zero. Capacity is
//     kept, which is the whole point of recycling.
// 3.  **Bounded idle memory**: At most `max_idle` buffers wait in the free list.
//     Extra releases are dropped so a burst cannot pin memory forever.
// 4.  **Internal locking**: Callers on different tasks share the pool behind an
//     `Arc` and never lock anything themselves. The lock is held only for a push
//     or pop and never across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Initial capacity of a freshly allocated buffer, sized for a typical 720p JPEG.
const INITIAL_BUFFER_CAPACITY: usize = 256 * 1024;
/// Default number of idle buffers kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 4;

/// One encoded frame in flight between pipeline stages.
#[derive(Debug, Default)]
pub struct RawFrameBuffer {
    data: Vec<u8>,
}

impl RawFrameBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn reset(&mut self) {
        self.data.clear();
    }
}

/// A concurrent free list of `RawFrameBuffer`s.
pub struct BufferPool {
    free: Mutex<VecDeque<RawFrameBuffer>>,
    max_idle: usize,
    /// Number of buffers ever allocated by this pool.
    allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(VecDeque::with_capacity(max_idle)),
            max_idle,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Returns an empty buffer, reusing a released one when available.
    pub fn acquire(&self) -> RawFrameBuffer {
        if let Some(mut buffer) = self.lock_free().pop_front() {
            buffer.reset();
            return buffer;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        RawFrameBuffer::with_capacity(INITIAL_BUFFER_CAPACITY)
    }

    /// Hands a buffer back for reuse. Dropped if the free list is full.
    pub fn release(&self, mut buffer: RawFrameBuffer) {
        buffer.reset();
        let mut free = self.lock_free();
        if free.len() < self.max_idle {
            free.push_back(buffer);
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.lock_free().len()
    }

    // A panic while holding this lock cannot leave the deque half-modified, so a
    // poisoned lock is still safe to use.
    fn lock_free(&self) -> MutexGuard<'_, VecDeque<RawFrameBuffer>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}
