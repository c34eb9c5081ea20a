//! Bootstrap allocator for requests that arrive before the real allocator is
//! resolved (typically `calloc` from inside `dlsym`).
//!
//! A fixed static buffer handed out by bumping an atomic cursor. Memory is
//! never reused, so every block is zero-filled and `free` of a block is a
//! no-op.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capacity of the bootstrap buffer in bytes.
pub const EARLY_ALLOC_SIZE: usize = 16384;
/// Alignment of every block.
pub const EARLY_ALLOC_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Buffer(UnsafeCell<[u8; EARLY_ALLOC_SIZE]>);

/// Lock-free bump allocator over a static buffer.
pub struct EarlyAllocator {
    buf: Buffer,
    cursor: AtomicUsize,
}

// SAFETY: disjoint ranges of the buffer are handed out through an atomic
// cursor; the allocator itself never reads or writes the bytes.
unsafe impl Sync for EarlyAllocator {}

impl Default for EarlyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EarlyAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: Buffer(UnsafeCell::new([0; EARLY_ALLOC_SIZE])),
            cursor: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> usize {
        self.buf.0.get() as usize
    }

    /// A fresh zero-filled block of at least `size` bytes, or `None` once
    /// the buffer is exhausted.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let rounded = size.max(1).checked_next_multiple_of(EARLY_ALLOC_ALIGN)?;
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            let end = cur.checked_add(rounded)?;
            if end > EARLY_ALLOC_SIZE {
                return None;
            }
            match self
                .cursor
                .compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
        // SAFETY: `cur < EARLY_ALLOC_SIZE`, so the offset stays in the buffer.
        NonNull::new(unsafe { self.buf.0.get().cast::<u8>().add(cur) })
    }

    /// Whether `ptr` points into the bootstrap buffer.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        (ptr as usize).wrapping_sub(self.base()) < EARLY_ALLOC_SIZE
    }

    /// Bytes between `ptr` and the end of the buffer; 0 outside it.
    #[must_use]
    pub fn bytes_after(&self, ptr: *const u8) -> usize {
        if self.contains(ptr) {
            EARLY_ALLOC_SIZE - (ptr as usize - self.base())
        } else {
            0
        }
    }

    /// Bytes handed out so far (including alignment padding).
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}
