//! Bump allocator backing large collections of small, same-lifetime nodes.
//!
//! Memory is carved out of 4 KiB blocks and never returned individually;
//! everything is released together when the arena is dropped. Requests larger
//! than a quarter block get their own exact-sized block so the tail of the
//! current block is not wasted on them.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK_SIZE: usize = 4096;

/// A bump allocator. An arena belongs to a single owner; allocation is not
/// internally synchronized. Pointers returned by the allocation methods stay
/// valid until the arena itself is dropped.
pub struct Arena {
    // Current block allocation state.
    alloc_ptr: *mut u8,
    alloc_bytes_remaining: usize,
    // Every block handed out by the system allocator, for release on drop.
    blocks: Vec<(NonNull<u8>, Layout)>,
    // Total bytes acquired from the system allocator plus per-block
    // bookkeeping. Relaxed so a monitor can sample it without locking.
    memory_usage: AtomicUsize,
}

unsafe impl Send for Arena {}

impl Arena {
    pub fn new() -> Self {
        Arena {
            alloc_ptr: std::ptr::null_mut(),
            alloc_bytes_remaining: 0,
            blocks: Vec::new(),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns a pointer to a newly allocated region of `bytes` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is zero.
    pub fn allocate(&mut self, bytes: usize) -> NonNull<u8> {
        // The semantics of what to return are messy for 0-byte allocations,
        // so they are disallowed.
        assert!(bytes > 0);
        if bytes <= self.alloc_bytes_remaining {
            let result = self.alloc_ptr;
            // SAFETY: `bytes` fits in the current block, so the advanced
            // pointer stays inside it.
            self.alloc_ptr = unsafe { self.alloc_ptr.add(bytes) };
            self.alloc_bytes_remaining -= bytes;
            return NonNull::new(result).unwrap();
        }
        self.allocate_fallback(bytes)
    }

    /// Like [`Arena::allocate`], but the returned pointer is aligned to
    /// `max(pointer size, 8)`.
    pub fn allocate_aligned(&mut self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0);
        let align = std::mem::size_of::<*const u8>().max(8);
        debug_assert!(align.is_power_of_two());

        let current_mod = self.alloc_ptr as usize & (align - 1);
        let slop = if current_mod == 0 { 0 } else { align - current_mod };
        let needed = bytes + slop;

        let result = if needed <= self.alloc_bytes_remaining {
            // SAFETY: `needed` fits in the current block.
            let result = unsafe { self.alloc_ptr.add(slop) };
            self.alloc_ptr = unsafe { self.alloc_ptr.add(needed) };
            self.alloc_bytes_remaining -= needed;
            result
        } else {
            // Fresh blocks come from the system allocator already aligned.
            self.allocate_fallback(bytes).as_ptr()
        };
        debug_assert_eq!(result as usize & (align - 1), 0);
        NonNull::new(result).unwrap()
    }

    /// Total memory acquired for data allocated by the arena. An estimate:
    /// block tails wasted by fallback allocation are included.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&mut self, bytes: usize) -> NonNull<u8> {
        if bytes > BLOCK_SIZE / 4 {
            // Oversized requests get their own block so the tail of the
            // current block stays available for small allocations.
            return self.allocate_new_block(bytes);
        }

        // Waste the remainder of the current block (bounded by 1 KiB) and
        // carve out of a fresh one.
        let block = self.allocate_new_block(BLOCK_SIZE);
        self.alloc_ptr = unsafe { block.as_ptr().add(bytes) };
        self.alloc_bytes_remaining = BLOCK_SIZE - bytes;
        block
    }

    fn allocate_new_block(&mut self, block_bytes: usize) -> NonNull<u8> {
        let align = std::mem::size_of::<*const u8>().max(8);
        let layout = Layout::from_size_align(block_bytes, align).expect("arena block layout");
        // SAFETY: layout has non-zero size; null results abort.
        let ptr = unsafe { alloc(layout) };
        let Some(block) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        self.blocks.push((block, layout));
        self.memory_usage.fetch_add(
            block_bytes + std::mem::size_of::<*mut u8>(),
            Ordering::Relaxed,
        );
        block
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for (block, layout) in self.blocks.drain(..) {
            // SAFETY: each pair was produced by `alloc` with this layout.
            unsafe { dealloc(block.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_arena() {
        let arena = Arena::new();
        assert_eq!(arena.memory_usage(), 0);
    }

    #[test]
    fn test_writes_survive_later_allocations() {
        let mut arena = Arena::new();
        let mut allocated: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        // A mix of sizes spanning in-block, new-block, and oversized paths.
        for i in 0..200usize {
            let size = match i % 7 {
                0 => 1,
                1 => 8,
                2 => 77,
                3 => 512,
                4 => 1025,
                5 => 2048,
                _ => 16,
            };
            let fill = (i % 251) as u8;
            let ptr = arena.allocate(size);
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), fill, size) };
            allocated.push((ptr, size, fill));
        }

        for (ptr, size, fill) in allocated {
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == fill));
        }
    }

    #[test]
    fn test_aligned_allocations() {
        let mut arena = Arena::new();
        let align = std::mem::size_of::<*const u8>().max(8);
        // Interleave odd-sized unaligned requests to knock the pointer off
        // alignment before each aligned request.
        for i in 1..64usize {
            arena.allocate(i % 5 + 1);
            let ptr = arena.allocate_aligned(i);
            assert_eq!(ptr.as_ptr() as usize % align, 0, "allocation {i}");
        }
    }

    #[test]
    fn test_memory_usage_grows_with_blocks() {
        let mut arena = Arena::new();
        arena.allocate(1);
        let after_first = arena.memory_usage();
        assert!(after_first >= BLOCK_SIZE);

        // An oversized request must get its own block.
        arena.allocate(BLOCK_SIZE);
        assert!(arena.memory_usage() >= after_first + BLOCK_SIZE);
    }

    #[test]
    fn test_small_allocations_share_a_block() {
        let mut arena = Arena::new();
        arena.allocate(16);
        let usage = arena.memory_usage();
        for _ in 0..10 {
            arena.allocate(16);
        }
        assert_eq!(arena.memory_usage(), usage);
    }
}
