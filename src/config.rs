// src/config.rs
//! Tuning constants and creation flags.
//!
//! The numeric constants below are part of the crate's compatibility
//! contract: block addresses, bucket indices and the small/large allocation
//! split all derive from them. Changing any of them changes the meaning of
//! sizes recorded by existing users, so treat them as ABI.

use bitflags::bitflags;

/// log2 of the node size granularity.
pub const BOUNDARY_INDEX: u32 = 12;

/// Granularity of node allocation (4 KiB). Every node's total footprint is
/// a multiple of this.
pub const BOUNDARY_SIZE: usize = 1 << BOUNDARY_INDEX;

/// Smallest node footprint handed out by an allocator (header included).
pub const MIN_ALLOC: usize = 2 * BOUNDARY_SIZE;

/// Number of size-indexed free buckets; index 0 doubles as the unsorted
/// sink for oversize nodes.
pub const MAX_INDEX: usize = 20;

/// `max == 0` disables the retention cap entirely.
pub const ALLOCATOR_MAX_FREE_UNLIMITED: u32 = 0;

/// Address-space (not memory) reservation for the mmap-backed arena.
/// The file mapping can grow in place up to this limit and no further.
pub const ALLOCATOR_MMAP_RESERVED: usize = 64 << 30;

/// Pool allocations of at least this many bytes are routed through the
/// pool's [`AllocManager`](crate::pool) recycler instead of the bump path.
pub const BLOCK_THRESHOLD: usize = 256;

/// Default allocation alignment; 16 bytes is compatible with SSE and other
/// 128-bit SIMD loads.
pub const ALIGN_DEFAULT: usize = 16;

/// Fixed depth of the per-thread scope stack. Deeper nesting is treated as
/// a programming error, not a resource to grow.
pub const ALLOC_STACK_DEPTH: usize = 32;

/// Initial hash table slot mask; always `2^n - 1`.
pub const INITIAL_HASH_MAX: u32 = 15;

/// Rounds `size` up to a power-of-two `boundary`. Wraps on overflow; the
/// caller detects that by checking `align(x, b) < x`.
#[inline(always)]
pub const fn align(size: usize, boundary: usize) -> usize {
    size.wrapping_add(boundary - 1) & !(boundary - 1)
}

/// Rounds `size` up to [`ALIGN_DEFAULT`].
#[inline(always)]
pub const fn align_default(size: usize) -> usize {
    align(size, ALIGN_DEFAULT)
}

bitflags! {
    /// Flags accepted by [`Pool::create`](crate::Pool::create).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        /// No synchronization anywhere; single-thread use only.
        const NONE = 0;
        /// The backing allocator carries a reentrant mutex so node traffic
        /// and child-list edits may come from several threads.
        const THREAD_SAFE_ALLOCATOR = 1 << 0;
        /// Every `alloc`/`free` on the pool itself is serialized as well.
        /// Implies [`PoolFlags::THREAD_SAFE_ALLOCATOR`].
        const THREAD_SAFE_POOL = (1 << 1) | (1 << 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_basics() {
        assert_eq!(align(0, 4096), 0);
        assert_eq!(align(1, 4096), 4096);
        assert_eq!(align(4096, 4096), 4096);
        assert_eq!(align(4097, 4096), 8192);
        assert_eq!(align_default(100), 112);
        assert_eq!(align_default(208), 208);
    }

    #[test]
    fn test_align_overflow_wraps_detectably() {
        let near_max = usize::MAX - 7;
        assert!(align(near_max, 4096) < near_max);
    }

    #[test]
    fn test_pool_flags_imply_allocator() {
        assert!(PoolFlags::THREAD_SAFE_POOL.contains(PoolFlags::THREAD_SAFE_ALLOCATOR));
        assert!(!PoolFlags::THREAD_SAFE_ALLOCATOR.contains(PoolFlags::THREAD_SAFE_POOL));
    }
}
