// src/alloc/allocator.rs
//! The block supplier behind every pool.
//!
//! An allocator owns raw memory and hands out [`MemNode`]s. Freed nodes are
//! recycled into size-indexed buckets (`buf[1..MAX_INDEX]`) with `buf[0]`
//! acting as an unsorted sink for oversize nodes, so most node requests are
//! served without touching the system heap. A retention cap (`set_max`)
//! bounds how much free memory the buckets may hold; anything above the cap
//! goes back to the heap. In mmap mode the allocator instead carves nodes
//! out of a file-backed region that grows in place and never returns memory
//! until the allocator is destroyed.
//!
//! Thread safety is per instance: an allocator constructed with
//! `thread_safe = true` carries a reentrant mutex and may be shared; one
//! constructed without is single-thread only.

use std::alloc::{Layout, dealloc};
use std::ptr::{NonNull, null_mut};

use parking_lot::lock_api::RawReentrantMutex;
use parking_lot::{RawMutex, RawThreadId};

use super::mmap::MmapArena;
use super::node::{MemNode, SIZEOF_MEMNODE};
use crate::config::{
    ALIGN_DEFAULT, ALLOCATOR_MAX_FREE_UNLIMITED, BOUNDARY_INDEX, BOUNDARY_SIZE, MAX_INDEX,
    MIN_ALLOC, align,
};
use crate::error::Result;
use crate::pool::{Pool, PoolInner};

/// Reentrant raw mutex; reentrancy matters because pool operations that
/// hold the lock call back into the allocator.
pub(crate) type ReentrantLock = RawReentrantMutex<RawMutex, RawThreadId>;

pub(crate) struct AllocatorInner {
    /// Largest occupied bucket index.
    pub(crate) last: u32,
    /// Retention cap in `BOUNDARY_SIZE` units; 0 means unlimited.
    pub(crate) max: u32,
    /// Remaining retention allowance in `BOUNDARY_SIZE` units.
    pub(crate) current: u32,
    pub(crate) owner: *mut PoolInner,
    pub(crate) mutex: Option<ReentrantLock>,
    /// `buf[0]` is the oversize sink; `buf[i]` holds nodes of size class `i`.
    pub(crate) buf: [*mut MemNode; MAX_INDEX],
    pub(crate) mmap: Option<MmapArena>,
}

impl AllocatorInner {
    fn new(thread_safe: bool) -> Self {
        AllocatorInner {
            last: 0,
            max: ALLOCATOR_MAX_FREE_UNLIMITED,
            current: 0,
            owner: null_mut(),
            mutex: thread_safe.then_some(ReentrantLock::INIT),
            buf: [null_mut(); MAX_INDEX],
            mmap: None,
        }
    }

    #[inline]
    pub(crate) fn lock(&self) {
        if let Some(m) = &self.mutex {
            m.lock();
        }
    }

    #[inline]
    pub(crate) fn unlock(&self) {
        if let Some(m) = &self.mutex {
            unsafe { m.unlock() };
        }
    }
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        // In mmap mode every node lives inside the arena, which unmaps
        // itself; only heap nodes need individual frees.
        if self.mmap.is_some() {
            return;
        }
        for index in 0..MAX_INDEX {
            let mut node = self.buf[index];
            while !node.is_null() {
                unsafe {
                    let next = (*node).next;
                    dealloc(node as *mut u8, node_layout((*node).index));
                    node = next;
                }
            }
        }
    }
}

#[inline]
fn node_layout(index: u32) -> Layout {
    // Footprints are boundary multiples handed out with default alignment.
    unsafe { Layout::from_size_align_unchecked(MemNode::footprint(index), ALIGN_DEFAULT) }
}

/// Pops a node with payload of at least `in_size` bytes, recycling from the
/// buckets or the sink before asking the backing memory for more. Returns
/// `None` on arithmetic overflow or exhaustion.
pub(crate) unsafe fn alloc_node(a: *mut AllocatorInner, in_size: usize) -> Option<NonNull<MemNode>> {
    unsafe {
        let mut size = align(in_size + SIZEOF_MEMNODE, BOUNDARY_SIZE);
        if size < in_size {
            return None;
        }
        if size < MIN_ALLOC {
            size = MIN_ALLOC;
        }

        let index = (size >> BOUNDARY_INDEX) - 1;
        if index > u32::MAX as usize {
            return None;
        }

        let mut locked = false;

        if index <= (*a).last as usize {
            (*a).lock();
            locked = true;

            // First non-empty bucket in [index, last] serves the request.
            let max_index = (*a).last as usize;
            let mut i = index;
            while (*a).buf[i].is_null() && i < max_index {
                i += 1;
            }

            let node = (*a).buf[i];
            if !node.is_null() {
                // Popping the highest occupied bucket empty means `last`
                // must drop to the next occupied one below.
                (*a).buf[i] = (*node).next;
                if (*a).buf[i].is_null() && i >= max_index {
                    let mut mi = max_index;
                    while mi > 0 && (*a).buf[mi].is_null() {
                        mi -= 1;
                    }
                    (*a).last = mi as u32;
                }

                (*a).current = (*a).current.wrapping_add((*node).index + 1);
                if (*a).current > (*a).max {
                    (*a).current = (*a).max;
                }

                (*node).next = null_mut();
                (*node).first_avail = (node as *mut u8).add(SIZEOF_MEMNODE);

                (*a).unlock();
                return NonNull::new(node);
            }
        } else if !(*a).buf[0].is_null() {
            (*a).lock();
            locked = true;

            // The sink is unordered; take the first node large enough.
            let mut refslot: *mut *mut MemNode = &raw mut (*a).buf[0];
            let mut node = *refslot;
            while !node.is_null() && index > (*node).index as usize {
                refslot = &raw mut (*node).next;
                node = *refslot;
            }

            if !node.is_null() {
                *refslot = (*node).next;

                (*a).current = (*a).current.wrapping_add((*node).index + 1);
                if (*a).current > (*a).max {
                    (*a).current = (*a).max;
                }

                (*node).next = null_mut();
                (*node).first_avail = (node as *mut u8).add(SIZEOF_MEMNODE);

                (*a).unlock();
                return NonNull::new(node);
            }
        }

        // Nothing suitable retained; carve a fresh node.
        if (*a).mmap.is_some() {
            // The arena cursor is shared state, so growth and the bump both
            // happen under the lock.
            if !locked {
                (*a).lock();
            }
            let arena = (*a).mmap.as_mut().unwrap();
            let required = arena.current as u64 + index as u64 + 1;
            if required > arena.max as u64 {
                if arena.grow(required as u32).is_err() {
                    (*a).unlock();
                    return None;
                }
            }
            let base = arena.base.add(arena.current as usize * BOUNDARY_SIZE);
            arena.current += index as u32 + 1;
            (*a).unlock();

            NonNull::new(MemNode::init_at(base, index as u32, size))
        } else {
            // Heap growth happens with the lock released so concurrent
            // threads can fault in memory independently.
            if locked {
                (*a).unlock();
            }
            let base = std::alloc::alloc(Layout::from_size_align_unchecked(size, ALIGN_DEFAULT));
            if base.is_null() {
                return None;
            }
            NonNull::new(MemNode::init_at(base, index as u32, size))
        }
    }
}

/// Deposits a null-terminated chain of nodes into the buckets, releasing
/// over-cap nodes back to the heap after the lock is dropped.
pub(crate) unsafe fn free_nodes(a: *mut AllocatorInner, chain: *mut MemNode) {
    unsafe {
        let mut freelist: *mut MemNode = null_mut();

        (*a).lock();

        let mut max_index = (*a).last;
        let max_free_index = (*a).max;
        let mut current_free_index = (*a).current;

        let mut node = chain;
        while !node.is_null() {
            let next = (*node).next;
            let index = (*node).index;

            if max_free_index != ALLOCATOR_MAX_FREE_UNLIMITED && index + 1 > current_free_index {
                // Over the retention cap; defer the real free until after
                // unlock. In mmap mode the region only grows, so these
                // nodes are simply abandoned to it.
                (*node).next = freelist;
                freelist = node;
            } else if (index as usize) < MAX_INDEX {
                (*node).next = (*a).buf[index as usize];
                if (*node).next.is_null() && index > max_index {
                    max_index = index;
                }
                (*a).buf[index as usize] = node;
                current_free_index = current_free_index.saturating_sub(index + 1);
            } else {
                // Too large for an indexed bucket; park it in the sink.
                (*node).next = (*a).buf[0];
                (*a).buf[0] = node;
                current_free_index = current_free_index.saturating_sub(index + 1);
            }

            node = next;
        }

        #[cfg(debug_assertions)]
        {
            // A chain this long in the most common bucket means the same
            // node was deposited twice and the list is now cyclic.
            let mut n = (*a).buf[1];
            let mut links = 0usize;
            while !n.is_null() {
                links += 1;
                if links >= 128 * 1024 {
                    log::error!("allocator bucket chain exceeds 128K links: double free");
                    std::process::abort();
                }
                n = (*n).next;
            }
        }

        (*a).last = max_index;
        (*a).current = current_free_index;

        (*a).unlock();

        if (*a).mmap.is_none() {
            while !freelist.is_null() {
                let n = freelist;
                freelist = (*n).next;
                dealloc(n as *mut u8, node_layout((*n).index));
            }
        }
    }
}

/// Handle to a heap-allocated [`AllocatorInner`].
///
/// Handles are plain copies of the same underlying allocator; dropping a
/// handle does nothing. [`Allocator::destroy`] (or the owning pool's
/// destruction) frees the allocator itself.
#[derive(Clone, Copy)]
pub struct Allocator {
    inner: NonNull<AllocatorInner>,
}

// Sharing across threads is sound only for allocators constructed
// thread-safe; single-thread allocators rely on the caller keeping them on
// one thread, exactly like the pools they serve.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Creates a standalone allocator. With `thread_safe` set it carries a
    /// reentrant mutex and may serve pools from several threads.
    pub fn new(thread_safe: bool) -> Allocator {
        let inner = Box::into_raw(Box::new(AllocatorInner::new(thread_safe)));
        Allocator {
            inner: unsafe { NonNull::new_unchecked(inner) },
        }
    }

    /// Creates an allocator backed by a file-backed mmap arena with
    /// `initial_pages` boundary units committed up front.
    ///
    /// # Errors
    ///
    /// [`PoolError::MmapUnsupported`](crate::PoolError::MmapUnsupported) on
    /// platforms without the arena, or a setup error from the temp file /
    /// mapping calls.
    pub fn with_mmap(initial_pages: u32) -> Result<Allocator> {
        let alloc = Allocator::new(false);
        match alloc.run_mmap(initial_pages) {
            Ok(()) => Ok(alloc),
            Err(e) => {
                unsafe { alloc.destroy() };
                Err(e)
            }
        }
    }

    /// Switches an existing allocator into mmap mode. Idempotent; nodes
    /// already handed out stay valid (they remain heap nodes).
    pub fn run_mmap(&self, initial_pages: u32) -> Result<()> {
        unsafe {
            let a = self.inner.as_ptr();
            (*a).lock();
            if (*a).mmap.is_some() {
                (*a).unlock();
                return Ok(());
            }
            let arena = MmapArena::create(initial_pages);
            match arena {
                Ok(arena) => {
                    (*a).mmap = Some(arena);
                    (*a).unlock();
                    Ok(())
                }
                Err(e) => {
                    (*a).unlock();
                    Err(e)
                }
            }
        }
    }

    /// Adjusts the retention cap to roughly `size` bytes (rounded up to a
    /// boundary multiple). 0 restores unlimited retention.
    pub fn set_max(&self, size: usize) {
        unsafe {
            let a = self.inner.as_ptr();
            (*a).lock();

            let max_free_index = (align(size, BOUNDARY_SIZE) >> BOUNDARY_INDEX) as u32;
            (*a).current = (*a)
                .current
                .wrapping_add(max_free_index)
                .wrapping_sub((*a).max);
            (*a).max = max_free_index;
            if (*a).current > (*a).max {
                (*a).current = (*a).max;
            }

            (*a).unlock();
        }
    }

    /// Records the pool that owns this allocator; destroying that pool
    /// destroys the allocator with it.
    pub fn set_owner(&self, pool: Pool) {
        unsafe { (*self.inner.as_ptr()).owner = pool.as_ptr() }
    }

    /// The owning pool, if one was recorded.
    pub fn owner(&self) -> Option<Pool> {
        unsafe { Pool::from_raw((*self.inner.as_ptr()).owner) }
    }

    /// Whether this allocator carries a mutex and may be shared.
    pub fn is_shared(&self) -> bool {
        unsafe { (*self.inner.as_ptr()).mutex.is_some() }
    }

    /// Acquires the allocator mutex (no-op for single-thread allocators).
    pub fn lock(&self) {
        unsafe { (*self.inner.as_ptr()).lock() }
    }

    /// Releases the allocator mutex (no-op for single-thread allocators).
    pub fn unlock(&self) {
        unsafe { (*self.inner.as_ptr()).unlock() }
    }

    /// Frees the allocator and every node retained in its buckets (or the
    /// whole arena in mmap mode).
    ///
    /// # Safety
    ///
    /// No pool may still be using this allocator, and no copy of the handle
    /// may be used afterwards.
    pub unsafe fn destroy(self) {
        unsafe { drop(Box::from_raw(self.inner.as_ptr())) }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut AllocatorInner {
        self.inner.as_ptr()
    }

    #[inline]
    pub(crate) fn from_raw(ptr: *mut AllocatorInner) -> Option<Allocator> {
        NonNull::new(ptr).map(|inner| Allocator { inner })
    }
}
