// src/pool/pool.rs
//! Pools: bump arenas chained into a parent/child tree.
//!
//! A pool bump-allocates out of a ring of [`MemNode`]s borrowed from an
//! [`Allocator`]. The `PoolInner` struct itself lives inside the first node
//! it owns (placement construction), so creating a pool costs exactly one
//! node and destroying it returns everything — the pool header included —
//! to the allocator's buckets.
//!
//! Parents own children: destroying a pool destroys its whole subtree,
//! depth first, running each pool's pre-cleanups before its children go
//! down and its cleanups after. `clear` does the same but keeps the pool
//! itself alive with its bump pointer rewound.
//!
//! The public [`Pool`] type is a copyable handle; handle copies all name
//! the same pool. Lifecycle operations that invalidate other handles or
//! outstanding allocations (`destroy`, `clear`) are `unsafe`.

use std::ptr::{NonNull, null_mut};

use super::cleanup::{self, Cleanup, CleanupFn};
use super::manager::{self, AllocManager};
use crate::alloc::allocator::{self, AllocatorInner};
use crate::alloc::node::{MemNode, SIZEOF_MEMNODE};
use crate::alloc::Allocator;
use crate::config::{
    BLOCK_THRESHOLD, BOUNDARY_INDEX, BOUNDARY_SIZE, MIN_ALLOC, PoolFlags, align, align_default,
};
use crate::error::{PoolError, Result};
use crate::table::{self, HashTableInner};

pub(crate) struct PoolInner {
    pub(crate) tag: Option<&'static str>,
    pub(crate) parent: *mut PoolInner,
    pub(crate) child: *mut PoolInner,
    pub(crate) sibling: *mut PoolInner,
    /// The slot in the parent's child list pointing at this pool.
    pub(crate) refp: *mut *mut PoolInner,
    pub(crate) cleanups: *mut Cleanup,
    pub(crate) free_cleanups: *mut Cleanup,
    pub(crate) pre_cleanups: *mut Cleanup,
    pub(crate) allocator: *mut AllocatorInner,
    /// The node the bump pointer currently lives in.
    pub(crate) active: *mut MemNode,
    /// The node containing this struct; survives `clear`.
    pub(crate) self_node: *mut MemNode,
    /// Bump reset target: just past the embedded `PoolInner`.
    pub(crate) self_first_avail: *mut u8,
    pub(crate) user_data: *mut HashTableInner,
    pub(crate) mngr: AllocManager,
    pub(crate) thread_safe: bool,
}

/// Pool header footprint inside its node, padded to default alignment.
pub(crate) const SIZEOF_POOL: usize = align_default(size_of::<PoolInner>());

#[inline]
pub(crate) unsafe fn pool_lock(p: *mut PoolInner) {
    unsafe {
        if (*p).thread_safe {
            (*(*p).allocator).lock();
        }
    }
}

#[inline]
pub(crate) unsafe fn pool_unlock(p: *mut PoolInner) {
    unsafe {
        if (*p).thread_safe {
            (*(*p).allocator).unlock();
        }
    }
}

/// Bump-allocates `in_size` bytes (rounded up to 16) from the pool's ring:
/// the active node first, then the node right after it, then a fresh node
/// from the allocator. When a node fills up the ring is re-sorted so nodes
/// sit in descending free-space order after `active` — which is what makes
/// the neighbor check worthwhile on the next call.
pub(crate) unsafe fn pool_palloc(p: *mut PoolInner, in_size: usize) -> Option<NonNull<u8>> {
    unsafe {
        let size = align_default(in_size);
        if size < in_size {
            return None;
        }

        let active = (*p).active;
        if size <= MemNode::free_space(active) {
            let mem = (*active).first_avail;
            (*active).first_avail = mem.add(size);
            return NonNull::new(mem);
        }

        let mut node = (*active).next;
        if size <= MemNode::free_space(node) {
            MemNode::remove(node);
        } else {
            node = match allocator::alloc_node((*p).allocator, size) {
                Some(n) => n.as_ptr(),
                None => return None,
            };
        }

        (*node).free_index = 0;

        let mem = (*node).first_avail;
        (*node).first_avail = mem.add(size);

        MemNode::insert(node, active);
        (*p).active = node;

        let free_index =
            ((align(MemNode::free_space(active) + 1, BOUNDARY_SIZE) - BOUNDARY_SIZE)
                >> BOUNDARY_INDEX) as u32;
        (*active).free_index = free_index;

        let mut at = (*active).next;
        if free_index >= (*at).free_index {
            return NonNull::new(mem);
        }

        loop {
            at = (*at).next;
            if free_index >= (*at).free_index {
                break;
            }
        }

        MemNode::remove(active);
        MemNode::insert(active, at);

        NonNull::new(mem)
    }
}

/// Places a fresh `PoolInner` inside `node` and, when `parent` is given,
/// splices it into the parent's child list under the allocator lock.
unsafe fn pool_construct(
    node: *mut MemNode,
    parent: *mut PoolInner,
    a: *mut AllocatorInner,
    thread_safe: bool,
) -> *mut PoolInner {
    unsafe {
        MemNode::make_ring(node);

        let p = (*node).first_avail as *mut PoolInner;
        std::ptr::write(
            p,
            PoolInner {
                tag: None,
                parent,
                child: null_mut(),
                sibling: null_mut(),
                refp: null_mut(),
                cleanups: null_mut(),
                free_cleanups: null_mut(),
                pre_cleanups: null_mut(),
                allocator: a,
                active: node,
                self_node: node,
                self_first_avail: null_mut(),
                user_data: null_mut(),
                mngr: AllocManager::new(null_mut()),
                thread_safe,
            },
        );
        (*p).mngr.pool = p;

        let avail = (p as *mut u8).add(SIZEOF_POOL);
        (*node).first_avail = avail;
        (*p).self_first_avail = avail;

        if !parent.is_null() {
            (*a).lock();
            (*p).sibling = (*parent).child;
            if !(*p).sibling.is_null() {
                (*(*p).sibling).refp = &raw mut (*p).sibling;
            }
            (*parent).child = p;
            (*p).refp = &raw mut (*parent).child;
            (*a).unlock();
        }

        p
    }
}

pub(crate) unsafe fn pool_clear(p: *mut PoolInner) {
    unsafe {
        let this = Pool::from_raw(p).unwrap();

        crate::stack::push(this);
        cleanup::run_all(&raw mut (*p).pre_cleanups);
        crate::stack::pop();
        (*p).pre_cleanups = null_mut();

        while !(*p).child.is_null() {
            pool_destroy((*p).child);
        }

        crate::stack::push(this);
        cleanup::run_all(&raw mut (*p).cleanups);
        crate::stack::pop();
        (*p).cleanups = null_mut();
        (*p).free_cleanups = null_mut();
        (*p).user_data = null_mut();

        // Rewind onto the node holding the pool struct and hand every other
        // node back to the allocator.
        let active = (*p).self_node;
        (*p).active = active;
        (*active).first_avail = (*p).self_first_avail;

        if (*active).next == active {
            manager::reset(&raw mut (*p).mngr, p);
            return;
        }

        *(*active).refp = null_mut();
        if !(*active).next.is_null() {
            allocator::free_nodes((*p).allocator, (*active).next);
        }
        (*active).next = active;
        (*active).refp = &raw mut (*active).next;

        manager::reset(&raw mut (*p).mngr, p);
    }
}

pub(crate) unsafe fn pool_destroy(p: *mut PoolInner) {
    unsafe {
        let this = Pool::from_raw(p).unwrap();
        log::trace!("destroy pool {:p} tag={:?}", p, (*p).tag);

        crate::stack::push(this);
        cleanup::run_all(&raw mut (*p).pre_cleanups);
        crate::stack::pop();
        (*p).pre_cleanups = null_mut();

        while !(*p).child.is_null() {
            pool_destroy((*p).child);
        }

        crate::stack::push(this);
        cleanup::run_all(&raw mut (*p).cleanups);
        crate::stack::pop();
        (*p).cleanups = null_mut();
        (*p).free_cleanups = null_mut();
        (*p).user_data = null_mut();

        if !(*p).parent.is_null() {
            let a = (*p).allocator;
            (*a).lock();
            let sib = (*p).sibling;
            *(*p).refp = sib;
            if !sib.is_null() {
                (*sib).refp = (*p).refp;
            }
            (*a).unlock();
        }

        // The pool struct lives inside `self_node`; after this point `p`
        // is only a value for the owner comparison below.
        let a = (*p).allocator;
        let active = (*p).self_node;
        *(*active).refp = null_mut();

        allocator::free_nodes(a, active);
        if (*a).owner == p {
            drop(Box::from_raw(a));
        }
    }
}

unsafe fn register_cleanup(
    p: *mut PoolInner,
    data: *mut u8,
    func: CleanupFn,
    pre: bool,
) -> Result<()> {
    unsafe {
        let c: *mut Cleanup = if !(*p).free_cleanups.is_null() {
            let c = (*p).free_cleanups;
            (*p).free_cleanups = (*c).next;
            c
        } else {
            pool_palloc(p, size_of::<Cleanup>())
                .ok_or(PoolError::OutOfMemory)?
                .as_ptr() as *mut Cleanup
        };

        (*c).data = data;
        (*c).func = func;
        let head = if pre {
            &raw mut (*p).pre_cleanups
        } else {
            &raw mut (*p).cleanups
        };
        (*c).next = *head;
        *head = c;
        Ok(())
    }
}

unsafe fn kill_in_list(head: *mut *mut Cleanup, free: *mut *mut Cleanup, data: *mut u8, func: CleanupFn) {
    unsafe {
        let mut lastp = head;
        let mut c = *head;
        while !c.is_null() {
            if (*c).data == data && (*c).func == func {
                *lastp = (*c).next;
                (*c).next = *free;
                *free = c;
                break;
            }
            lastp = &raw mut (*c).next;
            c = (*c).next;
        }
    }
}

/// Handle to a pool. Copies are cheap and all name the same pool; the
/// handle does nothing on drop. See [`PoolScope`](crate::PoolScope) for the
/// RAII way to select a pool as the thread's current one.
#[derive(Clone, Copy)]
pub struct Pool {
    inner: NonNull<PoolInner>,
}

// A pool may cross threads only when its allocator does; allocations on a
// shared pool require the `THREAD_SAFE_POOL` flag, as in the C lineage of
// this design. The usual pattern is one pool per thread or per request.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for Pool {}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.inner.as_ptr())
            .field("tag", &self.tag())
            .finish()
    }
}

impl Pool {
    /// Creates an unmanaged root pool. Without `alloc` a fresh allocator is
    /// constructed (thread-safe per `flags`) and owned by the pool, so
    /// destroying the pool destroys the allocator too.
    pub fn create(alloc: Option<Allocator>, flags: PoolFlags) -> Result<Pool> {
        let owned = alloc.is_none();
        let a = alloc.unwrap_or_else(|| {
            Allocator::new(flags.contains(PoolFlags::THREAD_SAFE_ALLOCATOR))
        });

        unsafe {
            let node = match allocator::alloc_node(a.as_ptr(), MIN_ALLOC - SIZEOF_MEMNODE) {
                Some(n) => n.as_ptr(),
                None => {
                    if owned {
                        a.destroy();
                    }
                    return Err(PoolError::OutOfMemory);
                }
            };

            let p = pool_construct(
                node,
                null_mut(),
                a.as_ptr(),
                flags.contains(PoolFlags::THREAD_SAFE_POOL),
            );
            if owned {
                (*a.as_ptr()).owner = p;
            }
            Ok(Pool {
                inner: NonNull::new_unchecked(p),
            })
        }
    }

    /// [`Pool::create`] with a debug tag attached.
    pub fn create_tagged(
        alloc: Option<Allocator>,
        flags: PoolFlags,
        tag: &'static str,
    ) -> Result<Pool> {
        let pool = Pool::create(alloc, flags)?;
        unsafe { (*pool.as_ptr()).tag = Some(tag) };
        Ok(pool)
    }

    /// Creates a child pool on this pool's allocator. The child inherits
    /// the parent's thread-safety flag and is destroyed with the parent.
    pub fn make_child(&self) -> Result<Pool> {
        self.make_child_with(None)
    }

    /// Creates a child pool on the given allocator.
    pub fn make_child_with(&self, alloc: Option<Allocator>) -> Result<Pool> {
        unsafe {
            let parent = self.as_ptr();
            let a = alloc.map_or((*parent).allocator, |x| x.as_ptr());

            let node = allocator::alloc_node(a, MIN_ALLOC - SIZEOF_MEMNODE)
                .ok_or(PoolError::OutOfMemory)?
                .as_ptr();

            let p = pool_construct(node, parent, a, (*parent).thread_safe);
            Ok(Pool {
                inner: NonNull::new_unchecked(p),
            })
        }
    }

    /// Destroys the pool: pre-cleanups, then the whole child subtree, then
    /// cleanups, then every node goes back to the allocator. If the pool
    /// owns its allocator, the allocator dies with it.
    ///
    /// # Safety
    ///
    /// Invalidates every handle to this pool and its descendants and every
    /// pointer allocated from them. None may be used afterwards.
    pub unsafe fn destroy(self) {
        unsafe { pool_destroy(self.as_ptr()) }
    }

    /// Clears the pool back to its post-creation state: runs both cleanup
    /// lists, destroys children, drops userdata and rewinds the bump
    /// pointer, returning all but the pool's own node to the allocator.
    ///
    /// # Safety
    ///
    /// Invalidates handles to child pools and every pointer previously
    /// allocated from this pool or its descendants.
    pub unsafe fn clear(&self) {
        unsafe { pool_clear(self.as_ptr()) }
    }

    /// Bump-allocates `size` bytes, 16-aligned.
    pub fn palloc(&self, size: usize) -> Result<NonNull<u8>> {
        unsafe { pool_palloc(self.as_ptr(), size).ok_or(PoolError::OutOfMemory) }
    }

    /// Allocates `size` bytes, recycling previously freed large ranges when
    /// `size >= BLOCK_THRESHOLD`. Returns the address and the size actually
    /// granted, which may exceed the request when a buffered range was
    /// reused — pass that granted size back to [`Pool::free`].
    pub fn alloc(&self, size: usize) -> Result<(NonNull<u8>, usize)> {
        unsafe {
            let p = self.as_ptr();
            pool_lock(p);
            let out = if size >= BLOCK_THRESHOLD {
                manager::alloc(&raw mut (*p).mngr, size)
            } else {
                (*p).mngr.increment_alloc(size);
                pool_palloc(p, size).map(|m| (m, size))
            };
            pool_unlock(p);
            out.ok_or(PoolError::OutOfMemory)
        }
    }

    /// Returns a large range to the pool's recycler. Small ranges are
    /// simply forgotten — bump memory is reclaimed wholesale on
    /// [`Pool::clear`].
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        if size >= BLOCK_THRESHOLD {
            unsafe {
                let p = self.as_ptr();
                pool_lock(p);
                manager::free(&raw mut (*p).mngr, ptr.as_ptr(), size);
                pool_unlock(p);
            }
        }
    }

    /// Allocates `count * eltsize` bytes, zeroed.
    pub fn calloc(&self, count: usize, eltsize: usize) -> Result<NonNull<u8>> {
        let total = count.checked_mul(eltsize).ok_or(PoolError::SizeTooBig)?;
        let (ptr, granted) = self.alloc(total)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, granted) };
        Ok(ptr)
    }

    /// Copies `data` into the pool and returns the copy.
    pub fn memdup(&self, data: &[u8]) -> Result<NonNull<u8>> {
        let dst = self.palloc(data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
        Ok(dst)
    }

    /// Copies `s` into the pool with a trailing NUL and returns the copy.
    pub fn strdup(&self, s: &str) -> Result<NonNull<u8>> {
        let bytes = s.as_bytes();
        let dst = self.palloc(bytes.len() + 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            *dst.as_ptr().add(bytes.len()) = 0;
        }
        Ok(dst)
    }

    /// Registers `func(data)` to run when the pool is cleared or destroyed,
    /// after its children are gone. Callbacks run in reverse registration
    /// order.
    pub fn cleanup_register(&self, data: *mut u8, func: CleanupFn) -> Result<()> {
        unsafe { register_cleanup(self.as_ptr(), data, func, false) }
    }

    /// Like [`Pool::cleanup_register`], but runs before the pool's children
    /// are destroyed.
    pub fn pre_cleanup_register(&self, data: *mut u8, func: CleanupFn) -> Result<()> {
        unsafe { register_cleanup(self.as_ptr(), data, func, true) }
    }

    /// Registers a closure cleanup; the closure is stored in pool memory.
    /// If the registration is later killed the closure's captures are
    /// leaked into the pool (reclaimed with it, never dropped).
    pub fn cleanup_register_fn<F: FnOnce() + 'static>(&self, f: F) -> Result<()> {
        fn trampoline<F: FnOnce()>(data: *mut u8) {
            unsafe { std::ptr::read(data as *mut F)() }
        }

        let slot = self.palloc(size_of::<F>().max(1))?;
        unsafe { std::ptr::write(slot.as_ptr() as *mut F, f) };
        self.cleanup_register(slot.as_ptr(), trampoline::<F>)
    }

    /// Removes the matching `(data, func)` registration, if any, from both
    /// cleanup lists without running it.
    pub fn cleanup_kill(&self, data: *mut u8, func: CleanupFn) {
        unsafe {
            let p = self.as_ptr();
            kill_in_list(&raw mut (*p).cleanups, &raw mut (*p).free_cleanups, data, func);
            kill_in_list(&raw mut (*p).pre_cleanups, &raw mut (*p).free_cleanups, data, func);
        }
    }

    /// Removes the matching registration and invokes it exactly once.
    pub fn cleanup_run(&self, data: *mut u8, func: CleanupFn) {
        self.cleanup_kill(data, func);
        func(data);
    }

    /// Stores `data` under `key` in the pool's userdata dictionary,
    /// duplicating the key into the pool on first insertion so the caller
    /// may pass a borrowed key. A non-`None` `cleanup` is registered over
    /// `data` as with [`Pool::cleanup_register`].
    pub fn userdata_set(
        &self,
        data: NonNull<u8>,
        key: &str,
        cleanup: Option<CleanupFn>,
    ) -> Result<()> {
        unsafe {
            let p = self.as_ptr();
            let ht = self.userdata_table()?;

            if table::raw_get(ht, key.as_bytes()).is_none() {
                let dup = pool_palloc(p, key.len()).ok_or(PoolError::OutOfMemory)?;
                std::ptr::copy_nonoverlapping(key.as_ptr(), dup.as_ptr(), key.len());
                let stored = std::slice::from_raw_parts(dup.as_ptr(), key.len());
                table::raw_set(ht, stored, Some(data.as_ptr() as *const u8));
            } else {
                // Existing entry: only the value slot is touched, the
                // originally duplicated key stays in place.
                table::raw_set(ht, key.as_bytes(), Some(data.as_ptr() as *const u8));
            }

            if let Some(func) = cleanup {
                self.cleanup_register(data.as_ptr(), func)?;
            }
            Ok(())
        }
    }

    /// Like [`Pool::userdata_set`] but never duplicates the key; the
    /// `'static` bound carries the lifetime guarantee the C ancestor left
    /// to the caller.
    pub fn userdata_setn(
        &self,
        data: NonNull<u8>,
        key: &'static str,
        cleanup: Option<CleanupFn>,
    ) -> Result<()> {
        unsafe {
            let ht = self.userdata_table()?;
            table::raw_set(ht, key.as_bytes(), Some(data.as_ptr() as *const u8));

            if let Some(func) = cleanup {
                self.cleanup_register(data.as_ptr(), func)?;
            }
            Ok(())
        }
    }

    /// Looks up `key` in the userdata dictionary.
    pub fn userdata_get(&self, key: &str) -> Option<NonNull<u8>> {
        unsafe {
            let p = self.as_ptr();
            if (*p).user_data.is_null() {
                return None;
            }
            table::raw_get((*p).user_data, key.as_bytes())
        }
    }

    unsafe fn userdata_table(&self) -> Result<*mut HashTableInner> {
        unsafe {
            let p = self.as_ptr();
            if (*p).user_data.is_null() {
                (*p).user_data = table::raw_make(p)?;
            }
            Ok((*p).user_data)
        }
    }

    /// Serializes allocations on a `THREAD_SAFE_POOL` pool; no-op
    /// otherwise.
    pub fn lock(&self) {
        unsafe { pool_lock(self.as_ptr()) }
    }

    /// Counterpart of [`Pool::lock`].
    pub fn unlock(&self) {
        unsafe { pool_unlock(self.as_ptr()) }
    }

    /// The debug tag, if one was attached at creation.
    pub fn tag(&self) -> Option<&'static str> {
        unsafe { (*self.as_ptr()).tag }
    }

    /// The allocator serving this pool.
    pub fn allocator(&self) -> Allocator {
        unsafe { Allocator::from_raw((*self.as_ptr()).allocator).unwrap() }
    }

    /// The parent pool, if this pool is a child.
    pub fn parent(&self) -> Option<Pool> {
        unsafe { Pool::from_raw((*self.as_ptr()).parent) }
    }

    /// Whether per-allocation locking is enabled on this pool.
    pub fn is_thread_safe(&self) -> bool {
        unsafe { (*self.as_ptr()).thread_safe }
    }

    /// Total bytes requested from this pool since creation or the last
    /// clear (small requests count unaligned, as requested).
    pub fn allocated_bytes(&self) -> usize {
        unsafe { (*self.as_ptr()).mngr.allocated }
    }

    /// Total bytes served from recycled large ranges (granted sizes).
    pub fn returned_bytes(&self) -> usize {
        unsafe { (*self.as_ptr()).mngr.returned }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut PoolInner {
        self.inner.as_ptr()
    }

    #[inline]
    pub(crate) fn from_raw(ptr: *mut PoolInner) -> Option<Pool> {
        NonNull::new(ptr).map(|inner| Pool { inner })
    }
}
