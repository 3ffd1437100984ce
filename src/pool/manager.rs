// src/pool/manager.rs
//! Per-pool large-allocation recycler.
//!
//! Pool allocations of `BLOCK_THRESHOLD` bytes and up flow through this
//! manager. Freed large ranges are kept on `buffered`, a singly-linked list
//! sorted ascending by size, so a later request can be served from a
//! previously freed range instead of bumping fresh pool space. An entry is
//! only reused when its size is between the request and twice the request —
//! anything larger would waste too much of the range.
//!
//! The record headers themselves are tiny pool allocations recycled through
//! `free_buffered`.

use std::ptr::{NonNull, null_mut};

use super::pool::{PoolInner, pool_palloc};

#[repr(C)]
pub(crate) struct MemAddr {
    pub(crate) size: u32,
    pub(crate) next: *mut MemAddr,
    pub(crate) address: *mut u8,
}

pub(crate) struct AllocManager {
    pub(crate) pool: *mut PoolInner,
    /// Freed ranges available for reuse, ascending by size.
    pub(crate) buffered: *mut MemAddr,
    /// Recycled record headers.
    pub(crate) free_buffered: *mut MemAddr,
    /// Largest scope tag seen for this pool (diagnostics only).
    pub(crate) tag: u32,
    /// Most recent scope annotation pointer (diagnostics only).
    pub(crate) ptr: *const (),
    pub(crate) alloc_buffer: usize,
    pub(crate) allocated: usize,
    pub(crate) returned: usize,
}

impl AllocManager {
    pub(crate) fn new(pool: *mut PoolInner) -> Self {
        AllocManager {
            pool,
            buffered: null_mut(),
            free_buffered: null_mut(),
            tag: 0,
            ptr: std::ptr::null(),
            alloc_buffer: 0,
            allocated: 0,
            returned: 0,
        }
    }

    #[inline]
    pub(crate) fn increment_alloc(&mut self, size: usize) {
        self.allocated += size;
        self.alloc_buffer += size;
    }

    #[inline]
    pub(crate) fn increment_return(&mut self, size: usize) {
        self.returned += size;
    }
}

/// Zeroes the manager and rebinds it to `pool`. The records it loses track
/// of live in pool nodes that are being reset alongside, so nothing leaks.
pub(crate) unsafe fn reset(mgr: *mut AllocManager, pool: *mut PoolInner) {
    unsafe {
        std::ptr::write(mgr, AllocManager::new(pool));
    }
}

/// Serves a large request: the first buffered range with
/// `request <= size <= 2 * request` wins and its *actual* size is returned
/// alongside the address. Scanning stops at the first range more than twice
/// the request — the list is ascending, so nothing past it can qualify.
/// With no match, the request falls through to a fresh pool bump.
pub(crate) unsafe fn alloc(mgr: *mut AllocManager, size: usize) -> Option<(NonNull<u8>, usize)> {
    unsafe {
        if !(*mgr).buffered.is_null() {
            let mut lastp: *mut *mut MemAddr = &raw mut (*mgr).buffered;
            let mut c = (*mgr).buffered;
            while !c.is_null() {
                let csize = (*c).size as usize;
                if csize > size.saturating_mul(2) {
                    break;
                } else if csize >= size {
                    *lastp = (*c).next;
                    (*c).next = (*mgr).free_buffered;
                    (*mgr).free_buffered = c;
                    (*mgr).increment_return(csize);
                    return Some((NonNull::new_unchecked((*c).address), csize));
                }

                lastp = &raw mut (*c).next;
                c = (*c).next;
            }
        }

        (*mgr).increment_alloc(size);
        pool_palloc((*mgr).pool, size).map(|p| (p, size))
    }
}

/// Records a freed large range for reuse, keeping `buffered` sorted. A
/// free arriving before any allocation was recorded is ignored — the pool
/// was probably cleared since the range was handed out.
pub(crate) unsafe fn free(mgr: *mut AllocManager, ptr: *mut u8, size: usize) {
    unsafe {
        if (*mgr).allocated == 0 {
            return;
        }
        if size > u32::MAX as usize {
            return;
        }

        let addr: *mut MemAddr = if !(*mgr).free_buffered.is_null() {
            let a = (*mgr).free_buffered;
            (*mgr).free_buffered = (*a).next;
            a
        } else {
            match pool_palloc((*mgr).pool, size_of::<MemAddr>()) {
                Some(p) => {
                    (*mgr).increment_alloc(size_of::<MemAddr>());
                    p.as_ptr() as *mut MemAddr
                }
                None => return,
            }
        };

        (*addr).size = size as u32;
        (*addr).address = ptr;
        (*addr).next = null_mut();

        if !(*mgr).buffered.is_null() {
            let mut lastp: *mut *mut MemAddr = &raw mut (*mgr).buffered;
            let mut c = (*mgr).buffered;
            while !c.is_null() {
                if (*c).size as usize >= size {
                    (*addr).next = c;
                    *lastp = addr;
                    break;
                }

                lastp = &raw mut (*c).next;
                c = (*c).next;
            }

            // Largest so far: append past the end.
            if (*addr).next.is_null() {
                *lastp = addr;
            }
        } else {
            (*mgr).buffered = addr;
        }
    }
}
