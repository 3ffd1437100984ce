// src/pool/cleanup.rs
//! Cleanup callback records.
//!
//! Every pool carries two LIFO lists of `(callback, data)` records: the
//! pre-cleanups run before the pool's children are destroyed, the cleanups
//! after. Records are allocated from the pool itself and recycled through a
//! per-pool freelist, so registration never touches the system heap once
//! the pool is warm.

/// A cleanup callback. Must not panic; a callback that fails should log and
/// return so the remaining records still run.
pub type CleanupFn = fn(*mut u8);

#[repr(C)]
pub(crate) struct Cleanup {
    pub(crate) next: *mut Cleanup,
    pub(crate) data: *mut u8,
    pub(crate) func: CleanupFn,
}

/// Runs and drains the list at `cref` in LIFO order. Each record is
/// unlinked *before* its callback is invoked, so a callback that registers
/// or kills cleanups on the same pool sees a consistent list and can never
/// re-trigger itself.
pub(crate) unsafe fn run_all(cref: *mut *mut Cleanup) {
    unsafe {
        let mut c = *cref;
        while !c.is_null() {
            *cref = (*c).next;
            ((*c).func)((*c).data);
            c = *cref;
        }
    }
}
