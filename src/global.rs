// src/global.rs
//! Process-wide root allocator and root pool.
//!
//! [`initialize`] / [`terminate`] are reference counted so nested
//! subsystems (including dynamically loaded ones) can each bracket their
//! lifetime without coordinating; the root comes up on the first
//! `initialize` and goes down on the last `terminate`. The initializing
//! call also pushes the root pool onto its thread's scope stack, so
//! [`acquire`](crate::acquire) always names an owner for ambient
//! allocations; the final `terminate` pops it again and should therefore
//! run on the same thread.
//!
//! [`create`] makes *managed* pools: children of the given parent, or of
//! the root when no parent is passed, counted in [`active_pool_count`].

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::alloc::Allocator;
use crate::config::PoolFlags;
use crate::error::{PoolError, Result};
use crate::pool::Pool;

struct GlobalState {
    refs: usize,
    allocator: Option<Allocator>,
    root: Option<Pool>,
}

static GLOBAL: Mutex<GlobalState> = Mutex::new(GlobalState {
    refs: 0,
    allocator: None,
    root: None,
});

static ACTIVE_POOLS: AtomicUsize = AtomicUsize::new(0);

/// Brings up the root allocator and root pool (first call only) and
/// registers one reference on them. The root allocator is thread-safe:
/// managed pools hang off the root from arbitrary threads.
pub fn initialize() -> Result<()> {
    let mut state = GLOBAL.lock();
    if state.refs == 0 {
        let allocator = Allocator::new(true);
        let root = match Pool::create_tagged(Some(allocator), PoolFlags::NONE, "Global") {
            Ok(root) => root,
            Err(e) => {
                unsafe { allocator.destroy() };
                return Err(e);
            }
        };
        crate::stack::push(root);
        log::trace!("root pool initialized");
        state.allocator = Some(allocator);
        state.root = Some(root);
    }
    state.refs += 1;
    Ok(())
}

/// Releases one reference; the last release pops the root pool off this
/// thread's scope stack and tears down the root pool and allocator. Every
/// managed pool must be destroyed before the final `terminate`.
pub fn terminate() {
    let mut state = GLOBAL.lock();
    if state.refs == 0 {
        return;
    }
    state.refs -= 1;
    if state.refs == 0 {
        crate::stack::pop();
        unsafe {
            if let Some(root) = state.root.take() {
                root.destroy();
            }
            if let Some(allocator) = state.allocator.take() {
                allocator.destroy();
            }
        }
        log::trace!("root pool terminated");
    }
}

fn root() -> Result<Pool> {
    GLOBAL
        .lock()
        .root
        .ok_or_else(|| PoolError::InvalidState("treepool not initialized".into()))
}

/// Creates a managed pool: a child of `parent`, or of the root pool when
/// `parent` is `None`. Pair with [`destroy`].
pub fn create(parent: Option<Pool>) -> Result<Pool> {
    let parent = match parent {
        Some(p) => p,
        None => root()?,
    };
    let pool = parent.make_child()?;
    ACTIVE_POOLS.fetch_add(1, Ordering::Relaxed);
    Ok(pool)
}

/// [`create`] with a debug tag attached.
pub fn create_tagged(parent: Option<Pool>, tag: &'static str) -> Result<Pool> {
    let pool = create(parent)?;
    unsafe { (*pool.as_ptr()).tag = Some(tag) };
    Ok(pool)
}

/// Destroys a managed pool and drops it from the active count.
///
/// # Safety
///
/// Same contract as [`Pool::destroy`].
pub unsafe fn destroy(pool: Pool) {
    let _ = ACTIVE_POOLS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
    unsafe { pool.destroy() }
}

/// Clears a pool; forwards to [`Pool::clear`].
///
/// # Safety
///
/// Same contract as [`Pool::clear`].
pub unsafe fn clear(pool: Pool) {
    unsafe { pool.clear() }
}

/// Number of managed pools currently alive.
pub fn active_pool_count() -> usize {
    ACTIVE_POOLS.load(Ordering::Relaxed)
}
