// src/stack.rs
//! Thread-local scope stack naming the "current pool".
//!
//! Each thread carries a bounded stack of `(pool, tag, annotation)` frames;
//! the top frame's pool is what [`acquire`] hands to code that allocates
//! without an explicit pool. The stack is fixed at
//! [`ALLOC_STACK_DEPTH`] frames — push/pop never allocate, which is why
//! pool internals are free to use them around cleanup runs. Deeper nesting
//! is a design smell, treated as a programming error rather than a reason
//! to grow.
//!
//! [`PoolScope`] is the RAII way in: it pushes on construction and pops on
//! every exit path.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr::{null, null_mut};

use crate::config::ALLOC_STACK_DEPTH;
use crate::pool::{Pool, PoolInner};

#[derive(Clone, Copy)]
struct Frame {
    pool: *mut PoolInner,
    tag: u32,
    ptr: *const (),
}

const EMPTY_FRAME: Frame = Frame {
    pool: null_mut(),
    tag: 0,
    ptr: null(),
};

struct AllocStack {
    size: usize,
    data: [Frame; ALLOC_STACK_DEPTH],
}

impl AllocStack {
    fn new() -> Self {
        let mut stack = AllocStack {
            size: 0,
            data: [EMPTY_FRAME; ALLOC_STACK_DEPTH],
        };
        // Bottom sentinel so `top` on an otherwise empty stack names no
        // pool instead of underflowing.
        stack.push_frame(EMPTY_FRAME);
        stack
    }

    fn push_frame(&mut self, frame: Frame) {
        if self.size >= ALLOC_STACK_DEPTH {
            #[cfg(debug_assertions)]
            {
                log::error!("scope stack overflow: more than {} frames", ALLOC_STACK_DEPTH);
                std::process::abort();
            }
            #[cfg(not(debug_assertions))]
            {
                // Release builds keep the cap without the check's cost on
                // the happy path; the overwritten frame is simply lost.
                self.size = ALLOC_STACK_DEPTH - 1;
            }
        }
        self.data[self.size] = frame;
        self.size += 1;
    }

    fn pop_frame(&mut self) {
        if self.size == 0 {
            #[cfg(debug_assertions)]
            {
                log::error!("scope stack underflow");
                std::process::abort();
            }
            #[cfg(not(debug_assertions))]
            return;
        }
        self.size -= 1;
    }

    fn top(&self) -> Frame {
        if self.size == 0 {
            return EMPTY_FRAME;
        }
        self.data[self.size - 1]
    }
}

thread_local! {
    static TL_STACK: RefCell<AllocStack> = RefCell::new(AllocStack::new());
}

/// Pushes `pool` as the thread's current pool.
pub fn push(pool: Pool) {
    TL_STACK.with(|stack| {
        stack.borrow_mut().push_frame(Frame {
            pool: pool.as_ptr(),
            tag: 0,
            ptr: null(),
        });
    });
}

/// Pushes `pool` with a diagnostic `(tag, ptr)` annotation. The pool's
/// recycler records the maximum tag it has seen and the latest pointer;
/// neither is interpreted by the allocator.
pub fn push_tagged(pool: Pool, tag: u32, ptr: *const ()) {
    unsafe {
        let mngr = &raw mut (*pool.as_ptr()).mngr;
        if tag > (*mngr).tag {
            (*mngr).tag = tag;
        }
        (*mngr).ptr = ptr;
    }

    TL_STACK.with(|stack| {
        stack.borrow_mut().push_frame(Frame {
            pool: pool.as_ptr(),
            tag,
            ptr,
        });
    });
}

/// Pops the thread's current frame.
pub fn pop() {
    TL_STACK.with(|stack| stack.borrow_mut().pop_frame());
}

/// The thread's current pool, or `None` outside any scope.
pub fn acquire() -> Option<Pool> {
    TL_STACK.with(|stack| Pool::from_raw(stack.borrow().top().pool))
}

/// The `(tag, ptr)` annotation of the current frame.
pub fn stack_info() -> (u32, *const ()) {
    TL_STACK.with(|stack| {
        let frame = stack.borrow().top();
        (frame.tag, frame.ptr)
    })
}

/// Walks the thread's frames top to bottom, skipping the sentinel, until
/// `f` returns `false`.
pub fn foreach_info<F: FnMut(Pool, u32, *const ()) -> bool>(mut f: F) {
    // Snapshot first so callbacks may push/pop without re-entering the
    // thread-local borrow.
    let (size, frames) = TL_STACK.with(|stack| {
        let stack = stack.borrow();
        (stack.size, stack.data)
    });

    for i in (0..size).rev() {
        let frame = frames[i];
        if let Some(pool) = Pool::from_raw(frame.pool) {
            if !f(pool, frame.tag, frame.ptr) {
                break;
            }
        }
    }
}

/// RAII frame: pushes its pool on construction, pops on drop.
///
/// ```
/// use treepool::{Pool, PoolFlags, PoolScope, acquire};
///
/// let pool = Pool::create(None, PoolFlags::NONE)?;
/// {
///     let _scope = PoolScope::new(pool);
///     assert_eq!(acquire(), Some(pool));
/// }
/// assert_eq!(acquire(), None);
/// unsafe { pool.destroy() };
/// # Ok::<(), treepool::PoolError>(())
/// ```
pub struct PoolScope {
    pool: Pool,
    // The frame lives on this thread's stack; the scope must not migrate.
    _not_send: PhantomData<*mut ()>,
}

impl PoolScope {
    /// Pushes `pool` for the lifetime of the returned scope.
    pub fn new(pool: Pool) -> PoolScope {
        push(pool);
        PoolScope {
            pool,
            _not_send: PhantomData,
        }
    }

    /// [`PoolScope::new`] with a `(tag, ptr)` annotation.
    pub fn tagged(pool: Pool, tag: u32, ptr: *const ()) -> PoolScope {
        push_tagged(pool, tag, ptr);
        PoolScope {
            pool,
            _not_send: PhantomData,
        }
    }

    /// The pool this scope selected.
    pub fn pool(&self) -> Pool {
        self.pool
    }
}

impl Drop for PoolScope {
    fn drop(&mut self) {
        pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolFlags;

    #[test]
    fn test_empty_stack_names_no_pool() {
        assert_eq!(acquire(), None);
        assert_eq!(stack_info(), (0, null()));
    }

    #[test]
    fn test_push_pop_restores_previous_top() {
        let p1 = Pool::create(None, PoolFlags::NONE).unwrap();
        let p2 = Pool::create(None, PoolFlags::NONE).unwrap();

        push_tagged(p1, 3, 0x40 as *const ());
        assert_eq!(acquire(), Some(p1));
        assert_eq!(stack_info(), (3, 0x40 as *const ()));

        push(p2);
        assert_eq!(acquire(), Some(p2));
        assert_eq!(stack_info(), (0, null()));

        pop();
        assert_eq!(acquire(), Some(p1));
        assert_eq!(stack_info(), (3, 0x40 as *const ()));
        pop();

        unsafe {
            p1.destroy();
            p2.destroy();
        }
    }

    #[test]
    fn test_tagged_push_feeds_pool_diagnostics() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();

        push_tagged(pool, 5, null());
        push_tagged(pool, 2, 0x80 as *const ());
        unsafe {
            // Maximum tag wins, latest pointer wins.
            assert_eq!((*pool.as_ptr()).mngr.tag, 5);
            assert_eq!((*pool.as_ptr()).mngr.ptr, 0x80 as *const ());
        }
        pop();
        pop();

        unsafe { pool.destroy() };
    }

    #[test]
    fn test_foreach_info_walks_top_down_and_stops() {
        let p1 = Pool::create(None, PoolFlags::NONE).unwrap();
        let p2 = Pool::create(None, PoolFlags::NONE).unwrap();
        let p3 = Pool::create(None, PoolFlags::NONE).unwrap();

        push_tagged(p1, 1, null());
        push_tagged(p2, 2, null());
        push_tagged(p3, 3, null());

        let mut tags = Vec::new();
        foreach_info(|_, tag, _| {
            tags.push(tag);
            true
        });
        assert_eq!(tags, vec![3, 2, 1]);

        let mut first = None;
        foreach_info(|pool, _, _| {
            first = Some(pool);
            false
        });
        assert_eq!(first, Some(p3));

        pop();
        pop();
        pop();
        unsafe {
            p1.destroy();
            p2.destroy();
            p3.destroy();
        }
    }

    #[test]
    fn test_scope_guard_pops_on_drop() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        {
            let scope = PoolScope::new(pool);
            assert_eq!(scope.pool(), pool);
            assert_eq!(acquire(), Some(pool));

            // Moving the guard must not double-push or early-pop.
            let moved = scope;
            assert_eq!(acquire(), Some(pool));
            drop(moved);
        }
        assert_eq!(acquire(), None);
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_nested_scopes() {
        let outer = Pool::create(None, PoolFlags::NONE).unwrap();
        let inner = outer.make_child().unwrap();

        let _s1 = PoolScope::new(outer);
        {
            let _s2 = PoolScope::tagged(inner, 7, null());
            assert_eq!(acquire(), Some(inner));
        }
        assert_eq!(acquire(), Some(outer));

        drop(_s1);
        unsafe { outer.destroy() };
    }
}
