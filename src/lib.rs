// src/lib.rs
//! # Hierarchical Pool Allocator
//!
//! A thread-capable hierarchical arena allocator: pools bump-allocate out
//! of recycled fixed-size blocks, parents own children, and everything a
//! pool handed out comes back in one sweep when the pool is cleared or
//! destroyed.
//!
//! Features:
//! - Size-bucketed block recycling with a configurable retention cap
//! - Parent/child pool trees with depth-first teardown
//! - Per-pool recycler for large allocations (size-sorted free list)
//! - Thread-local scope stack naming the current pool, with an RAII guard
//! - LIFO cleanup callbacks and a pool-allocated userdata dictionary
//! - Optional file-backed mmap arena that grows in place (Linux)
//!
//! ```
//! use treepool::{Pool, PoolFlags, PoolScope, acquire};
//!
//! let pool = Pool::create(None, PoolFlags::NONE)?;
//! {
//!     let _scope = PoolScope::new(pool);
//!     let current = acquire().unwrap();
//!     let buf = current.palloc(128)?;
//!     let copy = current.memdup(b"request state")?;
//!     let _ = (buf, copy);
//! }
//! unsafe { pool.destroy() };
//! # Ok::<(), treepool::PoolError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod config;
pub mod error;
pub mod global;
pub mod pool;
pub mod stack;
pub mod table;

// Re-export main types
pub use alloc::Allocator;
pub use config::PoolFlags;
pub use error::{PoolError, Result};
pub use global::{active_pool_count, clear, create, create_tagged, destroy, initialize, terminate};
pub use pool::{CleanupFn, Pool};
pub use stack::{PoolScope, acquire, foreach_info, pop, push, push_tagged, stack_info};
pub use table::{HashFunc, HashIter, HashTable, MergeFn, default_hash};

/// Commonly used imports.
pub mod prelude {
    pub use crate::alloc::Allocator;
    pub use crate::config::PoolFlags;
    pub use crate::error::{PoolError, Result};
    pub use crate::pool::{CleanupFn, Pool};
    pub use crate::stack::{PoolScope, acquire};
    pub use crate::table::{HashIter, HashTable};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::ptr::NonNull;

    #[test]
    fn test_basic_pool() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let a = pool.palloc(64).unwrap();
        let b = pool.palloc(64).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 16, 0);
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_scoped_allocation() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        {
            let _scope = PoolScope::new(pool);
            let current = acquire().unwrap();
            assert_eq!(current, pool);
            current.palloc(32).unwrap();
        }
        assert_eq!(acquire(), None);
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_large_roundtrip() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let (ptr, granted) = pool.alloc(1024).unwrap();
        assert_eq!(granted, 1024);
        pool.free(ptr, granted);
        let (again, granted) = pool.alloc(900).unwrap();
        assert_eq!(again, ptr);
        assert_eq!(granted, 1024);
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_userdata_and_table() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let mut value = 42u8;
        pool.userdata_set(NonNull::from(&mut value), "answer", None)
            .unwrap();
        assert_eq!(
            pool.userdata_get("answer").unwrap().as_ptr(),
            &raw mut value
        );

        let ht = HashTable::make(pool).unwrap();
        unsafe { ht.set(b"answer", Some(NonNull::from(&mut value))) };
        assert_eq!(ht.len(), 1);
        unsafe { pool.destroy() };
    }
}
