// tests/integration_tests.rs
//! End-to-end scenarios for the pool system.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use treepool::prelude::*;
use treepool::{HashTable, acquire, push, pop};

#[test]
fn test_bump_and_clear_addresses() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();

    let a = pool.palloc(100).unwrap().as_ptr() as usize;
    let b = pool.palloc(200).unwrap().as_ptr() as usize;
    let c = pool.palloc(50).unwrap().as_ptr() as usize;

    // 100 rounds to 112, 200 to 208; bump addresses are consecutive.
    assert_eq!(b, a + 112);
    assert_eq!(c, b + 208);

    unsafe { pool.clear() };
    let again = pool.palloc(100).unwrap().as_ptr() as usize;
    assert_eq!(again, a);

    unsafe { pool.destroy() };
}

#[test]
fn test_child_destroyed_with_parent_cleanup_order() {
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn child_sentinel(_d: *mut u8) {
        ORDER.lock().unwrap().push("child");
    }
    fn parent_sentinel(_d: *mut u8) {
        ORDER.lock().unwrap().push("parent");
    }

    let parent = Pool::create(None, PoolFlags::NONE).unwrap();
    let child = parent.make_child().unwrap();
    child.palloc(10).unwrap();

    parent.cleanup_register(std::ptr::null_mut(), parent_sentinel).unwrap();
    child.cleanup_register(std::ptr::null_mut(), child_sentinel).unwrap();

    unsafe { parent.destroy() };

    // The child's cleanup fires exactly once, before any parent cleanup.
    let order = ORDER.lock().unwrap();
    assert_eq!(order.as_slice(), &["child", "parent"]);
}

#[test]
fn test_large_allocation_recycled() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();

    let (a, granted) = pool.alloc(512).unwrap();
    assert_eq!(granted, 512);
    let returned_before = pool.returned_bytes();
    pool.free(a, granted);

    let (b, granted) = pool.alloc(400).unwrap();
    assert_eq!(b, a);
    // The grant is bumped up to the recycled range's full 512 bytes.
    assert_eq!(granted, 512);
    assert_eq!(pool.returned_bytes(), returned_before + 512);

    unsafe { pool.destroy() };
}

#[test]
fn test_large_range_rejected_when_too_big() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();

    let (a, _) = pool.alloc(512).unwrap();
    pool.free(a, 512);

    // 512 > 2 * 250: the buffered range must not serve this request.
    let allocated_before = pool.allocated_bytes();
    let (b, granted) = pool.alloc(250).unwrap();
    assert_ne!(b, a);
    assert_eq!(granted, 250);
    assert_eq!(pool.allocated_bytes(), allocated_before + 250);

    unsafe { pool.destroy() };
}

#[test]
fn test_manager_boundary_at_twice_request_plus_one() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();

    let (a, _) = pool.alloc(601).unwrap();
    pool.free(a, 601);

    // 601 == 2 * 300 + 1 forces a fresh allocation...
    let (fresh, _) = pool.alloc(300).unwrap();
    assert_ne!(fresh, a);

    // ...and the buffered range is still there for an eligible request.
    let (reused, granted) = pool.alloc(301).unwrap();
    assert_eq!(reused, a);
    assert_eq!(granted, 601);

    unsafe { pool.destroy() };
}

#[test]
fn test_threshold_boundary_routing() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();

    // Exactly the threshold: recyclable.
    let (a, _) = pool.alloc(256).unwrap();
    pool.free(a, 256);
    let (b, _) = pool.alloc(256).unwrap();
    assert_eq!(b, a);

    // One below: plain bump, the free is a no-op.
    let (c, _) = pool.alloc(255).unwrap();
    pool.free(c, 255);
    let (d, _) = pool.alloc(255).unwrap();
    assert_ne!(d, c);

    unsafe { pool.destroy() };
}

#[test]
fn test_userdata_lifecycle_with_cleanups() {
    static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn cb1(_d: *mut u8) {
        ORDER.lock().unwrap().push(1);
    }
    fn cb2(_d: *mut u8) {
        ORDER.lock().unwrap().push(2);
    }

    let pool = Pool::create(None, PoolFlags::NONE).unwrap();
    let mut d1 = 1u8;
    let mut d2 = 2u8;

    pool.userdata_set(NonNull::from(&mut d1), "k", Some(cb1)).unwrap();
    pool.userdata_set(NonNull::from(&mut d2), "k", Some(cb2)).unwrap();
    assert_eq!(pool.userdata_get("k").unwrap().as_ptr(), &raw mut d2);

    unsafe { pool.clear() };

    // Both cleanups ran exactly once, LIFO: cb2 first.
    assert_eq!(ORDER.lock().unwrap().as_slice(), &[2, 1]);
    assert!(pool.userdata_get("k").is_none());

    unsafe { pool.destroy() };
}

#[test]
fn test_scope_stack_is_thread_private() {
    use std::sync::Barrier;

    let barrier = std::sync::Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let barrier = std::sync::Arc::clone(&barrier);
            std::thread::spawn(move || {
                let pool = Pool::create(None, PoolFlags::NONE).unwrap();
                push(pool);

                // Both threads sit inside their scopes at the same time.
                barrier.wait();
                let current = acquire().unwrap();
                assert_eq!(current, pool);
                let marker = current.palloc(16).unwrap();
                unsafe { *marker.as_ptr() = i as u8 };
                barrier.wait();

                pop();
                assert_eq!(acquire(), None);
                unsafe { pool.destroy() };
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_shared_allocator_across_threads() {
    let alloc = Allocator::new(true);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let pool = Pool::create(Some(alloc), PoolFlags::NONE).unwrap();
                    for size in [24usize, 200, 512, 4000] {
                        let p = pool.palloc(size).unwrap();
                        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xCD, size) };
                    }
                    unsafe { pool.destroy() };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    unsafe { alloc.destroy() };
}

#[test]
fn test_thread_safe_pool_allocations() {
    let pool = Pool::create(None, PoolFlags::THREAD_SAFE_POOL).unwrap();
    assert!(pool.is_thread_safe());

    let counter = std::sync::Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let counter = std::sync::Arc::clone(&counter);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let (ptr, granted) = pool.alloc(300).unwrap();
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xEE, granted) };
                    pool.free(ptr, granted);
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 800);
    unsafe { pool.destroy() };
}

#[test]
fn test_pool_tree_isolation() {
    // Destroying one branch leaves the rest of the tree untouched.
    let root = Pool::create(None, PoolFlags::NONE).unwrap();
    let left = root.make_child().unwrap();
    let right = root.make_child().unwrap();
    let left_leaf = left.make_child().unwrap();

    let keep = right.memdup(b"survives").unwrap();
    left_leaf.palloc(64).unwrap();

    unsafe { left.destroy() };

    // The right branch still works and its memory is intact.
    unsafe {
        assert_eq!(std::slice::from_raw_parts(keep.as_ptr(), 8), b"survives");
    }
    right.palloc(64).unwrap();

    unsafe { root.destroy() };
}

#[test]
fn test_clear_recycles_nodes_for_reuse() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();

    // Force several nodes, then clear; the allocator's buckets now serve
    // the same workload without growing again.
    let mut addrs = Vec::new();
    for _ in 0..8 {
        addrs.push(pool.palloc(3000).unwrap().as_ptr() as usize);
    }
    unsafe { pool.clear() };

    let mut again = Vec::new();
    for _ in 0..8 {
        again.push(pool.palloc(3000).unwrap().as_ptr() as usize);
    }

    // Recycled nodes mean recycled addresses (as sets; ring order differs).
    addrs.sort_unstable();
    again.sort_unstable();
    assert_eq!(addrs, again);

    unsafe { pool.destroy() };
}

#[test]
fn test_global_lifecycle_and_managed_pools() {
    treepool::initialize().unwrap();

    let pool = treepool::create(None).unwrap();
    let tagged = treepool::create_tagged(Some(pool), "request").unwrap();
    assert_eq!(tagged.tag(), Some("request"));
    assert_eq!(tagged.parent(), Some(pool));
    assert!(treepool::active_pool_count() >= 2);

    // The initializing thread has the root pool as its ambient pool.
    let ambient = acquire().unwrap();
    ambient.palloc(32).unwrap();

    unsafe {
        treepool::destroy(tagged);
        treepool::destroy(pool);
    }
    treepool::terminate();
}

#[test]
fn test_hashtable_copy_and_merge_roundtrip() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();
    let a = HashTable::make(pool).unwrap();
    let b = HashTable::make(pool).unwrap();

    let mut vals: Vec<u8> = (0..8).collect();
    unsafe {
        for (i, v) in vals.iter_mut().enumerate() {
            let key = pool.memdup(format!("key-{i}").as_bytes()).unwrap();
            let key = std::slice::from_raw_parts(key.as_ptr(), 5);
            if i < 6 {
                a.set(key, Some(NonNull::from(&mut *v)));
            }
            if i >= 4 {
                b.set(key, Some(NonNull::from(&mut *v)));
            }
        }
    }

    let copied = a.copy(pool).unwrap();
    assert_eq!(copied.len(), a.len());
    a.foreach(|key, val| {
        assert_eq!(copied.get(key).unwrap(), val);
        true
    });

    let merged = a.merge(pool, &b).unwrap();
    assert_eq!(merged.len(), 8);
    // Keys only in `a` keep a's value; keys in `b` take b's value.
    b.foreach(|key, val| {
        assert_eq!(merged.get(key).unwrap(), val);
        true
    });

    unsafe { pool.destroy() };
}

#[test]
fn test_allocation_failure_is_an_error_not_a_panic() {
    let pool = Pool::create(None, PoolFlags::NONE).unwrap();
    assert!(pool.palloc(usize::MAX - 4096).is_err());
    assert!(pool.calloc(usize::MAX, 2).is_err());
    unsafe { pool.destroy() };
}

#[cfg(target_os = "linux")]
#[test]
fn test_mmap_backed_pool_workload() {
    let alloc = Allocator::with_mmap(8).unwrap();
    let pool = Pool::create(Some(alloc), PoolFlags::NONE).unwrap();

    // Push well past the initial 8-page extent to force in-place growth.
    for round in 0..4 {
        for _ in 0..64 {
            let p = pool.palloc(3500).unwrap();
            unsafe { std::ptr::write_bytes(p.as_ptr(), round as u8, 3500) };
        }
        unsafe { pool.clear() };
    }

    unsafe {
        pool.destroy();
        alloc.destroy();
    }
}
