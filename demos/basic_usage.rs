// demos/basic_usage.rs
//! Basic usage walkthrough for the pool system.

use std::ptr::NonNull;
use treepool::prelude::*;

fn main() -> Result<()> {
    println!("=== Basic Pool Usage ===\n");

    // 1. Create a root pool; it builds and owns its allocator.
    let pool = Pool::create(None, PoolFlags::NONE)?;

    // Bump allocations are 16-aligned and practically free.
    let a = pool.palloc(100)?;
    let b = pool.palloc(200)?;
    println!("bumped 100 bytes at {:p}, 200 bytes at {:p}", a, b);

    // 2. Large allocations go through the recycler.
    let (big, granted) = pool.alloc(512)?;
    println!("large allocation: asked 512, granted {granted}");
    pool.free(big, granted);

    let (big2, granted) = pool.alloc(400)?;
    println!(
        "recycled: asked 400, granted {granted}, same range: {}",
        big2 == big
    );

    // 3. Children are destroyed with their parent, cleanups in LIFO.
    let child = pool.make_child()?;
    fn report(_d: *mut u8) {
        println!("child cleanup ran");
    }
    child.cleanup_register(std::ptr::null_mut(), report)?;

    // 4. Userdata rides along with the pool.
    let mut session_id = 7u32;
    pool.userdata_set(
        NonNull::new(&mut session_id as *mut u32 as *mut u8).unwrap(),
        "session",
        None,
    )?;
    println!(
        "userdata present: {}",
        pool.userdata_get("session").is_some()
    );

    // 5. Accounting.
    println!(
        "allocated: {} bytes, served from recycled ranges: {} bytes",
        pool.allocated_bytes(),
        pool.returned_bytes()
    );

    // Destroying the pool runs the child's cleanup first, then returns
    // every block to the allocator.
    unsafe { pool.destroy() };
    println!("pool destroyed");

    Ok(())
}
