// demos/request_scopes.rs
//! Request-style usage: one pool per unit of work, selected through the
//! thread-local scope stack, torn down wholesale when the work is done.

use treepool::prelude::*;
use treepool::{acquire, create_tagged, initialize, terminate};

const TAG_REQUEST: u32 = 1;

fn handle_request(id: u32) -> Result<()> {
    // The caller's scope names the current pool; everything this request
    // allocates lives in a child that dies at the end of the function.
    let parent = acquire().expect("scope must be entered");
    let request = create_tagged(Some(parent), "request")?;

    {
        let _scope = PoolScope::tagged(request, TAG_REQUEST, std::ptr::null());

        let pool = acquire().unwrap();
        let header = pool.memdup(format!("request-{id}").as_bytes())?;
        let (body, granted) = pool.alloc(1024)?;
        println!(
            "request {id}: header at {:p}, {granted}-byte body at {:p} (tag {})",
            header,
            body,
            pool.tag().unwrap_or("-")
        );
    }

    unsafe { treepool::destroy(request) };
    Ok(())
}

fn main() -> Result<()> {
    initialize()?;

    for id in 0..3 {
        handle_request(id)?;
    }

    println!("active managed pools: {}", treepool::active_pool_count());

    terminate();
    Ok(())
}
