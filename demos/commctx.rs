use std::ptr;

use mpi_commctx::native::contexts;
use mpi_commctx::sync::{barrier, Sequential};
use mpi_commctx::traits::*;

fn main() {
    unsafe {
        mpi_sys::MPI_Init(ptr::null_mut(), ptr::null_mut());
    }

    let contexts = contexts();
    let runtime = contexts.runtime();
    let world = runtime.comm_world();
    let rank = runtime.rank(world).unwrap();

    let ctx = contexts.lookup(world).unwrap();
    assert_ne!(ctx.comm, world);
    assert_eq!(ctx.tag, 0);
    assert_eq!(contexts.lookup(world).unwrap().tag, 1);

    Sequential::new(contexts, world)
        .unwrap()
        .run(|| {
            println!(
                "Rank {} uses tag upper bound {}.",
                rank,
                contexts.tag_bound().unwrap()
            )
        })
        .unwrap();

    barrier(contexts, world).unwrap();
    println!("After barrier, rank {}.", rank);

    unsafe {
        mpi_sys::MPI_Finalize();
    }
}
