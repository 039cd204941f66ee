use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use mpi_commctx::sim::{self, Universe};
use mpi_commctx::sync::{barrier, Sequential};
use mpi_commctx::traits::*;
use mpi_commctx::ContextManager;

#[test]
fn sequential_sections_run_in_rank_order() {
    let order = Mutex::new(Vec::new());
    Universe::new(5).run(|process| {
        let pid = process.pid();
        let contexts = ContextManager::new(process);
        let world = contexts.runtime().comm_world();
        let sequential = Sequential::new(&contexts, world).unwrap();
        sequential
            .run(|| order.lock().unwrap().push(pid))
            .unwrap();
    });
    assert_eq!(order.into_inner().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn sequential_rejects_intercommunicators() {
    Universe::new(2).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 1)
            .unwrap();
        let err = Sequential::new(&contexts, inter).err().unwrap();
        assert_eq!(err.code(), sim::ERR_COMM);
    });
}

#[test]
fn barrier_waits_for_everybody() {
    let arrived = AtomicUsize::new(0);
    Universe::new(7).run(|process| {
        let contexts = ContextManager::new(process);
        let world = contexts.runtime().comm_world();
        for round in 1..=3 {
            arrived.fetch_add(1, Ordering::SeqCst);
            barrier(&contexts, world).unwrap();
            assert!(arrived.load(Ordering::SeqCst) >= 7 * round);
            barrier(&contexts, world).unwrap();
        }
    });
}

#[test]
fn intercommunicator_barrier_spans_both_groups() {
    let arrived = AtomicUsize::new(0);
    Universe::new(8).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 3)
            .unwrap();
        arrived.fetch_add(1, Ordering::SeqCst);
        barrier(&contexts, inter).unwrap();
        assert_eq!(arrived.load(Ordering::SeqCst), 8);
    });
}

#[test]
fn internal_traffic_does_not_match_user_messages() {
    Universe::new(2).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let world = runtime.comm_world();
        let rank = runtime.rank(world).unwrap();
        let peer = 1 - rank;

        // same tag the first internal message will use
        runtime.send(world, peer, 0, b"user").unwrap();
        barrier(&contexts, world).unwrap();
        assert_eq!(runtime.recv(world, peer, 0).unwrap(), b"user".to_vec());
    });
}
