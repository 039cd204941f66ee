use mpi_commctx::sim::Universe;
use mpi_commctx::traits::*;
use mpi_commctx::{ContextManager, GroupOrder};

#[test]
fn unequal_groups_put_larger_group_low() {
    let results = Universe::new(8).run(|process| {
        let pid = process.pid();
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 3)
            .unwrap();

        let ctx = contexts.lookup_inter(inter).unwrap();
        assert_eq!(ctx.tag, 0);
        assert!(runtime.is_inter(ctx.comm).unwrap());
        assert!(!runtime.is_inter(ctx.local_comm).unwrap());
        assert_eq!(
            runtime.rank(ctx.local_comm).unwrap(),
            runtime.rank(inter).unwrap()
        );
        (pid, ctx.order, runtime.size(ctx.local_comm).unwrap())
    });

    for (pid, order, local_size) in results {
        if pid < 3 {
            assert_eq!(order, GroupOrder::High);
            assert_eq!(local_size, 3);
        } else {
            assert_eq!(order, GroupOrder::Low);
            assert_eq!(local_size, 5);
        }
    }
}

#[test]
fn equal_groups_agree_on_order() {
    let results = Universe::new(8).run(|process| {
        let pid = process.pid();
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 4)
            .unwrap();

        let ctx = contexts.lookup_inter(inter).unwrap();
        assert_eq!(runtime.size(ctx.local_comm).unwrap(), 4);
        (pid < 4, ctx.order)
    });

    let first: Vec<_> = results.iter().filter(|r| r.0).map(|r| r.1).collect();
    let second: Vec<_> = results.iter().filter(|r| !r.0).map(|r| r.1).collect();
    assert!(first.iter().all(|&order| order == first[0]));
    assert!(second.iter().all(|&order| order == second[0]));
    assert_ne!(first[0], second[0]);
}

#[test]
fn merge_happens_once() {
    Universe::new(5).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 2)
            .unwrap();

        let first = contexts.lookup_inter(inter).unwrap();
        let second = contexts.lookup_inter(inter).unwrap();
        assert_eq!(first.comm, second.comm);
        assert_eq!(first.local_comm, second.local_comm);
        assert_eq!(first.order, second.order);
        assert_eq!((first.tag, second.tag), (0, 1));

        let stats = runtime.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.merges, 1);
        assert_eq!(stats.creates, 1);
    });
}

#[test]
fn merge_temporaries_are_released() {
    Universe::new(6).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 2)
            .unwrap();
        contexts.lookup_inter(inter).unwrap();

        // the inter-communicator itself, its duplicate and the local group communicator
        assert_eq!(runtime.live_comms(), 3);
        assert_eq!(runtime.live_groups(), 0);
    });
}

#[test]
fn plain_lookup_on_intercommunicator_does_not_merge() {
    Universe::new(4).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 1)
            .unwrap();

        let plain = contexts.lookup(inter).unwrap();
        assert_eq!(plain.tag, 0);
        assert_eq!(
            runtime.remote_size(plain.comm).unwrap(),
            runtime.remote_size(inter).unwrap()
        );
        assert_eq!(runtime.stats().merges, 0);

        let merged = contexts.lookup_inter(inter).unwrap();
        assert_eq!(merged.comm, plain.comm);
        assert_eq!(merged.tag, 1);
        assert_eq!(runtime.stats().merges, 1);
    });
}
