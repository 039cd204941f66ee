use mpi_commctx::sim::{self, Primitive, Universe};
use mpi_commctx::traits::*;
use mpi_commctx::ContextManager;

#[test]
fn freeing_communicator_releases_duplicate() {
    Universe::new(3).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let other = runtime.duplicate(runtime.comm_world()).unwrap();

        contexts.lookup(other).unwrap();
        contexts.lookup(other).unwrap();
        assert_eq!(runtime.live_comms(), 2);

        runtime.comm_free(other).unwrap();
        assert_eq!(runtime.live_comms(), 0);

        let stats = runtime.stats();
        assert_eq!(stats.attributes_deleted, 1);
        assert_eq!(stats.comms_freed, 2);
    });
}

#[test]
fn freeing_intercommunicator_releases_merge_products() {
    Universe::new(5).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let inter = runtime
            .create_intercomm(runtime.comm_world(), 2)
            .unwrap();

        contexts.lookup_inter(inter).unwrap();
        assert_eq!(runtime.live_comms(), 3);

        runtime.comm_free(inter).unwrap();
        assert_eq!(runtime.live_comms(), 0);
        assert_eq!(runtime.live_groups(), 0);
    });
}

#[test]
fn repeated_create_and_free_does_not_leak() {
    Universe::new(4).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let world = runtime.comm_world();

        for _ in 0..10 {
            let comm = runtime.duplicate(world).unwrap();
            assert_eq!(contexts.lookup(comm).unwrap().tag, 0);
            assert_eq!(contexts.lookup(comm).unwrap().tag, 1);
            runtime.comm_free(comm).unwrap();

            let inter = runtime.create_intercomm(world, 1).unwrap();
            contexts.lookup_inter(inter).unwrap();
            runtime.comm_free(inter).unwrap();

            assert_eq!(runtime.live_comms(), 0);
        }

        let stats = runtime.stats();
        assert_eq!(stats.attributes_deleted, 20);
        assert_eq!(stats.groups_created, stats.groups_freed);
        assert_eq!(runtime.live_keyvals(), 2);
    });
}

#[test]
fn failed_free_keeps_context() {
    Universe::new(2).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let other = runtime.duplicate(runtime.comm_world()).unwrap();
        let ctx = contexts.lookup(other).unwrap();

        runtime.fail_next(Primitive::CommFree, sim::ERR_COMM);
        assert!(runtime.comm_free(other).is_err());
        assert_eq!(runtime.live_comms(), 2);
        assert_eq!(contexts.lookup(other).unwrap().comm, ctx.comm);

        runtime.comm_free(other).unwrap();
        assert_eq!(runtime.live_comms(), 0);
    });
}

#[test]
fn finalize_releases_contexts_and_keyvals() {
    Universe::new(2).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let world = runtime.comm_world();
        let other = runtime.duplicate(world).unwrap();

        contexts.lookup(world).unwrap();
        contexts.lookup(other).unwrap();
        assert_eq!(runtime.live_keyvals(), 2);
        assert_eq!(runtime.live_comms(), 3);

        runtime.finalize().unwrap();
        assert_eq!(runtime.live_keyvals(), 0);
        assert!(contexts.store().keyval().is_none());
        assert_eq!(runtime.live_comms(), 0);
        assert_eq!(runtime.attribute_count(world), 0);
        assert_eq!(runtime.attribute_count(other), 0);

        // bookkeeping attribute plus one context per communicator
        assert_eq!(runtime.stats().attributes_deleted, 3);

        // handles of the finished session are gone
        assert_eq!(runtime.comm_free(other).unwrap_err().code(), sim::ERR_COMM);
    });
}

#[test]
fn new_session_gets_one_fresh_context() {
    Universe::new(2).run(|process| {
        let contexts = ContextManager::new(process);
        let runtime = contexts.runtime();
        let old_world = runtime.comm_world();

        contexts.lookup(old_world).unwrap();
        let old_keyval = contexts.store().keyval();
        runtime.finalize().unwrap();

        let world = runtime.comm_world();
        assert_ne!(world, old_world);
        assert_eq!(
            contexts.lookup(old_world).unwrap_err().code(),
            sim::ERR_COMM
        );
        assert_eq!(runtime.attribute_count(old_world), 0);

        let ctx = contexts.lookup(world).unwrap();
        assert_eq!(ctx.tag, 0);
        assert_eq!(contexts.lookup(world).unwrap().comm, ctx.comm);
        assert_eq!(runtime.attribute_count(world), 1);
        assert_eq!(runtime.live_comms(), 1);
        assert_ne!(contexts.store().keyval(), old_keyval);

        let stats = runtime.stats();
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.keyvals_created, 4);
        assert_eq!(stats.keyvals_freed, 2);
        assert_eq!(stats.tag_bound_queries, 1);

        runtime.finalize().unwrap();
        assert_eq!(runtime.live_comms(), 0);
        assert_eq!(runtime.live_keyvals(), 0);
    });
}
