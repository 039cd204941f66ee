//! A simulated message passing runtime
//!
//! The simulation runs every process of a [`Universe`] on its own thread of the current OS
//! process. Each thread receives a [`Process`], which implements [`Runtime`] with the semantics
//! the context layer relies on:
//!
//! - a world communicator and one self communicator per process,
//! - per-process attribute caches whose delete callbacks run, last set first, when a communicator
//!   is freed or when the process is finalized (self communicator first),
//! - finalization that ends the session: held handles and keyvals are dropped and fresh world and
//!   self communicators replace the old ones,
//! - collective duplication, inter-communicator merge and communicator creation, matched across
//!   processes by call order,
//! - buffered point to point messages matched on source and tag.
//!
//! Processes also count what they do ([`Stats`]) and can be told to fail the next call of a
//! primitive ([`Process::fail_next()`]), which makes them suitable for checking resource and
//! call-count properties in tests.
//!
//! # Examples
//!
//! ```
//! use mpi_commctx::sim::Universe;
//! use mpi_commctx::traits::*;
//! use mpi_commctx::ContextManager;
//!
//! let tags = Universe::new(2).run(|process| {
//!     let contexts = ContextManager::new(process);
//!     let world = contexts.runtime().comm_world();
//!     let first = contexts.lookup(world).unwrap();
//!     let second = contexts.lookup(world).unwrap();
//!     assert_eq!(first.comm, second.comm);
//!     (first.tag, second.tag)
//! });
//! assert_eq!(tags, vec![(0, 1), (0, 1)]);
//! ```
use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

use conv::ConvUtil;
use smallvec::SmallVec;

use self::world::{Contribution, Members, Outcome, Topology, World, WorldState};
use crate::error::{Error, Result};
use crate::runtime::{AttrValue, DeleteFn, ExtraState, Keyval, Runtime};
use crate::{Rank, Tag};

mod world;

/// Invalid tag argument
pub const ERR_TAG: c_int = 4;
/// Invalid communicator argument
pub const ERR_COMM: c_int = 5;
/// Invalid rank argument
pub const ERR_RANK: c_int = 6;
/// Invalid group argument
pub const ERR_GROUP: c_int = 8;
/// Invalid argument of some other kind
pub const ERR_ARG: c_int = 12;
/// Known error not in this list
pub const ERR_OTHER: c_int = 15;
/// Internal error
pub const ERR_INTERN: c_int = 16;
/// Invalid keyval argument
pub const ERR_KEYVAL: c_int = 48;

/// A simulated communicator handle
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct CommId(u32);

impl CommId {
    /// The null communicator
    pub const NULL: CommId = CommId(u32::MAX);
}

/// A simulated process group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    members: Members,
}

impl Group {
    /// Number of processes in the group
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Primitives that can be made to fail with [`Process::fail_next()`]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Primitive {
    /// [`Runtime::tag_upper_bound()`]
    TagUpperBound,
    /// [`Runtime::create_keyval()`]
    CreateKeyval,
    /// [`Runtime::get_attr()`]
    GetAttr,
    /// [`Runtime::set_attr()`]
    SetAttr,
    /// [`Runtime::duplicate()`]
    Duplicate,
    /// [`Runtime::intercomm_merge()`]
    IntercommMerge,
    /// [`Runtime::comm_create()`]
    CommCreate,
    /// [`Runtime::comm_free()`]
    CommFree,
    /// [`Runtime::allocate()`]
    Allocate,
}

/// Counters of runtime activity in one process
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Queries of the tag upper bound
    pub tag_bound_queries: usize,
    /// Keyvals created
    pub keyvals_created: usize,
    /// Keyvals freed
    pub keyvals_freed: usize,
    /// Completed collective duplications
    pub duplicates: usize,
    /// Completed inter-communicator merges
    pub merges: usize,
    /// Completed communicator creations from groups
    pub creates: usize,
    /// Communicators freed
    pub comms_freed: usize,
    /// Group handles obtained
    pub groups_created: usize,
    /// Group handles freed
    pub groups_freed: usize,
    /// Attribute delete callbacks run
    pub attributes_deleted: usize,
    /// Error handler invocations
    pub errhandler_calls: usize,
}

/// Configures a [`Universe`].
#[derive(Clone, Debug)]
pub struct Builder {
    size: usize,
    tag_ub: Option<Tag>,
}

impl Builder {
    /// Advertise `tag_ub` as `MPI_TAG_UB`.
    pub fn tag_upper_bound(mut self, tag_ub: Tag) -> Self {
        self.tag_ub = Some(tag_ub);
        self
    }

    /// Do not advertise `MPI_TAG_UB` at all.
    pub fn without_tag_upper_bound(mut self) -> Self {
        self.tag_ub = None;
        self
    }

    /// Create the universe.
    pub fn build(self) -> Universe {
        Universe {
            world: Arc::new(World::new(self.size, self.tag_ub)),
        }
    }
}

/// A set of simulated processes sharing a world communicator.
#[derive(Clone, Debug)]
pub struct Universe {
    world: Arc<World>,
}

impl Universe {
    /// A universe of `size` processes advertising the largest possible tag upper bound
    pub fn new(size: usize) -> Universe {
        Universe::builder(size).build()
    }

    /// Configure a universe of `size` processes.
    pub fn builder(size: usize) -> Builder {
        assert!(size > 0, "a universe needs at least one process");
        Builder {
            size,
            tag_ub: Some(c_int::MAX),
        }
    }

    /// Number of processes
    pub fn size(&self) -> usize {
        self.world.size
    }

    /// Run `f` on every process, each on its own thread, and collect the results in process order.
    ///
    /// If a process panics, blocked peers are released with errors and the panic of the first
    /// failing process is propagated.
    pub fn run<F, T>(&self, f: F) -> Vec<T>
    where
        F: Fn(Process) -> T + Sync,
        T: Send,
    {
        let results: Vec<thread::Result<T>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.world.size)
                .map(|pid| {
                    let world = Arc::clone(&self.world);
                    let f = &f;
                    scope.spawn(move || {
                        let process = Process::new(pid, Arc::clone(&world));
                        match panic::catch_unwind(AssertUnwindSafe(|| f(process))) {
                            Ok(value) => value,
                            Err(payload) => {
                                world.abort(pid);
                                panic::resume_unwind(payload)
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join()).collect()
        });

        let mut values = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (pid, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(payload) => failures.push((pid, payload)),
            }
        }
        if !failures.is_empty() {
            let culprit = self.world.aborted_by();
            let index = failures
                .iter()
                .position(|(pid, _)| Some(*pid) == culprit)
                .unwrap_or(0);
            let (_, payload) = failures.swap_remove(index);
            panic::resume_unwind(payload);
        }
        values
    }
}

struct Attribute {
    keyval: Keyval,
    value: AttrValue,
    delete: DeleteFn<Process>,
    extra: ExtraState,
}

#[derive(Copy, Clone)]
struct KeyvalEntry {
    delete: DeleteFn<Process>,
    extra: ExtraState,
}

#[derive(Default)]
struct LocalState {
    handles: HashSet<CommId>,
    attributes: HashMap<CommId, Vec<Attribute>>,
    keyvals: HashMap<c_int, KeyvalEntry>,
    next_keyval: c_int,
    collective_seq: HashMap<CommId, u64>,
    faults: HashMap<Primitive, c_int>,
    stats: Stats,
}

/// Predefined communicators of one runtime session
#[derive(Copy, Clone, Debug)]
struct Session {
    world: CommId,
    self_comm: CommId,
}

/// One simulated process.
///
/// A `Process` lives on the thread it was handed to and is not meant to be shared.
pub struct Process {
    pid: usize,
    world: Arc<World>,
    session: Cell<Session>,
    local: RefCell<LocalState>,
}

impl Process {
    fn new(pid: usize, world: Arc<World>) -> Process {
        // The world communicator is registered first, self communicators follow in process order.
        let session = Session {
            world: CommId(0),
            self_comm: CommId(1 + pid as u32),
        };
        Process {
            pid,
            world,
            session: Cell::new(session),
            local: RefCell::new(LocalState::default()),
        }
    }

    /// Index of this process in the universe, equal to its world rank
    pub fn pid(&self) -> usize {
        self.pid
    }

    /// Make the next call of `primitive` fail with `code`. For collective primitives every
    /// participant should be told to fail, since a failing process does not join the collective.
    pub fn fail_next(&self, primitive: Primitive, code: c_int) {
        self.local.borrow_mut().faults.insert(primitive, code);
    }

    /// Activity counters of this process
    pub fn stats(&self) -> Stats {
        self.local.borrow().stats.clone()
    }

    /// Communicators created by this process and not freed yet
    pub fn live_comms(&self) -> usize {
        self.local.borrow().handles.len()
    }

    /// Keyvals created by this process and not freed yet
    pub fn live_keyvals(&self) -> usize {
        self.local.borrow().keyvals.len()
    }

    /// Group handles obtained by this process and not freed yet
    pub fn live_groups(&self) -> usize {
        let local = self.local.borrow();
        local.stats.groups_created - local.stats.groups_freed
    }

    /// Number of attributes cached on `comm`
    pub fn attribute_count(&self, comm: CommId) -> usize {
        self.local
            .borrow()
            .attributes
            .get(&comm)
            .map_or(0, |attributes| attributes.len())
    }

    /// Build an inter-communicator from the intra-communicator `comm`: its first `first_size`
    /// ranks form one group, the remaining ranks the other. Collective over `comm`.
    pub fn create_intercomm(&self, comm: CommId, first_size: usize) -> Result<CommId> {
        let outcome = self.collective(comm, Contribution::Unit, move |state, topology, _| {
            match topology {
                Topology::Intra(members) if first_size > 0 && first_size < members.len() => {
                    let (a, b) = members.split_at(first_size);
                    Outcome::Comm(state.register(Topology::Inter(
                        SmallVec::from_slice(a),
                        SmallVec::from_slice(b),
                    )))
                }
                Topology::Intra(_) => Outcome::Failed(ERR_ARG),
                Topology::Inter(..) => Outcome::Failed(ERR_COMM),
            }
        })?;
        self.adopt(outcome)
    }

    /// End the runtime session and start a new one. Collective over the world communicator.
    ///
    /// The attributes of the self communicator are deleted first, most recently set first, as
    /// `MPI_Finalize` does. Then the attributes of every other communicator still held are
    /// deleted and all handles and keyvals of the session become invalid. The next session has
    /// fresh world and self communicators, so the process stays usable for repeated sessions.
    pub fn finalize(&self) -> Result<()> {
        let mut result = self.delete_all(self.comm_self());
        loop {
            let next = self.local.borrow().attributes.keys().min().copied();
            let comm = match next {
                Some(comm) => comm,
                None => break,
            };
            let deleted = self.delete_all(comm);
            if result.is_ok() {
                result = deleted;
            }
        }

        let outcome = self.collective(
            self.comm_world(),
            Contribution::Unit,
            |state, topology, _| {
                let members = match topology {
                    Topology::Intra(members) => members.clone(),
                    Topology::Inter(..) => return Outcome::Failed(ERR_COMM),
                };
                let world = state.register(Topology::Intra(members.clone()));
                let mut created = vec![(members.clone(), world)];
                for &pid in members.iter() {
                    let solo: Members = SmallVec::from_elem(pid, 1);
                    let id = state.register(Topology::Intra(solo.clone()));
                    created.push((solo, id));
                }
                Outcome::Comms(created)
            },
        )?;
        let created = match outcome {
            Outcome::Comms(created) => created,
            _ => return Err(Error::from_code(ERR_INTERN)),
        };
        let world = created.first().map(|&(_, id)| id);
        let self_comm = created
            .iter()
            .skip(1)
            .find(|(members, _)| members.contains(&self.pid))
            .map(|&(_, id)| id);
        match (world, self_comm) {
            (Some(world), Some(self_comm)) => self.session.set(Session { world, self_comm }),
            _ => return Err(Error::from_code(ERR_INTERN)),
        }

        let mut local = self.local.borrow_mut();
        local.handles.clear();
        local.keyvals.clear();
        local.collective_seq.clear();
        result
    }

    /// Delete every attribute cached on `comm`.
    fn delete_all(&self, comm: CommId) -> Result<()> {
        let attributes = self
            .local
            .borrow_mut()
            .attributes
            .remove(&comm)
            .unwrap_or_default();
        self.delete_attributes(comm, attributes)
    }

    fn fault(&self, primitive: Primitive) -> Result<()> {
        match self.local.borrow_mut().faults.remove(&primitive) {
            Some(code) => Err(Error::from_code(code)),
            None => Ok(()),
        }
    }

    fn check_comm(&self, comm: CommId) -> Result<Topology> {
        let held = comm == self.comm_world()
            || comm == self.comm_self()
            || self.local.borrow().handles.contains(&comm);
        if !held {
            return Err(Error::from_code(ERR_COMM));
        }
        self.world
            .topology(comm)
            .ok_or_else(|| Error::from_code(ERR_COMM))
    }

    fn check_keyval(&self, keyval: Keyval) -> Result<KeyvalEntry> {
        self.local
            .borrow()
            .keyvals
            .get(&keyval.as_raw())
            .copied()
            .ok_or_else(|| Error::from_code(ERR_KEYVAL))
    }

    fn local_group(&self, comm: CommId) -> Result<Members> {
        self.check_comm(comm)?
            .local_group(self.pid)
            .cloned()
            .ok_or_else(|| Error::from_code(ERR_COMM))
    }

    fn peer(&self, comm: CommId, rank: Rank) -> Result<usize> {
        let topology = self.check_comm(comm)?;
        let peers = topology
            .peer_group(self.pid)
            .ok_or_else(|| Error::from_code(ERR_COMM))?;
        rank.value_as::<usize>()
            .ok()
            .and_then(|index| peers.get(index).copied())
            .ok_or_else(|| Error::from_code(ERR_RANK))
    }

    fn check_tag(&self, tag: Tag) -> Result<()> {
        let too_large = self.world.tag_ub.map_or(false, |ub| tag > ub);
        if tag < 0 || too_large {
            Err(Error::from_code(ERR_TAG))
        } else {
            Ok(())
        }
    }

    fn collective<F>(&self, comm: CommId, contribution: Contribution, finish: F) -> Result<Outcome>
    where
        F: FnOnce(&mut WorldState, &Topology, BTreeMap<usize, Contribution>) -> Outcome,
    {
        self.check_comm(comm)?;
        let seq = {
            let mut local = self.local.borrow_mut();
            let next = local.collective_seq.entry(comm).or_insert(0);
            let seq = *next;
            *next += 1;
            seq
        };
        match self
            .world
            .collective(comm, seq, self.pid, contribution, finish)
            .map_err(Error::from_code)?
        {
            Outcome::Failed(code) => Err(Error::from_code(code)),
            outcome => Ok(outcome),
        }
    }

    /// Take ownership of the communicator a collective produced.
    fn adopt(&self, outcome: Outcome) -> Result<CommId> {
        match outcome {
            Outcome::Comm(comm) => {
                self.local.borrow_mut().handles.insert(comm);
                Ok(comm)
            }
            _ => Err(Error::from_code(ERR_INTERN)),
        }
    }

    fn delete_attributes(&self, comm: CommId, attributes: Vec<Attribute>) -> Result<()> {
        let mut result = Ok(());
        for attribute in attributes.into_iter().rev() {
            self.local.borrow_mut().stats.attributes_deleted += 1;
            // SAFETY: value and extra state are passed back exactly as they were registered.
            let deleted = unsafe {
                (attribute.delete)(
                    self,
                    comm,
                    attribute.keyval,
                    attribute.value,
                    attribute.extra,
                )
            };
            if result.is_ok() {
                result = deleted;
            }
        }
        result
    }
}

impl Runtime for Process {
    type Comm = CommId;
    type Group = Group;

    const ERR_INTERN: c_int = ERR_INTERN;
    const ERR_COMM: c_int = ERR_COMM;

    fn comm_world(&self) -> CommId {
        self.session.get().world
    }

    fn comm_self(&self) -> CommId {
        self.session.get().self_comm
    }

    fn comm_null(&self) -> CommId {
        CommId::NULL
    }

    fn tag_upper_bound(&self) -> Result<Option<Tag>> {
        self.fault(Primitive::TagUpperBound)?;
        self.local.borrow_mut().stats.tag_bound_queries += 1;
        Ok(self.world.tag_ub)
    }

    fn create_keyval(&self, delete: DeleteFn<Self>, extra_state: ExtraState) -> Result<Keyval> {
        self.fault(Primitive::CreateKeyval)?;
        let mut local = self.local.borrow_mut();
        local.next_keyval += 1;
        let raw = local.next_keyval;
        local.keyvals.insert(
            raw,
            KeyvalEntry {
                delete,
                extra: extra_state,
            },
        );
        local.stats.keyvals_created += 1;
        Ok(Keyval::from_raw(raw))
    }

    fn free_keyval(&self, keyval: Keyval) -> Result<()> {
        let mut local = self.local.borrow_mut();
        match local.keyvals.remove(&keyval.as_raw()) {
            Some(_) => {
                local.stats.keyvals_freed += 1;
                Ok(())
            }
            None => Err(Error::from_code(ERR_KEYVAL)),
        }
    }

    fn get_attr(&self, comm: CommId, keyval: Keyval) -> Result<Option<AttrValue>> {
        self.fault(Primitive::GetAttr)?;
        self.check_comm(comm)?;
        self.check_keyval(keyval)?;
        Ok(self.local.borrow().attributes.get(&comm).and_then(|attributes| {
            attributes
                .iter()
                .find(|attribute| attribute.keyval == keyval)
                .map(|attribute| attribute.value)
        }))
    }

    fn set_attr(&self, comm: CommId, keyval: Keyval, value: AttrValue) -> Result<()> {
        self.fault(Primitive::SetAttr)?;
        self.check_comm(comm)?;
        let entry = self.check_keyval(keyval)?;
        let replaced = {
            let mut local = self.local.borrow_mut();
            let attributes = local.attributes.entry(comm).or_default();
            let position = attributes
                .iter()
                .position(|attribute| attribute.keyval == keyval);
            let replaced = position.map(|index| attributes.remove(index));
            attributes.push(Attribute {
                keyval,
                value,
                delete: entry.delete,
                extra: entry.extra,
            });
            replaced
        };
        match replaced {
            Some(old) => self.delete_attributes(comm, vec![old]),
            None => Ok(()),
        }
    }

    fn is_inter(&self, comm: CommId) -> Result<bool> {
        Ok(matches!(self.check_comm(comm)?, Topology::Inter(..)))
    }

    fn size(&self, comm: CommId) -> Result<Rank> {
        self.local_group(comm)?
            .len()
            .value_as()
            .map_err(|_| Error::from_code(ERR_INTERN))
    }

    fn remote_size(&self, comm: CommId) -> Result<Rank> {
        self.check_comm(comm)?
            .remote_group(self.pid)
            .ok_or_else(|| Error::from_code(ERR_COMM))?
            .len()
            .value_as()
            .map_err(|_| Error::from_code(ERR_INTERN))
    }

    fn rank(&self, comm: CommId) -> Result<Rank> {
        self.local_group(comm)?
            .iter()
            .position(|&pid| pid == self.pid)
            .ok_or_else(|| Error::from_code(ERR_COMM))?
            .value_as()
            .map_err(|_| Error::from_code(ERR_INTERN))
    }

    fn duplicate(&self, comm: CommId) -> Result<CommId> {
        self.fault(Primitive::Duplicate)?;
        let outcome = self.collective(comm, Contribution::Unit, |state, topology, _| {
            Outcome::Comm(state.register(topology.clone()))
        })?;
        let dup = self.adopt(outcome)?;
        self.local.borrow_mut().stats.duplicates += 1;
        Ok(dup)
    }

    fn intercomm_merge(&self, comm: CommId, high: bool) -> Result<CommId> {
        self.fault(Primitive::IntercommMerge)?;
        if !self.is_inter(comm)? {
            return Err(Error::from_code(ERR_COMM));
        }
        let outcome = self.collective(
            comm,
            Contribution::High(high),
            |state, topology, contributions| {
                let (a, b) = match topology {
                    Topology::Inter(a, b) => (a, b),
                    Topology::Intra(_) => return Outcome::Failed(ERR_COMM),
                };
                let wants_high = |group: &Members| {
                    group.first().and_then(|pid| contributions.get(pid)).map_or(
                        false,
                        |contribution| matches!(contribution, Contribution::High(true)),
                    )
                };
                // With equal flags the group listed first when the inter-communicator was built
                // goes first.
                let (first, second) = if wants_high(a) && !wants_high(b) {
                    (b, a)
                } else {
                    (a, b)
                };
                let members = first.iter().chain(second.iter()).copied().collect();
                Outcome::Comm(state.register(Topology::Intra(members)))
            },
        )?;
        let merged = self.adopt(outcome)?;
        self.local.borrow_mut().stats.merges += 1;
        Ok(merged)
    }

    fn comm_group(&self, comm: CommId) -> Result<Group> {
        let members = self.local_group(comm)?;
        self.local.borrow_mut().stats.groups_created += 1;
        Ok(Group { members })
    }

    fn comm_create(&self, comm: CommId, group: &Group) -> Result<CommId> {
        self.fault(Primitive::CommCreate)?;
        if self.is_inter(comm)? {
            return Err(Error::from_code(ERR_COMM));
        }
        let outcome = self.collective(
            comm,
            Contribution::Group(group.members.clone()),
            |state, topology, contributions| {
                let members = match topology {
                    Topology::Intra(members) => members,
                    Topology::Inter(..) => return Outcome::Failed(ERR_COMM),
                };
                let mut created: Vec<(Members, CommId)> = Vec::new();
                for contribution in contributions.values() {
                    let group = match contribution {
                        Contribution::Group(group) => group,
                        _ => return Outcome::Failed(ERR_GROUP),
                    };
                    if group.iter().any(|pid| !members.contains(pid)) {
                        return Outcome::Failed(ERR_GROUP);
                    }
                    if created.iter().any(|(existing, _)| existing == group) {
                        continue;
                    }
                    if created
                        .iter()
                        .any(|(existing, _)| existing.iter().any(|pid| group.contains(pid)))
                    {
                        return Outcome::Failed(ERR_GROUP);
                    }
                    created.push((group.clone(), CommId::NULL));
                }
                // Members of a group must all have passed that same group.
                for (group, _) in &created {
                    let consistent = group.iter().all(|pid| {
                        matches!(contributions.get(pid), Some(Contribution::Group(g)) if g == group)
                    });
                    if !consistent {
                        return Outcome::Failed(ERR_GROUP);
                    }
                }
                for (group, id) in created.iter_mut() {
                    *id = state.register(Topology::Intra(group.clone()));
                }
                Outcome::Comms(created)
            },
        )?;

        let created = match outcome {
            Outcome::Comms(created) => created,
            _ => return Err(Error::from_code(ERR_INTERN)),
        };
        let comm = created
            .into_iter()
            .find(|(members, _)| *members == group.members && members.contains(&self.pid))
            .map_or(CommId::NULL, |(_, id)| id);
        if comm != CommId::NULL {
            self.local.borrow_mut().handles.insert(comm);
        }
        self.local.borrow_mut().stats.creates += 1;
        Ok(comm)
    }

    fn group_free(&self, group: Group) -> Result<()> {
        drop(group);
        self.local.borrow_mut().stats.groups_freed += 1;
        Ok(())
    }

    fn comm_free(&self, comm: CommId) -> Result<()> {
        self.fault(Primitive::CommFree)?;
        let attributes = {
            let mut local = self.local.borrow_mut();
            if !local.handles.remove(&comm) {
                return Err(Error::from_code(ERR_COMM));
            }
            local.stats.comms_freed += 1;
            local.attributes.remove(&comm).unwrap_or_default()
        };
        self.delete_attributes(comm, attributes)
    }

    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.fault(Primitive::Allocate).is_err() {
            return None;
        }
        NonNull::new(alloc::alloc(layout))
    }

    fn call_errhandler(&self, comm: CommId, _code: c_int) -> Result<()> {
        self.check_comm(comm)?;
        self.local.borrow_mut().stats.errhandler_calls += 1;
        Ok(())
    }

    fn send(&self, comm: CommId, dest: Rank, tag: Tag, buf: &[u8]) -> Result<()> {
        self.check_tag(tag)?;
        let dest = self.peer(comm, dest)?;
        let source = self.rank(comm)?;
        self.world.post(comm, dest, source, tag, buf.to_vec());
        Ok(())
    }

    fn recv(&self, comm: CommId, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        self.check_tag(tag)?;
        self.peer(comm, source)?;
        self.world
            .take(comm, self.pid, source, tag)
            .map_err(Error::from_code)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::ptr;

    use super::*;

    unsafe fn record(
        _process: &Process,
        _comm: CommId,
        keyval: Keyval,
        _value: AttrValue,
        extra: ExtraState,
    ) -> Result<()> {
        let log = &*(extra as *const RefCell<Vec<c_int>>);
        log.borrow_mut().push(keyval.as_raw());
        Ok(())
    }

    #[test]
    fn attributes_are_deleted_last_set_first() {
        Universe::new(1).run(|process| {
            let log = RefCell::new(Vec::new());
            let extra = &log as *const RefCell<Vec<c_int>> as ExtraState;
            let first = process.create_keyval(record, extra).unwrap();
            let second = process.create_keyval(record, extra).unwrap();

            let comm = process.duplicate(process.comm_world()).unwrap();
            process.set_attr(comm, first, ptr::null_mut()).unwrap();
            process.set_attr(comm, second, ptr::null_mut()).unwrap();
            process.comm_free(comm).unwrap();

            assert_eq!(*log.borrow(), vec![second.as_raw(), first.as_raw()]);
        });
    }

    #[test]
    fn replacing_an_attribute_deletes_the_old_value() {
        Universe::new(1).run(|process| {
            let log = RefCell::new(Vec::new());
            let extra = &log as *const RefCell<Vec<c_int>> as ExtraState;
            let keyval = process.create_keyval(record, extra).unwrap();
            let world = process.comm_world();

            process.set_attr(world, keyval, ptr::null_mut()).unwrap();
            assert!(log.borrow().is_empty());
            process.set_attr(world, keyval, ptr::null_mut()).unwrap();
            assert_eq!(log.borrow().len(), 1);
            assert_eq!(process.attribute_count(world), 1);
        });
    }

    #[test]
    fn messages_match_on_source_and_tag() {
        Universe::new(3).run(|process| {
            let world = process.comm_world();
            match process.rank(world).unwrap() {
                0 => {
                    let late = process.recv(world, 2, 7).unwrap();
                    let early = process.recv(world, 1, 7).unwrap();
                    assert_eq!((early, late), (vec![1], vec![2]));
                }
                rank => process.send(world, 0, 7, &[rank as u8]).unwrap(),
            }
        });
    }

    #[test]
    fn tags_outside_bound_are_rejected() {
        Universe::builder(2)
            .tag_upper_bound(10)
            .build()
            .run(|process| {
                let world = process.comm_world();
                assert_eq!(process.send(world, 0, 11, &[]).unwrap_err().code(), ERR_TAG);
                assert_eq!(process.send(world, 0, -1, &[]).unwrap_err().code(), ERR_TAG);
                assert_eq!(process.send(world, 2, 0, &[]).unwrap_err().code(), ERR_RANK);
            });
    }

    #[test]
    fn merge_puts_high_group_last() {
        let ranks = Universe::new(5).run(|process| {
            let inter = process.create_intercomm(process.comm_world(), 2).unwrap();
            let high = process.pid() < 2;
            let merged = process.intercomm_merge(inter, high).unwrap();
            process.rank(merged).unwrap()
        });
        assert_eq!(ranks, vec![3, 4, 0, 1, 2]);
    }

    #[test]
    fn comm_create_splits_disjoint_groups() {
        let sizes = Universe::new(4).run(|process| {
            let inter = process.create_intercomm(process.comm_world(), 1).unwrap();
            let merged = process.intercomm_merge(inter, false).unwrap();
            let group = process.comm_group(inter).unwrap();
            let local = process.comm_create(merged, &group).unwrap();
            process.group_free(group).unwrap();
            process.size(local).unwrap()
        });
        assert_eq!(sizes, vec![1, 3, 3, 3]);
    }

    #[test]
    fn finalize_starts_a_new_session() {
        Universe::new(3).run(|process| {
            let world = process.comm_world();
            let self_comm = process.comm_self();
            let dup = process.duplicate(world).unwrap();
            process.finalize().unwrap();

            assert_ne!(process.comm_world(), world);
            assert_ne!(process.comm_self(), self_comm);
            assert_eq!(process.live_comms(), 0);
            assert_eq!(process.size(world).unwrap_err().code(), ERR_COMM);
            assert_eq!(process.size(dup).unwrap_err().code(), ERR_COMM);

            let world = process.comm_world();
            assert_eq!(process.size(world).unwrap(), 3);
            assert_eq!(process.rank(world).unwrap(), process.pid() as Rank);
            assert_eq!(process.size(process.comm_self()).unwrap(), 1);
            process.duplicate(world).unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panic_releases_blocked_peers() {
        Universe::new(2).run(|process| {
            if process.pid() == 1 {
                panic!("boom");
            }
            process.duplicate(process.comm_world()).unwrap();
        });
    }
}
