//! State shared by all simulated processes: communicator topologies, pending collectives and
//! message queues.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::mem;
use std::os::raw::c_int;
use std::sync::{Condvar, Mutex, MutexGuard};

use smallvec::SmallVec;

use super::{CommId, ERR_COMM, ERR_OTHER};
use crate::{Rank, Tag};

/// Process ids of a group, in rank order
pub(crate) type Members = SmallVec<[usize; 8]>;

#[derive(Clone, Debug)]
pub(crate) enum Topology {
    Intra(Members),
    Inter(Members, Members),
}

impl Topology {
    pub(crate) fn local_group(&self, pid: usize) -> Option<&Members> {
        match self {
            Topology::Intra(members) => Some(members).filter(|m| m.contains(&pid)),
            Topology::Inter(a, b) => {
                if a.contains(&pid) {
                    Some(a)
                } else if b.contains(&pid) {
                    Some(b)
                } else {
                    None
                }
            }
        }
    }

    pub(crate) fn remote_group(&self, pid: usize) -> Option<&Members> {
        match self {
            Topology::Intra(_) => None,
            Topology::Inter(a, b) => {
                if a.contains(&pid) {
                    Some(b)
                } else if b.contains(&pid) {
                    Some(a)
                } else {
                    None
                }
            }
        }
    }

    /// The group whose ranks address point to point messages from `pid`
    pub(crate) fn peer_group(&self, pid: usize) -> Option<&Members> {
        match self {
            Topology::Intra(_) => self.local_group(pid),
            Topology::Inter(..) => self.remote_group(pid),
        }
    }

    fn participants(&self) -> usize {
        match self {
            Topology::Intra(members) => members.len(),
            Topology::Inter(a, b) => a.len() + b.len(),
        }
    }
}

/// What a process brings to a collective call
#[derive(Clone, Debug)]
pub(crate) enum Contribution {
    Unit,
    High(bool),
    Group(Members),
}

/// Result of a collective call, identical for all participants
#[derive(Clone, Debug)]
pub(crate) enum Outcome {
    Comm(CommId),
    Comms(Vec<(Members, CommId)>),
    Failed(c_int),
}

#[derive(Debug)]
struct Rendezvous {
    contributions: BTreeMap<usize, Contribution>,
    outcome: Option<Outcome>,
    unclaimed: usize,
}

#[derive(Debug)]
struct Envelope {
    source: Rank,
    tag: Tag,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct WorldState {
    comms: HashMap<CommId, Topology>,
    next_comm: u32,
    rendezvous: HashMap<(CommId, u64), Rendezvous>,
    mailboxes: HashMap<(CommId, usize), VecDeque<Envelope>>,
    aborted: Option<usize>,
}

impl WorldState {
    /// Register a new communicator and return its handle.
    pub(crate) fn register(&mut self, topology: Topology) -> CommId {
        let id = CommId(self.next_comm);
        self.next_comm += 1;
        self.comms.insert(id, topology);
        id
    }
}

#[derive(Debug)]
pub(crate) struct World {
    pub(crate) size: usize,
    pub(crate) tag_ub: Option<Tag>,
    state: Mutex<WorldState>,
    changed: Condvar,
}

impl World {
    /// A world of `size` processes with the world communicator and one self communicator per
    /// process already registered.
    pub(crate) fn new(size: usize, tag_ub: Option<Tag>) -> World {
        let mut state = WorldState::default();
        state.register(Topology::Intra((0..size).collect()));
        for pid in 0..size {
            state.register(Topology::Intra(SmallVec::from_elem(pid, 1)));
        }
        World {
            size,
            tag_ub,
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().expect("simulated world Mutex poisoned")
    }

    fn wait<'a>(&self, state: MutexGuard<'a, WorldState>) -> MutexGuard<'a, WorldState> {
        self.changed
            .wait(state)
            .expect("simulated world Mutex poisoned")
    }

    pub(crate) fn topology(&self, comm: CommId) -> Option<Topology> {
        self.lock().comms.get(&comm).cloned()
    }

    /// Record that process `pid` died, waking up everybody blocked on it.
    pub(crate) fn abort(&self, pid: usize) {
        let mut state = self.lock();
        state.aborted.get_or_insert(pid);
        self.changed.notify_all();
    }

    pub(crate) fn aborted_by(&self) -> Option<usize> {
        self.lock().aborted
    }

    /// Join the `seq`-th collective call on `comm`.
    ///
    /// Blocks until every participant has contributed. The last one to arrive computes the outcome
    /// with `finish`, everybody returns a copy of it.
    pub(crate) fn collective<F>(
        &self,
        comm: CommId,
        seq: u64,
        pid: usize,
        contribution: Contribution,
        finish: F,
    ) -> Result<Outcome, c_int>
    where
        F: FnOnce(&mut WorldState, &Topology, BTreeMap<usize, Contribution>) -> Outcome,
    {
        let mut state = self.lock();
        let topology = state.comms.get(&comm).cloned().ok_or(ERR_COMM)?;
        let participants = topology.participants();
        let key = (comm, seq);

        let entry = state.rendezvous.entry(key).or_insert_with(|| Rendezvous {
            contributions: BTreeMap::new(),
            outcome: None,
            unclaimed: participants,
        });
        entry.contributions.insert(pid, contribution);
        if entry.contributions.len() == participants {
            let contributions = mem::take(&mut entry.contributions);
            let outcome = finish(&mut state, &topology, contributions);
            if let Some(entry) = state.rendezvous.get_mut(&key) {
                entry.outcome = Some(outcome);
            }
            self.changed.notify_all();
        }

        loop {
            if state.aborted.is_some() {
                return Err(ERR_OTHER);
            }
            if let Some(entry) = state.rendezvous.get_mut(&key) {
                if let Some(outcome) = entry.outcome.clone() {
                    entry.unclaimed -= 1;
                    if entry.unclaimed == 0 {
                        state.rendezvous.remove(&key);
                    }
                    return Ok(outcome);
                }
            }
            state = self.wait(state);
        }
    }

    /// Queue a message for process `dest` on `comm`.
    pub(crate) fn post(&self, comm: CommId, dest: usize, source: Rank, tag: Tag, data: Vec<u8>) {
        let mut state = self.lock();
        state
            .mailboxes
            .entry((comm, dest))
            .or_default()
            .push_back(Envelope { source, tag, data });
        self.changed.notify_all();
    }

    /// Wait for the first message to process `pid` on `comm` from `source` with `tag`.
    pub(crate) fn take(
        &self,
        comm: CommId,
        pid: usize,
        source: Rank,
        tag: Tag,
    ) -> Result<Vec<u8>, c_int> {
        let mut state = self.lock();
        loop {
            if state.aborted.is_some() {
                return Err(ERR_OTHER);
            }
            if let Some(queue) = state.mailboxes.get_mut(&(comm, pid)) {
                let position = queue
                    .iter()
                    .position(|envelope| envelope.source == source && envelope.tag == tag);
                if let Some(envelope) = position.and_then(|i| queue.remove(i)) {
                    return Ok(envelope.data);
                }
            }
            state = self.wait(state);
        }
    }
}
