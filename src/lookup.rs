//! Looking up and creating communicator contexts
//!
//! [`ContextManager`] is the entry point of the crate. It owns the process-wide state (tag upper
//! bound and context keyval) and implements the lookup protocol:
//!
//! 1. obtain the context keyval, creating it on the very first lookup,
//! 2. return the context cached on the communicator, or
//! 3. create one: cache a fresh context on the communicator first, then duplicate the
//!    communicator into it (collective),
//! 4. hand out the next tag of the context.
//!
//! Caching before duplicating ties the context to the communicator's lifetime even if the
//! duplication does not complete. A failed duplication is not rolled back: later lookups find the
//! partial context, whose duplicate is the null communicator.
//!
//! Every process of a communicator must perform its lookups on it in the same order; a process
//! that skips one leaves its peers blocked in the duplication or merge.
use log::{debug, trace};

use crate::attribute::ContextStore;
use crate::context::{CommContext, ContextKind, GroupOrder};
use crate::environment::TagBound;
use crate::error::{Error, Result};
use crate::intercomm;
use crate::runtime::Runtime;
use crate::Tag;

/// Internal context of an intra-communicator (or the point to point part of an
/// inter-communicator).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IntraContext<C> {
    /// Private duplicate of the user communicator
    pub comm: C,
    /// Tag allocated to this lookup
    pub tag: Tag,
}

/// Internal context of an inter-communicator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InterContext<C> {
    /// Private duplicate of the user inter-communicator
    pub comm: C,
    /// Tag allocated to this lookup
    pub tag: Tag,
    /// Intra-communicator spanning the local group, in local group rank order
    pub local_comm: C,
    /// Position of the local group in the merged rank order
    pub order: GroupOrder,
}

/// Process-wide context state over a runtime.
///
/// One manager exists per process and runtime session. All state it owns is initialized lazily:
/// the tag upper bound on the first context creation, the keyval on the first lookup.
#[derive(Debug)]
pub struct ContextManager<R: Runtime> {
    runtime: R,
    tag_bound: TagBound,
    store: ContextStore,
}

impl<R: Runtime> ContextManager<R> {
    /// A manager with no state resolved yet
    pub fn new(runtime: R) -> Self {
        ContextManager {
            runtime,
            tag_bound: TagBound::new(),
            store: ContextStore::new(),
        }
    }

    /// The underlying runtime
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// The tag upper bound, resolving it on first use
    pub fn tag_bound(&self) -> Result<Tag> {
        self.tag_bound.resolve(&self.runtime)
    }

    /// The context keyval registry
    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Look up the context of `comm` and allocate a tag from it.
    ///
    /// On the first lookup of `comm` this duplicates it, which is collective over `comm`.
    /// Works on inter-communicators too, without merging them.
    pub fn lookup(&self, comm: R::Comm) -> Result<IntraContext<R::Comm>> {
        self.with_context(comm, |ctx| {
            let tag = ctx.allocate_tag();
            trace!("allocated tag {} on communicator {:?}", tag, comm);
            Ok(IntraContext {
                comm: ctx.duplicate.unwrap_or_else(|| self.runtime.comm_null()),
                tag,
            })
        })
    }

    /// Look up the context of the inter-communicator `comm`, merging it on first use, and
    /// allocate a tag from it.
    ///
    /// The first lookup duplicates `comm` and the first `lookup_inter()` merges it; both are
    /// collective over both groups. Fails with `ERR_COMM` if `comm` is an intra-communicator.
    pub fn lookup_inter(&self, comm: R::Comm) -> Result<InterContext<R::Comm>> {
        self.with_context(comm, |ctx| {
            match ctx.kind {
                ContextKind::Intra => return Err(Error::from_code(R::ERR_COMM)),
                ContextKind::Inter(None) => {
                    let local = intercomm::merge(&self.runtime, comm)?;
                    ctx.kind = ContextKind::Inter(Some(local));
                }
                ContextKind::Inter(Some(_)) => {}
            }
            let (local_comm, order) = match ctx.local_group() {
                Some(local) => (local.comm, local.order),
                None => return Err(Error::from_code(R::ERR_INTERN)),
            };
            let tag = ctx.allocate_tag();
            trace!("allocated tag {} on inter-communicator {:?}", tag, comm);
            Ok(InterContext {
                comm: ctx.duplicate.unwrap_or_else(|| self.runtime.comm_null()),
                tag,
                local_comm,
                order,
            })
        })
    }

    fn with_context<T, F>(&self, comm: R::Comm, f: F) -> Result<T>
    where
        F: FnOnce(&mut CommContext<R::Comm>) -> Result<T>,
    {
        let mut store = self.store.lock();
        let keyval = store.keyval(&self.runtime)?;

        let ctx = match store.get(&self.runtime, comm, keyval)? {
            Some(ctx) => ctx,
            None => {
                let tag_bound = self.tag_bound()?;
                let inter = self.runtime.is_inter(comm)?;
                let ctx = match CommContext::try_boxed(&self.runtime, tag_bound, inter) {
                    Some(ctx) => ctx,
                    None => {
                        let _ = self.runtime.call_errhandler(comm, R::ERR_INTERN);
                        return Err(Error::from_code(R::ERR_INTERN));
                    }
                };
                let ctx = store.set(&self.runtime, comm, keyval, ctx)?;
                let dup = self.runtime.duplicate(comm)?;
                // SAFETY: the context was cached above and the store lock is still held.
                unsafe { (*ctx.as_ptr()).duplicate = Some(dup) };
                debug!(
                    "created context for {} communicator {:?}: duplicate {:?}, tag bound {}",
                    if inter { "inter" } else { "intra" },
                    comm,
                    dup,
                    tag_bound
                );
                ctx
            }
        };

        // SAFETY: the context stays cached until `comm` is freed, and all access to cached
        // contexts goes through the store lock held here.
        f(unsafe { &mut *ctx.as_ptr() })
    }
}
