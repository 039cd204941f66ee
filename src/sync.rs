//! Synchronization built on internal contexts
//!
//! The helpers in this module exchange messages on the private communicators of a context, under
//! tags allocated from it, so they never match messages the application sends on the original
//! communicator.
use log::trace;

use crate::error::{Error, Result};
use crate::lookup::ContextManager;
use crate::runtime::Runtime;
use crate::{Rank, Tag};

/// Serializes a section of code over the processes of an intra-communicator, in rank order.
///
/// Rank `r` enters the section once rank `r - 1` has left it.
///
/// # Examples
///
/// ```
/// use mpi_commctx::sim::Universe;
/// use mpi_commctx::sync::Sequential;
/// use mpi_commctx::traits::*;
/// use mpi_commctx::ContextManager;
///
/// Universe::new(3).run(|process| {
///     let contexts = ContextManager::new(process);
///     let world = contexts.runtime().comm_world();
///     let sequential = Sequential::new(&contexts, world).unwrap();
///     sequential.run(|| println!("my turn")).unwrap();
/// });
/// ```
pub struct Sequential<'a, R: Runtime> {
    runtime: &'a R,
    comm: R::Comm,
    tag: Tag,
    rank: Rank,
    size: Rank,
}

impl<'a, R: Runtime> Sequential<'a, R> {
    /// Prepare sequential sections over `comm`. Collective over `comm` the first time `comm` is
    /// used with `contexts`. Fails with `ERR_COMM` on an inter-communicator.
    pub fn new(contexts: &'a ContextManager<R>, comm: R::Comm) -> Result<Self> {
        let runtime = contexts.runtime();
        if runtime.is_inter(comm)? {
            return Err(Error::from_code(R::ERR_COMM));
        }
        let ctx = contexts.lookup(comm)?;
        Ok(Sequential {
            runtime,
            comm: ctx.comm,
            tag: ctx.tag,
            rank: runtime.rank(comm)?,
            size: runtime.size(comm)?,
        })
    }

    /// Wait for the previous rank to leave the section.
    pub fn begin(&self) -> Result<()> {
        if self.rank > 0 {
            self.runtime.recv(self.comm, self.rank - 1, self.tag)?;
            trace!("rank {} entering sequential section", self.rank);
        }
        Ok(())
    }

    /// Let the next rank enter the section.
    pub fn end(&self) -> Result<()> {
        if self.rank + 1 < self.size {
            self.runtime.send(self.comm, self.rank + 1, self.tag, &[])?;
        }
        Ok(())
    }

    /// Run `f` inside a sequential section.
    pub fn run<T, F: FnOnce() -> T>(&self, f: F) -> Result<T> {
        self.begin()?;
        let value = f();
        self.end()?;
        Ok(value)
    }
}

/// Block until every process of `comm` has entered the barrier.
///
/// On an intra-communicator this runs a dissemination barrier on the private duplicate. On an
/// inter-communicator it returns once all processes of both groups have entered: each group
/// synchronizes locally, the two group leaders exchange a token (the low group sends first) and
/// each group synchronizes locally again. Collective over `comm`.
pub fn barrier<R: Runtime>(contexts: &ContextManager<R>, comm: R::Comm) -> Result<()> {
    let runtime = contexts.runtime();
    if !runtime.is_inter(comm)? {
        let ctx = contexts.lookup(comm)?;
        return dissemination(runtime, ctx.comm, ctx.tag);
    }

    let ctx = contexts.lookup_inter(comm)?;
    dissemination(runtime, ctx.local_comm, ctx.tag)?;
    if runtime.rank(ctx.local_comm)? == 0 {
        if ctx.order.is_low() {
            runtime.send(ctx.comm, 0, ctx.tag, &[])?;
            runtime.recv(ctx.comm, 0, ctx.tag)?;
        } else {
            runtime.recv(ctx.comm, 0, ctx.tag)?;
            runtime.send(ctx.comm, 0, ctx.tag, &[])?;
        }
    }
    dissemination(runtime, ctx.local_comm, ctx.tag)
}

fn dissemination<R: Runtime>(runtime: &R, comm: R::Comm, tag: Tag) -> Result<()> {
    let size = runtime.size(comm)?;
    let rank = runtime.rank(comm)?;
    let mut distance = 1;
    while distance < size {
        runtime.send(comm, (rank + distance) % size, tag, &[])?;
        runtime.recv(comm, (rank + size - distance) % size, tag)?;
        distance *= 2;
    }
    Ok(())
}
