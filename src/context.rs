//! The per-communicator context object
//!
//! A context is cached on a user communicator and owns the communicators derived from it: a
//! private duplicate for internal traffic and, for inter-communicators, a communicator spanning the
//! local group inside the merged rank order. It also carries the tag counter for the duplicate.
use std::alloc::Layout;
use std::fmt::Debug;

use log::warn;

use crate::runtime::Runtime;
use crate::{Rank, Tag};

/// Position of the local group in the merged rank order of an inter-communicator.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GroupOrder {
    /// The local group holds the lower block of merged ranks.
    Low,
    /// The local group holds the upper block of merged ranks.
    High,
}

impl GroupOrder {
    /// Decide the position of the local group.
    ///
    /// The larger group is merged first and is therefore low. For groups of equal size the
    /// runtime picks the order, which every process can read off its own merged rank: the
    /// processes of the first group have merged ranks below the group size.
    pub fn from_sizes(local_size: Rank, remote_size: Rank, merged_rank: Rank) -> GroupOrder {
        if local_size > remote_size {
            GroupOrder::Low
        } else if local_size < remote_size {
            GroupOrder::High
        } else if merged_rank < local_size {
            GroupOrder::Low
        } else {
            GroupOrder::High
        }
    }

    /// Whether the local group is the low group
    pub fn is_low(self) -> bool {
        self == GroupOrder::Low
    }
}

/// Merge products kept by an inter-communicator context
#[derive(Debug)]
pub(crate) struct LocalGroup<C> {
    pub(crate) comm: C,
    pub(crate) order: GroupOrder,
}

#[derive(Debug)]
pub(crate) enum ContextKind<C> {
    Intra,
    Inter(Option<LocalGroup<C>>),
}

/// The object cached on a communicator.
#[derive(Debug)]
pub(crate) struct CommContext<C> {
    pub(crate) duplicate: Option<C>,
    tag_bound: Tag,
    next_tag: Tag,
    pub(crate) kind: ContextKind<C>,
}

impl<C: Copy + Debug> CommContext<C> {
    pub(crate) fn new(tag_bound: Tag, inter: bool) -> Self {
        CommContext {
            duplicate: None,
            tag_bound,
            next_tag: 0,
            kind: if inter {
                ContextKind::Inter(None)
            } else {
                ContextKind::Intra
            },
        }
    }

    /// Heap-allocate a context through `runtime` without aborting on allocation failure.
    pub(crate) fn try_boxed<R: Runtime>(
        runtime: &R,
        tag_bound: Tag,
        inter: bool,
    ) -> Option<Box<Self>> {
        let layout = Layout::new::<Self>();
        // SAFETY: `Self` is not zero-sized, and `allocate` hands out global allocator memory with
        // the layout of `Self`, which may be initialized and turned into a `Box<Self>`.
        unsafe {
            let ptr = runtime.allocate(layout)?.as_ptr() as *mut Self;
            ptr.write(Self::new(tag_bound, inter));
            Some(Box::from_raw(ptr))
        }
    }

    /// Hand out the next tag. The counter wraps to zero before it is read, so a tag is always
    /// below the bound.
    pub(crate) fn allocate_tag(&mut self) -> Tag {
        if self.next_tag >= self.tag_bound {
            self.next_tag = 0;
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    pub(crate) fn local_group(&self) -> Option<&LocalGroup<C>> {
        match self.kind {
            ContextKind::Inter(Some(ref local)) => Some(local),
            _ => None,
        }
    }

    /// Free the communicators owned by this context. Failures are logged and otherwise ignored so
    /// that freeing the parent communicator always succeeds.
    pub(crate) fn release<R: Runtime<Comm = C>>(self, runtime: &R) {
        if let ContextKind::Inter(Some(local)) = self.kind {
            if let Err(err) = runtime.comm_free(local.comm) {
                warn!("failed to free local group communicator {:?}: {}", local.comm, err);
            }
        }
        if let Some(dup) = self.duplicate {
            if let Err(err) = runtime.comm_free(dup) {
                warn!("failed to free duplicate communicator {:?}: {}", dup, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CommId, Primitive, Universe, ERR_INTERN};

    #[test]
    fn tags_cycle_below_bound() {
        let mut ctx = CommContext::<u32>::new(3, false);
        let tags: Vec<Tag> = (0..7).map(|_| ctx.allocate_tag()).collect();
        assert_eq!(tags, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn boxed_context_starts_empty() {
        Universe::new(1).run(|process| {
            let ctx = CommContext::<CommId>::try_boxed(&process, 32767, true).unwrap();
            assert!(ctx.duplicate.is_none());
            assert!(ctx.local_group().is_none());
            assert!(matches!(ctx.kind, ContextKind::Inter(None)));
        });
    }

    #[test]
    fn boxing_reports_allocation_failure() {
        Universe::new(1).run(|process| {
            process.fail_next(Primitive::Allocate, ERR_INTERN);
            assert!(CommContext::<CommId>::try_boxed(&process, 32767, false).is_none());
            assert!(CommContext::<CommId>::try_boxed(&process, 32767, false).is_some());
        });
    }

    #[test]
    fn release_survives_failed_free() {
        Universe::new(1).run(|process| {
            let mut ctx = CommContext::new(32767, false);
            let dup = process.duplicate(process.comm_world()).unwrap();
            ctx.duplicate = Some(dup);

            process.fail_next(Primitive::CommFree, ERR_INTERN);
            ctx.release(&process);
            assert_eq!(process.live_comms(), 1);
            process.comm_free(dup).unwrap();
            assert_eq!(process.live_comms(), 0);
        });
    }

    #[test]
    fn larger_group_is_low() {
        assert_eq!(GroupOrder::from_sizes(5, 3, 0), GroupOrder::Low);
        assert_eq!(GroupOrder::from_sizes(5, 3, 7), GroupOrder::Low);
        assert_eq!(GroupOrder::from_sizes(3, 5, 0), GroupOrder::High);
        assert_eq!(GroupOrder::from_sizes(3, 5, 7), GroupOrder::High);
    }

    #[test]
    fn equal_groups_split_on_merged_rank() {
        assert!(GroupOrder::from_sizes(4, 4, 0).is_low());
        assert!(GroupOrder::from_sizes(4, 4, 3).is_low());
        assert!(!GroupOrder::from_sizes(4, 4, 4).is_low());
        assert!(!GroupOrder::from_sizes(4, 4, 7).is_low());
    }
}
