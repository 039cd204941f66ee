//! Rank ordering across both groups of an inter-communicator
//!
//! Algorithms that need a total order over the processes of both groups (pairwise exchanges,
//! leader election) merge the inter-communicator once and remember two things: a communicator
//! spanning the local group, and whether the local group comes first in the merged order.
//!
//! # Standard section(s)
//!
//! 6.6.2
use log::debug;

use crate::context::{GroupOrder, LocalGroup};
use crate::error::Result;
use crate::runtime::Runtime;

/// Merge `comm` and derive the local group communicator. Collective over both groups.
///
/// The larger group is placed first; for equal sizes both sides pass the same `high` flag and the
/// runtime's default order applies. Temporary handles are freed before returning. On failure they
/// are left to the runtime, matching the no-rollback behavior of context creation.
pub(crate) fn merge<R: Runtime>(runtime: &R, comm: R::Comm) -> Result<LocalGroup<R::Comm>> {
    let local_size = runtime.size(comm)?;
    let remote_size = runtime.remote_size(comm)?;

    let merged = runtime.intercomm_merge(comm, local_size < remote_size)?;
    let merged_rank = runtime.rank(merged)?;

    let group = runtime.comm_group(comm)?;
    let local = runtime.comm_create(merged, &group)?;
    runtime.group_free(group)?;
    runtime.comm_free(merged)?;

    let order = GroupOrder::from_sizes(local_size, remote_size, merged_rank);
    debug!(
        "merged inter-communicator {:?}: local size {}, remote size {}, merged rank {}, {:?} group",
        comm, local_size, remote_size, merged_rank, order
    );
    Ok(LocalGroup { comm: local, order })
}
