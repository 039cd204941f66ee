//! The message passing runtime seen from the context layer
//!
//! Contexts are built from two collaborators the runtime already provides: a per-communicator
//! attribute cache with destructor callbacks (MPI 3.1, section 6.7) and the communicator
//! constructors of section 6.4 and 6.6. The [`Runtime`] trait collects exactly those primitives,
//! plus blocking point to point transfer of byte buffers for the internal messaging helpers.
//!
//! Two implementations ship with this crate:
//!
//! - [`native::MpiRuntime`], a zero-sized handle onto the MPI library linked through `mpi-sys`
//!   (requires the `native` feature),
//! - [`sim::Process`](crate::sim::Process), a thread-backed in-process runtime used for testing.
use std::alloc::{self, Layout};
use std::fmt::Debug;
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;

use crate::error::Result;
use crate::{Rank, Tag};

#[cfg(feature = "native")]
pub mod native;

/// Identifies one attribute slot in the per-communicator attribute cache.
///
/// # Standard section(s)
///
/// 6.7.2
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Keyval(c_int);

impl Keyval {
    /// Wrap a raw keyval obtained from the runtime.
    pub fn from_raw(raw: c_int) -> Self {
        Keyval(raw)
    }

    /// The raw keyval value
    pub fn as_raw(&self) -> c_int {
        self.0
    }
}

/// Untyped attribute value, as stored in the attribute cache
pub type AttrValue = *mut c_void;

/// State registered together with a keyval and handed back to its delete callback
pub type ExtraState = *mut c_void;

/// Callback run by the runtime when an attribute is deleted from a communicator, which happens
/// when the communicator is freed (or, for the self communicator, at finalization).
///
/// # Safety
///
/// `value` and `extra_state` are whatever was stored with [`Runtime::set_attr()`] and
/// [`Runtime::create_keyval()`]; the callback is responsible for interpreting them correctly.
pub type DeleteFn<R> =
    unsafe fn(&R, <R as Runtime>::Comm, Keyval, AttrValue, ExtraState) -> Result<()>;

/// Primitives of the host message passing runtime needed to manage communicator contexts.
///
/// All methods report failure with the runtime's native error code. Methods marked as collective
/// must be called by every process of the communicator, in the same order.
pub trait Runtime: Sized {
    /// A communicator handle
    type Comm: Copy + Eq + Debug;
    /// A process group handle
    type Group;

    /// Error class code for internal errors (`MPI_ERR_INTERN`)
    const ERR_INTERN: c_int;
    /// Error class code for invalid communicators (`MPI_ERR_COMM`)
    const ERR_COMM: c_int;

    /// The world communicator
    fn comm_world(&self) -> Self::Comm;

    /// The self communicator, containing only the calling process
    fn comm_self(&self) -> Self::Comm;

    /// The null communicator handle
    fn comm_null(&self) -> Self::Comm;

    /// Value of the `MPI_TAG_UB` attribute of the world communicator, `None` if the runtime does
    /// not provide it.
    ///
    /// # Standard section(s)
    ///
    /// 8.1.2
    fn tag_upper_bound(&self) -> Result<Option<Tag>>;

    /// Create a new attribute key. Attributes stored under it are not copied to duplicates and are
    /// released by `delete` when their communicator goes away.
    ///
    /// # Standard section(s)
    ///
    /// 6.7.2
    fn create_keyval(&self, delete: DeleteFn<Self>, extra_state: ExtraState) -> Result<Keyval>;

    /// Free an attribute key. Attributes still cached under it remain valid and are released
    /// normally.
    fn free_keyval(&self, keyval: Keyval) -> Result<()>;

    /// Retrieve the attribute cached under `keyval`, if any.
    fn get_attr(&self, comm: Self::Comm, keyval: Keyval) -> Result<Option<AttrValue>>;

    /// Cache `value` on `comm` under `keyval`.
    fn set_attr(&self, comm: Self::Comm, keyval: Keyval, value: AttrValue) -> Result<()>;

    /// Whether `comm` is an inter-communicator
    ///
    /// # Standard section(s)
    ///
    /// 6.6.1
    fn is_inter(&self, comm: Self::Comm) -> Result<bool>;

    /// Number of processes in the (local group of the) communicator
    fn size(&self, comm: Self::Comm) -> Result<Rank>;

    /// Number of processes in the remote group of an inter-communicator
    fn remote_size(&self, comm: Self::Comm) -> Result<Rank>;

    /// Rank of the calling process in the (local group of the) communicator
    fn rank(&self, comm: Self::Comm) -> Result<Rank>;

    /// Duplicate a communicator. Collective.
    ///
    /// # Standard section(s)
    ///
    /// 6.4.2
    fn duplicate(&self, comm: Self::Comm) -> Result<Self::Comm>;

    /// Merge both groups of an inter-communicator into an intra-communicator. The group passing
    /// `high = true` is ordered after the other one; if both pass the same value the order is
    /// chosen by the runtime. Collective over both groups.
    ///
    /// # Standard section(s)
    ///
    /// 6.6.2
    fn intercomm_merge(&self, comm: Self::Comm, high: bool) -> Result<Self::Comm>;

    /// The (local) group of a communicator
    fn comm_group(&self, comm: Self::Comm) -> Result<Self::Group>;

    /// Create a communicator from a subgroup of an intra-communicator. Processes may pass
    /// different, disjoint groups; processes outside of their group receive the null handle.
    /// Collective.
    ///
    /// # Standard section(s)
    ///
    /// 6.4.2
    fn comm_create(&self, comm: Self::Comm, group: &Self::Group) -> Result<Self::Comm>;

    /// Release a group handle.
    fn group_free(&self, group: Self::Group) -> Result<()>;

    /// Release a communicator handle, running the delete callbacks of its attributes.
    fn comm_free(&self, comm: Self::Comm) -> Result<()>;

    /// Allocate memory for a context object, `None` if memory is exhausted.
    ///
    /// # Safety
    ///
    /// `layout` must have a non-zero size. Implementations must return memory obtained from the
    /// global allocator with `layout`, since it is released as a `Box`.
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        NonNull::new(alloc::alloc(layout))
    }

    /// Invoke the error handler attached to `comm` with `code`.
    fn call_errhandler(&self, comm: Self::Comm, code: c_int) -> Result<()>;

    /// Blocking standard mode send of a byte buffer. On inter-communicators `dest` is a rank of
    /// the remote group.
    fn send(&self, comm: Self::Comm, dest: Rank, tag: Tag, buf: &[u8]) -> Result<()>;

    /// Blocking receive of a byte buffer from `source` with a matching `tag`.
    fn recv(&self, comm: Self::Comm, source: Rank, tag: Tag) -> Result<Vec<u8>>;
}
