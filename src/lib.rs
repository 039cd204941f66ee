//! Private communication contexts for libraries built on the Message Passing Interface
//!
//! A library that exchanges messages on a communicator handed to it by the application must not
//! interfere with the application's own traffic on that communicator. The usual remedy is to
//! duplicate the communicator once and keep the duplicate alongside the original. This crate
//! does exactly that, caching the duplicate as an attribute of the user communicator so that it
//! lives exactly as long as the user communicator does:
//!
//! - [`ContextManager::lookup()`] returns the private duplicate of a communicator (creating it on
//!   first use) together with a fresh tag from a per-communicator counter,
//! - [`ContextManager::lookup_inter()`] additionally merges an inter-communicator once and
//!   returns a communicator spanning the local group plus the position of the local group in the
//!   merged order,
//! - freeing the user communicator frees everything derived from it, and finalizing the runtime
//!   frees the attribute keys.
//!
//! # Usage
//!
//! Add the `mpi-commctx` crate as a dependency in your `Cargo.toml`, with the `native` feature to
//! run on the MPI library:
//!
//! ```toml
//! [dependencies]
//! mpi-commctx = { version = "0.1.0", features = ["native"] }
//! ```
//!
//! Then use it in your program like this:
//!
//! ```no_run
//! # #[cfg(feature = "native")]
//! # fn main() {
//! use mpi_commctx::native::contexts;
//! use mpi_commctx::traits::*;
//!
//! let contexts = contexts();
//! let world = contexts.runtime().comm_world();
//! let ctx = contexts.lookup(world).unwrap();
//! println!("internal traffic goes to {:?} with tag {}", ctx.comm, ctx.tag);
//! # }
//! # #[cfg(not(feature = "native"))]
//! # fn main() {}
//! ```
//!
//! # Runtimes
//!
//! Everything in this crate is generic over [`traits::Runtime`], the handful of primitives the
//! context layer needs from its host:
//!
//! - [`native::MpiRuntime`] (feature `native`) calls into the MPI library through `mpi-sys`,
//! - [`sim::Process`] is one process of an in-process simulated universe, used for testing.
//!
//! # Concurrency
//!
//! Lookups on one [`ContextManager`] are serialized. Like every collective operation, the first
//! lookup of a communicator must be performed by all of its processes, in the same order relative
//! to their other collective calls on it.

use std::os::raw::c_int;

mod attribute;
mod context;
pub mod environment;
pub mod error;
mod intercomm;
mod lookup;
pub mod runtime;
pub mod sim;
pub mod sync;

#[cfg(feature = "native")]
pub use runtime::native;

pub use attribute::ContextStore;
pub use context::GroupOrder;
pub use error::{Error, Result};
pub use lookup::{ContextManager, InterContext, IntraContext};
pub use runtime::Runtime;

/// Re-exports all traits.
pub mod traits {
    pub use crate::runtime::Runtime;
}

/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = c_int;
/// Identifies a process in a communicator (or in a group of an inter-communicator).
pub type Rank = c_int;
