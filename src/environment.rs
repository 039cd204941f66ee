//! Environmental inquiry
//!
//! The only environmental attribute contexts depend on is `MPI_TAG_UB`, the largest tag value the
//! runtime guarantees to support. It is read once per process and cached for good.
//!
//! # Standard section(s)
//!
//! 8.1.2
use log::debug;
use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::runtime::Runtime;
use crate::Tag;

/// Tag upper bound assumed when the runtime does not advertise one. The standard requires
/// `MPI_TAG_UB` to be at least this value.
pub const DEFAULT_TAG_BOUND: Tag = 32767;

/// Lazily resolved, immutable tag upper bound.
#[derive(Debug, Default)]
pub struct TagBound(OnceCell<Tag>);

impl TagBound {
    /// An unresolved tag bound
    pub const fn new() -> Self {
        TagBound(OnceCell::new())
    }

    /// The tag upper bound, querying `runtime` on first use.
    ///
    /// A missing `MPI_TAG_UB` resolves to [`DEFAULT_TAG_BOUND`]; an advertised value is taken as
    /// is, even one below the guaranteed minimum. If the query itself fails, nothing is cached
    /// and the error is returned; the next call queries again.
    pub fn resolve<R: Runtime>(&self, runtime: &R) -> Result<Tag> {
        self.0
            .get_or_try_init(|| {
                let bound = runtime.tag_upper_bound()?.unwrap_or(DEFAULT_TAG_BOUND);
                debug!("resolved tag upper bound {}", bound);
                Ok(bound)
            })
            .copied()
    }

    /// The cached tag upper bound, if it has been resolved
    pub fn get(&self) -> Option<Tag> {
        self.0.get().copied()
    }
}
