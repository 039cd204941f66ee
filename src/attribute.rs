//! Caching contexts on communicators
//!
//! Contexts are attached to communicators through the runtime's attribute cache under a single
//! keyval shared by all communicators of the process. The keyval is created on first use together
//! with a second, bookkeeping keyval set on the self communicator: when the self communicator is
//! torn down (at finalization) the delete callback of that attribute frees both keyvals, so no
//! keyval outlives the runtime session that created it.
//!
//! # Standard section(s)
//!
//! 6.7
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::context::CommContext;
use crate::error::Result;
use crate::runtime::{AttrValue, ExtraState, Keyval, Runtime};

#[derive(Debug, Default)]
struct KeyvalSlot {
    keyval: Option<Keyval>,
}

type SharedSlot = Mutex<KeyvalSlot>;

/// Process-wide registry of the context keyval.
///
/// Lookups serialize on this registry, which makes keyval creation and context creation
/// first-call-wins even when several threads use the same process.
#[derive(Debug, Default)]
pub struct ContextStore {
    slot: Arc<SharedSlot>,
}

/// Exclusive access to the store, held for the duration of one lookup
pub(crate) struct StoreGuard<'a> {
    shared: &'a Arc<SharedSlot>,
    slot: MutexGuard<'a, KeyvalSlot>,
}

impl ContextStore {
    /// An empty store, no keyval allocated yet
    pub fn new() -> Self {
        Self::default()
    }

    /// The context keyval, if one is currently allocated
    pub fn keyval(&self) -> Option<Keyval> {
        self.slot.lock().expect("context keyval Mutex poisoned").keyval
    }

    pub(crate) fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            shared: &self.slot,
            slot: self.slot.lock().expect("context keyval Mutex poisoned"),
        }
    }
}

impl<'a> StoreGuard<'a> {
    /// The context keyval, creating it (and the self communicator bookkeeping keyval) on first
    /// use.
    pub(crate) fn keyval<R: Runtime>(&mut self, runtime: &R) -> Result<Keyval> {
        if let Some(keyval) = self.slot.keyval {
            return Ok(keyval);
        }

        let keyval = runtime.create_keyval(release::<R>, ptr::null_mut())?;
        let extra = Arc::into_raw(Arc::clone(self.shared)) as ExtraState;
        let self_keyval = match runtime.create_keyval(release::<R>, extra) {
            Ok(k) => k,
            Err(err) => {
                // SAFETY: `extra` came from `Arc::into_raw` above and was not handed out.
                drop(unsafe { Arc::from_raw(extra as *const SharedSlot) });
                free_keyvals(runtime, &[keyval]);
                return Err(err);
            }
        };
        if let Err(err) = runtime.set_attr(runtime.comm_self(), self_keyval, ptr::null_mut()) {
            // SAFETY: no attribute was cached under `self_keyval`, so its delete callback never
            // sees `extra`.
            drop(unsafe { Arc::from_raw(extra as *const SharedSlot) });
            free_keyvals(runtime, &[self_keyval, keyval]);
            return Err(err);
        }

        debug!(
            "allocated context keyval {:?} (teardown keyval {:?})",
            keyval, self_keyval
        );
        self.slot.keyval = Some(keyval);
        Ok(keyval)
    }

    /// The context cached on `comm`, if any
    pub(crate) fn get<R: Runtime>(
        &self,
        runtime: &R,
        comm: R::Comm,
        keyval: Keyval,
    ) -> Result<Option<NonNull<CommContext<R::Comm>>>> {
        Ok(runtime
            .get_attr(comm, keyval)?
            .and_then(|value| NonNull::new(value as *mut CommContext<R::Comm>)))
    }

    /// Cache `context` on `comm`. From here on the runtime owns the context and releases it when
    /// `comm` is freed.
    pub(crate) fn set<R: Runtime>(
        &self,
        runtime: &R,
        comm: R::Comm,
        keyval: Keyval,
        context: Box<CommContext<R::Comm>>,
    ) -> Result<NonNull<CommContext<R::Comm>>> {
        let raw = Box::into_raw(context);
        if let Err(err) = runtime.set_attr(comm, keyval, raw as AttrValue) {
            // SAFETY: the runtime rejected the attribute, so `raw` is still exclusively ours.
            drop(unsafe { Box::from_raw(raw) });
            return Err(err);
        }
        // SAFETY: `Box::into_raw` never returns null.
        Ok(unsafe { NonNull::new_unchecked(raw) })
    }
}

/// Free keyvals of an incomplete setup, logging failures.
fn free_keyvals<R: Runtime>(runtime: &R, keyvals: &[Keyval]) {
    for &keyval in keyvals {
        if let Err(err) = runtime.free_keyval(keyval) {
            warn!("failed to free keyval {:?}: {}", keyval, err);
        }
    }
}

/// Delete callback of both keyvals.
///
/// A null value cached on the self communicator is the bookkeeping attribute: its deletion marks
/// the end of the runtime session and frees both keyvals. Any other value is a context, whose
/// communicators are freed before the context itself. Failures are never reported back, so that
/// freeing the owning communicator cannot fail because of a context.
///
/// # Safety
///
/// `value` must be null or a pointer produced by [`StoreGuard::set()`]; `extra_state` must be
/// null or the registry pointer produced by [`StoreGuard::keyval()`].
pub(crate) unsafe fn release<R: Runtime>(
    runtime: &R,
    comm: R::Comm,
    keyval: Keyval,
    value: AttrValue,
    extra_state: ExtraState,
) -> Result<()> {
    if value.is_null() && comm == runtime.comm_self() {
        if let Err(err) = runtime.free_keyval(keyval) {
            warn!("failed to free teardown keyval {:?}: {}", keyval, err);
        }
        if !extra_state.is_null() {
            let shared = Arc::from_raw(extra_state as *const SharedSlot);
            let context_keyval = shared
                .lock()
                .expect("context keyval Mutex poisoned")
                .keyval
                .take();
            if let Some(context_keyval) = context_keyval {
                if let Err(err) = runtime.free_keyval(context_keyval) {
                    warn!("failed to free context keyval {:?}: {}", context_keyval, err);
                }
            }
            debug!("context keyvals released at self communicator teardown");
        }
    } else if let Some(context) = NonNull::new(value as *mut CommContext<R::Comm>) {
        let context = Box::from_raw(context.as_ptr());
        debug!("releasing context of communicator {:?}", comm);
        (*context).release(runtime);
    }
    Ok(())
}
