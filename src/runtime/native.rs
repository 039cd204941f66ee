//! The MPI library as a context runtime
//!
//! [`MpiRuntime`] forwards every primitive to the MPI library linked through `mpi-sys`. MPI must
//! be initialized before the first call and every context operation must happen before
//! `MPI_Finalize`. Keyvals created here never copy their attributes to duplicates.
//!
//! Delete callbacks of the [`Runtime`] trait are ordinary Rust functions, so they are registered
//! with MPI through one `extern "C"` trampoline and a process-wide table from keyval to callback.
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::RwLock;

use conv::ConvUtil;
use once_cell::sync::Lazy;

use mpi_sys as ffi;

use super::{AttrValue, DeleteFn, ExtraState, Keyval, Runtime};
use crate::error::{Error, Result};
use crate::lookup::ContextManager;
use crate::{Rank, Tag};

/// `MPI_SUCCESS`, as a `c_int` for easier checking of MPI return values
pub const MPI_SUCCESS: c_int = ffi::MPI_SUCCESS as c_int;

macro_rules! build_error_kind {
    {
        $(#[$doc:meta])*
        pub enum $name:ident {
            $(
                 #[$err_doc:meta]
                 #[err($mpi_err:ident)]
                 $rust_err:ident,
            )*
        }
    } => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $(
            #[$err_doc]
            $rust_err,
            )*
        }

        impl $name {
            /// Classify a raw MPI error code, `None` if its class is not listed here.
            pub fn from_raw(code: c_int) -> Option<$name> {
                let mut class: c_int = 0;
                let res = unsafe { ffi::MPI_Error_class(code, &mut class) };
                if res != MPI_SUCCESS {
                    return None;
                }
                $(
                if class == ffi::$mpi_err as c_int {
                    return Some($name::$rust_err);
                }
                )*
                None
            }
        }
    }
}

build_error_kind! {
    /// Error classes context operations can run into.
    ///
    /// # Standard section(s)
    ///
    /// 8.4
    pub enum ErrorKind {
        /// Invalid argument of some other kind
        #[err(MPI_ERR_ARG)]
        Arg,
        /// Invalid communicator argument
        #[err(MPI_ERR_COMM)]
        Comm,
        /// Invalid group argument
        #[err(MPI_ERR_GROUP)]
        Group,
        /// Internal MPI (implementation) error
        #[err(MPI_ERR_INTERN)]
        Intern,
        /// Invalid keyval has been passed
        #[err(MPI_ERR_KEYVAL)]
        Keyval,
        /// Memory exhausted
        #[err(MPI_ERR_NO_MEM)]
        NoMem,
        /// Known error not in this list
        #[err(MPI_ERR_OTHER)]
        Other,
        /// Invalid rank
        #[err(MPI_ERR_RANK)]
        Rank,
        /// Invalid tag argument
        #[err(MPI_ERR_TAG)]
        Tag,
        /// Message truncated
        #[err(MPI_ERR_TRUNCATE)]
        Truncate,
    }
}

impl Error {
    /// The MPI error class of this error, if it is one of the classes listed in [`ErrorKind`]
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_raw(self.code())
    }
}

static DELETE_FNS: Lazy<RwLock<HashMap<c_int, DeleteFn<MpiRuntime>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static CONTEXTS: Lazy<ContextManager<MpiRuntime>> = Lazy::new(|| ContextManager::new(MpiRuntime));

/// The process-wide context manager of the MPI library.
///
/// # Examples
/// See `demos/commctx.rs`
pub fn contexts() -> &'static ContextManager<MpiRuntime> {
    &CONTEXTS
}

fn check(code: c_int) -> Result<()> {
    Error::check(code, MPI_SUCCESS)
}

unsafe extern "C" fn copy_attr_fn(
    _old_comm: ffi::MPI_Comm,
    _keyval: c_int,
    _extra_state: *mut c_void,
    _val_in: *mut c_void,
    _val_out: *mut c_void,
    flag: *mut c_int,
) -> c_int {
    *flag = 0;
    MPI_SUCCESS
}

unsafe extern "C" fn delete_attr_fn(
    comm: ffi::MPI_Comm,
    keyval: c_int,
    value: *mut c_void,
    extra_state: *mut c_void,
) -> c_int {
    let delete = DELETE_FNS
        .read()
        .expect("DELETE_FNS RwLock poisoned")
        .get(&keyval)
        .copied();
    let delete = match delete {
        Some(delete) => delete,
        None => return MPI_SUCCESS,
    };
    match delete(&MpiRuntime, comm, Keyval::from_raw(keyval), value, extra_state) {
        Ok(()) => MPI_SUCCESS,
        Err(err) => err.code(),
    }
}

/// Handle onto the MPI library.
#[derive(Copy, Clone, Debug, Default)]
pub struct MpiRuntime;

impl Runtime for MpiRuntime {
    type Comm = ffi::MPI_Comm;
    type Group = ffi::MPI_Group;

    const ERR_INTERN: c_int = ffi::MPI_ERR_INTERN as c_int;
    const ERR_COMM: c_int = ffi::MPI_ERR_COMM as c_int;

    fn comm_world(&self) -> ffi::MPI_Comm {
        unsafe { ffi::RSMPI_COMM_WORLD }
    }

    fn comm_self(&self) -> ffi::MPI_Comm {
        unsafe { ffi::RSMPI_COMM_SELF }
    }

    fn comm_null(&self) -> ffi::MPI_Comm {
        unsafe { ffi::RSMPI_COMM_NULL }
    }

    fn tag_upper_bound(&self) -> Result<Option<Tag>> {
        let mut value: *mut c_int = ptr::null_mut();
        let mut flag: c_int = 0;
        check(unsafe {
            ffi::MPI_Comm_get_attr(
                ffi::RSMPI_COMM_WORLD,
                ffi::MPI_TAG_UB as c_int,
                &mut value as *mut *mut c_int as *mut c_void,
                &mut flag,
            )
        })?;
        if flag == 0 || value.is_null() {
            Ok(None)
        } else {
            Ok(Some(unsafe { *value }))
        }
    }

    fn create_keyval(&self, delete: DeleteFn<Self>, extra_state: ExtraState) -> Result<Keyval> {
        // Hold the table while MPI hands out the keyval, so no callback for it can run before it
        // is registered.
        let mut delete_fns = DELETE_FNS.write().expect("DELETE_FNS RwLock poisoned");
        let mut keyval: c_int = 0;
        check(unsafe {
            ffi::MPI_Comm_create_keyval(
                Some(copy_attr_fn),
                Some(delete_attr_fn),
                &mut keyval,
                extra_state,
            )
        })?;
        delete_fns.insert(keyval, delete);
        Ok(Keyval::from_raw(keyval))
    }

    fn free_keyval(&self, keyval: Keyval) -> Result<()> {
        // The table entry stays: attributes still cached under the keyval need their callback.
        let mut raw = keyval.as_raw();
        check(unsafe { ffi::MPI_Comm_free_keyval(&mut raw) })
    }

    fn get_attr(&self, comm: ffi::MPI_Comm, keyval: Keyval) -> Result<Option<AttrValue>> {
        let mut value: AttrValue = ptr::null_mut();
        let mut flag: c_int = 0;
        check(unsafe {
            ffi::MPI_Comm_get_attr(
                comm,
                keyval.as_raw(),
                &mut value as *mut AttrValue as *mut c_void,
                &mut flag,
            )
        })?;
        Ok(if flag != 0 { Some(value) } else { None })
    }

    fn set_attr(&self, comm: ffi::MPI_Comm, keyval: Keyval, value: AttrValue) -> Result<()> {
        check(unsafe { ffi::MPI_Comm_set_attr(comm, keyval.as_raw(), value) })
    }

    fn is_inter(&self, comm: ffi::MPI_Comm) -> Result<bool> {
        let mut flag: c_int = 0;
        check(unsafe { ffi::MPI_Comm_test_inter(comm, &mut flag) })?;
        Ok(flag != 0)
    }

    fn size(&self, comm: ffi::MPI_Comm) -> Result<Rank> {
        let mut size: Rank = 0;
        check(unsafe { ffi::MPI_Comm_size(comm, &mut size) })?;
        Ok(size)
    }

    fn remote_size(&self, comm: ffi::MPI_Comm) -> Result<Rank> {
        let mut size: Rank = 0;
        check(unsafe { ffi::MPI_Comm_remote_size(comm, &mut size) })?;
        Ok(size)
    }

    fn rank(&self, comm: ffi::MPI_Comm) -> Result<Rank> {
        let mut rank: Rank = 0;
        check(unsafe { ffi::MPI_Comm_rank(comm, &mut rank) })?;
        Ok(rank)
    }

    fn duplicate(&self, comm: ffi::MPI_Comm) -> Result<ffi::MPI_Comm> {
        let mut dup = self.comm_null();
        check(unsafe { ffi::MPI_Comm_dup(comm, &mut dup) })?;
        Ok(dup)
    }

    fn intercomm_merge(&self, comm: ffi::MPI_Comm, high: bool) -> Result<ffi::MPI_Comm> {
        let mut merged = self.comm_null();
        check(unsafe { ffi::MPI_Intercomm_merge(comm, high as c_int, &mut merged) })?;
        Ok(merged)
    }

    fn comm_group(&self, comm: ffi::MPI_Comm) -> Result<ffi::MPI_Group> {
        let mut group = MaybeUninit::uninit();
        check(unsafe { ffi::MPI_Comm_group(comm, group.as_mut_ptr()) })?;
        Ok(unsafe { group.assume_init() })
    }

    fn comm_create(&self, comm: ffi::MPI_Comm, group: &ffi::MPI_Group) -> Result<ffi::MPI_Comm> {
        let mut created = self.comm_null();
        check(unsafe { ffi::MPI_Comm_create(comm, *group, &mut created) })?;
        Ok(created)
    }

    fn group_free(&self, mut group: ffi::MPI_Group) -> Result<()> {
        check(unsafe { ffi::MPI_Group_free(&mut group) })
    }

    fn comm_free(&self, mut comm: ffi::MPI_Comm) -> Result<()> {
        check(unsafe { ffi::MPI_Comm_free(&mut comm) })
    }

    fn call_errhandler(&self, comm: ffi::MPI_Comm, code: c_int) -> Result<()> {
        check(unsafe { ffi::MPI_Comm_call_errhandler(comm, code) })
    }

    fn send(&self, comm: ffi::MPI_Comm, dest: Rank, tag: Tag, buf: &[u8]) -> Result<()> {
        let count: c_int = buf
            .len()
            .value_as()
            .map_err(|_| Error::from_code(ffi::MPI_ERR_COUNT as c_int))?;
        check(unsafe {
            ffi::MPI_Send(
                buf.as_ptr() as *const c_void,
                count,
                ffi::RSMPI_UINT8_T,
                dest,
                tag,
                comm,
            )
        })
    }

    fn recv(&self, comm: ffi::MPI_Comm, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
        check(unsafe { ffi::MPI_Probe(source, tag, comm, status.as_mut_ptr()) })?;
        let status = unsafe { status.assume_init() };

        let mut count: c_int = 0;
        check(unsafe { ffi::MPI_Get_count(&status, ffi::RSMPI_UINT8_T, &mut count) })?;
        let len: usize = count
            .value_as()
            .map_err(|_| Error::from_code(ffi::MPI_ERR_COUNT as c_int))?;

        let mut buf = vec![0u8; len];
        let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
        check(unsafe {
            ffi::MPI_Recv(
                buf.as_mut_ptr() as *mut c_void,
                count,
                ffi::RSMPI_UINT8_T,
                source,
                tag,
                comm,
                status.as_mut_ptr(),
            )
        })?;
        Ok(buf)
    }
}
