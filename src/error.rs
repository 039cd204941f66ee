//! Error handling and return codes
//!
//! Every fallible operation in this crate is a thin layer over a runtime primitive. When such a
//! primitive fails, its native error code is passed back to the caller unchanged, wrapped in
//! [`Error`].

use std::os::raw::c_int;

use thiserror::Error;

/// Result type of context operations
pub type Result<T> = std::result::Result<T, Error>;

/// A failed runtime call.
///
/// Holds the error code the runtime returned, verbatim. Codes are implementation-specific; use
/// [`Error::code()`] to hand them back to foreign callers or compare against the constants the
/// runtime advertises (e.g. [`Runtime::ERR_INTERN`](crate::Runtime::ERR_INTERN)).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("runtime call failed with error code {code}")]
pub struct Error {
    code: c_int,
}

impl Error {
    /// Wrap a raw, non-success return code.
    pub fn from_code(code: c_int) -> Self {
        debug_assert_ne!(code, 0, "from_code called with success code");
        Error { code }
    }

    /// The native error code as returned by the runtime
    pub fn code(&self) -> c_int {
        self.code
    }

    /// Check a raw return code, where `success` is the runtime's success value.
    pub fn check(code: c_int, success: c_int) -> Result<()> {
        if code == success {
            Ok(())
        } else {
            Err(Error::from_code(code))
        }
    }
}

impl From<Error> for c_int {
    fn from(err: Error) -> c_int {
        err.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_success_through() {
        assert_eq!(Error::check(0, 0), Ok(()));
        assert_eq!(Error::check(17, 0), Err(Error::from_code(17)));
    }

    #[test]
    fn code_is_preserved() {
        let err = Error::from_code(54);
        assert_eq!(err.code(), 54);
        assert_eq!(c_int::from(err), 54);
        assert_eq!(err.to_string(), "runtime call failed with error code 54");
    }
}
