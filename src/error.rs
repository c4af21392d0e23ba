//! Status codes returned to the guest in `RAX` after a hypercall.

use numeric_enum_macro::numeric_enum;

/// Status written back for a hypercall that completed.
pub const STATUS_SUCCESS: u64 = 0;

numeric_enum! {
    #[repr(u64)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Failure codes of the guest-facing hypercall ABI.
    ///
    /// The numeric values are part of the ABI and never change; unused
    /// values in between are reserved.
    pub enum HvError {
        /// A required address was zero or could not be translated.
        TranslateFailure = 5,
        /// A guest-physical page could not be mapped.
        InvalidGuestPhysical = 9,
        /// A guest-virtual page could not be mapped.
        InvalidGuestVirtual = 10,
        /// Authentication failed, the opcode is unknown, an argument is
        /// out of range, or the backend lacks the needed capability.
        InvalidGuestParam = 13,
    }
}

impl HvError {
    pub const fn code(self) -> u64 {
        self as u64
    }
}

pub type HvResult<T = ()> = Result<T, HvError>;

/// Converts a handler result into the value the guest sees in `RAX`.
pub fn status_of<T>(result: &HvResult<T>) -> u64 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(e) => e.code(),
    }
}

/// Evaluates to `Err` with the given [`HvError`], logging the reason at
/// debug level. Use with `return` or `?` to leave early.
macro_rules! hv_err {
    ($err:ident) => {
        Err($crate::error::HvError::$err)
    };
    ($err:ident, $($arg:tt)+) => {{
        debug!("[vmexit] {:?}: {}", $crate::error::HvError::$err, format_args!($($arg)+));
        Err($crate::error::HvError::$err)
    }};
}
