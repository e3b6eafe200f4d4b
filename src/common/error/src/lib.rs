mod error;

pub use error::{ArmadaError, ArmadaResult, ErrorAttributes, GenericError};

/// Builds an [`ArmadaError::InternalError`] from format arguments. Used for
/// invariant violations inside scheduling logic; the controller boundary
/// converts these into an operation failure instead of crashing the process.
#[macro_export]
macro_rules! internal_err {
    ($($arg:tt)*) => {
        $crate::ArmadaError::InternalError(format!($($arg)*))
    };
}

/// Returns early with an [`ArmadaError::InternalError`] when the condition
/// does not hold. The controller-internal replacement for assertion macros.
#[macro_export]
macro_rules! internal_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::internal_err!($($arg)*));
        }
    };
}
