use gvec_kernels::DeviceError;

/// Errors surfaced by vector, mapper and session operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VecError {
    /// The caller broke an operation's preconditions (lengths, aliasing,
    /// divisibility, index range). Raised before anything is enqueued.
    #[error("contract violation: {0}")]
    Contract(String),

    /// A device call failed inside an enqueued operation.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The command queue worker is gone; nothing more can run.
    #[error("command queue closed")]
    QueueClosed,

    #[error("queued operation panicked: {0}")]
    Panicked(String),
}

impl VecError {
    /// Whether the error is a contract violation by the caller, as opposed to
    /// a reported runtime failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VecError::Contract(_))
    }
}

pub type Result<T> = std::result::Result<T, VecError>;

/// Bail out of the enclosing function with a contract violation unless `cond` holds.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::VecError::Contract(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;
