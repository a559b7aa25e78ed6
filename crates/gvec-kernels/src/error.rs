//! Errors raised by a device while executing a queued operation.

use crate::device::AllocId;

/// Device-side failures.
///
/// These are produced inside enqueued work and travel back to whoever awaits
/// the operation's completion handle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    #[error("allocation {0:?} holds a different element type")]
    TypeMismatch(AllocId),

    #[error("linear-algebra call '{call}' failed: {msg}")]
    Blas { call: &'static str, msg: String },

    #[error("kernel '{kernel}' launch failed: {msg}")]
    Launch { kernel: &'static str, msg: String },

    #[error("random generator error: {0}")]
    Random(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("driver error: {0}")]
    Driver(String),
}

impl DeviceError {
    pub(crate) fn launch(kernel: &'static str, msg: impl Into<String>) -> Self {
        Self::Launch {
            kernel,
            msg: msg.into(),
        }
    }

    pub(crate) fn blas(call: &'static str, msg: impl Into<String>) -> Self {
        Self::Blas {
            call,
            msg: msg.into(),
        }
    }
}
