//! Stream-level error kinds

use thiserror::Error;

/// Errors surfaced by session read/write/lifecycle calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A non-blocking call could not proceed right now.
    #[error("operation would block")]
    WouldBlock,

    /// A blocking wait was interrupted; the caller should retry.
    #[error("wait was interrupted")]
    Interrupted,

    /// The session is no longer bound to live hardware.
    #[error("device is gone")]
    DeviceGone,

    /// The hardware channel was reset; reported once, then cleared.
    #[error("endpoint pipe was reset")]
    PipeReset,

    /// A transfer completed with an unexpected status.
    #[error("transfer failed: {0}")]
    Transport(String),

    /// Allocation failed while submitting or probing.
    #[error("out of memory")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, StreamError>;
