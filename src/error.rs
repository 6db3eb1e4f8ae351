//! Error taxonomy for the selector core.

use thiserror::Error;

/// Every fallible operation on [`crate::core::Core`] returns one of these.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or nonsensical input: zero tasks, unknown distribution,
    /// an unparsable host-list expression, and the like.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Insufficient memory on a node the job requires.
    #[error("memory busy")]
    MemoryBusy,

    /// No placement satisfying the job's constraints exists in the
    /// candidate bitmap.
    #[error("nodes busy")]
    NodesBusy,

    /// Fewer than the requested number of ports are free.
    #[error("ports busy")]
    PortsBusy,

    /// The port request itself is out of range of the configured table.
    #[error("ports invalid")]
    PortsInvalid,

    /// Allocation accounting underflowed. Logged and clamped to zero by
    /// the caller; surfaced here only for tests that want to assert it
    /// was detected.
    #[error("internal accounting underflow: {0}")]
    InternalUnderflow(String),

    /// Persisted state's header does not match the running plugin.
    /// Restore proceeds as a clean start.
    #[error("persisted state version mismatch")]
    PersistVersionMismatch,

    /// Persisted state failed to unpack.
    #[error("persisted state corrupt: {0}")]
    PersistCorrupt(String),

    /// Filesystem error while reading/writing persisted state.
    #[error("persistence i/o error: {0}")]
    Io(#[from] std::io::Error),
}
