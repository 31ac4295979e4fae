//! Driver error type and semantic error kinds.
//!
//! Every fallible driver operation reports one of a fixed set of semantic
//! kinds. Validation failures surface to the caller before a request is
//! enqueued; hardware faults latch the driver into an error state and fail
//! subsequent submissions with [`Error::Unavailable`].

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Semantic error kinds reported by the runtime.
///
/// The variants mirror the canonical RPC status space so higher layers can
/// map them without translation tables. Each carries a human-readable
/// message; messages are for diagnostics only and not part of the API
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The caller supplied an argument that can never be valid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is valid in general but not in the current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// An index, offset or size fell outside the valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// A bounded resource (memory, pool slots, address space) is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A named entity (layer, registration) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A named entity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The operation was cancelled, typically by `cancel` or a close.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// The operation could not finish within its declared tolerance.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// The driver (or device) is not in a usable state.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The operation is not implemented by this driver or device variant.
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    /// An invariant inside the runtime was violated.
    #[error("internal: {0}")]
    Internal(String),
    /// An error that fits no other kind.
    #[error("unknown: {0}")]
    Unknown(String),
    /// Data was lost or corrupted in transit.
    #[error("data loss: {0}")]
    DataLoss(String),
}

impl Error {
    /// Creates an [`Error::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates an [`Error::FailedPrecondition`].
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    /// Creates an [`Error::OutOfRange`].
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    /// Creates an [`Error::ResourceExhausted`].
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Creates an [`Error::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates an [`Error::AlreadyExists`].
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Creates an [`Error::Cancelled`].
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Creates an [`Error::DeadlineExceeded`].
    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::DeadlineExceeded(msg.into())
    }

    /// Creates an [`Error::Unavailable`].
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Creates an [`Error::Unimplemented`].
    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Self::Unimplemented(msg.into())
    }

    /// Creates an [`Error::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Creates an [`Error::Unknown`].
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Creates an [`Error::DataLoss`].
    pub fn data_loss(msg: impl Into<String>) -> Self {
        Self::DataLoss(msg.into())
    }

    /// Returns true for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns true for [`Error::DeadlineExceeded`].
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}

/// Folds `update` into `current`, keeping the first failure.
///
/// Mirrors the status-accumulation pattern used when tearing down partially
/// constructed state: every step runs, the first error wins.
pub fn accumulate(current: &mut Result<()>, update: Result<()>) {
    if current.is_ok() {
        *current = update;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::invalid_argument("batch size must be positive");
        assert_eq!(
            err.to_string(),
            "invalid argument: batch size must be positive"
        );
    }

    #[test]
    fn accumulate_keeps_first_failure() {
        let mut status = Ok(());
        accumulate(&mut status, Err(Error::internal("first")));
        accumulate(&mut status, Err(Error::cancelled("second")));
        assert_eq!(status, Err(Error::internal("first")));
    }

    #[test]
    fn accumulate_passes_later_failure_through_ok() {
        let mut status = Ok(());
        accumulate(&mut status, Ok(()));
        accumulate(&mut status, Err(Error::cancelled("late")));
        assert!(status.unwrap_err().is_cancelled());
    }
}
