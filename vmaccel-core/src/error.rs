//! The error taxonomy from spec.md §7, expressed as distinct `thiserror`
//! variants (not distinct types -- every public entry point in this crate
//! returns `Result<T, CoreError>`).

use thiserror::Error;
use vmt::StatusCode;

/// Errors surfaced by the allocator and compute-context layers.
///
/// `to_status_code` is the seam `vmaccel-rpc` uses to marshal this into the
/// wire-level status union (spec.md §6, §7).
#[derive(Debug, Error)]
pub enum CoreError {
    /// ID space or descriptor capacity exhausted.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// The request does not fit in any registered/free extent right now;
    /// the caller should retry.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(&'static str),

    /// A generation or consistency mismatch was detected.
    #[error("semantic error: {0}")]
    SemanticError(&'static str),

    /// A referenced id does not name a live object.
    #[error("invalid id: {0}")]
    InvalidId(&'static str),

    /// `Unregister` called while `refcount != 0`, or similar state
    /// preconditions that fail without leaving the system corrupted.
    #[error("operation failed: {0}")]
    Fail(&'static str),

    /// A wait on a device-side fence exceeded its deadline.
    #[error("timed out waiting on fence")]
    Timeout,

    /// Propagated verbatim from the `Backend` trait.
    #[error("backend error: {0}")]
    Backend(#[from] hal::DeviceError),
}

impl CoreError {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            CoreError::Exhausted(_) => StatusCode::Fail,
            CoreError::ResourceUnavailable(_) => StatusCode::ResourceUnavailable,
            CoreError::SemanticError(_) => StatusCode::SemanticError,
            CoreError::InvalidId(_) => StatusCode::Fail,
            CoreError::Fail(_) => StatusCode::Fail,
            CoreError::Timeout => StatusCode::Timeout,
            CoreError::Backend(e) => e.to_status_code(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
