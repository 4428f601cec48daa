/// The wire-level status enum every reply body carries (spec.md §6).
///
/// `vmaccel-core::error::CoreError` maps onto this; it is the single seam
/// where internal `Result<T, CoreError>` control flow becomes the
/// discriminated union the RPC layer puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    Fail = 1,
    SemanticError = 2,
    DeviceError = 3,
    ResourceUnavailable = 4,
    DeviceLost = 5,
    OutOfComputeResources = 6,
    OutOfMemory = 7,
    Timeout = 8,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }

    /// Whether a caller should retry the operation that produced this status
    /// (spec.md §5, §7: dispatch retries `ResourceUnavailable` transparently).
    pub fn is_retryable(self) -> bool {
        matches!(self, StatusCode::ResourceUnavailable)
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => StatusCode::Success,
            1 => StatusCode::Fail,
            2 => StatusCode::SemanticError,
            3 => StatusCode::DeviceError,
            4 => StatusCode::ResourceUnavailable,
            5 => StatusCode::DeviceLost,
            6 => StatusCode::OutOfComputeResources,
            7 => StatusCode::OutOfMemory,
            8 => StatusCode::Timeout,
            _ => return None,
        })
    }
}
