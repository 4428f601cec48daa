//! Wire-shaped data types shared by every VMAccel crate.
//!
//! This crate carries no logic beyond the arithmetic the wire format itself
//! implies (pointwise add/subtract on [`VMAccelDesc`], range splitting on
//! [`AllocRange`]). The resource-algebra behavior that makes those operations
//! meaningful to the allocator lives in `vmaccel-core`.

#![warn(trivial_casts, trivial_numeric_casts, unused_qualifications)]

mod desc;
mod range;
mod status;
mod surface;

pub use desc::{AcceleratorType, VMAccelDesc, WorkloadCapacity};
pub use range::AllocRange;
pub use status::StatusCode;
pub use surface::{
    BindFlags, FormatCaps, SurfaceDesc, SurfacePool, SurfaceType, SurfaceUsage, WorkTopology,
};

/// 32-bit identifier drawn from one of the named ID spaces (registered
/// device, external reservation, per-context sub-object). The all-ones
/// pattern is reserved to mean "no id" on the wire and in memory.
pub type Identifier = u32;

/// Reserved sentinel for "no identifier" (spec.md §3, §6).
pub const VMACCEL_INVALID_ID: Identifier = 0xFFFF_FFFF;

/// Opaque device-side retirement token. The allocator and the upload/download
/// paths only ever compare these for "has this fence retired yet?"; the
/// concrete representation is owned by `vmaccel-hal`'s `Backend` trait.
pub type FenceId = u64;

/// A fence that is already known to have retired (spec.md §4.2, Free).
pub const FENCE_ALREADY_RETIRED: FenceId = 0;

/// Scalar resource algebra element (spec.md §3: totally ordered by value).
pub type Int = u64;

/// Default RPC wire-level timeout from spec.md §5 (`clnt_call` default).
pub const DEFAULT_WIRE_TIMEOUT_SECS: u64 = 25;
/// Default application-level timeout layered on top of the wire timeout
/// (spec.md §5, `CLSET_TIMEOUT`).
pub const DEFAULT_APPLICATION_TIMEOUT_SECS: u64 = 60;
/// Bound on dispatch retries for `RESOURCE_UNAVAILABLE` (spec.md §5, §7).
pub const DISPATCH_RETRY_LIMIT: u32 = 100;
/// Streaming socket receive buffer size (spec.md §4.4).
pub const STREAM_RECV_BUFFER_BYTES: usize = 128 * 1024;
/// Streaming socket send buffer size (spec.md §4.4).
pub const STREAM_SEND_BUFFER_BYTES: usize = 16 * 1024;
