//! The pluggable accelerator backend contract (spec.md §1: "a pluggable
//! 'backend' trait"), plus an in-process reference implementation good
//! enough to drive `vmaccel-core`'s test suite and the `local` bypass path.
//!
//! A thin, `Send + Sync` trait that the core layer is generic over, with
//! concrete device bindings living outside the workspace entirely (spec.md
//! §1 calls the real SPIR-V/OpenCL-C binding an external collaborator).

mod local;

pub use local::LocalBackend;

use thiserror::Error;
pub use vmt::FenceId;
use vmt::{Identifier, StatusCode, SurfaceDesc, WorkTopology};

/// Errors a `Backend` implementation may surface. These propagate verbatim
/// through `vmaccel-core::error::CoreError::Backend` (spec.md §7: "Backend
/// failure ... propagated verbatim from backend").
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device lost")]
    Lost,
    #[error("out of device memory")]
    OutOfMemory,
    #[error("out of compute resources")]
    OutOfComputeResources,
    #[error("backend reported a generic failure: {0}")]
    Generic(&'static str),
}

impl DeviceError {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            DeviceError::Lost => StatusCode::DeviceLost,
            DeviceError::OutOfMemory => StatusCode::OutOfMemory,
            DeviceError::OutOfComputeResources => StatusCode::OutOfComputeResources,
            DeviceError::Generic(_) => StatusCode::DeviceError,
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

bitflags::bitflags! {
    /// Map access/behavior flags (spec.md §4.3, "Upload path").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ  = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const ASYNC = 0b0000_0100;
    }
}

bitflags::bitflags! {
    /// Unmap behavior flags (spec.md §4.3: `NO_FREE_PTR` tells the backend
    /// the buffer is caller-owned).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnmapFlags: u32 {
        const NO_FREE_PTR = 0b0000_0001;
    }
}

/// A half-open byte range within a surface's backing store, used by
/// map/upload/download/copy/fill (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

/// One kernel dispatch argument: a surface bound at a given slot.
#[derive(Debug, Clone, Copy)]
pub struct DispatchBinding {
    pub slot: u32,
    pub surface: Identifier,
    pub instance: u32,
}

/// The backend contract every sub-device-bound operation in
/// `vmaccel-core::compute` is expressed against. Implementations must be
/// `Send + Sync`: spec.md §5 says "the allocator and context layers do not
/// assume re-entrant backends", so the core serializes calls through
/// `Runtime`'s mutexes rather than relying on internal synchronization here.
pub trait Backend: Send + Sync {
    /// Allocate device-side storage for `desc` on `instance` (a sub-device
    /// index). Returns an opaque per-instance device handle.
    fn surface_alloc(&self, surface: Identifier, instance: u32, desc: &SurfaceDesc) -> DeviceResult<u64>;

    /// Release the device-side storage allocated by `surface_alloc`.
    fn surface_destroy(&self, surface: Identifier, instance: u32, handle: u64) -> DeviceResult<()>;

    /// Map a region of the surface for host access; returns an opaque token
    /// the caller passes back to `unmap`. Real backends return a pointer;
    /// this trait returns a handle because Rust callers cannot safely hold
    /// a raw pointer across the trait boundary.
    fn map(
        &self,
        surface: Identifier,
        instance: u32,
        handle: u64,
        region: Region,
        flags: MapFlags,
    ) -> DeviceResult<MappedRegion>;

    fn unmap(&self, mapped: MappedRegion, flags: UnmapFlags) -> DeviceResult<()>;

    /// DMA-style upload used for accelerator-pool buffers (spec.md §4.3,
    /// "Direct image upload").
    fn image_upload(
        &self,
        surface: Identifier,
        instance: u32,
        handle: u64,
        region: Region,
        data: &[u8],
    ) -> DeviceResult<()>;

    /// DMA-style download, symmetric to `image_upload`.
    fn image_download(
        &self,
        surface: Identifier,
        instance: u32,
        handle: u64,
        region: Region,
        out: &mut [u8],
    ) -> DeviceResult<()>;

    /// Queue-ordered fill of a region with a repeated `u32x4` pattern
    /// (spec.md §4.3: "Fill writes a typed scalar (currently uint4)").
    fn fill(
        &self,
        surface: Identifier,
        instance: u32,
        handle: u64,
        region: Region,
        pattern: [u32; 4],
    ) -> DeviceResult<()>;

    /// Queue-ordered copy between two same-parent surfaces.
    fn copy(
        &self,
        src_surface: Identifier,
        src_instance: u32,
        src_handle: u64,
        src_region: Region,
        dst_surface: Identifier,
        dst_instance: u32,
        dst_handle: u64,
        dst_region: Region,
    ) -> DeviceResult<()>;

    /// Build (if not cached) and invoke `entry_point` from `source` over
    /// `topology`, binding `args` (spec.md §3/§4.3: kernel variant cache is
    /// per-context; this call is the point where a cache miss compiles).
    fn dispatch(
        &self,
        instance: u32,
        language: &str,
        entry_point: &str,
        source: &[u8],
        args: &[DispatchBinding],
        topology: &WorkTopology,
    ) -> DeviceResult<()>;

    /// Barrier: wait for everything submitted to `instance`'s queue so far.
    fn flush_queue(&self, instance: u32) -> DeviceResult<()>;

    /// Submit a fence on `instance`'s queue and return its id. The allocator
    /// tags deferred-free entries with this (spec.md §4.2).
    fn fence_submit(&self, instance: u32) -> DeviceResult<FenceId>;

    /// Non-blocking poll: has `fence` retired yet?
    fn fence_has_retired(&self, fence: FenceId) -> bool;
}

/// Opaque token returned by `Backend::map`. Carries just enough for a
/// software backend to round-trip a slice; a real backend instead embeds a
/// raw device pointer behind the same opaque shape.
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub surface: Identifier,
    pub instance: u32,
    pub region: Region,
    pub token: u64,
}
