//! C4: per-context state, the surface residency/consistency engine, and
//! dispatch orchestration (spec.md §3 "Surface"/"ComputeContext", §4.3).
//!
//! Grounded on `original_source/common/inc/vmaccel_compute.hpp` for the
//! generation/consistency protocol and on `hal::Backend` for everything that
//! actually touches device memory.

mod context;
mod engine;
mod surface;

pub use context::ComputeContext;
pub use engine::{ComputeEngine, UploadMode};
pub use surface::Surface;
