//! Core VMAccel logic: identifier management, the generic resource
//! allocator, and the compute-context surface engine. This crate owns all
//! invariants and never talks to a socket or a real device directly; those
//! live in `vmaccel-rpc` and `vmaccel-hal` respectively.

#![warn(trivial_casts, trivial_numeric_casts, unused_qualifications)]

pub mod alloc;
pub mod algebra;
pub mod compute;
pub mod error;
pub mod identifier_db;
pub mod manager;

pub use algebra::ResourceAlgebra;
pub use error::{CoreError, CoreResult};
pub use identifier_db::IdentifierDB;
