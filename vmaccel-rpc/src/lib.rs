//! The external wire protocol (spec.md §6): a length-prefixed record codec,
//! the three-program procedure set, and the blocking client/server
//! transport plus the out-of-band streaming upload path (spec.md §4.4).
//!
//! Plays the role a generated XDR/protobuf stub crate plays in the
//! teacher's stack, except every encode/decode here is hand-written against
//! [`wire`]'s primitives -- spec.md §6 only requires "any equivalent
//! length-prefixed struct encoding", not literal XDR.

#![warn(trivial_casts, trivial_numeric_casts, unused_qualifications)]

pub mod procedures;
pub mod wire;

#[cfg(feature = "rpc")]
pub mod client;
#[cfg(feature = "rpc")]
pub mod server;
#[cfg(feature = "streaming")]
pub mod stream;

pub use wire::{Decode, Encode, Reader, WireError, WireResult, Writer};
