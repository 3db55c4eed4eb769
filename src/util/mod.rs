//! Utility types and functions shared by the decoder.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Aabb`] and math type re-exports from glam
//! - [`bytes`] - Bounds-checked little-endian field access

pub mod bytes;
mod error;
mod math;

pub use error::*;
pub use math::*;
