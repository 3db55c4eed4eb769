//! # rra-bvh
//!
//! Decoder for GPU ray-tracing acceleration structures captured in trace
//! chunks. Reads the RTIP 1.1 (4-wide, fp32/fp16 boxes) and RTIP 3.1 (8-wide
//! quantized boxes) layouts, links top-level instances to bottom-level
//! structures, and scores trees with a surface area heuristic.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math types and byte helpers
//! - [`bvh`] - Blob and node codecs, decoded trees, chunk and bundle loading
//! - [`sah`] - Surface area heuristic costs and triangle quality
//! - [`dxr`] - Conversion to vendor-neutral build settings and records
//! - [`config`] - Decode and cost model settings
//!
//! ## Example
//!
//! ```ignore
//! use rra_bvh::prelude::*;
//!
//! let file = ChunkFile::open("capture.bin")?;
//! let bundle = BvhBundle::decode(&file.chunk(), &DecodeOptions::default());
//!
//! for (slot, blas) in bundle.blas_iter() {
//!     let report = SahEvaluator::default().evaluate(blas);
//!     println!("blas[{}] cost {:.3}", slot, report.total_cost);
//! }
//! ```

pub mod util;
pub mod bvh;
pub mod sah;
pub mod dxr;
pub mod config;

// Re-export commonly used types
pub use util::{Error, ErrorKind, Result};
pub use bvh::{BvhBundle, EncodedBlas, EncodedBvh, EncodedTlas};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{Aabb, Error, ErrorKind, Result};
    pub use crate::bvh::{
        AccelerationStructure, BlasReference, BundleLoader, BvhBundle, ChunkFile, EncodedBlas, EncodedBvh,
        EncodedTlas, NodeKind, NodePointer, NodeView, RtIp, TraceChunk,
    };
    pub use crate::config::{DecodeOptions, SahConfig, Settings};
    pub use crate::sah::{SahEvaluator, SahReport};
}

/// Build date stamped by the build script.
pub fn build_date() -> &'static str {
    option_env!("RRA_BUILD_DATE").unwrap_or("unknown")
}
