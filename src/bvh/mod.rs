//! Acceleration structure codec.
//!
//! Decodes RTIP 1.1 and RTIP 3.1 structure blobs into query-able trees and
//! assembles the structures of a trace chunk into a [`BvhBundle`].
//!
//! ## Blob Structure
//!
//! ```text
//! +----------------------+
//! | Magic: RT11 / RT31   |  4 bytes
//! | Header offset        |  4 bytes (u32 LE, >= 16)
//! | Virtual address      |  8 bytes (u64 LE)
//! +----------------------+
//! | ... padding ...      |
//! +----------------------+  <- header offset; node offsets count from here
//! | Header               |  128 bytes
//! | Interior nodes       |  box records, root first
//! | Leaf nodes           |  triangle / procedural / instance records
//! | Geometry info        |  12 bytes per geometry (BLAS)
//! | Primitive node ptrs  |  4 bytes per primitive
//! +----------------------+
//! ```

pub mod format;
mod node_pointer;
mod header;
mod rtip;
pub mod nodes;
mod geometry_info;
mod index_map;
mod parent_block;
mod encoded;
mod blas;
mod tlas;
mod stats;
mod chunk;
mod bundle;
pub mod writer;

pub use node_pointer::*;
pub use header::*;
pub use rtip::*;
pub use nodes::{NodeData, Triangle};
pub use geometry_info::*;
pub use index_map::*;
pub use parent_block::*;
pub use encoded::*;
pub use blas::*;
pub use tlas::*;
pub use stats::*;
pub use chunk::*;
pub use bundle::*;
pub use writer::{BuildNode, ChunkWriter, StructureWriter};
