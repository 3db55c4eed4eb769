//! Per-geometry descriptors of a bottom-level structure.

use serde::{Deserialize, Serialize};

use super::format::GEOMETRY_INFO_SIZE;
use super::header::AccelerationStructureHeader;
use crate::util::bytes::{bit_field, read_u32, section, write_u32};
use crate::util::Result;

/// Geometry flags (3 bits).
pub const GEOMETRY_OPAQUE: u32 = 0x1;
pub const GEOMETRY_NO_DUPLICATE_ANY_HIT: u32 = 0x2;

/// Buffer element format. Captured descriptors do not record formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferFormat {
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryInfo {
    pub primitive_count: u32,
    pub flags: u32,
    pub geometry_buffer_offset: u32,
    /// Byte offset of this geometry's run in the primitive node pointer table.
    pub prim_node_ptrs_offset: u32,
    pub index_format: BufferFormat,
    pub vertex_format: BufferFormat,
}

impl GeometryInfo {
    pub fn new(primitive_count: u32, flags: u32, prim_node_ptrs_offset: u32) -> Self {
        Self {
            primitive_count,
            flags,
            geometry_buffer_offset: 0,
            prim_node_ptrs_offset,
            index_format: BufferFormat::Unknown,
            vertex_format: BufferFormat::Unknown,
        }
    }

    pub fn decode(b: &[u8]) -> Self {
        let packed = read_u32(b, 0);
        Self {
            primitive_count: bit_field(packed, 0, 29),
            flags: packed >> 29,
            geometry_buffer_offset: read_u32(b, 4),
            prim_node_ptrs_offset: read_u32(b, 8),
            index_format: BufferFormat::Unknown,
            vertex_format: BufferFormat::Unknown,
        }
    }

    pub fn encode(&self) -> [u8; GEOMETRY_INFO_SIZE] {
        let mut b = [0u8; GEOMETRY_INFO_SIZE];
        write_u32(&mut b, 0, (self.flags << 29) | (self.primitive_count & 0x1FFF_FFFF));
        write_u32(&mut b, 4, self.geometry_buffer_offset);
        write_u32(&mut b, 8, self.prim_node_ptrs_offset);
        b
    }

    #[inline]
    pub fn is_opaque(&self) -> bool {
        self.flags & GEOMETRY_OPAQUE != 0
    }
}

/// Read the descriptor table the header points at. TLAS headers yield an
/// empty table.
pub fn read_geometry_infos(data: &[u8], header: &AccelerationStructureHeader) -> Result<Vec<GeometryInfo>> {
    let count = header.geometry_count() as u64;
    let bytes = section(
        data,
        header.offsets.geometry_info as u64,
        count * GEOMETRY_INFO_SIZE as u64,
        "geometry info",
    )?;
    Ok(bytes.chunks_exact(GEOMETRY_INFO_SIZE).map(GeometryInfo::decode).collect())
}
