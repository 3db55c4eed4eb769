//! Acceleration structure header (128 bytes, little-endian).
//!
//! The same field layout is written by both hardware generations; the
//! generation-specific readers in [`super::rtip`] apply their own
//! consistency rules on top of [`AccelerationStructureHeader::decode`].

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::format::HEADER_SIZE;
use super::rtip::{RayTracingIpLevel, RtIp};
use crate::util::bytes::{bit_field, read_aabb, read_u32, set_bit_field, write_aabb, write_u32};
use crate::util::{Aabb, Error, Result};

// Field offsets
const INFO: usize = 0;
const METADATA_SIZE: usize = 4;
const SIZE_IN_BYTES: usize = 8;
const NUM_PRIMITIVES: usize = 12;
const NUM_ACTIVE_PRIMS: usize = 16;
const TASK_ID_COUNTER: usize = 20;
const NUM_DESCS: usize = 24;
const GEOMETRY_TYPE: usize = 28;
const OFFSETS: usize = 32;
const NUM_INTERNAL_FP32: usize = 48;
const NUM_INTERNAL_FP16: usize = 52;
const NUM_LEAF_NODES: usize = 56;
const VERSION: usize = 60;
const UUID_LO: usize = 64;
const UUID_HI: usize = 68;
const RT_IP_LEVEL: usize = 72;
const ROOT_BOUNDS: usize = 76;
const INFO2: usize = 100;
const PACKED_FLAGS: usize = 104;
const COMPACTED_SIZE: usize = 108;
const NUM_CHILD_PRIMS: usize = 112;

/// Top- or bottom-level structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructureType {
    TopLevel,
    BottomLevel,
}

/// How triangles are packed into leaf records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriangleCompressionMode {
    None,
    TwoTriangles,
    PairTriangles,
    Automatic,
    Other(u8),
}

impl TriangleCompressionMode {
    pub fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::None,
            1 => Self::TwoTriangles,
            2 => Self::PairTriangles,
            3 => Self::Automatic,
            n => Self::Other(n as u8),
        }
    }

    pub fn to_bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::TwoTriangles => 1,
            Self::PairTriangles => 2,
            Self::Automatic => 3,
            Self::Other(n) => n as u32,
        }
    }
}

/// Which interior nodes use half precision bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fp16BoxMode {
    None,
    LeafNodesOnly,
    MixedWithFp32,
    All,
}

impl Fp16BoxMode {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::None,
            1 => Self::LeafNodesOnly,
            2 => Self::MixedWithFp32,
            _ => Self::All,
        }
    }

    pub fn to_bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::LeafNodesOnly => 1,
            Self::MixedWithFp32 => 2,
            Self::All => 3,
        }
    }
}

/// Primitive type stored in a BLAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Triangles,
    Aabbs,
    Other(u32),
}

impl GeometryType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Triangles,
            1 => Self::Aabbs,
            n => Self::Other(n),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Triangles => 0,
            Self::Aabbs => 1,
            Self::Other(n) => n,
        }
    }
}

/// Build flags requested by the application (16-bit field of the info word).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildFlags(pub u16);

impl BuildFlags {
    pub const ALLOW_UPDATE: Self = Self(0x1);
    pub const ALLOW_COMPACTION: Self = Self(0x2);
    pub const PREFER_FAST_TRACE: Self = Self(0x4);
    pub const PREFER_FAST_BUILD: Self = Self(0x8);
    pub const MINIMIZE_MEMORY: Self = Self(0x10);
    pub const PERFORM_UPDATE: Self = Self(0x20);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for BuildFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Packed build information word.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildInfo(pub u32);

impl BuildInfo {
    /// Assemble an info word.
    pub fn new(
        structure_type: StructureType,
        compression: TriangleCompressionMode,
        fp16_mode: Fp16BoxMode,
        flags: BuildFlags,
    ) -> Self {
        let mut v = 0;
        v = set_bit_field(v, 0, 1, matches!(structure_type, StructureType::BottomLevel) as u32);
        v = set_bit_field(v, 6, 3, compression.to_bits());
        v = set_bit_field(v, 9, 2, fp16_mode.to_bits());
        Self(v | ((flags.0 as u32) << 16))
    }

    pub fn structure_type(self) -> StructureType {
        if bit_field(self.0, 0, 1) == 1 {
            StructureType::BottomLevel
        } else {
            StructureType::TopLevel
        }
    }

    pub fn build_type(self) -> u32 {
        bit_field(self.0, 1, 1)
    }

    pub fn build_mode(self) -> u32 {
        bit_field(self.0, 2, 4)
    }

    pub fn triangle_compression(self) -> TriangleCompressionMode {
        TriangleCompressionMode::from_bits(bit_field(self.0, 6, 3))
    }

    pub fn fp16_box_mode(self) -> Fp16BoxMode {
        Fp16BoxMode::from_bits(bit_field(self.0, 9, 2))
    }

    pub fn triangle_splitting(self) -> bool {
        bit_field(self.0, 11, 1) != 0
    }

    pub fn rebraid(self) -> bool {
        bit_field(self.0, 12, 1) != 0
    }

    pub fn fused_instances(self) -> bool {
        bit_field(self.0, 13, 1) != 0
    }

    pub fn build_flags(self) -> BuildFlags {
        BuildFlags((self.0 >> 16) as u16)
    }

    pub fn with_fused_instances(self, on: bool) -> Self {
        Self(set_bit_field(self.0, 13, 1, on as u32))
    }
}

impl fmt::Debug for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildInfo")
            .field("type", &self.structure_type())
            .field("compression", &self.triangle_compression())
            .field("fp16", &self.fp16_box_mode())
            .field("flags", &format_args!("0x{:04x}", self.build_flags().0))
            .finish()
    }
}

/// Section offsets, relative to the header start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionOffsets {
    pub interior_nodes: u32,
    pub leaf_nodes: u32,
    pub geometry_info: u32,
    pub primitive_node_ptrs: u32,
}

/// Decoded acceleration structure header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelerationStructureHeader {
    /// Layout generation the blob was tagged with.
    pub rtip: RtIp,
    pub build_info: BuildInfo,
    pub metadata_size: u32,
    pub size_in_bytes: u32,
    pub primitive_count: u32,
    pub active_primitive_count: u32,
    pub task_id_counter: u32,
    /// Geometry descriptors (BLAS) or instance descriptors (TLAS).
    pub descriptor_count: u32,
    pub geometry_type: GeometryType,
    pub offsets: SectionOffsets,
    /// Full precision interior nodes; quantized BVH8 nodes on RTIP 3.1.
    pub interior_fp32_count: u32,
    pub interior_fp16_count: u32,
    pub leaf_count: u32,
    /// Driver structure version, `(major << 16) | minor`.
    pub version: u32,
    pub uuid: u64,
    pub rt_ip_level: RayTracingIpLevel,
    pub bounds: Aabb,
    pub info2: u32,
    pub packed_flags: u32,
    pub compacted_size: u32,
    pub child_primitive_counts: [u32; 4],
}

impl AccelerationStructureHeader {
    /// Empty header for `rtip`, used by writers.
    pub fn new(rtip: RtIp, build_info: BuildInfo) -> Self {
        Self {
            rtip,
            build_info,
            metadata_size: 0,
            size_in_bytes: 0,
            primitive_count: 0,
            active_primitive_count: 0,
            task_id_counter: 0,
            descriptor_count: 0,
            geometry_type: GeometryType::Triangles,
            offsets: SectionOffsets::default(),
            interior_fp32_count: 0,
            interior_fp16_count: 0,
            leaf_count: 0,
            version: super::format::ACCEL_STRUCT_VERSION,
            uuid: 0,
            rt_ip_level: RayTracingIpLevel::Unspecified,
            bounds: Aabb::EMPTY,
            info2: 0,
            packed_flags: 0,
            compacted_size: 0,
            child_primitive_counts: [0; 4],
        }
    }

    /// Read the raw 128-byte layout. No consistency checks.
    pub fn decode(bytes: &[u8], rtip: RtIp) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::TruncatedBuffer {
                what: "structure header",
                offset: 0,
                needed: HEADER_SIZE as u64,
                available: bytes.len() as u64,
            });
        }
        let b = &bytes[..HEADER_SIZE];
        Ok(Self {
            rtip,
            build_info: BuildInfo(read_u32(b, INFO)),
            metadata_size: read_u32(b, METADATA_SIZE),
            size_in_bytes: read_u32(b, SIZE_IN_BYTES),
            primitive_count: read_u32(b, NUM_PRIMITIVES),
            active_primitive_count: read_u32(b, NUM_ACTIVE_PRIMS),
            task_id_counter: read_u32(b, TASK_ID_COUNTER),
            descriptor_count: read_u32(b, NUM_DESCS),
            geometry_type: GeometryType::from_u32(read_u32(b, GEOMETRY_TYPE)),
            offsets: SectionOffsets {
                interior_nodes: read_u32(b, OFFSETS),
                leaf_nodes: read_u32(b, OFFSETS + 4),
                geometry_info: read_u32(b, OFFSETS + 8),
                primitive_node_ptrs: read_u32(b, OFFSETS + 12),
            },
            interior_fp32_count: read_u32(b, NUM_INTERNAL_FP32),
            interior_fp16_count: read_u32(b, NUM_INTERNAL_FP16),
            leaf_count: read_u32(b, NUM_LEAF_NODES),
            version: read_u32(b, VERSION),
            uuid: read_u32(b, UUID_LO) as u64 | ((read_u32(b, UUID_HI) as u64) << 32),
            rt_ip_level: RayTracingIpLevel::from_u32(read_u32(b, RT_IP_LEVEL)),
            bounds: read_aabb(b, ROOT_BOUNDS),
            info2: read_u32(b, INFO2),
            packed_flags: read_u32(b, PACKED_FLAGS),
            compacted_size: read_u32(b, COMPACTED_SIZE),
            child_primitive_counts: [
                read_u32(b, NUM_CHILD_PRIMS),
                read_u32(b, NUM_CHILD_PRIMS + 4),
                read_u32(b, NUM_CHILD_PRIMS + 8),
                read_u32(b, NUM_CHILD_PRIMS + 12),
            ],
        })
    }

    /// Write the raw 128-byte layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        write_u32(&mut b, INFO, self.build_info.0);
        write_u32(&mut b, METADATA_SIZE, self.metadata_size);
        write_u32(&mut b, SIZE_IN_BYTES, self.size_in_bytes);
        write_u32(&mut b, NUM_PRIMITIVES, self.primitive_count);
        write_u32(&mut b, NUM_ACTIVE_PRIMS, self.active_primitive_count);
        write_u32(&mut b, TASK_ID_COUNTER, self.task_id_counter);
        write_u32(&mut b, NUM_DESCS, self.descriptor_count);
        write_u32(&mut b, GEOMETRY_TYPE, self.geometry_type.to_u32());
        write_u32(&mut b, OFFSETS, self.offsets.interior_nodes);
        write_u32(&mut b, OFFSETS + 4, self.offsets.leaf_nodes);
        write_u32(&mut b, OFFSETS + 8, self.offsets.geometry_info);
        write_u32(&mut b, OFFSETS + 12, self.offsets.primitive_node_ptrs);
        write_u32(&mut b, NUM_INTERNAL_FP32, self.interior_fp32_count);
        write_u32(&mut b, NUM_INTERNAL_FP16, self.interior_fp16_count);
        write_u32(&mut b, NUM_LEAF_NODES, self.leaf_count);
        write_u32(&mut b, VERSION, self.version);
        write_u32(&mut b, UUID_LO, self.uuid as u32);
        write_u32(&mut b, UUID_HI, (self.uuid >> 32) as u32);
        write_u32(&mut b, RT_IP_LEVEL, self.rt_ip_level.to_u32());
        write_aabb(&mut b, ROOT_BOUNDS, &self.bounds);
        write_u32(&mut b, INFO2, self.info2);
        write_u32(&mut b, PACKED_FLAGS, self.packed_flags);
        write_u32(&mut b, COMPACTED_SIZE, self.compacted_size);
        for (i, c) in self.child_primitive_counts.iter().enumerate() {
            write_u32(&mut b, NUM_CHILD_PRIMS + i * 4, *c);
        }
        b
    }

    /// Structure-level flags.
    #[inline]
    pub fn flags(&self) -> BuildInfo {
        self.build_info
    }

    #[inline]
    pub fn structure_type(&self) -> StructureType {
        self.build_info.structure_type()
    }

    #[inline]
    pub fn is_blas(&self) -> bool {
        self.structure_type() == StructureType::BottomLevel
    }

    /// Interior plus leaf nodes.
    #[inline]
    pub fn node_count(&self) -> u64 {
        self.interior_fp32_count as u64 + self.interior_fp16_count as u64 + self.leaf_count as u64
    }

    /// Geometry descriptors attached to a BLAS; zero for a TLAS.
    #[inline]
    pub fn geometry_count(&self) -> u32 {
        if self.is_blas() {
            self.descriptor_count
        } else {
            0
        }
    }

    /// Interior and leaf sections together.
    #[inline]
    pub fn node_stream(&self) -> Range<u64> {
        self.offsets.interior_nodes as u64..self.offsets.geometry_info as u64
    }

    #[inline]
    pub fn node_stream_size(&self) -> u64 {
        (self.offsets.geometry_info as u64).saturating_sub(self.offsets.interior_nodes as u64)
    }

    #[inline]
    pub fn interior_stream(&self) -> Range<u64> {
        self.offsets.interior_nodes as u64..self.offsets.leaf_nodes as u64
    }

    #[inline]
    pub fn leaf_stream(&self) -> Range<u64> {
        self.offsets.leaf_nodes as u64..self.offsets.geometry_info as u64
    }

    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.info2 & 0x1 != 0
    }

    /// An empty structure carries no nodes at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    /// Driver version as `(major, minor)`.
    #[inline]
    pub fn version_parts(&self) -> (u16, u16) {
        ((self.version >> 16) as u16, self.version as u16)
    }

    /// Section ordering shared by every generation.
    pub(crate) fn check_section_order(&self) -> Result<()> {
        let o = &self.offsets;
        if !(o.interior_nodes <= o.leaf_nodes
            && o.leaf_nodes <= o.geometry_info
            && o.geometry_info <= o.primitive_node_ptrs)
        {
            return Err(Error::inconsistent(format!(
                "section offsets out of order: interior {} leaf {} geometry {} prim ptrs {}",
                o.interior_nodes, o.leaf_nodes, o.geometry_info, o.primitive_node_ptrs
            )));
        }
        if (o.interior_nodes as usize) < HEADER_SIZE && !self.is_empty() {
            return Err(Error::inconsistent(format!(
                "interior nodes at {} overlap the header",
                o.interior_nodes
            )));
        }
        Ok(())
    }
}
