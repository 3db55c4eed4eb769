//! Hardware generation dispatch.
//!
//! The set of layouts is closed: [`RtIp`] names the generation and routes every
//! [`LayoutReader`] call to the matching unit reader with a `match`, so the
//! generation is fixed once the blob magic has been read.

use serde::{Deserialize, Serialize};

use super::format::*;
use super::header::AccelerationStructureHeader;
use super::node_pointer::{NodeKind, NodePointer};
use crate::util::{Error, Result};

/// Ray-tracing IP level as recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RayTracingIpLevel {
    Unspecified,
    RtIp1_0,
    RtIp1_1,
    RtIp2_0,
    RtIp3_0,
    RtIp3_1,
    Unknown(u32),
}

impl RayTracingIpLevel {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Unspecified,
            1 => Self::RtIp1_0,
            2 => Self::RtIp1_1,
            3 => Self::RtIp2_0,
            4 => Self::RtIp3_0,
            6 => Self::RtIp3_1,
            n => Self::Unknown(n),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Unspecified => 0,
            Self::RtIp1_0 => 1,
            Self::RtIp1_1 => 2,
            Self::RtIp2_0 => 3,
            Self::RtIp3_0 => 4,
            Self::RtIp3_1 => 6,
            Self::Unknown(n) => n,
        }
    }

    /// Node layout generation used by this IP level.
    ///
    /// Levels 1.0 through 3.0 share the RTIP 1.1 node encoding.
    pub fn generation(self) -> Option<RtIp> {
        match self {
            Self::RtIp1_0 | Self::RtIp1_1 | Self::RtIp2_0 | Self::RtIp3_0 => Some(RtIp::Rtip11),
            Self::RtIp3_1 => Some(RtIp::Rtip31),
            Self::Unspecified | Self::Unknown(_) => None,
        }
    }
}

/// Node layout generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RtIp {
    Rtip11,
    Rtip31,
}

impl RtIp {
    /// Select the generation from the blob magic.
    pub fn from_magic(magic: &[u8]) -> Result<Self> {
        match magic {
            m if m == RTIP11_MAGIC => Ok(Self::Rtip11),
            m if m == RTIP31_MAGIC => Ok(Self::Rtip31),
            other => Err(Error::unsupported(format!(
                "unrecognized structure magic {:02x?}",
                other
            ))),
        }
    }

    pub fn magic(self) -> &'static [u8; 4] {
        match self {
            Self::Rtip11 => RTIP11_MAGIC,
            Self::Rtip31 => RTIP31_MAGIC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rtip11 => "RTIP 1.1",
            Self::Rtip31 => "RTIP 3.1",
        }
    }

    /// IP level written by default for this generation.
    pub fn ip_level(self) -> RayTracingIpLevel {
        match self {
            Self::Rtip11 => RayTracingIpLevel::RtIp1_1,
            Self::Rtip31 => RayTracingIpLevel::RtIp3_1,
        }
    }

    /// Whether nodes of `kind` exist in this generation.
    pub fn supports(self, kind: NodeKind) -> bool {
        match (self, kind) {
            (Self::Rtip11, NodeKind::QuantizedBvh8) => false,
            (Self::Rtip11, NodeKind::Triangle(slot)) => slot < 4,
            (Self::Rtip31, NodeKind::Box16 | NodeKind::Box32) => false,
            (Self::Rtip31, NodeKind::Triangle(slot)) => slot < 8,
            _ => true,
        }
    }
}

/// Decode contract implemented by each generation.
pub trait LayoutReader {
    /// Parse and validate the 128-byte header.
    fn parse_header(&self, bytes: &[u8]) -> Result<AccelerationStructureHeader>;

    /// Root node, `None` for an empty structure.
    fn root_node_offset(&self, header: &AccelerationStructureHeader) -> Result<Option<NodePointer>>;

    /// Space a node of `kind` occupies in the node stream; zero if the kind
    /// does not exist in this generation.
    fn node_stride(&self, kind: NodeKind) -> usize;

    /// Bytes the decoder reads for a record of `kind`.
    fn record_size(&self, kind: NodeKind, header: &AccelerationStructureHeader) -> usize;

    /// Stride of the leaf section.
    fn leaf_stride(&self, header: &AccelerationStructureHeader) -> usize;
}

/// Leaf and level checks shared by both generations.
fn check_common(header: &AccelerationStructureHeader, rtip: RtIp) -> Result<()> {
    if let Some(generation) = header.rt_ip_level.generation() {
        if generation != rtip {
            return Err(Error::unsupported(format!(
                "{:?} header inside a {} blob",
                header.rt_ip_level,
                rtip.name()
            )));
        }
    } else if let RayTracingIpLevel::Unknown(n) = header.rt_ip_level {
        return Err(Error::unsupported(format!("unknown ray tracing IP level {}", n)));
    }
    header.check_section_order()?;
    let interior = header.interior_fp32_count as u64 + header.interior_fp16_count as u64;
    if interior == 0 && header.leaf_count > 0 {
        return Err(Error::inconsistent("leaf nodes without a root box"));
    }
    Ok(())
}

fn check_leaf_section(header: &AccelerationStructureHeader, stride: usize) -> Result<()> {
    let leaf_bytes = header.leaf_stream().end - header.leaf_stream().start;
    let expected = header.leaf_count as u64 * stride as u64;
    if leaf_bytes != expected {
        return Err(Error::inconsistent(format!(
            "leaf section is {} bytes, {} leaves x {} bytes = {}",
            leaf_bytes, header.leaf_count, stride, expected
        )));
    }
    Ok(())
}

/// RTIP 1.1: fixed Box32 root after the header, 3-bit pointer tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rtip11Layout;

impl LayoutReader for Rtip11Layout {
    fn parse_header(&self, bytes: &[u8]) -> Result<AccelerationStructureHeader> {
        let header = AccelerationStructureHeader::decode(bytes, RtIp::Rtip11)?;
        check_common(&header, RtIp::Rtip11)?;
        if header.is_empty() {
            return Ok(header);
        }
        if header.offsets.interior_nodes as u64 != RTIP11_ROOT_OFFSET {
            return Err(Error::inconsistent(format!(
                "interior nodes at {}, root must follow the header at {}",
                header.offsets.interior_nodes, RTIP11_ROOT_OFFSET
            )));
        }
        if header.interior_fp32_count == 0 {
            return Err(Error::inconsistent("no full precision root box"));
        }
        let interior_bytes = header.interior_stream().end - header.interior_stream().start;
        let expected = header.interior_fp32_count as u64 * BOX32_NODE_SIZE as u64
            + header.interior_fp16_count as u64 * BOX16_NODE_SIZE as u64;
        if interior_bytes != expected {
            return Err(Error::inconsistent(format!(
                "interior section is {} bytes, box counts give {}",
                interior_bytes, expected
            )));
        }
        check_leaf_section(&header, self.leaf_stride(&header))?;
        Ok(header)
    }

    fn root_node_offset(&self, header: &AccelerationStructureHeader) -> Result<Option<NodePointer>> {
        if header.is_empty() {
            return Ok(None);
        }
        NodePointer::new(RtIp::Rtip11, NodeKind::Box32, RTIP11_ROOT_OFFSET).map(Some)
    }

    fn node_stride(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Box32 => BOX32_NODE_SIZE,
            NodeKind::Box16 => BOX16_NODE_SIZE,
            NodeKind::Triangle(_) | NodeKind::Procedural => LEAF_NODE_SIZE,
            NodeKind::Instance => INSTANCE_NODE_SIZE,
            NodeKind::QuantizedBvh8 => 0,
        }
    }

    fn record_size(&self, kind: NodeKind, header: &AccelerationStructureHeader) -> usize {
        match kind {
            NodeKind::Instance => self.leaf_stride(header),
            other => self.node_stride(other),
        }
    }

    fn leaf_stride(&self, header: &AccelerationStructureHeader) -> usize {
        if header.is_blas() {
            LEAF_NODE_SIZE
        } else if header.build_info.fused_instances() {
            FUSED_INSTANCE_NODE_SIZE
        } else {
            INSTANCE_NODE_SIZE
        }
    }
}

/// RTIP 3.1: header-stored root, 128-byte node slots, 4-bit pointer tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rtip31Layout;

impl LayoutReader for Rtip31Layout {
    fn parse_header(&self, bytes: &[u8]) -> Result<AccelerationStructureHeader> {
        let header = AccelerationStructureHeader::decode(bytes, RtIp::Rtip31)?;
        check_common(&header, RtIp::Rtip31)?;
        if header.is_empty() {
            return Ok(header);
        }
        if header.interior_fp16_count != 0 {
            return Err(Error::inconsistent(format!(
                "{} half precision boxes in an RTIP 3.1 structure",
                header.interior_fp16_count
            )));
        }
        if header.offsets.interior_nodes as usize % RTIP31_NODE_SLOT != 0
            || header.offsets.leaf_nodes as usize % RTIP31_NODE_SLOT != 0
        {
            return Err(Error::inconsistent("node sections are not 128-byte aligned"));
        }
        let interior_bytes = header.interior_stream().end - header.interior_stream().start;
        let expected = header.interior_fp32_count as u64 * QUANTIZED_BVH8_NODE_SIZE as u64;
        if interior_bytes != expected {
            return Err(Error::inconsistent(format!(
                "interior section is {} bytes, {} boxes give {}",
                interior_bytes, header.interior_fp32_count, expected
            )));
        }
        check_leaf_section(&header, self.leaf_stride(&header))?;
        Ok(header)
    }

    fn root_node_offset(&self, header: &AccelerationStructureHeader) -> Result<Option<NodePointer>> {
        if header.is_empty() {
            return Ok(None);
        }
        NodePointer::new(RtIp::Rtip31, NodeKind::QuantizedBvh8, header.offsets.interior_nodes as u64).map(Some)
    }

    fn node_stride(&self, kind: NodeKind) -> usize {
        if RtIp::Rtip31.supports(kind) {
            RTIP31_NODE_SLOT
        } else {
            0
        }
    }

    fn record_size(&self, kind: NodeKind, _header: &AccelerationStructureHeader) -> usize {
        match kind {
            NodeKind::QuantizedBvh8 => QUANTIZED_BVH8_NODE_SIZE,
            NodeKind::Triangle(_) | NodeKind::Procedural => PRIMITIVE_PACKET_SIZE,
            NodeKind::Instance => INSTANCE_NODE_SIZE,
            NodeKind::Box16 | NodeKind::Box32 => 0,
        }
    }

    fn leaf_stride(&self, _header: &AccelerationStructureHeader) -> usize {
        RTIP31_NODE_SLOT
    }
}

macro_rules! dispatch {
    ($self:expr, $reader:ident => $call:expr) => {
        match $self {
            RtIp::Rtip11 => {
                let $reader = Rtip11Layout;
                $call
            }
            RtIp::Rtip31 => {
                let $reader = Rtip31Layout;
                $call
            }
        }
    };
}

impl LayoutReader for RtIp {
    fn parse_header(&self, bytes: &[u8]) -> Result<AccelerationStructureHeader> {
        dispatch!(self, r => r.parse_header(bytes))
    }

    fn root_node_offset(&self, header: &AccelerationStructureHeader) -> Result<Option<NodePointer>> {
        dispatch!(self, r => r.root_node_offset(header))
    }

    fn node_stride(&self, kind: NodeKind) -> usize {
        dispatch!(self, r => r.node_stride(kind))
    }

    fn record_size(&self, kind: NodeKind, header: &AccelerationStructureHeader) -> usize {
        dispatch!(self, r => r.record_size(kind, header))
    }

    fn leaf_stride(&self, header: &AccelerationStructureHeader) -> usize {
        dispatch!(self, r => r.leaf_stride(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::header::{BuildFlags, BuildInfo, Fp16BoxMode, SectionOffsets, StructureType, TriangleCompressionMode};

    fn blas_header(rtip: RtIp) -> AccelerationStructureHeader {
        let info = BuildInfo::new(
            StructureType::BottomLevel,
            TriangleCompressionMode::None,
            Fp16BoxMode::None,
            BuildFlags::default(),
        );
        let mut h = AccelerationStructureHeader::new(rtip, info);
        h.rt_ip_level = rtip.ip_level();
        h.interior_fp32_count = 1;
        h.leaf_count = 2;
        h.primitive_count = 2;
        let leaf_stride = match rtip {
            RtIp::Rtip11 => 64,
            RtIp::Rtip31 => 128,
        };
        h.offsets = SectionOffsets {
            interior_nodes: 128,
            leaf_nodes: 256,
            geometry_info: 256 + 2 * leaf_stride,
            primitive_node_ptrs: 256 + 2 * leaf_stride + 12,
        };
        h
    }

    #[test]
    fn test_magic_dispatch() {
        assert_eq!(RtIp::from_magic(b"RT11").unwrap(), RtIp::Rtip11);
        assert_eq!(RtIp::from_magic(b"RT31").unwrap(), RtIp::Rtip31);
        let err = RtIp::from_magic(b"ABCD").unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(_)));
    }

    #[test]
    fn test_parse_valid_headers() {
        for rtip in [RtIp::Rtip11, RtIp::Rtip31] {
            let h = blas_header(rtip);
            let parsed = rtip.parse_header(&h.encode()).unwrap();
            assert_eq!(parsed.rtip, rtip);
            let root = rtip.root_node_offset(&parsed).unwrap().unwrap();
            assert_eq!(root.byte_offset(), 128);
        }
    }

    #[test]
    fn test_root_kinds() {
        let h = blas_header(RtIp::Rtip11);
        assert_eq!(RtIp::Rtip11.root_node_offset(&h).unwrap().unwrap().kind(), NodeKind::Box32);
        let h = blas_header(RtIp::Rtip31);
        assert_eq!(RtIp::Rtip31.root_node_offset(&h).unwrap().unwrap().kind(), NodeKind::QuantizedBvh8);
    }

    #[test]
    fn test_level_mismatch() {
        let mut h = blas_header(RtIp::Rtip11);
        h.rt_ip_level = RayTracingIpLevel::RtIp3_1;
        assert!(matches!(RtIp::Rtip11.parse_header(&h.encode()), Err(Error::UnsupportedVersion(_))));
        h.rt_ip_level = RayTracingIpLevel::Unknown(9);
        assert!(matches!(RtIp::Rtip11.parse_header(&h.encode()), Err(Error::UnsupportedVersion(_))));
    }

    #[test]
    fn test_inconsistent_counts() {
        let mut h = blas_header(RtIp::Rtip11);
        h.leaf_count = 3;
        assert!(matches!(RtIp::Rtip11.parse_header(&h.encode()), Err(Error::InconsistentHeader(_))));

        let mut h = blas_header(RtIp::Rtip31);
        h.interior_fp16_count = 1;
        assert!(matches!(RtIp::Rtip31.parse_header(&h.encode()), Err(Error::InconsistentHeader(_))));
    }

    #[test]
    fn test_strides() {
        let h = blas_header(RtIp::Rtip11);
        assert_eq!(RtIp::Rtip11.node_stride(NodeKind::Box16), 64);
        assert_eq!(RtIp::Rtip11.node_stride(NodeKind::QuantizedBvh8), 0);
        assert_eq!(RtIp::Rtip31.node_stride(NodeKind::Triangle(0)), 128);
        assert_eq!(RtIp::Rtip31.record_size(NodeKind::Triangle(0), &h), 128);
        assert_eq!(RtIp::Rtip31.record_size(NodeKind::Triangle(4), &h), 128);

        let mut tlas = h.clone();
        tlas.build_info = BuildInfo::new(
            StructureType::TopLevel,
            TriangleCompressionMode::None,
            Fp16BoxMode::None,
            BuildFlags::default(),
        )
        .with_fused_instances(true);
        assert_eq!(RtIp::Rtip11.leaf_stride(&tlas), 256);
        assert_eq!(RtIp::Rtip11.record_size(NodeKind::Instance, &tlas), 256);
    }

    #[test]
    fn test_supports() {
        assert!(!RtIp::Rtip11.supports(NodeKind::QuantizedBvh8));
        assert!(RtIp::Rtip31.supports(NodeKind::Triangle(7)));
        assert!(!RtIp::Rtip11.supports(NodeKind::Triangle(4)));
    }
}
