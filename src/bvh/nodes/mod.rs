//! Node record decoders and encoders.
//!
//! - [`Box32Node`] / [`Box16Node`] - RTIP 1.1 four-wide boxes
//! - [`QuantizedBvh8Node`] - RTIP 3.1 eight-wide quantized box
//! - [`TriangleNode`] - RTIP 1.1 triangle leaves
//! - [`PrimitiveRange`] - RTIP 3.1 triangle leaves over compressed packets
//! - [`ProceduralNode`] - AABB leaves
//! - [`InstanceNode`] - Top-level instance leaves

use smallvec::SmallVec;

use super::format::{INSTANCE_NODE_SIZE, INSTANCE_SIDEBAND_SIZE, PRIMITIVE_PACKET_SIZE};
use super::header::{AccelerationStructureHeader, TriangleCompressionMode};
use super::index_map::PrimitiveLocation;
use super::node_pointer::{NodeKind, NodePointer};
use super::rtip::{LayoutReader, RtIp};
use crate::util::bytes::{record, section};
use crate::util::{Aabb, Error, Result};

mod box_node;
mod instance;
mod primitive;
mod procedural;
mod quantized;
mod triangle;

pub use box_node::{Box16Node, Box32Node};
pub use instance::{instance_flags, InstanceDesc, InstanceLayout, InstanceNode, InstanceRootBox};
pub use primitive::{PackedTriangle, PairSource, PrimitivePacket, PrimitiveRange, TrianglePairDesc};
pub use procedural::ProceduralNode;
pub use quantized::{
    compute_exponents, dequantize, quantize_max, quantize_min, ChildInfo, QuantizedBvh8Node, QuantizedChild,
    BVH8_NODE_TYPE, OBB_DISABLED,
};
pub use triangle::{Triangle, TriangleNode, GEOMETRY_FLAG_NO_DUPLICATE_ANY_HIT, GEOMETRY_FLAG_OPAQUE};

/// Child of a box node: where it is and how big it is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildRef {
    pub pointer: NodePointer,
    pub bounds: Aabb,
}

/// Triangle reached through a leaf pointer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafTriangle {
    /// Position among the triangles the pointer addresses.
    pub slot: u8,
    /// Where the triangle is stored.
    pub location: PrimitiveLocation,
    pub triangle: Triangle,
    pub geometry_index: u32,
    pub primitive_index: Option<u32>,
    pub opaque: bool,
}

/// Decoded node record, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Box32(Box32Node),
    Box16(Box16Node),
    QuantizedBvh8(QuantizedBvh8Node),
    Triangle(TriangleNode),
    PrimitiveRange(PrimitiveRange),
    Procedural(ProceduralNode),
    Instance(InstanceNode),
}

impl NodeData {
    /// Decode a fixed-size record already sliced to its full size. RTIP 3.1
    /// leaves need the surrounding buffer and go through [`read_node`].
    pub fn decode(kind: NodeKind, b: &[u8]) -> Self {
        match kind {
            NodeKind::Box32 => Self::Box32(Box32Node::decode(b)),
            NodeKind::Box16 => Self::Box16(Box16Node::decode(b)),
            NodeKind::QuantizedBvh8 => Self::QuantizedBvh8(QuantizedBvh8Node::decode(b)),
            NodeKind::Triangle(_) => Self::Triangle(TriangleNode::decode(b)),
            NodeKind::Procedural => Self::Procedural(ProceduralNode::decode(b)),
            NodeKind::Instance => Self::Instance(InstanceNode::decode(b)),
        }
    }

    pub fn is_box(&self) -> bool {
        matches!(self, Self::Box32(_) | Self::Box16(_) | Self::QuantizedBvh8(_))
    }

    /// Valid children in slot order; empty for leaves.
    pub fn child_refs(&self, rtip: RtIp) -> Result<SmallVec<[ChildRef; 8]>> {
        match self {
            Self::Box32(n) => n.child_refs(rtip),
            Self::Box16(n) => n.child_refs(rtip),
            Self::QuantizedBvh8(n) => n.child_refs(rtip),
            _ => Ok(SmallVec::new()),
        }
    }

    /// Triangles addressed by the leaf pointer `ptr`; empty for other nodes.
    pub fn leaf_triangles(&self, ptr: NodePointer, compression: TriangleCompressionMode) -> Vec<LeafTriangle> {
        match (self, ptr.kind()) {
            (Self::Triangle(t), NodeKind::Triangle(slot)) => TriangleNode::addressed_slots(slot, compression)
                .iter()
                .map(|s| LeafTriangle {
                    slot: *s,
                    location: PrimitiveLocation {
                        byte_offset: ptr.byte_offset(),
                        slot: *s,
                    },
                    triangle: t.triangle(*s, compression),
                    geometry_index: t.geometry_index(),
                    primitive_index: t.primitive_index(*s),
                    opaque: t.is_opaque(*s),
                })
                .collect(),
            (Self::PrimitiveRange(r), _) => r.leaf_triangles(),
            _ => Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Box32(_) => "box32",
            Self::Box16(_) => "box16",
            Self::QuantizedBvh8(_) => "bvh8",
            Self::Triangle(_) | Self::PrimitiveRange(_) => "triangle",
            Self::Procedural(_) => "procedural",
            Self::Instance(_) => "instance",
        }
    }
}

/// Read the record `ptr` addresses. `data` starts at the structure header.
pub fn read_node(data: &[u8], ptr: NodePointer, header: &AccelerationStructureHeader) -> Result<NodeData> {
    if ptr.rtip() == RtIp::Rtip31 && ptr.kind().is_leaf() {
        return read_rtip31_leaf(data, ptr, header);
    }
    let size = ptr.rtip().record_size(ptr.kind(), header);
    let b = record(data, ptr.byte_offset(), size, ptr.kind().name())?;
    Ok(NodeData::decode(ptr.kind(), b))
}

fn read_rtip31_leaf(data: &[u8], ptr: NodePointer, header: &AccelerationStructureHeader) -> Result<NodeData> {
    match ptr.kind() {
        NodeKind::Triangle(pair) => {
            PrimitiveRange::read(data, ptr, pair, header.offsets.geometry_info as u64).map(NodeData::PrimitiveRange)
        }
        NodeKind::Procedural => {
            let b = record(data, ptr.byte_offset(), PRIMITIVE_PACKET_SIZE, "primitive packet")?;
            ProceduralNode::from_packet(&PrimitivePacket::decode(b))
                .map(NodeData::Procedural)
                .ok_or_else(|| Error::invalid_pointer(ptr.encode(), "packet holds no procedural primitive"))
        }
        NodeKind::Instance => {
            let node = record(data, ptr.byte_offset(), INSTANCE_NODE_SIZE, "instance")?;
            let sideband = instance_sideband(data, ptr, header)?;
            Ok(NodeData::Instance(InstanceNode::decode_rtip31(node, sideband)))
        }
        other => Err(Error::invalid_pointer(ptr.encode(), format!("{} is not a leaf", other.name()))),
    }
}

/// Sideband record of the instance node at `ptr`: one per 128-byte slot of
/// the leaf section, stored from the geometry info offset.
fn instance_sideband<'a>(data: &'a [u8], ptr: NodePointer, header: &AccelerationStructureHeader) -> Result<&'a [u8]> {
    let offsets = &header.offsets;
    let slot = ptr
        .byte_offset()
        .checked_sub(offsets.leaf_nodes as u64)
        .ok_or_else(|| Error::invalid_pointer(ptr.encode(), "instance node before the leaf section"))?
        / INSTANCE_NODE_SIZE as u64;
    let at = offsets.geometry_info as u64 + slot * INSTANCE_SIDEBAND_SIZE as u64;
    if at + INSTANCE_SIDEBAND_SIZE as u64 > offsets.primitive_node_ptrs as u64 {
        return Err(Error::inconsistent(format!(
            "sideband of instance {} at {} runs past the sideband section",
            slot, at
        )));
    }
    section(data, at, INSTANCE_SIDEBAND_SIZE as u64, "instance sideband")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::header::{BuildFlags, BuildInfo, Fp16BoxMode, StructureType, TriangleCompressionMode};
    use crate::util::{Error, Vec3};

    fn header() -> AccelerationStructureHeader {
        let info = BuildInfo::new(
            StructureType::BottomLevel,
            TriangleCompressionMode::None,
            Fp16BoxMode::None,
            BuildFlags::default(),
        );
        AccelerationStructureHeader::new(RtIp::Rtip11, info)
    }

    #[test]
    fn test_read_node_dispatch() {
        let tri = TriangleNode::single([Vec3::ZERO, Vec3::X, Vec3::Y], 0, 0, 4);
        let mut data = vec![0u8; 128];
        data.extend_from_slice(&tri.encode());
        let ptr = NodePointer::new(RtIp::Rtip11, NodeKind::Triangle(0), 128).unwrap();
        let node = read_node(&data, ptr, &header()).unwrap();
        assert_eq!(node, NodeData::Triangle(tri));
        let leaf = node.leaf_triangles(ptr, TriangleCompressionMode::None);
        assert_eq!(leaf.len(), 1);
        assert_eq!(leaf[0].primitive_index, Some(4));
        assert_eq!(leaf[0].location, PrimitiveLocation { byte_offset: 128, slot: 0 });
        assert!(node.child_refs(RtIp::Rtip11).unwrap().is_empty());
    }

    #[test]
    fn test_read_node_truncated() {
        let data = vec![0u8; 128 + 61];
        let ptr = NodePointer::new(RtIp::Rtip11, NodeKind::Triangle(0), 128).unwrap();
        match read_node(&data, ptr, &header()) {
            Err(Error::TruncatedRecord { stride: 64, available: 61, .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
