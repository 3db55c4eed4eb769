//! Procedural (AABB) leaf records.

use super::primitive::{procedural_flags, PrimitivePacket};
use crate::bvh::format::LEAF_NODE_SIZE;
use crate::util::bytes::{read_aabb, read_u32, write_aabb, write_u32};
use crate::util::Aabb;

const GEOMETRY: usize = 48;
const RESERVED: usize = 52;
const PRIMITIVE: usize = 56;
const TRIANGLE_ID: usize = 60;

/// Procedural leaf: a user AABB with its geometry and primitive index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProceduralNode {
    pub bounds: Aabb,
    pub geometry_index_and_flags: u32,
    pub reserved: u32,
    pub primitive_index: u32,
    pub triangle_id: u32,
}

impl ProceduralNode {
    pub fn new(bounds: Aabb, geometry_index: u32, geometry_flags: u32, primitive_index: u32) -> Self {
        Self {
            bounds,
            geometry_index_and_flags: (geometry_flags << 24) | (geometry_index & 0x00FF_FFFF),
            reserved: 0,
            primitive_index,
            triangle_id: 0,
        }
    }

    pub fn decode(b: &[u8]) -> Self {
        Self {
            bounds: read_aabb(b, 0),
            geometry_index_and_flags: read_u32(b, GEOMETRY),
            reserved: read_u32(b, RESERVED),
            primitive_index: read_u32(b, PRIMITIVE),
            triangle_id: read_u32(b, TRIANGLE_ID),
        }
    }

    pub fn encode(&self) -> [u8; LEAF_NODE_SIZE] {
        let mut b = [0u8; LEAF_NODE_SIZE];
        write_aabb(&mut b, 0, &self.bounds);
        write_u32(&mut b, GEOMETRY, self.geometry_index_and_flags);
        write_u32(&mut b, RESERVED, self.reserved);
        write_u32(&mut b, PRIMITIVE, self.primitive_index);
        write_u32(&mut b, TRIANGLE_ID, self.triangle_id);
        b
    }

    /// Procedural primitive held by an RTIP 3.1 packet, if pair 0 is one.
    pub fn from_packet(packet: &PrimitivePacket) -> Option<Self> {
        let desc = packet.pair_desc(0);
        if !desc.is_procedural() {
            return None;
        }
        Some(Self::new(
            packet.procedural_bounds(),
            packet.geometry_index(0),
            procedural_flags(desc),
            packet.primitive_index(0),
        ))
    }

    #[inline]
    pub fn geometry_index(&self) -> u32 {
        self.geometry_index_and_flags & 0x00FF_FFFF
    }

    #[inline]
    pub fn geometry_flags(&self) -> u32 {
        self.geometry_index_and_flags >> 24
    }

    /// Inactive primitives carry a NaN min x.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.bounds.min.x.is_nan()
    }
}
