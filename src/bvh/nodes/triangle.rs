//! Triangle leaf records.
//!
//! A record holds up to five vertices shared by up to four triangles. The
//! words of the fifth vertex double as the geometry index and the primitive
//! indices of the first two triangles, so only pair-compressed records use
//! all five positions.

use crate::bvh::format::LEAF_NODE_SIZE;
use crate::bvh::header::TriangleCompressionMode;
use crate::util::bytes::{read_u32, read_vec3, write_u32, write_vec3};
use crate::util::{triangle_area, Aabb, Vec3};

const V4_GEOMETRY: usize = 48;
const V4_PRIM0: usize = 52;
const V4_PRIM1: usize = 56;
const TRIANGLE_ID: usize = 60;

const ID_BIT_STRIDE: u32 = 8;
const ID_I_SHIFT: u32 = 0;
const ID_J_SHIFT: u32 = 2;
const ID_OPAQUE_SHIFT: u32 = 7;

/// Vertex indices per slot without compression.
const SLOT_VERTICES: [[usize; 3]; 4] = [[0, 1, 2], [1, 3, 2], [2, 3, 4], [2, 4, 0]];

/// Packed vertex mapping per slot, one nibble per rotated corner.
const SLOT_VERTEX_MAPPING: [u32; 4] = [0x210, 0x231, 0x432, 0x042];

/// Geometry flag bits stored with the geometry index.
pub const GEOMETRY_FLAG_OPAQUE: u32 = 0x1;
pub const GEOMETRY_FLAG_NO_DUPLICATE_ANY_HIT: u32 = 0x2;

/// One triangle addressed by a leaf pointer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Vec3; 3],
    /// False for the padding sentinel (a NaN vertex x).
    pub is_valid: bool,
}

impl Triangle {
    pub fn area(&self) -> f32 {
        if self.is_valid {
            triangle_area(self.vertices[0], self.vertices[1], self.vertices[2])
        } else {
            0.0
        }
    }

    pub fn bounds(&self) -> Aabb {
        if self.is_valid {
            Aabb::from_points(&self.vertices)
        } else {
            Aabb::EMPTY
        }
    }
}

/// Raw triangle leaf record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleNode {
    /// Vertex positions; `vertices[4]` is metadata except under pair compression.
    pub vertices: [Vec3; 5],
    pub triangle_id: u32,
}

impl Default for TriangleNode {
    fn default() -> Self {
        let mut node = Self {
            vertices: [Vec3::ZERO; 5],
            triangle_id: 0,
        };
        node.set_triangle_id(0, 0, false);
        node
    }
}

impl TriangleNode {
    pub fn decode(b: &[u8]) -> Self {
        let mut vertices = [Vec3::ZERO; 5];
        for (i, v) in vertices.iter_mut().enumerate() {
            *v = read_vec3(b, i * 12);
        }
        Self {
            vertices,
            triangle_id: read_u32(b, TRIANGLE_ID),
        }
    }

    pub fn encode(&self) -> [u8; LEAF_NODE_SIZE] {
        let mut b = [0u8; LEAF_NODE_SIZE];
        for (i, v) in self.vertices.iter().enumerate() {
            write_vec3(&mut b, i * 12, *v);
        }
        write_u32(&mut b, TRIANGLE_ID, self.triangle_id);
        b
    }

    /// Record with one triangle in slot 0.
    pub fn single(vertices: [Vec3; 3], geometry_index: u32, geometry_flags: u32, primitive_index: u32) -> Self {
        let mut node = Self::default();
        node.vertices[..3].copy_from_slice(&vertices);
        node.set_geometry_index_and_flags(geometry_index, geometry_flags);
        node.set_primitive_index(0, primitive_index);
        node.set_triangle_id(0, 0, geometry_flags & GEOMETRY_FLAG_OPAQUE != 0);
        node
    }

    /// Record with two triangles sharing an edge: (v0, v1, v2) and (v1, v3, v2).
    pub fn pair(
        vertices: [Vec3; 4],
        geometry_index: u32,
        geometry_flags: u32,
        primitive_indices: [u32; 2],
    ) -> Self {
        let mut node = Self::default();
        node.vertices[..4].copy_from_slice(&vertices);
        node.set_geometry_index_and_flags(geometry_index, geometry_flags);
        node.set_primitive_index(0, primitive_indices[0]);
        node.set_primitive_index(1, primitive_indices[1]);
        let opaque = geometry_flags & GEOMETRY_FLAG_OPAQUE != 0;
        node.set_triangle_id(0, 0, opaque);
        node.set_triangle_id(1, 0, opaque);
        node
    }

    fn meta(&self, pos: usize) -> u32 {
        let axis = (pos - V4_GEOMETRY) / 4;
        self.vertices[4].to_array()[axis].to_bits()
    }

    fn set_meta(&mut self, pos: usize, value: u32) {
        let axis = (pos - V4_GEOMETRY) / 4;
        let mut v = self.vertices[4].to_array();
        v[axis] = f32::from_bits(value);
        self.vertices[4] = Vec3::from_array(v);
    }

    pub fn geometry_index(&self) -> u32 {
        self.meta(V4_GEOMETRY) & 0x00FF_FFFF
    }

    pub fn geometry_flags(&self) -> u32 {
        (self.meta(V4_GEOMETRY) >> 24) & 0x3
    }

    pub fn set_geometry_index_and_flags(&mut self, index: u32, flags: u32) {
        self.set_meta(V4_GEOMETRY, (flags << 24) | (index & 0x00FF_FFFF));
    }

    /// Primitive index of triangle 0 or 1; higher slots have none.
    pub fn primitive_index(&self, slot: u8) -> Option<u32> {
        match slot {
            0 => Some(self.meta(V4_PRIM0)),
            1 => Some(self.meta(V4_PRIM1)),
            _ => None,
        }
    }

    pub fn set_primitive_index(&mut self, slot: u8, index: u32) {
        match slot {
            0 => self.set_meta(V4_PRIM0, index),
            1 => self.set_meta(V4_PRIM1, index),
            _ => {}
        }
    }

    /// Write the rotation and opaque bits of `slot` into the triangle id.
    pub fn set_triangle_id(&mut self, slot: u8, rotation: u32, opaque: bool) {
        let shift = slot as u32 * ID_BIT_STRIDE;
        let mut id = self.triangle_id & !(0xFF << shift);
        id |= ((rotation + 1) % 3) << (shift + ID_I_SHIFT);
        id |= ((rotation + 2) % 3) << (shift + ID_J_SHIFT);
        if opaque {
            id |= 1 << (shift + ID_OPAQUE_SHIFT);
        }
        self.triangle_id = id;
    }

    /// Vertex indices of `slot`, honoring the triangle id rotation when
    /// compression is enabled.
    pub fn vertex_indices(&self, slot: u8, compression: TriangleCompressionMode) -> [usize; 3] {
        let slot = (slot & 0x3) as usize;
        if compression == TriangleCompressionMode::None {
            return SLOT_VERTICES[slot];
        }
        let shift = slot as u32 * ID_BIT_STRIDE;
        let swizzle_y = (self.triangle_id >> (shift + ID_I_SHIFT)) % 4;
        let swizzle_z = (self.triangle_id >> (shift + ID_J_SHIFT)) % 4;
        // Corrupt ids can overflow the three corners; fall back to the plain order.
        let Some(swizzle_x) = 3u32.checked_sub(swizzle_y + swizzle_z) else {
            return SLOT_VERTICES[slot];
        };
        let mapping = SLOT_VERTEX_MAPPING[slot];
        let corner = |s: u32| ((mapping >> (s * 4)) & 0xF) as usize;
        [corner(swizzle_x), corner(swizzle_y), corner(swizzle_z)]
    }

    /// Triangle in `slot`.
    pub fn triangle(&self, slot: u8, compression: TriangleCompressionMode) -> Triangle {
        let idx = self.vertex_indices(slot, compression);
        let vertices = [self.vertices[idx[0]], self.vertices[idx[1]], self.vertices[idx[2]]];
        let is_valid = !vertices.iter().any(|v| v.x.is_nan());
        Triangle { vertices, is_valid }
    }

    /// Triangles addressed by a pointer with `slot`: a slot 1 pointer under
    /// pair compression covers both triangles of the pair. A record has four
    /// slots, so higher tags address nothing.
    pub fn addressed_slots(slot: u8, compression: TriangleCompressionMode) -> &'static [u8] {
        match (slot, compression) {
            (1, TriangleCompressionMode::PairTriangles) => &[0, 1],
            (0, _) => &[0],
            (1, _) => &[1],
            (2, _) => &[2],
            (3, _) => &[3],
            _ => &[],
        }
    }

    /// Triangles addressed by a pointer with `slot`.
    pub fn triangles(&self, slot: u8, compression: TriangleCompressionMode) -> Vec<Triangle> {
        Self::addressed_slots(slot, compression)
            .iter()
            .map(|s| self.triangle(*s, compression))
            .collect()
    }

    pub fn is_opaque(&self, slot: u8) -> bool {
        let shift = (slot & 0x3) as u32 * ID_BIT_STRIDE;
        (self.triangle_id >> (shift + ID_OPAQUE_SHIFT)) & 1 != 0
    }

    /// Bounds of every valid triangle addressed by `slot`.
    pub fn bounds(&self, slot: u8, compression: TriangleCompressionMode) -> Aabb {
        self.triangles(slot, compression)
            .iter()
            .fold(Aabb::EMPTY, |acc, t| acc.union(&t.bounds()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri() -> [Vec3; 3] {
        [Vec3::ZERO, Vec3::X, Vec3::Y]
    }

    #[test]
    fn test_metadata_words() {
        let node = TriangleNode::single(tri(), 0x12_3456, GEOMETRY_FLAG_OPAQUE, 99);
        let bytes = node.encode();
        assert_eq!(read_u32(&bytes, 48), 0x0112_3456);
        assert_eq!(read_u32(&bytes, 52), 99);
        let back = TriangleNode::decode(&bytes);
        assert_eq!(back.geometry_index(), 0x12_3456);
        assert_eq!(back.geometry_flags(), GEOMETRY_FLAG_OPAQUE);
        assert_eq!(back.primitive_index(0), Some(99));
        assert_eq!(back.primitive_index(2), None);
        assert!(back.is_opaque(0));
    }

    #[test]
    fn test_slot_vertices() {
        let node = TriangleNode::single(tri(), 0, 0, 0);
        let t = node.triangle(0, TriangleCompressionMode::None);
        assert_eq!(t.vertices, tri());
        assert!(t.is_valid);
        assert!((t.area() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_pair_compression() {
        let quad = [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(1.0, 1.0, 0.0)];
        let node = TriangleNode::pair(quad, 3, 0, [10, 11]);
        let tris = node.triangles(1, TriangleCompressionMode::PairTriangles);
        assert_eq!(tris.len(), 2);
        // Rotation zero keeps the plain vertex order
        assert_eq!(tris[0].vertices, [quad[0], quad[1], quad[2]]);
        assert_eq!(tris[1].vertices, [quad[1], quad[3], quad[2]]);
        assert_eq!(node.triangles(1, TriangleCompressionMode::None).len(), 1);
        assert_eq!(node.primitive_index(1), Some(11));
    }

    #[test]
    fn test_slots_past_record() {
        let node = TriangleNode::single(tri(), 0, 0, 0);
        assert_eq!(TriangleNode::addressed_slots(3, TriangleCompressionMode::None), &[3]);
        for slot in 4..12 {
            assert!(TriangleNode::addressed_slots(slot, TriangleCompressionMode::None).is_empty());
            assert!(node.triangles(slot, TriangleCompressionMode::PairTriangles).is_empty());
            assert!(node.bounds(slot, TriangleCompressionMode::None).is_empty());
        }
    }

    #[test]
    fn test_degenerate_sentinel() {
        let mut node = TriangleNode::single(tri(), 0, 0, 0);
        node.vertices[1].x = f32::NAN;
        let t = node.triangle(0, TriangleCompressionMode::None);
        assert!(!t.is_valid);
        assert_eq!(t.area(), 0.0);
        assert!(t.bounds().is_empty());
    }
}
