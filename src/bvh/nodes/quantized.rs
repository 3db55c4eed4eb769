//! RTIP 3.1 quantized eight-wide box node.
//!
//! Child bounds are stored as 12-bit planes relative to a per-node origin and
//! per-axis power-of-two exponent. Child pointers are not stored: they are
//! rebuilt from two running offsets (one for box children, one for leaf
//! children) advanced by each child's node range.

use smallvec::SmallVec;

use super::ChildRef;
use crate::bvh::format::{BVH8_CHILD_COUNT, QUANTIZED_BVH8_NODE_SIZE};
use crate::bvh::node_pointer::NodePointer;
use crate::bvh::rtip::RtIp;
use crate::util::bytes::{bit_field, read_u32, read_vec3, set_bit_field, write_u32, write_vec3};
use crate::util::{Aabb, Result, Vec3};

const INTERNAL_BASE: usize = 0;
const LEAF_BASE: usize = 4;
const PARENT: usize = 8;
const ORIGIN: usize = 12;
const PACKED: usize = 24;
const OBB_INDEX: usize = 28;
const CHILD_INFOS: usize = 32;
const CHILD_INFO_SIZE: usize = 12;

/// Node type tag of a box child.
pub const BVH8_NODE_TYPE: u32 = 5;

/// OBB matrix index meaning "no oriented box".
pub const OBB_DISABLED: u32 = 0x7F;

/// Plane precision in bits.
pub const PLANE_BITS: u32 = 12;

const PLANE_MAX: u32 = (1 << PLANE_BITS) - 1;

// ============================================================================
// Plane quantization
// ============================================================================

/// Decode a quantized plane.
///
/// Bit-exact with the hardware: the plane is turned into a float of
/// magnitude `plane * 2^(exponent - 139)` directly in the IEEE bit pattern,
/// flushing to zero when the result would be denormal, then added to origin.
pub fn dequantize(origin: f32, exponent: u32, plane: u32) -> f32 {
    let mut bits = 0u32;
    if plane != 0 {
        let signed_pos = (31 - plane.leading_zeros()) as i32 - PLANE_BITS as i32;
        let signed_exp = signed_pos + exponent as i32;
        if signed_exp > 0 {
            let shift = (23 - PLANE_BITS as i32 - signed_pos) as u32;
            bits = (plane << shift) & 0x7F_FFFF;
            bits |= ((signed_exp as u32) << 23) & 0x7FFF_FFFF;
        }
    }
    f32::from_bits(bits) + origin
}

/// Smallest f32 strictly greater than a non-negative finite `v`.
fn next_up_positive(v: f32) -> f32 {
    if v == 0.0 {
        f32::from_bits(1)
    } else {
        f32::from_bits(v.to_bits() + 1)
    }
}

/// Per-axis exponents able to span `[min, max]` with 4096 steps.
///
/// Exponents below 13 cannot address every plane value, so they are raised
/// to 13; zero is kept for flat extents.
pub fn compute_exponents(min: Vec3, max: Vec3) -> [u32; 3] {
    let mut out = [0u32; 3];
    let lo = min.to_array();
    let hi = max.to_array();
    for axis in 0..3 {
        // Round the extent up so the MSB of a large min is not lost.
        let exact = hi[axis] as f64 - lo[axis] as f64;
        let mut extent = (hi[axis] - lo[axis]).max(0.0);
        if (extent as f64) < exact {
            extent = next_up_positive(extent);
        }
        let e = (extent.to_bits() + 0x7F_FFFF) >> 23;
        out[axis] = if e == 0 { 0 } else { e.max(13).min(253) };
    }
    out
}

fn plane_scale(exponent: u32) -> f64 {
    2f64.powi(139 - exponent as i32)
}

/// Quantize a min plane, rounding down so the decoded plane is <= `value`.
pub fn quantize_min(value: f32, origin: f32, exponent: u32) -> u32 {
    if exponent == 0 {
        return 0;
    }
    let f = ((value as f64 - origin as f64) * plane_scale(exponent)).floor();
    let mut q = f.clamp(0.0, PLANE_MAX as f64) as u32;
    while q > 0 && dequantize(origin, exponent, q) > value {
        q -= 1;
    }
    q
}

/// Quantize a max plane, rounding up so the decoded plane (`q + 1`) is
/// >= `value`. Returns the stored 12-bit value.
pub fn quantize_max(value: f32, origin: f32, exponent: u32) -> u32 {
    if exponent == 0 {
        return 0;
    }
    let f = ((value as f64 - origin as f64) * plane_scale(exponent)).ceil();
    let mut q = f.clamp(1.0, (PLANE_MAX + 1) as f64) as u32;
    while q <= PLANE_MAX && dequantize(origin, exponent, q) < value {
        q += 1;
    }
    q - 1
}

// ============================================================================
// Child info
// ============================================================================

/// Packed per-child bounds, flags and pointer range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildInfo {
    pub words: [u32; 3],
}

impl ChildInfo {
    /// Marker stored in unused child slots.
    pub const INVALID: Self = Self {
        words: [0xFFFF_FFFF, 0, 0],
    };

    pub fn pack(q_min: [u32; 3], q_max: [u32; 3], culling: u32, instance_mask: u32, node_type: u32, range: u32) -> Self {
        let mut w = [0u32; 3];
        w[0] = set_bit_field(w[0], 0, 12, q_min[0]);
        w[0] = set_bit_field(w[0], 12, 12, q_min[1]);
        w[0] = set_bit_field(w[0], 24, 4, culling);
        w[1] = set_bit_field(w[1], 0, 12, q_min[2]);
        w[1] = set_bit_field(w[1], 12, 12, q_max[0]);
        w[1] = set_bit_field(w[1], 24, 8, instance_mask);
        w[2] = set_bit_field(w[2], 0, 12, q_max[1]);
        w[2] = set_bit_field(w[2], 12, 12, q_max[2]);
        w[2] = set_bit_field(w[2], 24, 4, node_type);
        w[2] = set_bit_field(w[2], 28, 4, range);
        Self { words: w }
    }

    pub fn q_min(&self) -> [u32; 3] {
        [
            bit_field(self.words[0], 0, 12),
            bit_field(self.words[0], 12, 12),
            bit_field(self.words[1], 0, 12),
        ]
    }

    pub fn q_max(&self) -> [u32; 3] {
        [
            bit_field(self.words[1], 12, 12),
            bit_field(self.words[2], 0, 12),
            bit_field(self.words[2], 12, 12),
        ]
    }

    pub fn culling_flags(&self) -> u32 {
        bit_field(self.words[0], 24, 4)
    }

    pub fn instance_mask(&self) -> u32 {
        bit_field(self.words[1], 24, 8)
    }

    pub fn node_type(&self) -> u32 {
        bit_field(self.words[2], 24, 4)
    }

    /// Number of consecutive 128-byte nodes this child spans.
    pub fn node_range(&self) -> u32 {
        bit_field(self.words[2], 28, 4)
    }

    pub fn is_valid(&self) -> bool {
        let [min_x, min_y, _] = self.q_min();
        let [_, max_y, max_z] = self.q_max();
        !(min_x == PLANE_MAX && min_y == PLANE_MAX && max_y == 0 && max_z == 0)
    }

    pub fn decode_bounds(&self, origin: Vec3, exponents: [u32; 3]) -> Aabb {
        let o = origin.to_array();
        let q_min = self.q_min();
        let q_max = self.q_max();
        let mut lo = [0f32; 3];
        let mut hi = [0f32; 3];
        for axis in 0..3 {
            lo[axis] = dequantize(o[axis], exponents[axis], q_min[axis]);
            hi[axis] = dequantize(o[axis], exponents[axis], q_max[axis] + 1);
        }
        Aabb::new(Vec3::from_array(lo), Vec3::from_array(hi))
    }
}

// ============================================================================
// Node
// ============================================================================

/// Child description used when building a node.
#[derive(Debug, Clone, Copy)]
pub struct QuantizedChild {
    pub bounds: Aabb,
    /// Pointer tag of the child (5 for boxes).
    pub node_type: u32,
    /// 128-byte slots spanned by the child.
    pub range: u32,
    pub instance_mask: u8,
}

/// Quantized eight-wide box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizedBvh8Node {
    /// Base of box children, in pointer units (byte offset >> 3).
    pub internal_base: u32,
    /// Base of leaf children, in pointer units.
    pub leaf_base: u32,
    pub parent_pointer: u32,
    pub origin: Vec3,
    pub packed: u32,
    pub obb_matrix_index: u32,
    pub child_infos: [ChildInfo; BVH8_CHILD_COUNT],
}

impl Default for QuantizedBvh8Node {
    fn default() -> Self {
        Self {
            internal_base: 0,
            leaf_base: 0,
            parent_pointer: crate::bvh::format::INVALID_NODE,
            origin: Vec3::ZERO,
            packed: 0,
            obb_matrix_index: OBB_DISABLED,
            child_infos: [ChildInfo::INVALID; BVH8_CHILD_COUNT],
        }
    }
}

impl QuantizedBvh8Node {
    pub fn decode(b: &[u8]) -> Self {
        let mut child_infos = [ChildInfo::default(); BVH8_CHILD_COUNT];
        for (i, info) in child_infos.iter_mut().enumerate() {
            let at = CHILD_INFOS + i * CHILD_INFO_SIZE;
            info.words = [read_u32(b, at), read_u32(b, at + 4), read_u32(b, at + 8)];
        }
        Self {
            internal_base: read_u32(b, INTERNAL_BASE),
            leaf_base: read_u32(b, LEAF_BASE),
            parent_pointer: read_u32(b, PARENT),
            origin: read_vec3(b, ORIGIN),
            packed: read_u32(b, PACKED),
            obb_matrix_index: read_u32(b, OBB_INDEX),
            child_infos,
        }
    }

    pub fn encode(&self) -> [u8; QUANTIZED_BVH8_NODE_SIZE] {
        let mut b = [0u8; QUANTIZED_BVH8_NODE_SIZE];
        write_u32(&mut b, INTERNAL_BASE, self.internal_base);
        write_u32(&mut b, LEAF_BASE, self.leaf_base);
        write_u32(&mut b, PARENT, self.parent_pointer);
        write_vec3(&mut b, ORIGIN, self.origin);
        write_u32(&mut b, PACKED, self.packed);
        write_u32(&mut b, OBB_INDEX, self.obb_matrix_index);
        for (i, info) in self.child_infos.iter().enumerate() {
            let at = CHILD_INFOS + i * CHILD_INFO_SIZE;
            for (j, w) in info.words.iter().enumerate() {
                write_u32(&mut b, at + j * 4, *w);
            }
        }
        b
    }

    /// Build a node over `children` (at most eight, box children first in
    /// slot order is not required).
    pub fn build(
        children: &[QuantizedChild],
        internal_base: u32,
        leaf_base: u32,
        parent_pointer: u32,
        index_in_parent: u32,
    ) -> Self {
        let mut node = Self {
            internal_base,
            leaf_base,
            parent_pointer,
            ..Self::default()
        };
        let count = children.len().min(BVH8_CHILD_COUNT);
        if count == 0 {
            return node;
        }
        let bounds = children[..count]
            .iter()
            .fold(Aabb::EMPTY, |acc, c| acc.union(&c.bounds));
        let exponents = compute_exponents(bounds.min, bounds.max);
        node.origin = bounds.min;
        node.packed = Self::pack_word(exponents, false, index_in_parent, count as u32);
        let o = node.origin.to_array();
        for (slot, child) in children[..count].iter().enumerate() {
            let lo = child.bounds.min.to_array();
            let hi = child.bounds.max.to_array();
            let mut q_min = [0u32; 3];
            let mut q_max = [0u32; 3];
            for axis in 0..3 {
                q_min[axis] = quantize_min(lo[axis], o[axis], exponents[axis]);
                q_max[axis] = quantize_max(hi[axis], o[axis], exponents[axis]);
            }
            node.child_infos[slot] = ChildInfo::pack(
                q_min,
                q_max,
                0,
                child.instance_mask as u32,
                child.node_type,
                child.range,
            );
        }
        node
    }

    pub fn pack_word(exponents: [u32; 3], disable_sort: bool, index_in_parent: u32, valid_count: u32) -> u32 {
        let mut w = 0;
        w = set_bit_field(w, 0, 8, exponents[0]);
        w = set_bit_field(w, 8, 8, exponents[1]);
        w = set_bit_field(w, 16, 8, exponents[2]);
        w = set_bit_field(w, 24, 1, disable_sort as u32);
        w = set_bit_field(w, 25, 3, index_in_parent);
        set_bit_field(w, 28, 3, valid_count.saturating_sub(1))
    }

    pub fn exponents(&self) -> [u32; 3] {
        [
            bit_field(self.packed, 0, 8),
            bit_field(self.packed, 8, 8),
            bit_field(self.packed, 16, 8),
        ]
    }

    pub fn disable_box_sort(&self) -> bool {
        bit_field(self.packed, 24, 1) != 0
    }

    pub fn index_in_parent(&self) -> u32 {
        bit_field(self.packed, 25, 3)
    }

    /// Valid children, packed at the front of the slot array.
    pub fn valid_child_count(&self) -> usize {
        1 + bit_field(self.packed, 28, 3) as usize
    }

    /// Raw child pointers rebuilt from the running offsets.
    pub fn child_pointers(&self) -> SmallVec<[u32; 8]> {
        let mut internal = self.internal_base | BVH8_NODE_TYPE;
        let mut primitive = self.leaf_base;
        let mut out = SmallVec::new();
        for info in &self.child_infos[..self.valid_child_count()] {
            if info.node_type() == BVH8_NODE_TYPE {
                out.push(internal);
                internal = internal.wrapping_add(info.node_range() << 4);
            } else {
                out.push(primitive | info.node_type());
                primitive = primitive.wrapping_add(info.node_range() << 4);
            }
        }
        out
    }

    pub fn child_refs(&self, rtip: RtIp) -> Result<SmallVec<[ChildRef; 8]>> {
        let exponents = self.exponents();
        let mut out = SmallVec::new();
        for (raw, info) in self.child_pointers().iter().zip(self.child_infos.iter()) {
            out.push(ChildRef {
                pointer: NodePointer::decode(rtip, *raw)?,
                bounds: info.decode_bounds(self.origin, exponents),
            });
        }
        Ok(out)
    }

    pub fn bounds(&self) -> Aabb {
        let exponents = self.exponents();
        self.child_infos[..self.valid_child_count()]
            .iter()
            .fold(Aabb::EMPTY, |acc, info| acc.union(&info.decode_bounds(self.origin, exponents)))
    }
}
