//! Four-wide RTIP 1.1 box nodes.

use half::f16;
use smallvec::SmallVec;

use super::ChildRef;
use crate::bvh::format::{BOX16_NODE_SIZE, BOX32_NODE_SIZE, BOX_CHILD_COUNT, INVALID_NODE};
use crate::bvh::node_pointer::NodePointer;
use crate::bvh::rtip::RtIp;
use crate::util::bytes::{read_aabb, read_f16, read_u32, write_aabb, write_f16, write_u32};
use crate::util::{Aabb, Result, Vec3};

const CHILD_BOUNDS: usize = 16;

/// Box node with full precision child bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Box32Node {
    pub children: [u32; BOX_CHILD_COUNT],
    pub bounds: [Aabb; BOX_CHILD_COUNT],
    /// Trailing 32 bytes; carried through unchanged.
    pub reserved: [u32; 8],
}

impl Default for Box32Node {
    fn default() -> Self {
        Self {
            children: [INVALID_NODE; BOX_CHILD_COUNT],
            bounds: [Aabb::EMPTY; BOX_CHILD_COUNT],
            reserved: [0; 8],
        }
    }
}

impl Box32Node {
    pub fn decode(b: &[u8]) -> Self {
        let mut node = Self::default();
        for i in 0..BOX_CHILD_COUNT {
            node.children[i] = read_u32(b, i * 4);
            node.bounds[i] = read_aabb(b, CHILD_BOUNDS + i * 24);
        }
        for (i, r) in node.reserved.iter_mut().enumerate() {
            *r = read_u32(b, 112 + i * 4);
        }
        node
    }

    pub fn encode(&self) -> [u8; BOX32_NODE_SIZE] {
        let mut b = [0u8; BOX32_NODE_SIZE];
        for i in 0..BOX_CHILD_COUNT {
            write_u32(&mut b, i * 4, self.children[i]);
            write_aabb(&mut b, CHILD_BOUNDS + i * 24, &self.bounds[i]);
        }
        for (i, r) in self.reserved.iter().enumerate() {
            write_u32(&mut b, 112 + i * 4, *r);
        }
        b
    }

    /// Valid children in slot order.
    pub fn child_refs(&self, rtip: RtIp) -> Result<SmallVec<[ChildRef; 8]>> {
        let mut out = SmallVec::new();
        for (raw, bounds) in self.children.iter().zip(self.bounds.iter()) {
            if *raw != INVALID_NODE {
                out.push(ChildRef {
                    pointer: NodePointer::decode(rtip, *raw)?,
                    bounds: *bounds,
                });
            }
        }
        Ok(out)
    }

    /// Union of all valid child bounds.
    pub fn bounds(&self) -> Aabb {
        self.children
            .iter()
            .zip(self.bounds.iter())
            .filter(|(raw, _)| **raw != INVALID_NODE)
            .fold(Aabb::EMPTY, |acc, (_, b)| acc.union(b))
    }
}

/// Box node with half precision child bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Box16Node {
    pub children: [u32; BOX_CHILD_COUNT],
    /// Per child: min xyz then max xyz.
    pub half_bounds: [[f16; 6]; BOX_CHILD_COUNT],
}

impl Default for Box16Node {
    fn default() -> Self {
        Self {
            children: [INVALID_NODE; BOX_CHILD_COUNT],
            half_bounds: [[f16::ZERO; 6]; BOX_CHILD_COUNT],
        }
    }
}

impl Box16Node {
    pub fn decode(b: &[u8]) -> Self {
        let mut node = Self::default();
        for i in 0..BOX_CHILD_COUNT {
            node.children[i] = read_u32(b, i * 4);
            for (j, h) in node.half_bounds[i].iter_mut().enumerate() {
                *h = read_f16(b, CHILD_BOUNDS + i * 12 + j * 2);
            }
        }
        node
    }

    pub fn encode(&self) -> [u8; BOX16_NODE_SIZE] {
        let mut b = [0u8; BOX16_NODE_SIZE];
        for i in 0..BOX_CHILD_COUNT {
            write_u32(&mut b, i * 4, self.children[i]);
            for (j, h) in self.half_bounds[i].iter().enumerate() {
                write_f16(&mut b, CHILD_BOUNDS + i * 12 + j * 2, *h);
            }
        }
        b
    }

    /// Compress full precision bounds, rounding outward so each stored box
    /// contains its source box.
    pub fn from_bounds(children: [u32; BOX_CHILD_COUNT], bounds: &[Aabb; BOX_CHILD_COUNT]) -> Self {
        let mut half_bounds = [[f16::ZERO; 6]; BOX_CHILD_COUNT];
        for (dst, src) in half_bounds.iter_mut().zip(bounds.iter()) {
            let lo = src.min.to_array();
            let hi = src.max.to_array();
            for axis in 0..3 {
                dst[axis] = f16_round_down(lo[axis]);
                dst[axis + 3] = f16_round_up(hi[axis]);
            }
        }
        Self { children, half_bounds }
    }

    /// Child box `i` widened to f32. Every f16 is exactly representable in
    /// f32, so the widened box is identical to the stored one.
    pub fn expanded_bounds(&self, i: usize) -> Aabb {
        let h = &self.half_bounds[i];
        Aabb::new(
            Vec3::new(h[0].to_f32(), h[1].to_f32(), h[2].to_f32()),
            Vec3::new(h[3].to_f32(), h[4].to_f32(), h[5].to_f32()),
        )
    }

    pub fn child_refs(&self, rtip: RtIp) -> Result<SmallVec<[ChildRef; 8]>> {
        let mut out = SmallVec::new();
        for (i, raw) in self.children.iter().enumerate() {
            if *raw != INVALID_NODE {
                out.push(ChildRef {
                    pointer: NodePointer::decode(rtip, *raw)?,
                    bounds: self.expanded_bounds(i),
                });
            }
        }
        Ok(out)
    }

    pub fn bounds(&self) -> Aabb {
        (0..BOX_CHILD_COUNT)
            .filter(|i| self.children[*i] != INVALID_NODE)
            .fold(Aabb::EMPTY, |acc, i| acc.union(&self.expanded_bounds(i)))
    }
}

/// Largest f16 not greater than `v`.
pub(crate) fn f16_round_down(v: f32) -> f16 {
    let h = f16::from_f32(v);
    if h.is_nan() || h.to_f32() <= v {
        h
    } else {
        f16_step_down(h)
    }
}

/// Smallest f16 not less than `v`.
pub(crate) fn f16_round_up(v: f32) -> f16 {
    let h = f16::from_f32(v);
    if h.is_nan() || h.to_f32() >= v {
        h
    } else {
        f16_step_up(h)
    }
}

fn f16_step_down(h: f16) -> f16 {
    let bits = h.to_bits();
    if bits == 0x0000 || bits == 0x8000 {
        // Smallest negative subnormal
        f16::from_bits(0x8001)
    } else if bits & 0x8000 == 0 {
        f16::from_bits(bits - 1)
    } else {
        f16::from_bits(bits + 1)
    }
}

fn f16_step_up(h: f16) -> f16 {
    -f16_step_down(-h)
}
