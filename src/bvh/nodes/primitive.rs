//! RTIP 3.1 primitive packets.
//!
//! A packet is a 1024-bit block holding up to eight triangle pairs over at
//! most sixteen shared vertices. Vertex components share a per-axis prefix
//! taken from vertex 0 and a common run of trailing zeros, so only the middle
//! bits of each component are stored. Geometry and primitive indices sit on
//! either side of a movable midpoint: an anchor, then per-triangle payloads
//! that replace the anchor's low bits. Pair descriptors are packed down from
//! the top end of the block.
//!
//! A leaf pointer names a packet and the pair its range starts at. The range
//! runs to the first pair with the stop bit set and may continue at pair 0 of
//! the following packet.

use smallvec::{smallvec, SmallVec};

use super::triangle::{Triangle, GEOMETRY_FLAG_OPAQUE};
use super::LeafTriangle;
use crate::bvh::format::PRIMITIVE_PACKET_SIZE;
use crate::bvh::index_map::PrimitiveLocation;
use crate::bvh::node_pointer::NodePointer;
use crate::util::bytes::{bit_field, read_u32, record, set_bit_field, write_u32};
use crate::util::{Aabb, Error, Result, Vec3};

const PACKET_DWORDS: usize = PRIMITIVE_PACKET_SIZE / 4;
const PACKET_BITS: u32 = 1024;
const HEADER_BITS: u32 = 52;
const DATA_BITS: u32 = PACKET_BITS - HEADER_BITS;
const PAIR_DESC_BITS: u32 = 29;

/// Triangle pairs in one packet, and in one leaf range.
pub const MAX_PAIRS: usize = 8;

/// Unique vertices in one packet.
pub const MAX_VERTICES: usize = 16;

/// Vertex index that marks a procedural pair when used for both v0 and v1.
const PROCEDURAL_VERTEX: u32 = 0xF;

// Header dword 0
const PAYLOAD_SHIFT: [u32; 3] = [0, 5, 10];
const TRAILING_ZERO_SHIFT: u32 = 15;
const GEO_ANCHOR_SHIFT: u32 = 20;
const GEO_PAYLOAD_SHIFT: u32 = 24;
const PAIR_COUNT_SHIFT: u32 = 28;
const VERTEX_TYPE_SHIFT: u32 = 31;

// Header dword 1
const PRIM_ANCHOR_SHIFT: u32 = 0;
const PRIM_PAYLOAD_SHIFT: u32 = 5;
const MIDPOINT_SHIFT: u32 = 10;

// Procedural packets: full precision min and max, 30-bit geometry and
// 31-bit primitive anchors, no payloads.
const PROCEDURAL_GEO_ANCHOR_BITS: u32 = 30;
const PROCEDURAL_PRIM_ANCHOR_BITS: u32 = 31;
const PROCEDURAL_MIDPOINT: u32 = PACKET_BITS - PAIR_DESC_BITS - 32;

#[inline]
fn low_mask(len: u32) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

/// Bits needed to hold `v`.
#[inline]
fn bit_length(v: u32) -> u32 {
    32 - v.leading_zeros()
}

// ============================================================================
// Pair descriptor
// ============================================================================

/// 29-bit triangle pair descriptor.
///
/// Bit 0 ends a leaf range. Each triangle then has a double-sided bit, an
/// opaque bit and three 4-bit vertex indices: triangle 1 from bit 1,
/// triangle 0 from bit 15.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrianglePairDesc(pub u32);

impl TrianglePairDesc {
    const RANGE_STOP: u32 = 0;
    const TRI1_BASE: u32 = 1;
    const TRI0_BASE: u32 = 15;

    #[inline]
    fn base(tri: u8) -> u32 {
        if tri == 0 {
            Self::TRI0_BASE
        } else {
            Self::TRI1_BASE
        }
    }

    pub fn indices(self, tri: u8) -> [u32; 3] {
        let b = Self::base(tri) + 2;
        [bit_field(self.0, b, 4), bit_field(self.0, b + 4, 4), bit_field(self.0, b + 8, 4)]
    }

    pub fn is_double_sided(self, tri: u8) -> bool {
        bit_field(self.0, Self::base(tri), 1) != 0
    }

    pub fn is_opaque(self, tri: u8) -> bool {
        bit_field(self.0, Self::base(tri) + 1, 1) != 0
    }

    #[inline]
    pub fn range_stop(self) -> bool {
        bit_field(self.0, Self::RANGE_STOP, 1) != 0
    }

    /// Triangle 1 is present when any of its indices is non-zero.
    #[inline]
    pub fn has_second(self) -> bool {
        self.indices(1) != [0; 3]
    }

    #[inline]
    pub fn triangle_count(self) -> u32 {
        1 + self.has_second() as u32
    }

    pub fn is_procedural(self) -> bool {
        let [v0, v1, _] = self.indices(0);
        v0 == PROCEDURAL_VERTEX && v1 == PROCEDURAL_VERTEX
    }

    pub fn set_triangle(&mut self, tri: u8, indices: [u32; 3], opaque: bool) {
        let b = Self::base(tri);
        self.0 = set_bit_field(self.0, b + 1, 1, opaque as u32);
        for (i, v) in indices.iter().enumerate() {
            self.0 = set_bit_field(self.0, b + 2 + 4 * i as u32, 4, *v);
        }
    }

    pub fn set_range_stop(&mut self, stop: bool) {
        self.0 = set_bit_field(self.0, Self::RANGE_STOP, 1, stop as u32);
    }
}

// ============================================================================
// Packet
// ============================================================================

/// Triangle to be packed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedTriangle {
    pub vertices: [Vec3; 3],
    pub geometry_index: u32,
    pub primitive_index: u32,
    pub opaque: bool,
}

/// One or two triangles sharing a descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairSource {
    pub first: PackedTriangle,
    pub second: Option<PackedTriangle>,
    /// Last pair of its leaf range.
    pub range_stop: bool,
}

impl PairSource {
    fn triangles(&self) -> impl Iterator<Item = &PackedTriangle> + '_ {
        std::iter::once(&self.first).chain(self.second.iter())
    }
}

/// 128-byte primitive packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitivePacket {
    pub words: [u32; PACKET_DWORDS],
}

impl Default for PrimitivePacket {
    fn default() -> Self {
        Self {
            words: [0; PACKET_DWORDS],
        }
    }
}

impl PrimitivePacket {
    pub fn decode(b: &[u8]) -> Self {
        let mut words = [0u32; PACKET_DWORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = read_u32(b, i * 4);
        }
        Self { words }
    }

    pub fn encode(&self) -> [u8; PRIMITIVE_PACKET_SIZE] {
        let mut b = [0u8; PRIMITIVE_PACKET_SIZE];
        for (i, w) in self.words.iter().enumerate() {
            write_u32(&mut b, i * 4, *w);
        }
        b
    }

    /// Read `len` bits (at most 32) at bit `start`, through the window formed
    /// by the dword holding `start` and the one after it.
    pub fn read_bits(&self, start: u32, len: u32) -> u32 {
        if len == 0 {
            return 0;
        }
        let dw = (start / 32) as usize;
        let lo = self.words.get(dw).copied().unwrap_or(0) as u64;
        let hi = self.words.get(dw + 1).copied().unwrap_or(0) as u64;
        let window = (hi << 32) | lo;
        ((window >> (start % 32)) & low_mask(len)) as u32
    }

    fn write_bits(&mut self, start: u32, len: u32, value: u32) {
        let dw = (start / 32) as usize;
        if len == 0 || dw >= PACKET_DWORDS {
            return;
        }
        let shift = start % 32;
        let lo = self.words[dw] as u64;
        let hi = self.words.get(dw + 1).copied().unwrap_or(0) as u64;
        let mask = low_mask(len) << shift;
        let window = (((hi << 32) | lo) & !mask) | (((value as u64) << shift) & mask);
        self.words[dw] = window as u32;
        if let Some(next) = self.words.get_mut(dw + 1) {
            *next = (window >> 32) as u32;
        }
    }

    // ------------------------------------------------------------------------
    // Header
    // ------------------------------------------------------------------------

    /// Stored bits per vertex component.
    pub fn payload_lengths(&self) -> [u32; 3] {
        PAYLOAD_SHIFT.map(|s| 1 + bit_field(self.words[0], s, 5))
    }

    pub fn trailing_zeros(&self) -> u32 {
        bit_field(self.words[0], TRAILING_ZERO_SHIFT, 5)
    }

    pub fn geometry_anchor_bits(&self) -> u32 {
        2 * bit_field(self.words[0], GEO_ANCHOR_SHIFT, 4)
    }

    pub fn geometry_payload_bits(&self) -> u32 {
        2 * bit_field(self.words[0], GEO_PAYLOAD_SHIFT, 4)
    }

    pub fn pair_count(&self) -> usize {
        1 + bit_field(self.words[0], PAIR_COUNT_SHIFT, 3) as usize
    }

    /// Vertices stored as unorm16 instead of compressed floats.
    pub fn is_unorm16(&self) -> bool {
        bit_field(self.words[0], VERTEX_TYPE_SHIFT, 1) != 0
    }

    pub fn primitive_anchor_bits(&self) -> u32 {
        bit_field(self.words[1], PRIM_ANCHOR_SHIFT, 5)
    }

    pub fn primitive_payload_bits(&self) -> u32 {
        bit_field(self.words[1], PRIM_PAYLOAD_SHIFT, 5)
    }

    /// Bit offset splitting geometry ids (below) from primitive ids (above).
    pub fn index_midpoint(&self) -> u32 {
        bit_field(self.words[1], MIDPOINT_SHIFT, 10)
    }

    /// Bits shared with vertex 0 at the top of each component.
    pub fn prefix_lengths(&self) -> [u32; 3] {
        let t = self.trailing_zeros();
        self.payload_lengths().map(|p| 32u32.saturating_sub(t + p))
    }

    // ------------------------------------------------------------------------
    // Vertices
    // ------------------------------------------------------------------------

    fn vertex_prefixes(&self) -> [u32; 3] {
        let lengths = self.prefix_lengths();
        let mut at = HEADER_BITS;
        let mut out = [0u32; 3];
        for axis in 0..3 {
            let len = lengths[axis];
            if len > 0 {
                out[axis] = self.read_bits(at, len) << (32 - len);
            }
            at += len;
        }
        out
    }

    /// Compressed vertex `index`.
    pub fn vertex(&self, index: u32) -> Vec3 {
        let payload = self.payload_lengths();
        let prefixes = self.vertex_prefixes();
        let trailing = self.trailing_zeros();
        let stride: u32 = payload.iter().sum();
        let mut at = HEADER_BITS + self.prefix_lengths().iter().sum::<u32>() + index * stride;
        let mut c = [0f32; 3];
        for axis in 0..3 {
            c[axis] = f32::from_bits(prefixes[axis] | (self.read_bits(at, payload[axis]) << trailing));
            at += payload[axis];
        }
        Vec3::from_array(c)
    }

    /// Full precision vertex of a procedural packet: 0 is the box min, 1 the max.
    pub fn procedural_vertex(&self, index: u32) -> Vec3 {
        let at = HEADER_BITS + index * 96;
        Vec3::new(
            f32::from_bits(self.read_bits(at, 32)),
            f32::from_bits(self.read_bits(at + 32, 32)),
            f32::from_bits(self.read_bits(at + 64, 32)),
        )
    }

    pub fn procedural_bounds(&self) -> Aabb {
        Aabb::new(self.procedural_vertex(0), self.procedural_vertex(1))
    }

    // ------------------------------------------------------------------------
    // Indices
    // ------------------------------------------------------------------------

    /// Primitive index of triangle `tri_index` (`pair * 2 + tri`).
    pub fn primitive_index(&self, tri_index: u32) -> u32 {
        let mid = self.index_midpoint();
        let anchor_bits = self.primitive_anchor_bits();
        let anchor = self.read_bits(mid, anchor_bits);
        if tri_index == 0 {
            return anchor;
        }
        let payload_bits = self.primitive_payload_bits();
        let payload = self.read_bits(mid + anchor_bits + (tri_index - 1) * payload_bits, payload_bits);
        merge_payload(anchor, anchor_bits, payload, payload_bits)
    }

    /// Geometry index of triangle `tri_index`.
    pub fn geometry_index(&self, tri_index: u32) -> u32 {
        let mid = self.index_midpoint();
        let anchor_bits = self.geometry_anchor_bits();
        let anchor = self.read_bits(mid.saturating_sub(anchor_bits), anchor_bits);
        if tri_index == 0 {
            return anchor;
        }
        let payload_bits = self.geometry_payload_bits();
        let start = mid.saturating_sub(anchor_bits + tri_index * payload_bits);
        let payload = self.read_bits(start, payload_bits);
        merge_payload(anchor, anchor_bits, payload, payload_bits)
    }

    pub fn pair_desc(&self, pair: usize) -> TrianglePairDesc {
        let start = PACKET_BITS.saturating_sub(PAIR_DESC_BITS * (pair as u32 + 1));
        TrianglePairDesc(self.read_bits(start, PAIR_DESC_BITS))
    }

    /// Triangles in the packet, counting second triangles only when present.
    pub fn triangle_count(&self) -> u32 {
        (0..self.pair_count()).map(|p| self.pair_desc(p).triangle_count()).sum()
    }

    pub fn triangle(&self, pair: usize, tri: u8) -> Triangle {
        let vertices = self.pair_desc(pair).indices(tri).map(|i| self.vertex(i));
        let is_valid = !vertices.iter().any(|v| v.x.is_nan());
        Triangle { vertices, is_valid }
    }

    // ------------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------------

    /// Pack `pairs` into one packet, or `None` when they do not fit.
    pub fn pack(pairs: &[PairSource]) -> Option<Self> {
        if pairs.is_empty() || pairs.len() > MAX_PAIRS {
            return None;
        }

        let mut unique: SmallVec<[[u32; 3]; MAX_VERTICES]> = SmallVec::new();
        let mut descs: SmallVec<[TrianglePairDesc; MAX_PAIRS]> = SmallVec::new();
        for pair in pairs {
            let mut desc = TrianglePairDesc::default();
            for (tri, t) in pair.triangles().enumerate() {
                let indices = t.vertices.map(|v| vertex_slot(&mut unique, v));
                if tri == 0 && indices[0] == PROCEDURAL_VERTEX && indices[1] == PROCEDURAL_VERTEX {
                    return None;
                }
                if tri == 1 && indices == [0; 3] {
                    return None;
                }
                desc.set_triangle(tri as u8, indices, t.opaque);
            }
            desc.set_range_stop(pair.range_stop);
            descs.push(desc);
        }
        if unique.len() > MAX_VERTICES {
            return None;
        }

        // Vertex compression
        let v0 = unique[0];
        let mut union = 0u32;
        let mut diffs = [0u32; 3];
        for v in &unique {
            for axis in 0..3 {
                union |= v[axis];
                diffs[axis] |= v[axis] ^ v0[axis];
            }
        }
        let trailing = union.trailing_zeros().min(31);
        let prefix = diffs.map(|d| d.leading_zeros().min(31).min(31 - trailing));
        let payload = prefix.map(|p| 32 - p - trailing);
        let vertex_bits: u32 = payload.iter().sum();
        let prefix_bits: u32 = prefix.iter().sum();

        // Index compression
        let prim_anchor = pairs[0].first.primitive_index;
        let geo_anchor = pairs[0].first.geometry_index;
        let (prim_diff, geo_diff) = pairs
            .iter()
            .flat_map(|p| p.triangles())
            .fold((0u32, 0u32), |(pd, gd), t| {
                (pd | (t.primitive_index ^ prim_anchor), gd | (t.geometry_index ^ geo_anchor))
            });
        let prim_payload_bits = bit_length(prim_diff);
        let prim_anchor_bits = bit_length(prim_anchor);
        let geo_payload_bits = (bit_length(geo_diff) + 1) & !1;
        let geo_anchor_bits = (bit_length(geo_anchor) + 1) & !1;
        if prim_anchor_bits > 31 || prim_payload_bits > 31 || geo_anchor_bits > 30 || geo_payload_bits > 30 {
            return None;
        }

        let pair_count = pairs.len() as u32;
        let required = pair_count * (2 * prim_payload_bits + 2 * geo_payload_bits + PAIR_DESC_BITS)
            + unique.len() as u32 * vertex_bits
            + prefix_bits
            + prim_anchor_bits
            + geo_anchor_bits;
        if required > DATA_BITS {
            return None;
        }
        let mid = PACKET_BITS - pair_count * (PAIR_DESC_BITS + 2 * prim_payload_bits) - prim_anchor_bits;

        let mut packet = Self::default();
        let mut w0 = 0u32;
        for axis in 0..3 {
            w0 = set_bit_field(w0, PAYLOAD_SHIFT[axis], 5, payload[axis] - 1);
        }
        w0 = set_bit_field(w0, TRAILING_ZERO_SHIFT, 5, trailing);
        w0 = set_bit_field(w0, GEO_ANCHOR_SHIFT, 4, geo_anchor_bits / 2);
        w0 = set_bit_field(w0, GEO_PAYLOAD_SHIFT, 4, geo_payload_bits / 2);
        w0 = set_bit_field(w0, PAIR_COUNT_SHIFT, 3, pair_count - 1);
        packet.words[0] = w0;
        packet.words[1] = pack_header_hi(prim_anchor_bits, prim_payload_bits, mid);

        let mut at = HEADER_BITS;
        for axis in 0..3 {
            if prefix[axis] > 0 {
                packet.write_bits(at, prefix[axis], v0[axis] >> (32 - prefix[axis]));
            }
            at += prefix[axis];
        }
        for v in &unique {
            for axis in 0..3 {
                packet.write_bits(at, payload[axis], v[axis] >> trailing);
                at += payload[axis];
            }
        }

        packet.write_bits(mid, prim_anchor_bits, prim_anchor);
        packet.write_bits(mid - geo_anchor_bits, geo_anchor_bits, geo_anchor);
        for (p, (pair, desc)) in pairs.iter().zip(descs.iter()).enumerate() {
            packet.write_bits(PACKET_BITS - PAIR_DESC_BITS * (p as u32 + 1), PAIR_DESC_BITS, desc.0);
            for (tri, t) in pair.triangles().enumerate() {
                let tri_index = p as u32 * 2 + tri as u32;
                if tri_index == 0 {
                    continue;
                }
                packet.write_bits(
                    mid + prim_anchor_bits + (tri_index - 1) * prim_payload_bits,
                    prim_payload_bits,
                    t.primitive_index,
                );
                packet.write_bits(
                    mid - geo_anchor_bits - tri_index * geo_payload_bits,
                    geo_payload_bits,
                    t.geometry_index,
                );
            }
        }
        Some(packet)
    }

    /// Packet holding one procedural primitive. `None` when the indices
    /// exceed the anchor widths.
    pub fn procedural(bounds: Aabb, geometry_index: u32, primitive_index: u32, opaque: bool) -> Option<Self> {
        if bit_length(geometry_index) > PROCEDURAL_GEO_ANCHOR_BITS
            || bit_length(primitive_index) > PROCEDURAL_PRIM_ANCHOR_BITS
        {
            return None;
        }
        let mut packet = Self::default();
        packet.words[0] = set_bit_field(0, GEO_ANCHOR_SHIFT, 4, PROCEDURAL_GEO_ANCHOR_BITS / 2);
        packet.words[1] = pack_header_hi(PROCEDURAL_PRIM_ANCHOR_BITS, 0, PROCEDURAL_MIDPOINT);

        let corners = [bounds.min.to_array(), bounds.max.to_array()];
        let mut at = HEADER_BITS;
        for c in corners.iter().flatten() {
            packet.write_bits(at, 32, c.to_bits());
            at += 32;
        }
        packet.write_bits(PROCEDURAL_MIDPOINT, PROCEDURAL_PRIM_ANCHOR_BITS, primitive_index);
        packet.write_bits(
            PROCEDURAL_MIDPOINT - PROCEDURAL_GEO_ANCHOR_BITS,
            PROCEDURAL_GEO_ANCHOR_BITS,
            geometry_index,
        );

        let mut desc = TrianglePairDesc::default();
        desc.set_triangle(0, [PROCEDURAL_VERTEX; 3], opaque);
        desc.set_range_stop(true);
        packet.write_bits(PACKET_BITS - PAIR_DESC_BITS, PAIR_DESC_BITS, desc.0);
        Some(packet)
    }
}

fn pack_header_hi(prim_anchor_bits: u32, prim_payload_bits: u32, midpoint: u32) -> u32 {
    let mut w = set_bit_field(0, PRIM_ANCHOR_SHIFT, 5, prim_anchor_bits);
    w = set_bit_field(w, PRIM_PAYLOAD_SHIFT, 5, prim_payload_bits);
    set_bit_field(w, MIDPOINT_SHIFT, 10, midpoint)
}

/// Shorter payloads replace the low bits of the anchor; wider ones are
/// stored whole.
fn merge_payload(anchor: u32, anchor_bits: u32, payload: u32, payload_bits: u32) -> u32 {
    if payload_bits >= anchor_bits {
        payload
    } else {
        (anchor & !(low_mask(payload_bits) as u32)) | payload
    }
}

fn vertex_slot(unique: &mut SmallVec<[[u32; 3]; MAX_VERTICES]>, v: Vec3) -> u32 {
    let bits = v.to_array().map(f32::to_bits);
    match unique.iter().position(|u| *u == bits) {
        Some(i) => i as u32,
        None => {
            unique.push(bits);
            (unique.len() - 1) as u32
        }
    }
}

// ============================================================================
// Leaf range
// ============================================================================

/// Triangle pairs covered by one RTIP 3.1 leaf pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveRange {
    /// Byte offset of the first packet.
    pub offset: u64,
    /// Packets the range touches, consecutive from `offset`.
    pub packets: SmallVec<[PrimitivePacket; 1]>,
    /// `(packet, pair)` in range order.
    pub pairs: SmallVec<[(u8, u8); MAX_PAIRS]>,
}

impl PrimitiveRange {
    /// Follow the range of `ptr` from pair `first`. `data` starts at the
    /// header; packets must end before `limit`.
    pub fn read(data: &[u8], ptr: NodePointer, first: u8, limit: u64) -> Result<Self> {
        let mut offset = ptr.byte_offset();
        let mut packet = read_packet(data, ptr, offset, limit)?;
        if first as usize >= packet.pair_count() {
            return Err(Error::invalid_pointer(
                ptr.encode(),
                format!("pair {} of a packet holding {} pairs", first, packet.pair_count()),
            ));
        }
        let mut range = Self {
            offset,
            packets: smallvec![packet],
            pairs: SmallVec::new(),
        };
        let mut pair = first as usize;
        loop {
            if range.pairs.len() == MAX_PAIRS {
                return Err(Error::invalid_pointer(
                    ptr.encode(),
                    format!("leaf range has no stop bit within {} pairs", MAX_PAIRS),
                ));
            }
            range.pairs.push(((range.packets.len() - 1) as u8, pair as u8));
            if packet.pair_desc(pair).range_stop() {
                break;
            }
            pair += 1;
            if pair == packet.pair_count() {
                offset += PRIMITIVE_PACKET_SIZE as u64;
                packet = read_packet(data, ptr, offset, limit)?;
                range.packets.push(packet);
                pair = 0;
            }
        }
        Ok(range)
    }

    #[inline]
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Byte offset of the `index`th packet of the range.
    #[inline]
    pub fn packet_offset(&self, index: u8) -> u64 {
        self.offset + index as u64 * PRIMITIVE_PACKET_SIZE as u64
    }

    /// Triangles of the range in order; procedural pairs contribute none.
    pub fn leaf_triangles(&self) -> Vec<LeafTriangle> {
        let mut out = Vec::new();
        for (packet_index, pair) in &self.pairs {
            let packet = &self.packets[*packet_index as usize];
            let desc = packet.pair_desc(*pair as usize);
            if desc.is_procedural() {
                continue;
            }
            for tri in 0..desc.triangle_count() as u8 {
                let tri_index = *pair as u32 * 2 + tri as u32;
                out.push(LeafTriangle {
                    slot: out.len() as u8,
                    location: PrimitiveLocation {
                        byte_offset: self.packet_offset(*packet_index),
                        slot: tri_index as u8,
                    },
                    triangle: packet.triangle(*pair as usize, tri),
                    geometry_index: packet.geometry_index(tri_index),
                    primitive_index: Some(packet.primitive_index(tri_index)),
                    opaque: desc.is_opaque(tri),
                });
            }
        }
        out
    }

    pub fn triangles(&self) -> Vec<Triangle> {
        self.leaf_triangles().into_iter().map(|t| t.triangle).collect()
    }

    pub fn bounds(&self) -> Aabb {
        self.leaf_triangles()
            .iter()
            .fold(Aabb::EMPTY, |acc, t| acc.union(&t.triangle.bounds()))
    }
}

fn read_packet(data: &[u8], ptr: NodePointer, offset: u64, limit: u64) -> Result<PrimitivePacket> {
    if offset + PRIMITIVE_PACKET_SIZE as u64 > limit {
        return Err(Error::invalid_pointer(
            ptr.encode(),
            format!("leaf range runs past the node stream at {}", offset),
        ));
    }
    Ok(PrimitivePacket::decode(record(data, offset, PRIMITIVE_PACKET_SIZE, "primitive packet")?))
}

/// Geometry flags of a procedural pair.
pub(crate) fn procedural_flags(desc: TrianglePairDesc) -> u32 {
    if desc.is_opaque(0) {
        GEOMETRY_FLAG_OPAQUE
    } else {
        0
    }
}
