//! Structure and chunk writers.
//!
//! [`StructureWriter`] lays out a [`BuildNode`] tree as a structure blob in
//! either generation's format. Boxes are placed breadth first so that the box
//! children of one node, and its leaf children, occupy consecutive slots as
//! the RTIP 3.1 running offsets require. RTIP 3.1 triangle leaves of one box
//! share primitive packets, one pair per leaf, as far as the packets allow.
//! [`ChunkWriter`] frames blobs into a trace chunk.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use super::format::*;
use super::geometry_info::GeometryInfo;
use super::header::{
    AccelerationStructureHeader, BuildFlags, BuildInfo, Fp16BoxMode, GeometryType, SectionOffsets, StructureType,
    TriangleCompressionMode,
};
use super::node_pointer::{NodeKind, NodePointer};
use super::nodes::{
    Box16Node, Box32Node, InstanceLayout, InstanceNode, InstanceRootBox, PackedTriangle, PairSource, PrimitivePacket,
    ProceduralNode, QuantizedBvh8Node, QuantizedChild, TriangleNode, BVH8_NODE_TYPE, GEOMETRY_FLAG_OPAQUE,
};
use super::rtip::RtIp;
use crate::util::{Affine3A, Aabb, Error, Result, Vec3};

// ============================================================================
// Build tree
// ============================================================================

/// Node of a structure to be written.
#[derive(Debug, Clone)]
pub enum BuildNode {
    Box {
        children: Vec<BuildNode>,
        /// Store as a Box16 node (RTIP 1.1 only; the root is always full precision).
        half_precision: bool,
    },
    /// One triangle, or two sharing the edge v1-v2 (pair compression on
    /// RTIP 1.1, native on RTIP 3.1).
    Triangles {
        vertices: Vec<Vec3>,
        geometry_index: u32,
        geometry_flags: u32,
    },
    Procedural {
        bounds: Aabb,
        geometry_index: u32,
        geometry_flags: u32,
    },
    Instance {
        blas_index: u64,
        /// Object-to-world transform.
        transform: Affine3A,
        /// Object space bounds of the referenced BLAS.
        blas_bounds: Aabb,
        mask: u8,
        instance_id: u32,
    },
}

impl BuildNode {
    pub fn boxed(children: Vec<BuildNode>) -> Self {
        Self::Box {
            children,
            half_precision: false,
        }
    }

    pub fn half_box(children: Vec<BuildNode>) -> Self {
        Self::Box {
            children,
            half_precision: true,
        }
    }

    pub fn triangle(vertices: [Vec3; 3], geometry_index: u32, geometry_flags: u32) -> Self {
        Self::Triangles {
            vertices: vertices.to_vec(),
            geometry_index,
            geometry_flags,
        }
    }

    /// Triangles (v0, v1, v2) and (v1, v3, v2).
    pub fn triangle_pair(vertices: [Vec3; 4], geometry_index: u32, geometry_flags: u32) -> Self {
        Self::Triangles {
            vertices: vertices.to_vec(),
            geometry_index,
            geometry_flags,
        }
    }

    pub fn procedural(bounds: Aabb, geometry_index: u32) -> Self {
        Self::Procedural {
            bounds,
            geometry_index,
            geometry_flags: 0,
        }
    }

    pub fn instance(blas_index: u64, transform: Affine3A, blas_bounds: Aabb) -> Self {
        Self::Instance {
            blas_index,
            transform,
            blas_bounds,
            mask: 0xFF,
            instance_id: 0,
        }
    }

    fn is_box(&self) -> bool {
        matches!(self, Self::Box { .. })
    }

    fn primitive_count(&self) -> u32 {
        match self {
            Self::Box { .. } => 0,
            Self::Triangles { vertices, .. } if vertices.len() == 4 => 2,
            _ => 1,
        }
    }

    /// Triangles without a NaN vertex x.
    fn valid_triangles(&self) -> u32 {
        let Self::Triangles { vertices, .. } = self else {
            return 0;
        };
        let valid = |idx: [usize; 3]| idx.iter().all(|i| vertices.get(*i).map_or(false, |v| !v.x.is_nan()));
        let mut count = valid([0, 1, 2]) as u32;
        if vertices.len() == 4 {
            count += valid([1, 3, 2]) as u32;
        }
        count
    }

    fn geometry_index(&self) -> Option<u32> {
        match self {
            Self::Triangles { geometry_index, .. } | Self::Procedural { geometry_index, .. } => Some(*geometry_index),
            _ => None,
        }
    }

    fn bounds(&self) -> Aabb {
        match self {
            Self::Box { children, .. } => children.iter().fold(Aabb::EMPTY, |acc, c| acc.union(&c.bounds())),
            Self::Triangles { vertices, .. } => {
                let valid: Vec<Vec3> = vertices.iter().copied().filter(|v| !v.is_nan()).collect();
                Aabb::from_points(&valid)
            }
            Self::Procedural { bounds, .. } => *bounds,
            Self::Instance {
                transform,
                blas_bounds,
                ..
            } => blas_bounds.transformed(transform),
        }
    }
}

// ============================================================================
// Structure writer
// ============================================================================

struct Flat<'a> {
    node: &'a BuildNode,
    children: Vec<usize>,
    parent: Option<usize>,
    slot: u32,
    bounds: Aabb,
    kind: NodeKind,
    offset: u64,
    /// Primitive indices of a leaf, per triangle.
    primitives: [u32; 2],
    instance_index: u32,
}

/// Writes a structure blob from a [`BuildNode`] tree.
#[derive(Debug, Clone)]
pub struct StructureWriter {
    rtip: RtIp,
    structure_type: StructureType,
    compression: TriangleCompressionMode,
    build_flags: BuildFlags,
    fused_instances: bool,
    header_offset: usize,
    virtual_address: u64,
}

impl StructureWriter {
    pub fn blas(rtip: RtIp) -> Self {
        Self::new(rtip, StructureType::BottomLevel)
    }

    pub fn tlas(rtip: RtIp) -> Self {
        Self::new(rtip, StructureType::TopLevel)
    }

    fn new(rtip: RtIp, structure_type: StructureType) -> Self {
        Self {
            rtip,
            structure_type,
            compression: TriangleCompressionMode::None,
            build_flags: BuildFlags::PREFER_FAST_TRACE,
            fused_instances: false,
            header_offset: METADATA_ALIGNMENT,
            virtual_address: 0,
        }
    }

    pub fn with_compression(mut self, mode: TriangleCompressionMode) -> Self {
        self.compression = mode;
        self
    }

    pub fn with_build_flags(mut self, flags: BuildFlags) -> Self {
        self.build_flags = flags;
        self
    }

    /// Append the BLAS root to each instance record (RTIP 1.1 TLAS only).
    pub fn with_fused_instances(mut self, on: bool) -> Self {
        self.fused_instances = on;
        self
    }

    pub fn with_virtual_address(mut self, va: u64) -> Self {
        self.virtual_address = va;
        self
    }

    fn is_blas(&self) -> bool {
        self.structure_type == StructureType::BottomLevel
    }

    /// RTIP 3.1 BLAS leaves live in shared primitive packets.
    fn packs_leaves(&self) -> bool {
        self.rtip == RtIp::Rtip31 && self.is_blas()
    }

    fn fused(&self) -> bool {
        self.fused_instances && self.rtip == RtIp::Rtip11 && !self.is_blas()
    }

    fn build_info(&self, any_half: bool) -> BuildInfo {
        let fp16 = if any_half {
            Fp16BoxMode::MixedWithFp32
        } else {
            Fp16BoxMode::None
        };
        BuildInfo::new(self.structure_type, self.compression, fp16, self.build_flags).with_fused_instances(self.fused())
    }

    fn leaf_stride(&self) -> usize {
        match (self.rtip, self.is_blas()) {
            (RtIp::Rtip31, _) => RTIP31_NODE_SLOT,
            (RtIp::Rtip11, true) => LEAF_NODE_SIZE,
            (RtIp::Rtip11, false) if self.fused() => FUSED_INSTANCE_NODE_SIZE,
            (RtIp::Rtip11, false) => INSTANCE_NODE_SIZE,
        }
    }

    fn box_size(&self, node: &BuildNode, is_root: bool) -> usize {
        match (self.rtip, node) {
            (RtIp::Rtip31, _) => QUANTIZED_BVH8_NODE_SIZE,
            (RtIp::Rtip11, BuildNode::Box { half_precision: true, .. }) if !is_root => BOX16_NODE_SIZE,
            _ => BOX32_NODE_SIZE,
        }
    }

    fn box_kind(&self, node: &BuildNode, is_root: bool) -> NodeKind {
        match self.box_size(node, is_root) {
            BOX16_NODE_SIZE => NodeKind::Box16,
            _ if self.rtip == RtIp::Rtip31 => NodeKind::QuantizedBvh8,
            _ => NodeKind::Box32,
        }
    }

    /// Blob of a structure with no nodes.
    pub fn write_empty(&self) -> Vec<u8> {
        let mut header = AccelerationStructureHeader::new(self.rtip, self.build_info(false));
        header.rt_ip_level = self.rtip.ip_level();
        let end = HEADER_SIZE as u32;
        header.offsets = SectionOffsets {
            interior_nodes: end,
            leaf_nodes: end,
            geometry_info: end,
            primitive_node_ptrs: end,
        };
        header.size_in_bytes = end;
        header.metadata_size = self.header_offset as u32;
        self.frame(&header.encode())
    }

    /// Lay out and encode `root`.
    pub fn write(&self, root: &BuildNode) -> Result<Vec<u8>> {
        // The root must be a box
        let wrapped;
        let root = if root.is_box() {
            root
        } else {
            wrapped = BuildNode::boxed(vec![root.clone()]);
            &wrapped
        };

        let mut flat = Vec::new();
        self.flatten(root, None, 0, &mut flat)?;

        // Primitive indices per geometry, instance indices in walk order
        let mut per_geometry: Vec<u32> = Vec::new();
        let mut instances = 0u32;
        for f in flat.iter_mut() {
            if let Some(g) = f.node.geometry_index() {
                let g = g as usize;
                if per_geometry.len() <= g {
                    per_geometry.resize(g + 1, 0);
                }
                for p in 0..f.node.primitive_count() as usize {
                    f.primitives[p] = per_geometry[g];
                    per_geometry[g] += 1;
                }
            }
            if matches!(f.node, BuildNode::Instance { .. }) {
                f.instance_index = instances;
                instances += 1;
            }
        }

        // Sections
        let interior_start = HEADER_SIZE as u64;
        let mut fp32 = 0u32;
        let mut fp16 = 0u32;
        let mut interior_bytes = 0u64;
        let mut leaf_count = 0u32;
        for (i, f) in flat.iter().enumerate() {
            if f.node.is_box() {
                let size = self.box_size(f.node, i == 0);
                interior_bytes += size as u64;
                if size == BOX16_NODE_SIZE {
                    fp16 += 1;
                } else {
                    fp32 += 1;
                }
            } else {
                leaf_count += 1;
            }
        }
        let leaf_start = interior_start + interior_bytes;
        let leaf_stride = self.leaf_stride() as u64;

        // Breadth-first placement
        flat[0].offset = interior_start;
        let mut next_interior = interior_start + self.box_size(root, true) as u64;
        let mut next_leaf = leaf_start;
        let mut packets: Vec<(u64, PrimitivePacket)> = Vec::new();
        let mut queue = std::collections::VecDeque::from([0usize]);
        while let Some(b) = queue.pop_front() {
            let children = flat[b].children.clone();
            let mut packed_leaves = Vec::new();
            for c in children {
                if flat[c].node.is_box() {
                    flat[c].offset = next_interior;
                    next_interior += self.box_size(flat[c].node, false) as u64;
                    queue.push_back(c);
                } else if self.packs_leaves() {
                    packed_leaves.push(c);
                } else {
                    flat[c].offset = next_leaf;
                    next_leaf += leaf_stride;
                }
            }
            for (packet, members) in pack_leaves(&flat, &packed_leaves)? {
                for (leaf, pair) in members {
                    flat[leaf].offset = next_leaf;
                    if let NodeKind::Triangle(_) = flat[leaf].kind {
                        flat[leaf].kind = NodeKind::Triangle(pair);
                    }
                }
                packets.push((next_leaf, packet));
                next_leaf += PRIMITIVE_PACKET_SIZE as u64;
            }
        }
        if self.packs_leaves() {
            leaf_count = packets.len() as u32;
        }

        let geometry_count = if self.is_blas() { per_geometry.len() } else { 0 };
        let primitive_count: u32 = if self.is_blas() {
            per_geometry.iter().sum()
        } else {
            instances
        };
        let geometry_info_start = next_leaf;
        let geometry_info_size = if self.rtip == RtIp::Rtip31 && !self.is_blas() {
            leaf_count as u64 * INSTANCE_SIDEBAND_SIZE as u64
        } else {
            (geometry_count * GEOMETRY_INFO_SIZE) as u64
        };
        let prim_ptrs_start = geometry_info_start + geometry_info_size;
        let total = prim_ptrs_start + primitive_count as u64 * 4;
        let mut data = vec![0u8; total as usize];

        let pointers: Vec<NodePointer> = flat
            .iter()
            .map(|f| NodePointer::new(self.rtip, f.kind, f.offset))
            .collect::<Result<_>>()?;

        // Node records
        for (i, f) in flat.iter().enumerate() {
            if self.packs_leaves() && !f.node.is_box() {
                continue;
            }
            let record = self.encode_node(&flat, &pointers, i)?;
            let at = f.offset as usize;
            data[at..at + record.len()].copy_from_slice(&record);
            if self.rtip == RtIp::Rtip31 && matches!(f.node, BuildNode::Instance { .. }) {
                let sideband = self.instance_node(&flat, &pointers, i)?.encode_sideband();
                let slot = (f.offset - leaf_start) / INSTANCE_NODE_SIZE as u64;
                let at = (geometry_info_start + slot * INSTANCE_SIDEBAND_SIZE as u64) as usize;
                data[at..at + INSTANCE_SIDEBAND_SIZE].copy_from_slice(&sideband);
            }
        }
        for (offset, packet) in &packets {
            let at = *offset as usize;
            data[at..at + PRIMITIVE_PACKET_SIZE].copy_from_slice(&packet.encode());
        }

        // Geometry info and primitive node pointers
        let mut prim_table = vec![INVALID_NODE; primitive_count as usize];
        let mut geometry_base = vec![0u32; per_geometry.len()];
        for g in 1..per_geometry.len() {
            geometry_base[g] = geometry_base[g - 1] + per_geometry[g - 1];
        }
        let mut active = 0u32;
        for (f, ptr) in flat.iter().zip(pointers.iter()) {
            match f.node {
                BuildNode::Box { .. } => {}
                BuildNode::Instance { mask, .. } => {
                    prim_table[f.instance_index as usize] = ptr.encode();
                    active += (*mask != 0) as u32;
                }
                leaf => {
                    let g = leaf.geometry_index().unwrap_or(0) as usize;
                    for p in 0..leaf.primitive_count() as usize {
                        prim_table[(geometry_base[g] + f.primitives[p]) as usize] = ptr.encode();
                    }
                    active += match leaf {
                        BuildNode::Triangles { .. } => leaf.valid_triangles(),
                        BuildNode::Procedural { bounds, .. } => (!bounds.min.x.is_nan()) as u32,
                        _ => 0,
                    };
                }
            }
        }
        for (g, count) in per_geometry.iter().enumerate().take(geometry_count) {
            let info = GeometryInfo::new(*count, 0, geometry_base[g] * 4);
            let at = geometry_info_start as usize + g * GEOMETRY_INFO_SIZE;
            data[at..at + GEOMETRY_INFO_SIZE].copy_from_slice(&info.encode());
        }
        for (i, raw) in prim_table.iter().enumerate() {
            let at = prim_ptrs_start as usize + i * 4;
            data[at..at + 4].copy_from_slice(&raw.to_le_bytes());
        }

        // Header
        let any_half = fp16 > 0;
        let mut header = AccelerationStructureHeader::new(self.rtip, self.build_info(any_half));
        header.metadata_size = self.header_offset as u32;
        header.size_in_bytes = total as u32;
        header.primitive_count = primitive_count;
        header.active_primitive_count = active;
        header.descriptor_count = if self.is_blas() { geometry_count as u32 } else { instances };
        header.geometry_type = if flat.iter().any(|f| matches!(f.node, BuildNode::Procedural { .. })) {
            GeometryType::Aabbs
        } else {
            GeometryType::Triangles
        };
        header.offsets = SectionOffsets {
            interior_nodes: interior_start as u32,
            leaf_nodes: leaf_start as u32,
            geometry_info: geometry_info_start as u32,
            primitive_node_ptrs: prim_ptrs_start as u32,
        };
        header.interior_fp32_count = fp32;
        header.interior_fp16_count = fp16;
        header.leaf_count = leaf_count;
        header.uuid = self.virtual_address;
        header.rt_ip_level = self.rtip.ip_level();
        header.bounds = flat[0].bounds;
        data[..HEADER_SIZE].copy_from_slice(&header.encode());

        tracing::trace!(rtip = ?self.rtip, nodes = flat.len(), bytes = data.len(), "wrote structure");
        Ok(self.frame(&data))
    }

    /// Prefix the preamble and pad up to the header offset.
    fn frame(&self, data: &[u8]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.header_offset + data.len());
        blob.extend_from_slice(self.rtip.magic());
        blob.extend_from_slice(&(self.header_offset as u32).to_le_bytes());
        blob.extend_from_slice(&self.virtual_address.to_le_bytes());
        blob.resize(self.header_offset, 0);
        blob.extend_from_slice(data);
        blob
    }

    fn flatten<'a>(
        &self,
        node: &'a BuildNode,
        parent: Option<usize>,
        slot: u32,
        out: &mut Vec<Flat<'a>>,
    ) -> Result<usize> {
        let index = out.len();
        let kind = match node {
            BuildNode::Box { children, .. } => {
                let max = match self.rtip {
                    RtIp::Rtip11 => BOX_CHILD_COUNT,
                    RtIp::Rtip31 => BVH8_CHILD_COUNT,
                };
                if children.is_empty() || children.len() > max {
                    return Err(Error::other(format!(
                        "{} boxes take 1 to {} children, got {}",
                        self.rtip.name(),
                        max,
                        children.len()
                    )));
                }
                self.box_kind(node, parent.is_none())
            }
            BuildNode::Triangles { vertices, .. } => {
                if !self.is_blas() {
                    return Err(Error::other("triangle leaf in a top-level structure"));
                }
                match vertices.len() {
                    3 => NodeKind::Triangle(0),
                    // The pair index is assigned when packets are laid out
                    4 if self.rtip == RtIp::Rtip31 => NodeKind::Triangle(0),
                    4 if self.compression == TriangleCompressionMode::PairTriangles => NodeKind::Triangle(1),
                    4 => return Err(Error::other("triangle pairs need pair compression")),
                    n => return Err(Error::other(format!("triangle leaf with {} vertices", n))),
                }
            }
            BuildNode::Procedural { .. } => {
                if !self.is_blas() {
                    return Err(Error::other("procedural leaf in a top-level structure"));
                }
                NodeKind::Procedural
            }
            BuildNode::Instance { .. } => {
                if self.is_blas() {
                    return Err(Error::other("instance leaf in a bottom-level structure"));
                }
                NodeKind::Instance
            }
        };
        out.push(Flat {
            node,
            children: Vec::new(),
            parent,
            slot,
            bounds: node.bounds(),
            kind,
            offset: 0,
            primitives: [0; 2],
            instance_index: 0,
        });
        if let BuildNode::Box { children, .. } = node {
            for (s, child) in children.iter().enumerate() {
                let c = self.flatten(child, Some(index), s as u32, out)?;
                out[index].children.push(c);
            }
        }
        Ok(index)
    }

    fn triangle_record(&self, f: &Flat<'_>) -> TriangleNode {
        match f.node {
            BuildNode::Triangles {
                vertices,
                geometry_index,
                geometry_flags,
            } if vertices.len() == 4 => TriangleNode::pair(
                [vertices[0], vertices[1], vertices[2], vertices[3]],
                *geometry_index,
                *geometry_flags,
                f.primitives,
            ),
            BuildNode::Triangles {
                vertices,
                geometry_index,
                geometry_flags,
            } if vertices.len() == 3 => TriangleNode::single(
                [vertices[0], vertices[1], vertices[2]],
                *geometry_index,
                *geometry_flags,
                f.primitives[0],
            ),
            _ => TriangleNode::default(),
        }
    }

    fn encode_node(&self, flat: &[Flat<'_>], pointers: &[NodePointer], i: usize) -> Result<Vec<u8>> {
        let f = &flat[i];
        let record = match f.node {
            BuildNode::Box { .. } => match f.kind {
                NodeKind::Box32 => {
                    let mut node = Box32Node::default();
                    for (s, c) in f.children.iter().enumerate() {
                        node.children[s] = pointers[*c].encode();
                        node.bounds[s] = flat[*c].bounds;
                    }
                    node.encode().to_vec()
                }
                NodeKind::Box16 => {
                    let mut raw = [INVALID_NODE; BOX_CHILD_COUNT];
                    let mut bounds = [Aabb::EMPTY; BOX_CHILD_COUNT];
                    for (s, c) in f.children.iter().enumerate() {
                        raw[s] = pointers[*c].encode();
                        bounds[s] = flat[*c].bounds;
                    }
                    Box16Node::from_bounds(raw, &bounds).encode().to_vec()
                }
                _ => self.encode_quantized(flat, pointers, i).encode().to_vec(),
            },
            BuildNode::Triangles { .. } => self.triangle_record(f).encode().to_vec(),
            BuildNode::Procedural {
                bounds,
                geometry_index,
                geometry_flags,
            } => ProceduralNode::new(*bounds, *geometry_index, *geometry_flags, f.primitives[0])
                .encode()
                .to_vec(),
            BuildNode::Instance { .. } => self.instance_node(flat, pointers, i)?.encode(),
        };
        Ok(record)
    }

    fn instance_node(&self, flat: &[Flat<'_>], pointers: &[NodePointer], i: usize) -> Result<InstanceNode> {
        let f = &flat[i];
        let BuildNode::Instance {
            blas_index,
            transform,
            blas_bounds,
            mask,
            instance_id,
        } = f.node
        else {
            return Err(Error::other("instance record for a non-instance node"));
        };
        let mut node = InstanceNode::new(*blas_index, f.instance_index);
        node.desc.mask = *mask;
        node.desc.instance_id = *instance_id;
        node.blas_metadata_size = self.header_offset as u32;
        node.set_transform(transform);
        match self.rtip {
            RtIp::Rtip11 => {
                let blas_root = NodePointer::new(self.rtip, NodeKind::Box32, RTIP11_ROOT_OFFSET)?;
                let fused_root = self.fused().then(|| {
                    let mut root = Box32Node::default();
                    root.children[0] = blas_root.encode();
                    root.bounds[0] = *blas_bounds;
                    root
                });
                node.layout = InstanceLayout::Rtip11 {
                    blas_root: blas_root.encode(),
                    fused_root,
                };
            }
            RtIp::Rtip31 => {
                node.desc.leaf_type = BVH8_NODE_TYPE as u8;
                node.layout = InstanceLayout::Rtip31 {
                    parent_pointer: f.parent.map(|p| pointers[p].encode()).unwrap_or(INVALID_NODE),
                    root_box: InstanceRootBox::build(&[*blas_bounds]),
                };
            }
        }
        Ok(node)
    }

    fn encode_quantized(&self, flat: &[Flat<'_>], pointers: &[NodePointer], i: usize) -> QuantizedBvh8Node {
        let f = &flat[i];
        let mut children = Vec::with_capacity(f.children.len());
        let mut internal_base = None;
        let mut leaf_base = None;
        for (s, c) in f.children.iter().enumerate() {
            let child = &flat[*c];
            let ptr = pointers[*c];
            let node_type = ptr.encode() & 0xF;
            // Leaves sharing a packet with the next leaf child do not advance the running offset
            let next_leaf = f.children[s + 1..].iter().find(|n| !flat[**n].node.is_box());
            let range = match next_leaf {
                Some(n) if !child.node.is_box() && flat[*n].offset == child.offset => 0,
                _ => 1,
            };
            if child.node.is_box() {
                internal_base.get_or_insert(ptr.byte_offset());
            } else {
                leaf_base.get_or_insert(ptr.byte_offset());
            }
            let instance_mask = match child.node {
                BuildNode::Instance { mask, .. } => *mask,
                _ => 0xFF,
            };
            children.push(QuantizedChild {
                bounds: child.bounds,
                node_type,
                range,
                instance_mask,
            });
        }
        let parent = f
            .parent
            .map(|p| pointers[p].encode())
            .unwrap_or(INVALID_NODE);
        QuantizedBvh8Node::build(
            &children,
            (internal_base.unwrap_or(0) >> 3) as u32,
            (leaf_base.unwrap_or(0) >> 3) as u32,
            parent,
            f.slot,
        )
    }
}

/// Packet pair for a triangle leaf.
fn pair_source(f: &Flat<'_>) -> Option<PairSource> {
    let BuildNode::Triangles {
        vertices,
        geometry_index,
        geometry_flags,
    } = f.node
    else {
        return None;
    };
    let opaque = geometry_flags & GEOMETRY_FLAG_OPAQUE != 0;
    let triangle = |idx: [usize; 3], primitive_index: u32| {
        Some(PackedTriangle {
            vertices: [*vertices.get(idx[0])?, *vertices.get(idx[1])?, *vertices.get(idx[2])?],
            geometry_index: *geometry_index,
            primitive_index,
            opaque,
        })
    };
    let second = if vertices.len() == 4 {
        Some(triangle([1, 3, 2], f.primitives[1])?)
    } else {
        None
    };
    Some(PairSource {
        first: triangle([0, 1, 2], f.primitives[0])?,
        second,
        range_stop: true,
    })
}

/// Group the leaf children of one box into packets, greedily in slot order.
/// Each member is a leaf and its pair index in the packet.
fn pack_leaves(flat: &[Flat<'_>], leaves: &[usize]) -> Result<Vec<(PrimitivePacket, Vec<(usize, u8)>)>> {
    fn close(
        out: &mut Vec<(PrimitivePacket, Vec<(usize, u8)>)>,
        open: &mut Vec<(usize, PairSource)>,
        packet: &mut Option<PrimitivePacket>,
    ) {
        if let Some(p) = packet.take() {
            let members = open.drain(..).enumerate().map(|(pair, (leaf, _))| (leaf, pair as u8)).collect();
            out.push((p, members));
        }
    }

    let mut out = Vec::new();
    let mut open: Vec<(usize, PairSource)> = Vec::new();
    let mut packet: Option<PrimitivePacket> = None;
    for &leaf in leaves {
        let f = &flat[leaf];
        if let BuildNode::Procedural {
            bounds,
            geometry_index,
            geometry_flags,
        } = f.node
        {
            close(&mut out, &mut open, &mut packet);
            let opaque = geometry_flags & GEOMETRY_FLAG_OPAQUE != 0;
            let p = PrimitivePacket::procedural(*bounds, *geometry_index, f.primitives[0], opaque)
                .ok_or_else(|| Error::other(format!("procedural primitive {} does not fit a packet", f.primitives[0])))?;
            out.push((p, vec![(leaf, 0)]));
            continue;
        }
        let source = pair_source(f).ok_or_else(|| Error::other("packed leaf is not a triangle"))?;
        open.push((leaf, source));
        let sources: Vec<PairSource> = open.iter().map(|(_, s)| *s).collect();
        if let Some(p) = PrimitivePacket::pack(&sources) {
            packet = Some(p);
            continue;
        }
        open.pop();
        close(&mut out, &mut open, &mut packet);
        let p = PrimitivePacket::pack(&[source])
            .ok_or_else(|| Error::other(format!("triangle {} does not fit a packet", f.primitives[0])))?;
        open.push((leaf, source));
        packet = Some(p);
    }
    close(&mut out, &mut open, &mut packet);
    Ok(out)
}

// ============================================================================
// Chunk writer
// ============================================================================

/// Frames structure blobs into a trace chunk.
#[derive(Debug, Default)]
pub struct ChunkWriter {
    buf: Vec<u8>,
    blas: usize,
    tlas: usize,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_blas(&mut self, blob: &[u8]) -> Result<usize> {
        self.push(blob, CHUNK_FLAG_BLAS)?;
        self.blas += 1;
        Ok(self.blas - 1)
    }

    pub fn push_tlas(&mut self, blob: &[u8]) -> Result<usize> {
        self.push(blob, 0)?;
        self.tlas += 1;
        Ok(self.tlas - 1)
    }

    fn push(&mut self, blob: &[u8], flags: u32) -> Result<()> {
        let size = u32::try_from(blob.len()).map_err(|_| Error::other("blob larger than 4 GiB"))?;
        self.buf.write_u32::<LittleEndian>(size)?;
        self.buf.write_u32::<LittleEndian>(flags)?;
        self.buf.write_all(blob)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Write the chunk to `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::rtip::LayoutReader;
    use crate::util::bytes::read_u32;

    fn tri(x: f32) -> BuildNode {
        BuildNode::triangle([Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 0.0, 0.0), Vec3::new(x, 1.0, 0.0)], 0, 0)
    }

    #[test]
    fn test_rtip11_layout() {
        let tree = BuildNode::boxed(vec![tri(0.0), BuildNode::half_box(vec![tri(1.0), tri(2.0)])]);
        let blob = StructureWriter::blas(RtIp::Rtip11).write(&tree).unwrap();
        assert_eq!(&blob[..4], b"RT11");
        assert_eq!(read_u32(&blob, 4), 128);
        let header = RtIp::Rtip11.parse_header(&blob[128..]).unwrap();
        assert_eq!(header.interior_fp32_count, 1);
        assert_eq!(header.interior_fp16_count, 1);
        assert_eq!(header.leaf_count, 3);
        assert_eq!(header.offsets.leaf_nodes, 128 + 128 + 64);
        assert_eq!(header.primitive_count, 3);
        assert_eq!(header.geometry_count(), 1);
        assert_eq!(header.bounds.max, Vec3::new(3.0, 1.0, 0.0));
    }

    #[test]
    fn test_rtip31_layout() {
        let tree = BuildNode::boxed(vec![tri(0.0), tri(1.0)]);
        let blob = StructureWriter::blas(RtIp::Rtip31).write(&tree).unwrap();
        let header = RtIp::Rtip31.parse_header(&blob[128..]).unwrap();
        assert_eq!(header.offsets.leaf_nodes, 256);
        // Both triangles share one packet
        assert_eq!(header.leaf_count, 1);
        assert_eq!(header.offsets.geometry_info, 256 + 128);
        assert_eq!(header.active_primitive_count, 2);

        let data = &blob[128..];
        let packet = PrimitivePacket::decode(&data[256..384]);
        assert_eq!(packet.pair_count(), 2);
        assert_eq!(packet.primitive_index(2), 1);
        let root = QuantizedBvh8Node::decode(&data[128..256]);
        assert_eq!(root.child_infos[0].node_range(), 0);
        assert_eq!(root.child_infos[1].node_range(), 1);
        assert_eq!(root.child_pointers().as_slice(), &[256 >> 3, (256 >> 3) | 1]);
    }

    #[test]
    fn test_rtip31_packet_overflow() {
        // Eight disjoint triangles need 24 vertices, more than one packet holds
        let tree = BuildNode::boxed((0..8).map(|i| tri(i as f32 * 10.0 + 0.5)).collect());
        let blob = StructureWriter::blas(RtIp::Rtip31).write(&tree).unwrap();
        let header = RtIp::Rtip31.parse_header(&blob[128..]).unwrap();
        assert!(header.leaf_count >= 2);
        assert_eq!(
            header.offsets.geometry_info - header.offsets.leaf_nodes,
            header.leaf_count * 128
        );
        let root = QuantizedBvh8Node::decode(&blob[256..384]);
        let spans: u32 = root.child_infos[..8].iter().map(|c| c.node_range()).sum();
        assert_eq!(spans, header.leaf_count);
    }

    #[test]
    fn test_rtip31_tlas_sideband() {
        let bounds = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let mut second = BuildNode::instance(4, Affine3A::from_translation(Vec3::X), bounds);
        if let BuildNode::Instance { instance_id, .. } = &mut second {
            *instance_id = 77;
        }
        let tree = BuildNode::boxed(vec![BuildNode::instance(2, Affine3A::IDENTITY, bounds), second]);
        let blob = StructureWriter::tlas(RtIp::Rtip31).write(&tree).unwrap();
        let data = &blob[128..];
        let header = RtIp::Rtip31.parse_header(data).unwrap();
        let o = header.offsets;
        assert_eq!(o.geometry_info - o.leaf_nodes, 2 * 128);
        assert_eq!(o.primitive_node_ptrs - o.geometry_info, 2 * 64);

        let hw = &data[o.leaf_nodes as usize + 128..];
        let sideband = &data[o.geometry_info as usize + 64..];
        let node = InstanceNode::decode_rtip31(hw, sideband);
        assert_eq!(node.blas_index(), 4);
        assert_eq!(node.instance_index, 1);
        assert_eq!(node.desc.instance_id, 77);
        assert_eq!(node.desc.leaf_type, BVH8_NODE_TYPE as u8);
        assert_eq!(node.parent_pointer(), Some((128 >> 3) | 5));
        assert!(node.is_active());
        assert_eq!(node.world_transform().transform_point3(Vec3::ZERO), Vec3::X);
    }

    #[test]
    fn test_rejects_bad_trees() {
        let five = BuildNode::boxed((0..5).map(|i| tri(i as f32)).collect());
        assert!(StructureWriter::blas(RtIp::Rtip11).write(&five).is_err());
        assert!(StructureWriter::blas(RtIp::Rtip31).write(&five).is_ok());
        let quad = BuildNode::triangle_pair([Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::ONE], 0, 0);
        assert!(StructureWriter::blas(RtIp::Rtip11).write(&quad).is_err());
        assert!(StructureWriter::blas(RtIp::Rtip11)
            .with_compression(TriangleCompressionMode::PairTriangles)
            .write(&quad)
            .is_ok());
        let inst = BuildNode::instance(0, Affine3A::IDENTITY, Aabb::new(Vec3::ZERO, Vec3::ONE));
        assert!(StructureWriter::blas(RtIp::Rtip11).write(&inst).is_err());
    }

    #[test]
    fn test_fused_tlas_stride() {
        let inst = BuildNode::instance(0, Affine3A::IDENTITY, Aabb::new(Vec3::ZERO, Vec3::ONE));
        let blob = StructureWriter::tlas(RtIp::Rtip11)
            .with_fused_instances(true)
            .write(&BuildNode::boxed(vec![inst.clone(), inst]))
            .unwrap();
        let header = RtIp::Rtip11.parse_header(&blob[128..]).unwrap();
        assert!(header.build_info.fused_instances());
        assert_eq!(header.offsets.geometry_info - header.offsets.leaf_nodes, 2 * 256);
        assert_eq!(header.descriptor_count, 2);
    }

    #[test]
    fn test_empty_structure() {
        let blob = StructureWriter::blas(RtIp::Rtip31).write_empty();
        let header = RtIp::Rtip31.parse_header(&blob[128..]).unwrap();
        assert!(header.is_empty());
        assert!(RtIp::Rtip31.root_node_offset(&header).unwrap().is_none());
    }

    #[test]
    fn test_chunk_frames() {
        let mut chunk = ChunkWriter::new();
        assert_eq!(chunk.push_blas(&[1, 2, 3]).unwrap(), 0);
        assert_eq!(chunk.push_tlas(&[4]).unwrap(), 0);
        let bytes = chunk.finish();
        assert_eq!(read_u32(&bytes, 0), 3);
        assert_eq!(read_u32(&bytes, 4), CHUNK_FLAG_BLAS);
        assert_eq!(&bytes[8..11], &[1, 2, 3]);
        assert_eq!(read_u32(&bytes, 11), 1);
        assert_eq!(read_u32(&bytes, 15), 0);
    }
}
