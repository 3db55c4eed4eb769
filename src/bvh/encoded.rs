//! Decoded structure shared by both levels.
//!
//! A structure blob is decoded in one pass: preamble and header, a depth-first
//! walk of the node stream from the root (children in slot order), then the
//! geometry and primitive pointer tables. Every node reached becomes an entry
//! in a flat node table; logical node indices are preorder positions in that
//! walk. Nodes are addressed by [`NodePointer`] and table index only, never by
//! references into the source bytes.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::OnceLock;

use smallvec::SmallVec;

use super::format::{BLOB_HEADER_OFFSET_POS, BLOB_PREAMBLE_SIZE, BLOB_VA_POS};
use super::header::{AccelerationStructureHeader, TriangleCompressionMode};
use super::index_map::IndexReferenceMap;
use super::node_pointer::{NodeKind, NodePointer};
use super::nodes::{read_node, LeafTriangle, NodeData, Triangle, TriangleNode};
use super::parent_block::ParentBlock;
use super::rtip::{LayoutReader, RtIp};
use crate::config::DecodeOptions;
use crate::util::bytes::{read_u32, read_u64, section};
use crate::util::{Aabb, Error, Result};

// ============================================================================
// Blob preamble
// ============================================================================

/// A structure blob with its preamble resolved.
#[derive(Debug, Clone, Copy)]
pub struct BlobView<'a> {
    pub rtip: RtIp,
    pub virtual_address: u64,
    /// Bytes from the header start to the blob end.
    pub data: &'a [u8],
}

impl<'a> BlobView<'a> {
    /// Check the magic and locate the header.
    pub fn open(blob: &'a [u8]) -> Result<Self> {
        let preamble = section(blob, 0, BLOB_PREAMBLE_SIZE as u64, "blob preamble")?;
        let rtip = RtIp::from_magic(&preamble[..4])?;
        let header_offset = read_u32(preamble, BLOB_HEADER_OFFSET_POS) as usize;
        if header_offset < BLOB_PREAMBLE_SIZE {
            return Err(Error::inconsistent(format!(
                "header offset {} overlaps the blob preamble",
                header_offset
            )));
        }
        let data = blob.get(header_offset..).ok_or(Error::TruncatedBuffer {
            what: "structure header",
            offset: header_offset as u64,
            needed: 1,
            available: 0,
        })?;
        Ok(Self {
            rtip,
            virtual_address: read_u64(preamble, BLOB_VA_POS),
            data,
        })
    }
}

// ============================================================================
// Node table
// ============================================================================

/// One decoded node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub pointer: NodePointer,
    /// Table index of the node that first reached this one.
    pub parent: Option<u32>,
    pub depth: u32,
    /// Bounds stored by the parent; the structure bounds for the root.
    pub bounds: Aabb,
    pub data: NodeData,
    /// Table indices of the children in slot order. A child reached a
    /// second time appears again under its first index.
    pub children: SmallVec<[u32; 8]>,
}

/// Read-only view of a node.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    pub index: u32,
    entry: &'a NodeEntry,
    compression: TriangleCompressionMode,
}

impl<'a> NodeView<'a> {
    #[inline]
    pub fn pointer(&self) -> NodePointer {
        self.entry.pointer
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.entry.pointer.kind()
    }

    #[inline]
    pub fn byte_offset(&self) -> u64 {
        self.entry.pointer.byte_offset()
    }

    #[inline]
    pub fn data(&self) -> &'a NodeData {
        &self.entry.data
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        self.entry.bounds
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.entry.depth
    }

    /// Parent recorded by the walk.
    #[inline]
    pub fn parent_index(&self) -> Option<u32> {
        self.entry.parent
    }

    #[inline]
    pub fn child_indices(&self) -> &'a [u32] {
        &self.entry.children
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        !self.entry.data.is_box()
    }

    /// Triangles addressed by a triangle leaf; empty for other kinds.
    pub fn triangles(&self) -> Vec<Triangle> {
        self.leaf_triangles().into_iter().map(|t| t.triangle).collect()
    }

    /// Addressed triangles with their slot, location and indices.
    pub fn leaf_triangles(&self) -> Vec<LeafTriangle> {
        self.entry.data.leaf_triangles(self.entry.pointer, self.compression)
    }

    /// Primitives the leaf holds: addressed triangles, or one for procedural
    /// and instance leaves.
    pub fn primitive_count(&self) -> u32 {
        match (&self.entry.data, self.kind()) {
            (NodeData::PrimitiveRange(r), _) => r.leaf_triangles().len() as u32,
            (NodeData::Triangle(_), NodeKind::Triangle(slot)) => {
                TriangleNode::addressed_slots(slot, self.compression).len() as u32
            }
            (_, NodeKind::Procedural | NodeKind::Instance) => 1,
            _ => 0,
        }
    }

    /// Bounds of the leaf contents, tighter than [`bounds`](Self::bounds).
    pub fn content_bounds(&self) -> Aabb {
        match (&self.entry.data, self.kind()) {
            (NodeData::Triangle(t), NodeKind::Triangle(slot)) => t.bounds(slot, self.compression),
            (NodeData::PrimitiveRange(r), _) => r.bounds(),
            (NodeData::Procedural(p), _) if p.is_active() => p.bounds,
            _ => self.entry.bounds,
        }
    }
}

// ============================================================================
// Encoded structure
// ============================================================================

/// Fully decoded acceleration structure.
#[derive(Debug)]
pub struct EncodedBvh {
    header: AccelerationStructureHeader,
    virtual_address: u64,
    nodes: Vec<NodeEntry>,
    by_pointer: HashMap<NodePointer, u32>,
    by_offset: HashMap<u64, u32>,
    index_map: IndexReferenceMap,
    primitive_node_ptrs: Vec<u32>,
    revisits: u32,
    parents: OnceLock<ParentBlock>,
}

impl EncodedBvh {
    /// Decode the header, node stream and primitive pointer table.
    #[tracing::instrument(level = "debug", skip_all, fields(rtip = ?view.rtip))]
    pub fn decode(view: &BlobView<'_>, options: &DecodeOptions) -> Result<Self> {
        let rtip = view.rtip;
        let header = rtip.parse_header(view.data)?;
        let mut bvh = Self {
            header,
            virtual_address: view.virtual_address,
            nodes: Vec::new(),
            by_pointer: HashMap::new(),
            by_offset: HashMap::new(),
            index_map: IndexReferenceMap::new(),
            primitive_node_ptrs: Vec::new(),
            revisits: 0,
            parents: OnceLock::new(),
        };

        if let Some(root) = rtip.root_node_offset(&bvh.header)? {
            bvh.walk(view.data, root)?;
        }

        let count = bvh.header.primitive_count as u64;
        let table = section(
            view.data,
            bvh.header.offsets.primitive_node_ptrs as u64,
            count * 4,
            "primitive node pointers",
        )?;
        bvh.primitive_node_ptrs = table.chunks_exact(4).map(|c| read_u32(c, 0)).collect();

        if bvh.header.is_blas() && bvh.index_map.len() != bvh.header.primitive_count as usize {
            let err = Error::IncompleteIndexMap {
                expected: bvh.header.primitive_count,
                resolved: bvh.index_map.len() as u32,
            };
            if options.strict_index_map {
                return Err(err);
            }
            tracing::warn!("{}", err);
        }

        if rtip == RtIp::Rtip31 {
            let block = bvh.build_parent_block();
            let _ = bvh.parents.set(block);
        }

        tracing::debug!(
            nodes = bvh.nodes.len(),
            primitives = bvh.index_map.len(),
            revisits = bvh.revisits,
            "decoded structure"
        );
        Ok(bvh)
    }

    fn walk(&mut self, data: &[u8], root: NodePointer) -> Result<()> {
        let stream = self.header.node_stream();
        let compression = self.header.build_info.triangle_compression();
        let is_blas = self.header.is_blas();
        let rtip = root.rtip();

        let mut stack: Vec<(NodePointer, Option<u32>, u32, Aabb)> = vec![(root, None, 0, self.header.bounds)];
        while let Some((ptr, parent, depth, bounds)) = stack.pop() {
            if let Some(&existing) = self.by_pointer.get(&ptr) {
                // Shared or cyclic link; kept for topology checks, not re-decoded
                self.revisits += 1;
                tracing::debug!(pointer = %ptr, "node reached twice");
                if let Some(p) = parent {
                    self.nodes[p as usize].children.push(existing);
                }
                continue;
            }

            ptr.check_within(&stream)?;
            check_level(ptr, is_blas)?;
            let node = read_node(data, ptr, &self.header)?;
            let index = self.nodes.len() as u32;

            match ptr.kind() {
                NodeKind::Triangle(_) => {
                    for t in node.leaf_triangles(ptr, compression) {
                        self.index_map.insert_at(ptr, t.slot, t.location);
                    }
                }
                NodeKind::Procedural | NodeKind::Instance => {
                    self.index_map.insert(ptr, 0);
                }
                _ => {}
            }

            let children = node.child_refs(rtip)?;
            for child in children.iter().rev() {
                stack.push((child.pointer, Some(index), depth + 1, child.bounds));
            }

            let bounds = if parent.is_none() && (bounds.is_empty() || bounds.is_nan()) {
                children.iter().fold(Aabb::EMPTY, |acc, c| acc.union(&c.bounds))
            } else {
                bounds
            };

            if let Some(p) = parent {
                self.nodes[p as usize].children.push(index);
            }
            self.by_pointer.insert(ptr, index);
            self.by_offset.entry(ptr.byte_offset()).or_insert(index);
            self.nodes.push(NodeEntry {
                pointer: ptr,
                parent,
                depth,
                bounds,
                data: node,
                children: SmallVec::new(),
            });
        }
        Ok(())
    }

    fn build_parent_block(&self) -> ParentBlock {
        let rtip = self.header.rtip;
        let stored = rtip == RtIp::Rtip31;
        let links = self.nodes.iter().filter_map(|n| {
            let stored_link = match &n.data {
                NodeData::QuantizedBvh8(q) if stored => NodePointer::decode(rtip, q.parent_pointer).ok(),
                NodeData::Instance(i) if stored => i.parent_pointer().and_then(|p| NodePointer::decode(rtip, p).ok()),
                _ => None,
            };
            stored_link
                .or_else(|| n.parent.map(|p| self.nodes[p as usize].pointer))
                .map(|parent| (n.pointer.byte_offset(), parent))
        });
        ParentBlock::from_links(links, stored)
    }

    #[inline]
    pub fn header(&self) -> &AccelerationStructureHeader {
        &self.header
    }

    #[inline]
    pub fn rtip(&self) -> RtIp {
        self.header.rtip
    }

    #[inline]
    pub fn virtual_address(&self) -> u64 {
        self.virtual_address
    }

    /// Decoded nodes.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn view(&self, index: u32) -> Option<NodeView<'_>> {
        self.nodes.get(index as usize).map(|entry| NodeView {
            index,
            entry,
            compression: self.header.build_info.triangle_compression(),
        })
    }

    pub fn node(&self, index: u32) -> Option<NodeView<'_>> {
        self.view(index)
    }

    pub fn root(&self) -> Option<NodeView<'_>> {
        self.view(0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeView<'_>> + '_ {
        (0..self.nodes.len() as u32).filter_map(move |i| self.view(i))
    }

    pub fn children(&self, index: u32) -> impl Iterator<Item = NodeView<'_>> + '_ {
        let kids: &[u32] = self.nodes.get(index as usize).map(|n| &n.children[..]).unwrap_or(&[]);
        kids.iter().filter_map(move |i| self.view(*i))
    }

    /// Parent through the [`ParentBlock`].
    pub fn parent(&self, index: u32) -> Option<NodeView<'_>> {
        let entry = self.nodes.get(index as usize)?;
        let parent = self.parent_block().parent_of(entry.pointer.byte_offset())?;
        self.node_by_pointer(parent)
    }

    /// Reverse links; stored ones for RTIP 3.1, derived on first use otherwise.
    pub fn parent_block(&self) -> &ParentBlock {
        self.parents.get_or_init(|| self.build_parent_block())
    }

    pub fn node_by_pointer(&self, ptr: NodePointer) -> Option<NodeView<'_>> {
        self.by_pointer.get(&ptr).and_then(|i| self.view(*i))
    }

    /// First node decoded at `byte_offset`.
    pub fn node_by_offset(&self, byte_offset: u64) -> Option<NodeView<'_>> {
        self.by_offset.get(&byte_offset).and_then(|i| self.view(*i))
    }

    pub fn leaves(&self) -> impl Iterator<Item = NodeView<'_>> + '_ {
        self.nodes().filter(|n| n.is_leaf())
    }

    #[inline]
    pub fn index_map(&self) -> &IndexReferenceMap {
        &self.index_map
    }

    /// Leaf holding logical primitive `index`, and its triangle slot.
    pub fn primitive(&self, index: u32) -> Option<(NodeView<'_>, u8)> {
        let (ptr, slot) = self.index_map.location(index)?;
        self.node_by_pointer(ptr).map(|n| (n, slot))
    }

    /// Raw entries of the primitive node pointer table.
    #[inline]
    pub fn primitive_node_pointers(&self) -> &[u32] {
        &self.primitive_node_ptrs
    }

    /// Times the walk reached an already decoded node.
    #[inline]
    pub fn revisit_count(&self) -> u32 {
        self.revisits
    }

    /// Node stream bounds, relative to the header.
    pub fn node_stream(&self) -> Range<u64> {
        self.header.node_stream()
    }
}

/// Leaf kinds must match the structure level.
fn check_level(ptr: NodePointer, is_blas: bool) -> Result<()> {
    let ok = match ptr.kind() {
        NodeKind::Instance => !is_blas,
        NodeKind::Triangle(_) | NodeKind::Procedural => is_blas,
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        let level = if is_blas { "bottom-level" } else { "top-level" };
        Err(Error::invalid_pointer(
            ptr.encode(),
            format!("{} node in a {} structure", ptr.kind(), level),
        ))
    }
}

// ============================================================================
// Shared query surface
// ============================================================================

/// Query surface shared by bottom- and top-level structures.
pub trait AccelerationStructure: Send + Sync {
    fn bvh(&self) -> &EncodedBvh;

    fn header(&self) -> &AccelerationStructureHeader {
        self.bvh().header()
    }

    fn node_count(&self) -> usize {
        self.bvh().node_count()
    }

    fn node(&self, index: u32) -> Option<NodeView<'_>> {
        self.bvh().node(index)
    }

    fn root(&self) -> Option<NodeView<'_>> {
        self.bvh().root()
    }

    fn index_map(&self) -> &IndexReferenceMap {
        self.bvh().index_map()
    }
}

impl AccelerationStructure for EncodedBvh {
    fn bvh(&self) -> &EncodedBvh {
        self
    }
}
