//! Geometry statistics over decoded structures.

use serde::Serialize;

use super::blas::EncodedBlas;
use super::encoded::EncodedBvh;
use super::node_pointer::NodeKind;
use super::tlas::EncodedTlas;
use crate::bvh::AccelerationStructure;

/// Node counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    pub box32: u32,
    pub box16: u32,
    pub quantized_bvh8: u32,
    pub triangle: u32,
    pub procedural: u32,
    pub instance: u32,
}

impl NodeCounts {
    pub fn interior(&self) -> u32 {
        self.box32 + self.box16 + self.quantized_bvh8
    }

    pub fn leaves(&self) -> u32 {
        self.triangle + self.procedural + self.instance
    }

    fn add(&mut self, other: &Self) {
        self.box32 += other.box32;
        self.box16 += other.box16;
        self.quantized_bvh8 += other.quantized_bvh8;
        self.triangle += other.triangle;
        self.procedural += other.procedural;
        self.instance += other.instance;
    }
}

/// Statistics of one structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructureStats {
    pub nodes: NodeCounts,
    pub primitive_count: u32,
    pub max_depth: u32,
    pub average_leaf_depth: f32,
    pub valid_triangles: u32,
    /// Degenerate triangles, inactive procedurals and zero-mask instances.
    pub inactive_primitives: u32,
    pub root_surface_area: f32,
    pub revisits: u32,
}

impl StructureStats {
    pub fn compute(bvh: &EncodedBvh) -> Self {
        let mut stats = Self {
            primitive_count: bvh.index_map().len() as u32,
            revisits: bvh.revisit_count(),
            root_surface_area: bvh.root().map(|r| r.bounds().surface_area()).unwrap_or(0.0),
            ..Self::default()
        };
        let mut depth_sum = 0u64;
        for node in bvh.nodes() {
            stats.max_depth = stats.max_depth.max(node.depth());
            match node.kind() {
                NodeKind::Box32 => stats.nodes.box32 += 1,
                NodeKind::Box16 => stats.nodes.box16 += 1,
                NodeKind::QuantizedBvh8 => stats.nodes.quantized_bvh8 += 1,
                NodeKind::Triangle(_) => {
                    stats.nodes.triangle += 1;
                    for t in node.triangles() {
                        if t.is_valid {
                            stats.valid_triangles += 1;
                        } else {
                            stats.inactive_primitives += 1;
                        }
                    }
                }
                NodeKind::Procedural => {
                    stats.nodes.procedural += 1;
                    if let super::nodes::NodeData::Procedural(p) = node.data() {
                        stats.inactive_primitives += (!p.is_active()) as u32;
                    }
                }
                NodeKind::Instance => {
                    stats.nodes.instance += 1;
                    if let super::nodes::NodeData::Instance(i) = node.data() {
                        stats.inactive_primitives += (!i.is_active()) as u32;
                    }
                }
            }
            if node.is_leaf() {
                depth_sum += node.depth() as u64;
            }
        }
        let leaves = stats.nodes.leaves();
        if leaves > 0 {
            stats.average_leaf_depth = (depth_sum as f64 / leaves as f64) as f32;
        }
        stats
    }
}

/// Totals over a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BundleStats {
    pub blas_count: usize,
    pub tlas_count: usize,
    /// Slots whose structure failed to decode.
    pub absent_structures: usize,
    pub nodes: NodeCounts,
    pub primitive_count: u64,
    pub valid_triangles: u64,
    pub empty_blas: usize,
    pub missing_instances: usize,
    pub inactive_instances: usize,
}

impl BundleStats {
    pub(crate) fn accumulate_blas(&mut self, blas: Option<&EncodedBlas>) {
        self.blas_count += 1;
        let Some(blas) = blas else {
            self.absent_structures += 1;
            return;
        };
        let s = StructureStats::compute(blas.bvh());
        self.nodes.add(&s.nodes);
        self.primitive_count += s.primitive_count as u64;
        self.valid_triangles += s.valid_triangles as u64;
        if blas.is_empty() {
            self.empty_blas += 1;
        }
    }

    pub(crate) fn accumulate_tlas(&mut self, tlas: Option<&EncodedTlas>) {
        self.tlas_count += 1;
        let Some(tlas) = tlas else {
            self.absent_structures += 1;
            return;
        };
        let s = StructureStats::compute(tlas.bvh());
        self.nodes.add(&s.nodes);
        self.primitive_count += s.primitive_count as u64;
        self.missing_instances += tlas.missing_count();
        self.inactive_instances += tlas.instances().filter(|i| !i.is_active()).count();
    }
}
