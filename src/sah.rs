//! Surface area heuristic evaluation.
//!
//! Cost of a box node is `traversal_cost + sum(child_area / node_area * child_cost)`;
//! a leaf costs `intersection_cost * primitive_count`. Areas come from the
//! full precision bounds the decoder stores for every node, so half precision
//! boxes are costed on their expanded bounds.
//!
//! The evaluator walks the decoded node table from the root with a visited
//! set. A node reached a second time is reported as a topology diagnostic and
//! contributes nothing to its second parent.

use rayon::prelude::*;
use serde::Serialize;
use smallvec::SmallVec;

use crate::bvh::{AccelerationStructure, BvhBundle, EncodedBlas, EncodedTlas, NodeKind, NodeView};
use crate::config::SahConfig;
use crate::util::Error;

/// A node reached through more than one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopologyDiagnostic {
    /// Node table index of the node reached again.
    pub node: u32,
    pub byte_offset: u64,
    /// Node holding the extra link.
    pub parent: u32,
}

impl TopologyDiagnostic {
    pub fn to_error(&self) -> Error {
        Error::MalformedTopology {
            offset: self.byte_offset,
        }
    }
}

/// Min and mean of the per-leaf triangle quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriangleQuality {
    pub min: f32,
    pub average: f32,
    pub leaves: u32,
}

/// Result of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SahReport {
    /// Cost per node table index; `None` for nodes the walk did not own.
    pub node_costs: Vec<Option<f32>>,
    /// Cost of the root, zero for an empty structure.
    pub total_cost: f32,
    pub leaf_count: u32,
    /// Quality per triangle leaf in `[0, 1]`, by node index.
    pub leaf_quality: Vec<(u32, f32)>,
    pub triangle_quality: Option<TriangleQuality>,
    pub diagnostics: Vec<TopologyDiagnostic>,
}

impl SahReport {
    pub fn node_cost(&self, index: u32) -> Option<f32> {
        self.node_costs.get(index as usize).copied().flatten()
    }

    /// No node was reached twice.
    pub fn is_well_formed(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = Error> + '_ {
        self.diagnostics.iter().map(|d| d.to_error())
    }
}

/// Evaluates structures under one cost model.
#[derive(Debug, Clone, Copy, Default)]
pub struct SahEvaluator {
    config: SahConfig,
}

impl SahEvaluator {
    pub fn new(config: SahConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &SahConfig {
        &self.config
    }

    #[tracing::instrument(level = "debug", skip_all, fields(nodes = structure.node_count()))]
    pub fn evaluate<S: AccelerationStructure + ?Sized>(&self, structure: &S) -> SahReport {
        let bvh = structure.bvh();
        let count = bvh.node_count();
        let mut report = SahReport {
            node_costs: vec![None; count],
            ..SahReport::default()
        };
        if count == 0 {
            return report;
        }

        // Preorder with a visited set; each node is owned by the first parent to reach it
        let mut visited = vec![false; count];
        let mut owned: Vec<SmallVec<[u32; 8]>> = vec![SmallVec::new(); count];
        let mut order = Vec::with_capacity(count);
        let mut stack = vec![0u32];
        visited[0] = true;
        while let Some(n) = stack.pop() {
            order.push(n);
            let Some(node) = bvh.node(n) else { continue };
            for &c in node.child_indices() {
                if visited[c as usize] {
                    let byte_offset = bvh.node(c).map(|v| v.byte_offset()).unwrap_or(0);
                    tracing::warn!(node = c, offset = byte_offset, "node reached twice");
                    report.diagnostics.push(TopologyDiagnostic {
                        node: c,
                        byte_offset,
                        parent: n,
                    });
                    continue;
                }
                visited[c as usize] = true;
                owned[n as usize].push(c);
                stack.push(c);
            }
        }

        // Children always follow their owner in `order`
        for &n in order.iter().rev() {
            let Some(node) = bvh.node(n) else { continue };
            let cost = if node.is_leaf() {
                report.leaf_count += 1;
                if let Some(q) = leaf_triangle_quality(&node) {
                    report.leaf_quality.push((n, q));
                }
                self.config.intersection_cost * node.primitive_count() as f32
            } else {
                let area = node.bounds().surface_area();
                let mut cost = self.config.traversal_cost;
                for &c in &owned[n as usize] {
                    let Some(child) = bvh.node(c) else { continue };
                    let child_cost = report.node_costs[c as usize].unwrap_or(0.0);
                    let weight = if area > self.config.area_epsilon {
                        child.bounds().surface_area() / area
                    } else {
                        1.0
                    };
                    cost += weight * child_cost;
                }
                cost
            };
            report.node_costs[n as usize] = Some(cost);
        }

        report.total_cost = report.node_costs[0].unwrap_or(0.0);
        report.leaf_quality.sort_unstable_by_key(|(n, _)| *n);
        if !report.leaf_quality.is_empty() {
            let mut min = f32::INFINITY;
            let mut sum = 0.0f64;
            for (_, q) in &report.leaf_quality {
                min = min.min(*q);
                sum += *q as f64;
            }
            report.triangle_quality = Some(TriangleQuality {
                min,
                average: (sum / report.leaf_quality.len() as f64) as f32,
                leaves: report.leaf_quality.len() as u32,
            });
        }
        report
    }

    /// Evaluate every decoded structure of a bundle in parallel.
    pub fn evaluate_bundle(&self, bundle: &BvhBundle) -> BundleSahReport {
        let blas: Vec<(usize, &EncodedBlas)> = bundle.blas_iter().collect();
        let tlas: Vec<(usize, &EncodedTlas)> = bundle.tlas_iter().collect();
        BundleSahReport {
            blas: blas.par_iter().map(|(i, b)| (*i, self.evaluate(*b))).collect(),
            tlas: tlas.par_iter().map(|(i, t)| (*i, self.evaluate(*t))).collect(),
        }
    }
}

/// Reports for the decoded structures of a bundle, keyed by slot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BundleSahReport {
    pub blas: Vec<(usize, SahReport)>,
    pub tlas: Vec<(usize, SahReport)>,
}

/// How much of its bounding box a triangle leaf fills: twice the mean triangle
/// area over the box area, normalized to `[0, 1]`. Values past 1.01 mark a
/// sliver whose area is floating point noise and score 0.
fn leaf_triangle_quality(node: &NodeView<'_>) -> Option<f32> {
    if !matches!(node.kind(), NodeKind::Triangle(_)) {
        return None;
    }
    let triangles = node.triangles();
    if triangles.is_empty() {
        return None;
    }
    let box_area = node.content_bounds().surface_area();
    let triangle_area: f32 = triangles.iter().map(|t| t.area()).sum();
    let average = triangle_area / triangles.len() as f32;
    let mut quality = 0.0f32;
    if box_area >= triangle_area && box_area > f32::MIN_POSITIVE {
        quality = 2.0 * (2.0 * average) / box_area;
    }
    if quality > 1.01 {
        quality = 0.0;
    }
    Some(quality.min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::{BlobView, BuildNode, EncodedBvh, RtIp, StructureWriter};
    use crate::config::DecodeOptions;
    use crate::util::Vec3;

    fn decode(tree: &BuildNode, rtip: RtIp) -> EncodedBvh {
        let blob = StructureWriter::blas(rtip).write(tree).unwrap();
        EncodedBvh::decode(&BlobView::open(&blob).unwrap(), &DecodeOptions::default()).unwrap()
    }

    fn tri(x: f32) -> BuildNode {
        BuildNode::triangle([Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 0.0, 1.0), Vec3::new(x, 1.0, 0.0)], 0, 0)
    }

    #[test]
    fn test_leaf_and_root_cost() {
        let bvh = decode(&BuildNode::boxed(vec![tri(0.0), tri(2.0)]), RtIp::Rtip11);
        let config = SahConfig {
            traversal_cost: 1.0,
            intersection_cost: 3.0,
            ..SahConfig::default()
        };
        let report = SahEvaluator::new(config).evaluate(&bvh);
        assert_eq!(report.node_cost(1), Some(3.0));
        assert_eq!(report.node_cost(2), Some(3.0));
        let root = bvh.root().unwrap().bounds().surface_area();
        let child = bvh.node(1).unwrap().bounds().surface_area();
        let expected = 1.0 + 2.0 * (child / root) * 3.0;
        assert!((report.total_cost - expected).abs() < 1e-5);
        assert!(report.is_well_formed());
        assert_eq!(report.leaf_count, 2);
    }

    #[test]
    fn test_half_boxes_use_expanded_bounds() {
        let full = decode(&BuildNode::boxed(vec![BuildNode::boxed(vec![tri(0.0), tri(2.0)]), tri(5.0)]), RtIp::Rtip11);
        let half = decode(&BuildNode::boxed(vec![BuildNode::half_box(vec![tri(0.0), tri(2.0)]), tri(5.0)]), RtIp::Rtip11);
        let a = SahEvaluator::default().evaluate(&full);
        let b = SahEvaluator::default().evaluate(&half);
        assert!(a.total_cost > 0.0 && b.total_cost > 0.0);
        // Integer coordinates are exact in f16, so both layouts cost the same
        assert!((a.total_cost - b.total_cost).abs() < 1e-5);
    }

    #[test]
    fn test_triangle_quality() {
        // Right triangle filling half of a unit square
        let flat = BuildNode::triangle([Vec3::ZERO, Vec3::X, Vec3::Y], 0, 0);
        let bvh = decode(&BuildNode::boxed(vec![flat]), RtIp::Rtip11);
        let report = SahEvaluator::default().evaluate(&bvh);
        let q = report.triangle_quality.unwrap();
        assert_eq!(q.leaves, 1);
        assert!((q.min - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_structure() {
        let blob = StructureWriter::blas(RtIp::Rtip31).write_empty();
        let bvh = EncodedBvh::decode(&BlobView::open(&blob).unwrap(), &DecodeOptions::default()).unwrap();
        let report = SahEvaluator::default().evaluate(&bvh);
        assert_eq!(report.total_cost, 0.0);
        assert!(report.triangle_quality.is_none());
    }
}
