//! Top-level structures and instance resolution.
//!
//! Instances resolve by bundle index: the reference field of an instance
//! record holds the position of the BLAS among the chunk's bottom-level
//! entries. Blob virtual addresses are carried for display only and never
//! take part in resolution, so a trace whose addresses were rebased still
//! links up.

use serde::Serialize;

use super::encoded::{AccelerationStructure, BlobView, EncodedBvh, NodeView};
use super::nodes::{InstanceDesc, InstanceNode, NodeData};
use crate::config::DecodeOptions;
use crate::util::{Aabb, Affine3A, Error, Result};

/// Where an instance's geometry lives in the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlasReference {
    /// Not resolved yet; the TLAS has not been placed in a bundle.
    Unresolved,
    /// Index of a decoded BLAS.
    Resolved(u32),
    /// The BLAS is out of range or failed to decode.
    Missing { blas_index: u64 },
}

impl BlasReference {
    #[inline]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }

    pub fn blas(&self) -> Option<u32> {
        match self {
            Self::Resolved(i) => Some(*i),
            _ => None,
        }
    }
}

/// Read-only view of one instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceView<'a> {
    /// Logical instance index (walk order).
    pub index: u32,
    node: NodeView<'a>,
    instance: &'a InstanceNode,
    reference: BlasReference,
}

impl<'a> InstanceView<'a> {
    /// The instance leaf in the node table.
    #[inline]
    pub fn node(&self) -> NodeView<'a> {
        self.node
    }

    #[inline]
    pub fn record(&self) -> &'a InstanceNode {
        self.instance
    }

    #[inline]
    pub fn desc(&self) -> &'a InstanceDesc {
        &self.instance.desc
    }

    /// BLAS index as stored in the descriptor.
    #[inline]
    pub fn blas_index(&self) -> u64 {
        self.instance.blas_index()
    }

    #[inline]
    pub fn blas_reference(&self) -> BlasReference {
        self.reference
    }

    #[inline]
    pub fn is_missing(&self) -> bool {
        self.reference.is_missing()
    }

    /// A zero mask hides the instance from every ray.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.instance.is_active()
    }

    pub fn world_transform(&self) -> Affine3A {
        self.instance.world_transform()
    }

    pub fn inverse_transform(&self) -> Affine3A {
        self.instance.inverse_transform()
    }

    /// World space bounds as stored by the parent box.
    pub fn world_bounds(&self) -> Aabb {
        self.node.bounds()
    }
}

/// Decoded TLAS.
#[derive(Debug)]
pub struct EncodedTlas {
    bvh: EncodedBvh,
    /// Per logical instance, filled in by [`resolve`](Self::resolve).
    references: Vec<BlasReference>,
}

impl EncodedTlas {
    /// Decode a TLAS blob. Instances stay unresolved until the bundle
    /// resolves them against its BLAS slots.
    #[tracing::instrument(level = "debug", skip_all, fields(len = blob.len()))]
    pub fn decode(blob: &[u8], options: &DecodeOptions) -> Result<Self> {
        let view = BlobView::open(blob)?;
        let bvh = EncodedBvh::decode(&view, options)?;
        if bvh.header().is_blas() {
            return Err(Error::inconsistent("bottom-level header in a top-level entry"));
        }
        let references = vec![BlasReference::Unresolved; bvh.index_map().len()];
        Ok(Self { bvh, references })
    }

    /// Resolve every instance against `blas_slots` (one flag per bundle slot,
    /// true when that BLAS decoded). Returns the dangling references.
    ///
    /// Matching is by slot index only; see the module docs.
    pub fn resolve(&mut self, blas_slots: &[bool]) -> Vec<Error> {
        let mut dangling = Vec::new();
        for i in 0..self.references.len() {
            let Some(blas_index) = self.instance_node(i as u32).map(|(_, n)| n.blas_index()) else {
                continue;
            };
            let present = usize::try_from(blas_index)
                .ok()
                .and_then(|b| blas_slots.get(b))
                .copied()
                .unwrap_or(false);
            self.references[i] = if present {
                BlasReference::Resolved(blas_index as u32)
            } else {
                if blas_index >= blas_slots.len() as u64 {
                    dangling.push(Error::DanglingInstanceReference {
                        instance: i as u32,
                        blas_index,
                        blas_count: blas_slots.len(),
                    });
                }
                BlasReference::Missing { blas_index }
            };
        }
        dangling
    }

    fn instance_node(&self, index: u32) -> Option<(NodeView<'_>, &InstanceNode)> {
        let (node, _) = self.bvh.primitive(index)?;
        match node.data() {
            NodeData::Instance(inst) => Some((node, inst)),
            _ => None,
        }
    }

    #[inline]
    pub fn instance_count(&self) -> usize {
        self.references.len()
    }

    pub fn instance(&self, index: u32) -> Option<InstanceView<'_>> {
        let (node, instance) = self.instance_node(index)?;
        Some(InstanceView {
            index,
            node,
            instance,
            reference: self.references.get(index as usize).copied().unwrap_or(BlasReference::Unresolved),
        })
    }

    pub fn instances(&self) -> impl Iterator<Item = InstanceView<'_>> + '_ {
        (0..self.instance_count() as u32).filter_map(move |i| self.instance(i))
    }

    /// Resolved references, per logical instance.
    #[inline]
    pub fn references(&self) -> &[BlasReference] {
        &self.references
    }

    pub fn missing_count(&self) -> usize {
        self.references.iter().filter(|r| r.is_missing()).count()
    }
}

impl AccelerationStructure for EncodedTlas {
    fn bvh(&self) -> &EncodedBvh {
        &self.bvh
    }
}
