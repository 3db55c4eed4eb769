//! Bottom-level structures.

use super::encoded::{AccelerationStructure, BlobView, EncodedBvh};
use super::geometry_info::{read_geometry_infos, GeometryInfo};
use super::nodes::Triangle;
use crate::config::DecodeOptions;
use crate::util::{Error, Result};

/// Decoded BLAS: the node tree plus its geometry descriptors.
#[derive(Debug)]
pub struct EncodedBlas {
    bvh: EncodedBvh,
    geometry_infos: Vec<GeometryInfo>,
}

impl EncodedBlas {
    /// Decode a BLAS blob.
    #[tracing::instrument(level = "debug", skip_all, fields(len = blob.len()))]
    pub fn decode(blob: &[u8], options: &DecodeOptions) -> Result<Self> {
        let view = BlobView::open(blob)?;
        let bvh = EncodedBvh::decode(&view, options)?;
        if !bvh.header().is_blas() {
            return Err(Error::inconsistent("top-level header in a bottom-level entry"));
        }
        let geometry_infos = read_geometry_infos(view.data, bvh.header())?;
        Ok(Self { bvh, geometry_infos })
    }

    pub fn geometry_info(&self, geometry_index: u32) -> Option<&GeometryInfo> {
        self.geometry_infos.get(geometry_index as usize)
    }

    #[inline]
    pub fn geometry_infos(&self) -> &[GeometryInfo] {
        &self.geometry_infos
    }

    #[inline]
    pub fn geometry_count(&self) -> usize {
        self.geometry_infos.len()
    }

    /// Triangle of logical primitive `index`; `None` for procedural primitives.
    pub fn primitive_triangle(&self, index: u32) -> Option<Triangle> {
        let (node, slot) = self.bvh.primitive(index)?;
        node.leaf_triangles()
            .into_iter()
            .find(|t| t.slot == slot)
            .map(|t| t.triangle)
    }

    /// Every triangle in the structure, in logical primitive order.
    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        (0..self.bvh.index_map().len() as u32).filter_map(move |i| self.primitive_triangle(i))
    }

    /// No nodes at all (empty build).
    pub fn is_empty(&self) -> bool {
        self.bvh.node_count() == 0
    }
}

impl AccelerationStructure for EncodedBlas {
    fn bvh(&self) -> &EncodedBvh {
        &self.bvh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::header::TriangleCompressionMode;
    use crate::bvh::rtip::RtIp;
    use crate::bvh::writer::{BuildNode, StructureWriter};
    use crate::util::Vec3;

    #[test]
    fn test_geometry_table() {
        let tree = BuildNode::boxed(vec![
            BuildNode::triangle([Vec3::ZERO, Vec3::X, Vec3::Y], 0, 0),
            BuildNode::triangle([Vec3::Z, Vec3::X, Vec3::Y], 1, 0),
            BuildNode::triangle([Vec3::ONE, Vec3::X, Vec3::Y], 1, 0),
        ]);
        for rtip in [RtIp::Rtip11, RtIp::Rtip31] {
            let blob = StructureWriter::blas(rtip).write(&tree).unwrap();
            let blas = EncodedBlas::decode(&blob, &DecodeOptions::default()).unwrap();
            assert_eq!(blas.geometry_count(), 2);
            assert_eq!(blas.geometry_info(0).unwrap().primitive_count, 1);
            assert_eq!(blas.geometry_info(1).unwrap().primitive_count, 2);
            assert_eq!(blas.geometry_info(1).unwrap().prim_node_ptrs_offset, 4);
            assert!(blas.geometry_info(2).is_none());
            assert_eq!(blas.triangles().count(), 3);
        }
    }

    #[test]
    fn test_pair_primitives() {
        let quad = BuildNode::triangle_pair([Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(1.0, 1.0, 0.0)], 0, 0);
        let blob = StructureWriter::blas(RtIp::Rtip11)
            .with_compression(TriangleCompressionMode::PairTriangles)
            .write(&BuildNode::boxed(vec![quad]))
            .unwrap();
        let blas = EncodedBlas::decode(&blob, &DecodeOptions::default()).unwrap();
        assert_eq!(blas.node_count(), 2);
        assert_eq!(blas.index_map().len(), 2);
        assert!(blas.index_map().is_bijection());
        let tris: Vec<Triangle> = blas.triangles().collect();
        assert_eq!(tris.len(), 2);
        assert!(tris.iter().all(|t| t.is_valid));
        assert!(tris[1].vertices.contains(&Vec3::new(1.0, 1.0, 0.0)));
    }

    #[test]
    fn test_level_mismatch() {
        let inst = BuildNode::instance(0, crate::util::Affine3A::IDENTITY, crate::util::Aabb::new(Vec3::ZERO, Vec3::ONE));
        let blob = StructureWriter::tlas(RtIp::Rtip11).write(&inst).unwrap();
        let err = EncodedBlas::decode(&blob, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InconsistentHeader(_)));
    }

    #[test]
    fn test_empty_blas() {
        let blob = StructureWriter::blas(RtIp::Rtip11).write_empty();
        let blas = EncodedBlas::decode(&blob, &DecodeOptions::default()).unwrap();
        assert!(blas.is_empty());
        assert!(blas.root().is_none());
        assert_eq!(blas.geometry_count(), 0);
    }
}
