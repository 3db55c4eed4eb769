//! Conversion to and from vendor-neutral (DXR) definitions.
//!
//! Every hardware node kind and build setting has a standard counterpart;
//! records with nothing to export (inactive procedurals, degenerate
//! triangles) map to [`StandardNodeRecord::Omitted`] instead of failing.

use serde::Serialize;
use smallvec::SmallVec;

use crate::bvh::nodes::instance_flags;
use crate::bvh::{
    AccelerationStructureHeader, BuildFlags, Fp16BoxMode, GeometryType, NodeData, NodeKind, NodeView,
    StructureType, TriangleCompressionMode,
};
use crate::util::bytes::{read_f32, read_matrix3x4, read_u32, read_u64, write_f32, write_matrix3x4, write_u32, write_u64};
use crate::util::{Aabb, Error, Result, Vec3};

// ============================================================================
// Build settings
// ============================================================================

/// Application build flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DxrBuildFlags(pub u32);

impl DxrBuildFlags {
    pub const NONE: Self = Self(0);
    pub const ALLOW_UPDATE: Self = Self(1 << 0);
    pub const ALLOW_COMPACTION: Self = Self(1 << 1);
    pub const FAST_TRACE: Self = Self(1 << 2);
    pub const FAST_BUILD: Self = Self(1 << 3);
    pub const MINIMIZE_MEMORY: Self = Self(1 << 4);
    pub const PERFORM_UPDATE: Self = Self(1 << 5);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

const BUILD_FLAG_MAP: [(DxrBuildFlags, BuildFlags); 6] = [
    (DxrBuildFlags::ALLOW_UPDATE, BuildFlags::ALLOW_UPDATE),
    (DxrBuildFlags::ALLOW_COMPACTION, BuildFlags::ALLOW_COMPACTION),
    (DxrBuildFlags::FAST_TRACE, BuildFlags::PREFER_FAST_TRACE),
    (DxrBuildFlags::FAST_BUILD, BuildFlags::PREFER_FAST_BUILD),
    (DxrBuildFlags::PERFORM_UPDATE, BuildFlags::PERFORM_UPDATE),
    (DxrBuildFlags::MINIMIZE_MEMORY, BuildFlags::MINIMIZE_MEMORY),
];

impl From<BuildFlags> for DxrBuildFlags {
    fn from(flags: BuildFlags) -> Self {
        let bits = BUILD_FLAG_MAP
            .iter()
            .filter(|(_, hw)| flags.contains(*hw))
            .fold(0, |acc, (dxr, _)| acc | dxr.0);
        Self(bits)
    }
}

impl From<DxrBuildFlags> for BuildFlags {
    fn from(flags: DxrBuildFlags) -> Self {
        let bits = BUILD_FLAG_MAP
            .iter()
            .filter(|(dxr, _)| flags.contains(*dxr))
            .fold(0, |acc, (_, hw)| acc | hw.0);
        Self(bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DxrStructureType {
    TopLevel,
    BottomLevel,
}

impl From<StructureType> for DxrStructureType {
    fn from(t: StructureType) -> Self {
        match t {
            StructureType::TopLevel => Self::TopLevel,
            StructureType::BottomLevel => Self::BottomLevel,
        }
    }
}

impl From<DxrStructureType> for StructureType {
    fn from(t: DxrStructureType) -> Self {
        match t {
            DxrStructureType::TopLevel => Self::TopLevel,
            DxrStructureType::BottomLevel => Self::BottomLevel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DxrTriangleCompression {
    None,
    TwoTriangles,
    PairTriangles,
    AutomaticNumberOfTriangles,
    /// No hardware counterpart; converts to no compression.
    FourTriangles,
}

impl From<TriangleCompressionMode> for DxrTriangleCompression {
    fn from(mode: TriangleCompressionMode) -> Self {
        match mode {
            TriangleCompressionMode::TwoTriangles => Self::TwoTriangles,
            TriangleCompressionMode::PairTriangles => Self::PairTriangles,
            TriangleCompressionMode::Automatic => Self::AutomaticNumberOfTriangles,
            TriangleCompressionMode::None | TriangleCompressionMode::Other(_) => Self::None,
        }
    }
}

impl From<DxrTriangleCompression> for TriangleCompressionMode {
    fn from(mode: DxrTriangleCompression) -> Self {
        match mode {
            DxrTriangleCompression::TwoTriangles => Self::TwoTriangles,
            DxrTriangleCompression::PairTriangles => Self::PairTriangles,
            DxrTriangleCompression::AutomaticNumberOfTriangles => Self::Automatic,
            DxrTriangleCompression::None | DxrTriangleCompression::FourTriangles => Self::None,
        }
    }
}

/// Which interior nodes use low precision bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DxrLowPrecisionMode {
    None,
    LeafNodesOnly,
    MixedWithFp32,
    All,
}

impl From<Fp16BoxMode> for DxrLowPrecisionMode {
    fn from(mode: Fp16BoxMode) -> Self {
        match mode {
            Fp16BoxMode::None => Self::None,
            Fp16BoxMode::LeafNodesOnly => Self::LeafNodesOnly,
            Fp16BoxMode::MixedWithFp32 => Self::MixedWithFp32,
            Fp16BoxMode::All => Self::All,
        }
    }
}

impl From<DxrLowPrecisionMode> for Fp16BoxMode {
    fn from(mode: DxrLowPrecisionMode) -> Self {
        match mode {
            DxrLowPrecisionMode::None => Self::None,
            DxrLowPrecisionMode::LeafNodesOnly => Self::LeafNodesOnly,
            DxrLowPrecisionMode::MixedWithFp32 => Self::MixedWithFp32,
            DxrLowPrecisionMode::All => Self::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DxrGeometryType {
    Triangles,
    ProceduralAabbs,
}

impl From<GeometryType> for DxrGeometryType {
    fn from(t: GeometryType) -> Self {
        match t {
            GeometryType::Aabbs => Self::ProceduralAabbs,
            GeometryType::Triangles | GeometryType::Other(_) => Self::Triangles,
        }
    }
}

impl From<DxrGeometryType> for GeometryType {
    fn from(t: DxrGeometryType) -> Self {
        match t {
            DxrGeometryType::Triangles => Self::Triangles,
            DxrGeometryType::ProceduralAabbs => Self::Aabbs,
        }
    }
}

/// Coarse node class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DxrNodeClass {
    LowPrecisionInterior,
    HighPrecisionInterior,
    Leaf,
}

impl From<NodeKind> for DxrNodeClass {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Box16 => Self::LowPrecisionInterior,
            NodeKind::Box32 | NodeKind::QuantizedBvh8 => Self::HighPrecisionInterior,
            NodeKind::Triangle(_) | NodeKind::Procedural | NodeKind::Instance => Self::Leaf,
        }
    }
}

/// Build settings of a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DxrBuildSettings {
    pub structure_type: DxrStructureType,
    pub flags: DxrBuildFlags,
    pub triangle_compression: DxrTriangleCompression,
    pub low_precision_mode: DxrLowPrecisionMode,
    /// Bottom level only.
    pub geometry_type: Option<DxrGeometryType>,
}

impl DxrBuildSettings {
    pub fn from_header(header: &AccelerationStructureHeader) -> Self {
        let info = header.build_info;
        Self {
            structure_type: info.structure_type().into(),
            flags: info.build_flags().into(),
            triangle_compression: info.triangle_compression().into(),
            low_precision_mode: info.fp16_box_mode().into(),
            geometry_type: header.is_blas().then(|| header.geometry_type.into()),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Size of an instance descriptor.
pub const DXR_INSTANCE_DESC_SIZE: usize = 64;

/// Size of a procedural AABB.
pub const DXR_AABB_SIZE: usize = 24;

/// Instance descriptor as submitted by the application.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DxrInstanceDesc {
    /// Row-major object-to-world transform.
    pub transform: [[f32; 4]; 3],
    pub instance_id: u32,
    pub instance_mask: u8,
    pub hit_group_index: u32,
    pub flags: u8,
    /// Address of the referenced BLAS; the bundle index when exported
    /// without addresses.
    pub acceleration_structure: u64,
}

impl DxrInstanceDesc {
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < DXR_INSTANCE_DESC_SIZE {
            return Err(Error::TruncatedRecord {
                kind: "DXR instance descriptor",
                offset: 0,
                stride: DXR_INSTANCE_DESC_SIZE,
                available: b.len(),
            });
        }
        let id_and_mask = read_u32(b, 48);
        let index_and_flags = read_u32(b, 52);
        Ok(Self {
            transform: read_matrix3x4(b, 0),
            instance_id: id_and_mask & 0x00FF_FFFF,
            instance_mask: (id_and_mask >> 24) as u8,
            hit_group_index: index_and_flags & 0x00FF_FFFF,
            flags: (index_and_flags >> 24) as u8,
            acceleration_structure: read_u64(b, 56),
        })
    }

    pub fn encode(&self) -> [u8; DXR_INSTANCE_DESC_SIZE] {
        let mut b = [0u8; DXR_INSTANCE_DESC_SIZE];
        write_matrix3x4(&mut b, 0, &self.transform);
        write_u32(&mut b, 48, (self.instance_id & 0x00FF_FFFF) | ((self.instance_mask as u32) << 24));
        write_u32(&mut b, 52, (self.hit_group_index & 0x00FF_FFFF) | ((self.flags as u32) << 24));
        write_u64(&mut b, 56, self.acceleration_structure);
        b
    }

    pub fn is_opaque(&self) -> bool {
        self.flags as u32 & instance_flags::FORCE_OPAQUE != 0
    }
}

/// Procedural primitive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DxrAabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl DxrAabb {
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < DXR_AABB_SIZE {
            return Err(Error::TruncatedRecord {
                kind: "DXR AABB",
                offset: 0,
                stride: DXR_AABB_SIZE,
                available: b.len(),
            });
        }
        let f = |i: usize| read_f32(b, i * 4);
        Ok(Self {
            min: [f(0), f(1), f(2)],
            max: [f(3), f(4), f(5)],
        })
    }

    pub fn encode(&self) -> [u8; DXR_AABB_SIZE] {
        let mut b = [0u8; DXR_AABB_SIZE];
        for (i, v) in self.min.iter().chain(self.max.iter()).enumerate() {
            write_f32(&mut b, i * 4, *v);
        }
        b
    }

    pub fn to_aabb(&self) -> Aabb {
        Aabb::new(Vec3::from_array(self.min), Vec3::from_array(self.max))
    }
}

impl From<Aabb> for DxrAabb {
    fn from(b: Aabb) -> Self {
        Self {
            min: b.min.to_array(),
            max: b.max.to_array(),
        }
    }
}

/// Standard form of one decoded node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StandardNodeRecord {
    Interior {
        class: DxrNodeClass,
        bounds: DxrAabb,
        /// Node table indices of the children.
        children: SmallVec<[u32; 8]>,
    },
    Triangles {
        geometry_index: u32,
        opaque: bool,
        /// Primitive index and vertices of each valid triangle.
        triangles: SmallVec<[(u32, [[f32; 3]; 3]); 2]>,
    },
    Procedural {
        geometry_index: u32,
        primitive_index: u32,
        aabb: DxrAabb,
    },
    Instance(DxrInstanceDesc),
    /// Nothing to export.
    Omitted { kind: &'static str, reason: &'static str },
}

/// Convert a decoded node to its standard form.
pub fn to_standard_format(node: &NodeView<'_>) -> StandardNodeRecord {
    match node.data() {
        NodeData::Box32(_) | NodeData::Box16(_) | NodeData::QuantizedBvh8(_) => StandardNodeRecord::Interior {
            class: node.kind().into(),
            bounds: node.bounds().into(),
            children: node.child_indices().iter().copied().collect(),
        },
        NodeData::Triangle(_) | NodeData::PrimitiveRange(_) => {
            let leaf = node.leaf_triangles();
            let triangles: SmallVec<[(u32, [[f32; 3]; 3]); 2]> = leaf
                .iter()
                .filter(|t| t.triangle.is_valid)
                .map(|t| (t.primitive_index.unwrap_or(u32::MAX), t.triangle.vertices.map(|v| v.to_array())))
                .collect();
            let Some(first) = leaf.first().filter(|_| !triangles.is_empty()) else {
                return StandardNodeRecord::Omitted {
                    kind: node.kind().name(),
                    reason: "no valid triangle",
                };
            };
            StandardNodeRecord::Triangles {
                geometry_index: first.geometry_index,
                opaque: leaf.iter().all(|t| t.opaque),
                triangles,
            }
        }
        NodeData::Procedural(p) => {
            if !p.is_active() {
                return StandardNodeRecord::Omitted {
                    kind: node.kind().name(),
                    reason: "inactive primitive",
                };
            }
            StandardNodeRecord::Procedural {
                geometry_index: p.geometry_index(),
                primitive_index: p.primitive_index,
                aabb: p.bounds.into(),
            }
        }
        NodeData::Instance(inst) => StandardNodeRecord::Instance(DxrInstanceDesc {
            transform: inst.object_to_world,
            instance_id: inst.desc.instance_id,
            instance_mask: inst.desc.mask,
            hit_group_index: inst.desc.hit_group_contribution,
            flags: inst.desc.flags,
            acceleration_structure: inst.blas_index(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::{BlobView, BuildInfo, BuildNode, EncodedBvh, RtIp, StructureWriter};
    use crate::config::DecodeOptions;
    use crate::util::Affine3A;

    fn decode(blob: &[u8]) -> EncodedBvh {
        EncodedBvh::decode(&BlobView::open(blob).unwrap(), &DecodeOptions::default()).unwrap()
    }

    #[test]
    fn test_build_flags_both_ways() {
        let hw = BuildFlags::ALLOW_UPDATE | BuildFlags::MINIMIZE_MEMORY;
        let dxr = DxrBuildFlags::from(hw);
        assert!(dxr.contains(DxrBuildFlags::ALLOW_UPDATE));
        assert!(dxr.contains(DxrBuildFlags::MINIMIZE_MEMORY));
        assert!(!dxr.contains(DxrBuildFlags::FAST_TRACE));
        assert_eq!(BuildFlags::from(dxr), hw);
    }

    #[test]
    fn test_enum_mappings() {
        assert_eq!(
            TriangleCompressionMode::from(DxrTriangleCompression::FourTriangles),
            TriangleCompressionMode::None
        );
        assert_eq!(
            DxrTriangleCompression::from(TriangleCompressionMode::PairTriangles),
            DxrTriangleCompression::PairTriangles
        );
        for mode in [Fp16BoxMode::None, Fp16BoxMode::LeafNodesOnly, Fp16BoxMode::MixedWithFp32, Fp16BoxMode::All] {
            assert_eq!(Fp16BoxMode::from(DxrLowPrecisionMode::from(mode)), mode);
        }
        assert_eq!(DxrNodeClass::from(NodeKind::Box16), DxrNodeClass::LowPrecisionInterior);
        assert_eq!(DxrNodeClass::from(NodeKind::QuantizedBvh8), DxrNodeClass::HighPrecisionInterior);
        assert_eq!(DxrNodeClass::from(NodeKind::Instance), DxrNodeClass::Leaf);
        assert_eq!(GeometryType::from(DxrGeometryType::ProceduralAabbs), GeometryType::Aabbs);
    }

    #[test]
    fn test_settings_from_header() {
        let info = BuildInfo::new(
            StructureType::BottomLevel,
            TriangleCompressionMode::PairTriangles,
            Fp16BoxMode::MixedWithFp32,
            BuildFlags::PREFER_FAST_TRACE,
        );
        let header = AccelerationStructureHeader::new(RtIp::Rtip11, info);
        let s = DxrBuildSettings::from_header(&header);
        assert_eq!(s.structure_type, DxrStructureType::BottomLevel);
        assert_eq!(s.triangle_compression, DxrTriangleCompression::PairTriangles);
        assert_eq!(s.low_precision_mode, DxrLowPrecisionMode::MixedWithFp32);
        assert_eq!(s.flags, DxrBuildFlags::FAST_TRACE);
        assert_eq!(s.geometry_type, Some(DxrGeometryType::Triangles));
    }

    #[test]
    fn test_record_layouts() {
        let desc = DxrInstanceDesc {
            transform: [[1.0, 0.0, 0.0, 5.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
            instance_id: 7,
            instance_mask: 0x80,
            hit_group_index: 3,
            flags: instance_flags::FORCE_OPAQUE as u8,
            acceleration_structure: 0xDEAD_0000,
        };
        let bytes = desc.encode();
        assert_eq!(read_f32(&bytes, 12), 5.0);
        assert_eq!(read_u32(&bytes, 48), 0x8000_0007);
        assert_eq!(DxrInstanceDesc::decode(&bytes).unwrap(), desc);
        assert!(desc.is_opaque());
        assert!(DxrInstanceDesc::decode(&bytes[..60]).is_err());

        let aabb = DxrAabb::from(Aabb::new(Vec3::new(-1.0, 0.0, 1.0), Vec3::splat(2.0)));
        let bytes = aabb.encode();
        assert_eq!(read_f32(&bytes, 8), 1.0);
        assert_eq!(DxrAabb::decode(&bytes).unwrap().to_aabb().max, Vec3::splat(2.0));
    }

    #[test]
    fn test_node_conversion() {
        let mut degenerate = [Vec3::ZERO, Vec3::X, Vec3::Y];
        degenerate[0].x = f32::NAN;
        let tree = BuildNode::boxed(vec![
            BuildNode::triangle([Vec3::ZERO, Vec3::X, Vec3::Y], 2, 1),
            BuildNode::triangle(degenerate, 2, 0),
        ]);
        let bvh = decode(&StructureWriter::blas(RtIp::Rtip11).write(&tree).unwrap());
        match to_standard_format(&bvh.root().unwrap()) {
            StandardNodeRecord::Interior { class, children, .. } => {
                assert_eq!(class, DxrNodeClass::HighPrecisionInterior);
                assert_eq!(children.as_slice(), &[1, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match to_standard_format(&bvh.node(1).unwrap()) {
            StandardNodeRecord::Triangles {
                geometry_index,
                opaque,
                triangles,
            } => {
                assert_eq!(geometry_index, 2);
                assert!(opaque);
                assert_eq!(triangles.len(), 1);
                assert_eq!(triangles[0].0, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            to_standard_format(&bvh.node(2).unwrap()),
            StandardNodeRecord::Omitted { .. }
        ));

        let inst = BuildNode::instance(4, Affine3A::from_translation(Vec3::Y), Aabb::new(Vec3::ZERO, Vec3::ONE));
        let tlas = decode(&StructureWriter::tlas(RtIp::Rtip31).write(&inst).unwrap());
        match to_standard_format(&tlas.node(1).unwrap()) {
            StandardNodeRecord::Instance(desc) => {
                assert_eq!(desc.acceleration_structure, 4);
                assert_eq!(desc.transform[1][3], 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_packet_conversion() {
        let quad = [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(1.0, 1.0, 0.0)];
        let tree = BuildNode::boxed(vec![
            BuildNode::triangle_pair(quad, 3, 1),
            BuildNode::procedural(Aabb::new(Vec3::ZERO, Vec3::ONE), 3),
        ]);
        let bvh = decode(&StructureWriter::blas(RtIp::Rtip31).write(&tree).unwrap());
        match to_standard_format(&bvh.node(1).unwrap()) {
            StandardNodeRecord::Triangles {
                geometry_index,
                opaque,
                triangles,
            } => {
                assert_eq!(geometry_index, 3);
                assert!(opaque);
                assert_eq!(triangles.iter().map(|t| t.0).collect::<Vec<_>>(), vec![0, 1]);
                assert_eq!(triangles[1].1[1], [1.0, 1.0, 0.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match to_standard_format(&bvh.node(2).unwrap()) {
            StandardNodeRecord::Procedural {
                geometry_index,
                primitive_index,
                aabb,
            } => {
                assert_eq!(geometry_index, 3);
                assert_eq!(primitive_index, 2);
                assert_eq!(aabb.to_aabb().max, Vec3::ONE);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
