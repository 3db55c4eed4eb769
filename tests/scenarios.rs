//! End-to-end decode scenarios over synthetic chunks.

use rra_bvh::bvh::{
    AccelerationStructure, BlasReference, BlobView, BuildNode, BvhBundle, ChunkWriter, EncodedBlas, Level, NodeKind,
    RtIp, StructureWriter, TraceChunk,
};
use rra_bvh::config::{DecodeOptions, SahConfig};
use rra_bvh::sah::SahEvaluator;
use rra_bvh::util::{Aabb, Affine3A, ErrorKind, Vec3};

fn triangle(x: f32) -> BuildNode {
    BuildNode::triangle([Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 0.0, 0.0), Vec3::new(x, 1.0, 0.0)], 0, 0)
}

fn two_leaf_blas() -> Vec<u8> {
    StructureWriter::blas(RtIp::Rtip11)
        .write(&BuildNode::boxed(vec![triangle(0.0), triangle(2.0)]))
        .expect("Failed to write BLAS")
}

#[test]
fn test_unknown_magic_marks_slot_absent() {
    let mut unknown = vec![0u8; 64];
    unknown[..4].copy_from_slice(b"RTXX");
    unknown[4..8].copy_from_slice(&16u32.to_le_bytes());

    let mut w = ChunkWriter::new();
    w.push_blas(&two_leaf_blas()).unwrap();
    w.push_blas(&unknown).unwrap();
    w.push_blas(&two_leaf_blas()).unwrap();
    let bytes = w.finish();

    let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &DecodeOptions::default());
    assert_eq!(bundle.blas_count(), 3);
    assert!(bundle.is_blas_present(0));
    assert!(!bundle.is_blas_present(1));
    assert!(bundle.is_blas_present(2));
    assert_eq!(bundle.get_blas(2).unwrap().node_count(), 3);

    assert_eq!(bundle.failures().len(), 1);
    let failure = &bundle.failures()[0];
    assert_eq!(failure.kind(), ErrorKind::UnsupportedVersion);
    assert_eq!(failure.level, Some(Level::Bottom));
    assert_eq!(failure.slot, Some(1));
    assert_eq!(failure.entry, 1);
}

#[test]
fn test_minimal_blas_costs() {
    let blob = two_leaf_blas();
    let blas = EncodedBlas::decode(&blob, &DecodeOptions::default()).unwrap();
    assert_eq!(blas.node_count(), 3);
    assert_eq!(blas.index_map().len(), 2);
    assert_eq!(blas.root().unwrap().kind(), NodeKind::Box32);

    let config = SahConfig {
        intersection_cost: 2.5,
        ..SahConfig::default()
    };
    let report = SahEvaluator::new(config).evaluate(&blas);
    for leaf in blas.bvh().leaves() {
        assert_eq!(leaf.primitive_count(), 1);
        assert_eq!(report.node_cost(leaf.index), Some(2.5));
    }
    assert!(report.total_cost > 0.0);
}

#[test]
fn test_instance_past_last_blas_is_missing() {
    let tlas = StructureWriter::tlas(RtIp::Rtip11)
        .write(&BuildNode::boxed(vec![
            BuildNode::instance(0, Affine3A::IDENTITY, Aabb::new(Vec3::ZERO, Vec3::ONE)),
            BuildNode::instance(1, Affine3A::from_translation(Vec3::X * 4.0), Aabb::new(Vec3::ZERO, Vec3::ONE)),
        ]))
        .unwrap();

    let mut w = ChunkWriter::new();
    w.push_blas(&two_leaf_blas()).unwrap();
    w.push_tlas(&tlas).unwrap();
    let bytes = w.finish();

    let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &DecodeOptions::default());
    assert_eq!(bundle.blas_count(), 1);
    let tlas = bundle.get_tlas(0).expect("TLAS should decode");
    assert_eq!(tlas.instance_count(), 2);

    let refs = tlas.references();
    assert_eq!(refs[0], BlasReference::Resolved(0));
    assert_eq!(refs[1], BlasReference::Missing { blas_index: 1 });
    assert_eq!(tlas.missing_count(), 1);
    assert!(bundle.instance_blas(0, 1).is_none());
    assert!(bundle.instance_blas(0, 0).is_some());

    let dangling: Vec<_> = bundle
        .failures()
        .iter()
        .filter(|f| f.kind() == ErrorKind::DanglingInstanceReference)
        .collect();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].level, Some(Level::Top));
}

#[test]
fn test_truncated_leaf_record() {
    let blob = two_leaf_blas();
    let full = EncodedBlas::decode(&blob, &DecodeOptions::default()).unwrap();
    let header_offset = blob.len() - BlobView::open(&blob).unwrap().data.len();
    let last_leaf = full.bvh().leaves().map(|n| n.byte_offset()).max().unwrap() as usize;

    // Cut the blob 3 bytes short of the last triangle record
    let cut = header_offset + last_leaf + 64 - 3;
    let err = EncodedBlas::decode(&blob[..cut], &DecodeOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TruncatedRecord);

    let mut w = ChunkWriter::new();
    w.push_blas(&blob[..cut]).unwrap();
    let bytes = w.finish();
    let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &DecodeOptions::default());
    assert!(!bundle.is_blas_present(0));
    assert_eq!(bundle.failures()[0].kind(), ErrorKind::TruncatedRecord);
}
