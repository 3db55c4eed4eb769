//! Bundle loading from chunk files.

use std::io::Write;
use std::sync::Arc;

use rra_bvh::bvh::{
    AccelerationStructure, BlasReference, BuildNode, BundleLoader, BvhBundle, ChunkFile, ChunkWriter, RtIp,
    StructureWriter, TraceChunk, TriangleCompressionMode,
};
use rra_bvh::config::{DecodeOptions, Settings};
use rra_bvh::sah::SahEvaluator;
use rra_bvh::util::{Aabb, Affine3A, ErrorKind, Vec3};

use tempfile::NamedTempFile;

fn quad(x: f32) -> BuildNode {
    BuildNode::triangle_pair(
        [
            Vec3::new(x, 0.0, 0.0),
            Vec3::new(x + 1.0, 0.0, 0.0),
            Vec3::new(x, 1.0, 0.0),
            Vec3::new(x + 1.0, 1.0, 0.0),
        ],
        0,
        1,
    )
}

/// Two BLAS (one per generation), one empty BLAS, one TLAS instancing all three
/// plus one dangling instance, and a trailing BLAS with a bad magic.
fn scene_chunk() -> Vec<u8> {
    let blas11 = StructureWriter::blas(RtIp::Rtip11)
        .with_compression(TriangleCompressionMode::PairTriangles)
        .write(&BuildNode::boxed(vec![quad(0.0), BuildNode::half_box(vec![quad(2.0), quad(4.0)])]))
        .unwrap();
    let blas31 = StructureWriter::blas(RtIp::Rtip31)
        .write(&BuildNode::boxed(vec![
            BuildNode::procedural(Aabb::new(Vec3::ZERO, Vec3::ONE), 0),
            BuildNode::procedural(Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0)), 1),
        ]))
        .unwrap();
    let empty = StructureWriter::blas(RtIp::Rtip31).write_empty();
    let unit = Aabb::new(Vec3::ZERO, Vec3::ONE);
    let tlas = StructureWriter::tlas(RtIp::Rtip11)
        .write(&BuildNode::boxed(vec![
            BuildNode::instance(0, Affine3A::IDENTITY, unit),
            BuildNode::instance(1, Affine3A::from_translation(Vec3::new(10.0, 0.0, 0.0)), unit),
            BuildNode::instance(2, Affine3A::from_scale(Vec3::splat(2.0)), unit),
            BuildNode::instance(9, Affine3A::IDENTITY, unit),
        ]))
        .unwrap();
    let mut broken = blas31.clone();
    broken[..4].copy_from_slice(b"RT99");

    let mut w = ChunkWriter::new();
    w.push_blas(&blas11).unwrap();
    w.push_blas(&blas31).unwrap();
    w.push_tlas(&tlas).unwrap();
    w.push_blas(&empty).unwrap();
    w.push_blas(&broken).unwrap();
    w.finish()
}

fn write_temp(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(bytes).expect("Failed to write chunk");
    file.flush().unwrap();
    file
}

#[test]
fn test_load_mapped_chunk() {
    let file = write_temp(&scene_chunk());
    let mapped = ChunkFile::open(file.path()).expect("Failed to map chunk");
    let loader = BundleLoader::new(DecodeOptions::default());
    assert!(loader.current().is_none());

    let bundle = loader.load(&mapped.chunk()).expect("Load should not be cancelled");
    assert!(Arc::ptr_eq(&bundle, &loader.current().unwrap()));

    assert_eq!(bundle.blas_count(), 4);
    assert_eq!(bundle.tlas_count(), 1);
    assert!(bundle.is_blas_present(0));
    assert!(bundle.is_blas_present(1));
    assert!(bundle.is_blas_present(2));
    assert!(!bundle.is_blas_present(3));
    assert!(bundle.get_blas(2).unwrap().is_empty());
    assert_eq!(bundle.get_blas(0).unwrap().header().primitive_count, 6);
    assert_eq!(bundle.get_blas(1).unwrap().geometry_count(), 2);

    let kinds: Vec<ErrorKind> = bundle.failures().iter().map(|f| f.kind()).collect();
    assert!(kinds.contains(&ErrorKind::UnsupportedVersion));
    assert!(kinds.contains(&ErrorKind::DanglingInstanceReference));

    loader.clear();
    assert!(loader.current().is_none());
}

#[test]
fn test_cross_references() {
    let bytes = scene_chunk();
    let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &DecodeOptions::default());
    let refs: Vec<BlasReference> = bundle.cross_references().map(|r| r.blas).collect();
    assert_eq!(
        refs,
        vec![
            BlasReference::Resolved(0),
            BlasReference::Resolved(1),
            BlasReference::Resolved(2),
            BlasReference::Missing { blas_index: 9 },
        ]
    );

    let tlas = bundle.get_tlas(0).unwrap();
    let moved = tlas.instance(1).unwrap();
    assert_eq!(moved.world_transform().translation.x, 10.0);
    let bounds = moved.world_bounds();
    assert!(bounds.min.x >= 10.0 - 1e-5);

    let stats = bundle.stats();
    assert_eq!(stats.blas_count, 4);
    assert_eq!(stats.absent_structures, 1);
    assert_eq!(stats.empty_blas, 1);
    assert_eq!(stats.missing_instances, 1);
    assert_eq!(stats.nodes.instance, 4);
    assert_eq!(stats.nodes.procedural, 2);
}

#[test]
fn test_parallel_matches_serial() {
    let bytes = scene_chunk();
    let chunk = TraceChunk::new(&bytes, 0);
    let parallel = BvhBundle::decode(&chunk, &DecodeOptions::default());
    let serial = BvhBundle::decode(
        &chunk,
        &DecodeOptions {
            parallel_blas: false,
            ..DecodeOptions::default()
        },
    );
    assert_eq!(parallel.stats(), serial.stats());
    let failures = |b: &BvhBundle| b.failures().iter().map(|f| (f.entry, f.kind())).collect::<Vec<_>>();
    assert_eq!(failures(&parallel), failures(&serial));

    let evaluator = SahEvaluator::default();
    let a = evaluator.evaluate_bundle(&parallel);
    let b = evaluator.evaluate_bundle(&serial);
    assert_eq!(a.blas.len(), 3);
    for ((i, ra), (j, rb)) in a.blas.iter().zip(b.blas.iter()) {
        assert_eq!(i, j);
        assert_eq!(ra.total_cost, rb.total_cost);
    }
}

#[test]
fn test_settings_drive_decode() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "decode": {{ "parallel_blas": false }}, "sah": {{ "intersection_cost": 4.0 }} }}"#).unwrap();
    file.flush().unwrap();
    let settings = Settings::load(Some(file.path())).unwrap();
    assert!(!settings.decode.parallel_blas);
    assert!(settings.decode.strict_index_map);

    let bytes = scene_chunk();
    let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &settings.decode);
    let blas = bundle.get_blas(1).unwrap();
    let report = SahEvaluator::new(settings.sah).evaluate(blas);
    for leaf in blas.bvh().leaves() {
        assert_eq!(report.node_cost(leaf.index), Some(4.0));
    }
}
