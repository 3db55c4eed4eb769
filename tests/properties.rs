//! Invariants checked over generated trees of both layout generations.

use std::collections::HashSet;

use rra_bvh::bvh::{
    AccelerationStructure, BlobView, BuildNode, EncodedBlas, EncodedBvh, NodeKind, NodePointer, RtIp,
    StructureWriter, TriangleCompressionMode,
};
use rra_bvh::config::{DecodeOptions, SahConfig};
use rra_bvh::sah::SahEvaluator;
use rra_bvh::util::Vec3;

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, n: u32) -> u32 {
        self.next_u32() % n
    }

    fn unit(&mut self) -> f32 {
        self.next_u32() as f32 / (1u32 << 31) as f32
    }

    fn point(&mut self, scale: f32) -> Vec3 {
        Vec3::new(self.unit(), self.unit(), self.unit()) * 2.0 * scale - Vec3::splat(scale)
    }
}

fn random_tree(rng: &mut Lcg, width: u32, half_boxes: bool, depth: u32) -> BuildNode {
    if depth == 0 || rng.below(4) == 0 {
        let base = rng.point(50.0);
        return BuildNode::triangle(
            [base, base + rng.point(2.0), base + rng.point(2.0)],
            rng.below(3),
            rng.below(2),
        );
    }
    let count = 2 + rng.below(width - 1) as usize;
    let children = (0..count).map(|_| random_tree(rng, width, half_boxes, depth - 1)).collect();
    if half_boxes && rng.below(3) == 0 {
        BuildNode::half_box(children)
    } else {
        BuildNode::boxed(children)
    }
}

fn generated(seed: u64, rtip: RtIp) -> (Vec<u8>, EncodedBlas) {
    let mut rng = Lcg(seed);
    let (width, half_boxes) = match rtip {
        RtIp::Rtip11 => (4, true),
        RtIp::Rtip31 => (8, false),
    };
    let tree = BuildNode::boxed(vec![
        random_tree(&mut rng, width, half_boxes, 4),
        random_tree(&mut rng, width, half_boxes, 4),
    ]);
    let blob = StructureWriter::blas(rtip).write(&tree).expect("Failed to write tree");
    let blas = EncodedBlas::decode(&blob, &DecodeOptions::default()).expect("Failed to decode tree");
    (blob, blas)
}

const SEEDS: [u64; 6] = [1, 7, 42, 1234, 99991, 0xDEAD_BEEF];

#[test]
fn test_pointers_stay_inside_node_stream() {
    for rtip in [RtIp::Rtip11, RtIp::Rtip31] {
        for seed in SEEDS {
            let (_, blas) = generated(seed, rtip);
            let stream = blas.bvh().node_stream();
            for node in blas.bvh().nodes() {
                assert!(
                    stream.contains(&node.byte_offset()),
                    "{:?} seed {}: node at {} outside {:?}",
                    rtip,
                    seed,
                    node.byte_offset(),
                    stream
                );
            }
            for raw in blas.bvh().primitive_node_pointers() {
                let ptr = NodePointer::decode(rtip, *raw).unwrap();
                assert!(stream.contains(&ptr.byte_offset()));
            }
        }
    }
}

#[test]
fn test_index_map_is_bijection() {
    for rtip in [RtIp::Rtip11, RtIp::Rtip31] {
        for seed in SEEDS {
            let (_, blas) = generated(seed, rtip);
            let map = blas.index_map();
            let p = blas.header().primitive_count as usize;
            assert_eq!(map.len(), p);
            assert!(map.is_bijection());

            let mut seen = HashSet::new();
            for i in 0..p as u32 {
                let (ptr, _) = map.location(i).unwrap();
                assert!(ptr.kind().is_leaf());
                let loc = map.position(i).unwrap();
                assert!(seen.insert((loc.byte_offset, loc.slot)), "location reused");
                assert_eq!(map.index_of(loc.byte_offset, loc.slot), Some(i));
            }
            let leaf_offsets: HashSet<u64> = blas.bvh().leaves().map(|n| n.byte_offset()).collect();
            let mapped: HashSet<u64> = seen.iter().map(|(o, _)| *o).collect();
            // An RTIP 3.1 range may continue into a packet no pointer starts in
            assert!(leaf_offsets.is_subset(&mapped));
            if rtip == RtIp::Rtip11 {
                assert_eq!(leaf_offsets, mapped);
            }
        }
    }
}

#[test]
fn test_leaf_contents_inside_ancestor_bounds() {
    for rtip in [RtIp::Rtip11, RtIp::Rtip31] {
        for seed in SEEDS {
            let (_, blas) = generated(seed, rtip);
            let bvh = blas.bvh();
            for leaf in bvh.leaves() {
                let content = leaf.content_bounds();
                let mut current = Some(leaf);
                while let Some(node) = current {
                    assert!(
                        node.bounds().contains_box(&content),
                        "{:?} seed {}: {:?} does not contain {:?}",
                        rtip,
                        seed,
                        node.bounds(),
                        content
                    );
                    current = node.parent_index().and_then(|p| bvh.node(p));
                }
            }
        }
    }
}

#[test]
fn test_sah_drops_with_fewer_primitives_per_leaf() {
    // Both leaves cover the unit square, so only the primitive count differs
    let quad = [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(1.0, 1.0, 0.0)];
    let single = [Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0)];
    let far = [Vec3::splat(4.0), Vec3::new(5.0, 4.0, 4.0), Vec3::new(4.0, 5.0, 4.0)];

    let writer = StructureWriter::blas(RtIp::Rtip11).with_compression(TriangleCompressionMode::PairTriangles);
    let paired = writer
        .write(&BuildNode::boxed(vec![
            BuildNode::boxed(vec![BuildNode::triangle_pair(quad, 0, 0)]),
            BuildNode::triangle(far, 0, 0),
        ]))
        .unwrap();
    let split = writer
        .write(&BuildNode::boxed(vec![
            BuildNode::boxed(vec![BuildNode::triangle(single, 0, 0)]),
            BuildNode::triangle(far, 0, 0),
        ]))
        .unwrap();

    for config in [
        SahConfig::default(),
        SahConfig {
            traversal_cost: 0.0,
            intersection_cost: 3.0,
            ..SahConfig::default()
        },
    ] {
        let evaluator = SahEvaluator::new(config);
        let a = evaluator.evaluate(&EncodedBlas::decode(&paired, &DecodeOptions::default()).unwrap());
        let b = evaluator.evaluate(&EncodedBlas::decode(&split, &DecodeOptions::default()).unwrap());
        assert!(b.total_cost >= 0.0);
        assert!(b.total_cost < a.total_cost, "{} !< {}", b.total_cost, a.total_cost);
        assert!(a.node_costs.iter().flatten().all(|c| *c >= 0.0));
    }
}

#[test]
fn test_magic_selects_layout() {
    for seed in SEEDS {
        for rtip in [RtIp::Rtip11, RtIp::Rtip31] {
            let (blob, blas) = generated(seed, rtip);
            let view = BlobView::open(&blob).unwrap();
            assert_eq!(view.rtip, rtip);
            assert_eq!(blas.bvh().rtip(), rtip);
            for node in blas.bvh().nodes() {
                assert!(rtip.supports(node.kind()));
                match rtip {
                    RtIp::Rtip11 => assert_ne!(node.kind(), NodeKind::QuantizedBvh8),
                    RtIp::Rtip31 => assert!(!matches!(node.kind(), NodeKind::Box16 | NodeKind::Box32)),
                }
            }

            // Same bytes, same tree
            let again = EncodedBvh::decode(&view, &DecodeOptions::default()).unwrap();
            let offsets = |b: &EncodedBvh| b.nodes().map(|n| (n.byte_offset(), n.kind())).collect::<Vec<_>>();
            assert_eq!(offsets(blas.bvh()), offsets(&again));
        }
    }
}

#[test]
fn test_generations_agree_on_triangles() {
    let key = |blas: &EncodedBlas| {
        let mut v: Vec<[u32; 9]> = blas
            .triangles()
            .map(|t| std::array::from_fn(|i| t.vertices[i / 3].to_array()[i % 3].to_bits()))
            .collect();
        v.sort_unstable();
        v
    };
    for seed in SEEDS {
        let tree = random_tree(&mut Lcg(seed), 4, false, 4);
        let tree = BuildNode::boxed(vec![tree]);
        let decode = |rtip: RtIp| {
            let blob = StructureWriter::blas(rtip).write(&tree).unwrap();
            EncodedBlas::decode(&blob, &DecodeOptions::default()).unwrap()
        };
        let a = decode(RtIp::Rtip11);
        let b = decode(RtIp::Rtip31);
        assert_eq!(a.header().primitive_count, b.header().primitive_count);
        assert_eq!(a.header().primitive_count as usize, a.triangles().count());
        assert_eq!(key(&a), key(&b));
    }
}
