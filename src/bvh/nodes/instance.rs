//! Top-level instance records.
//!
//! RTIP 1.1 instance nodes are a 64-byte descriptor (world-to-object
//! transform, id, mask, flags, BLAS reference) followed by 64 bytes of extra
//! data carrying the object-to-world transform. Fused structures append a
//! copy of the referenced BLAS root box.
//!
//! RTIP 3.1 splits an instance in two. The 128-byte hardware node in the leaf
//! section holds the world-to-object transform, a 64-bit child base pointer,
//! the parent pointer, user data with the mask, and quantized boxes of the
//! BLAS root's children. The id, flags, instance index and object-to-world
//! transform move to a 64-byte sideband record in the section after the leaf
//! nodes, one per 128-byte instance slot.

use smallvec::SmallVec;

use super::box_node::Box32Node;
use super::quantized::{compute_exponents, quantize_max, quantize_min, ChildInfo, QuantizedBvh8Node, BVH8_NODE_TYPE};
use crate::bvh::format::{
    BLAS_REFERENCE_MASK, FUSED_INSTANCE_NODE_SIZE, INSTANCE_DESC_SIZE, INSTANCE_NODE_SIZE, INSTANCE_SIDEBAND_SIZE,
    INVALID_NODE,
};
use crate::util::bytes::{
    bit_field, read_matrix3x4, read_u32, read_u64, read_vec3, write_matrix3x4, write_u32, write_u64, write_vec3,
};
use crate::util::{affine_from_rows, Aabb, Affine3A, Vec3};

// Descriptor
const WORLD_TO_OBJECT: usize = 0;
const ID_AND_MASK: usize = 48;
const CONTRIBUTION_AND_FLAGS: usize = 52;
const REFERENCE_LO: usize = 56;
const REFERENCE_HI: usize = 60;

// RTIP 1.1 extra data
const INSTANCE_INDEX: usize = INSTANCE_DESC_SIZE;
const BLAS_ROOT: usize = INSTANCE_DESC_SIZE + 4;
const BLAS_METADATA_SIZE: usize = INSTANCE_DESC_SIZE + 8;
const OBJECT_TO_WORLD: usize = INSTANCE_DESC_SIZE + 16;

// RTIP 3.1 hardware node
const HW_CHILD_BASE: usize = 48;
const HW_PARENT: usize = 56;
const HW_USER_DATA_AND_MASK: usize = 60;
const HW_ROOT_ORIGIN: usize = 64;
const HW_ROOT_PACKED: usize = 76;
const HW_ROOT_CHILD_INFOS: usize = 80;

// RTIP 3.1 sideband
const SB_INSTANCE_INDEX: usize = 0;
const SB_ID_AND_FLAGS: usize = 4;
const SB_BLAS_METADATA_SIZE: usize = 8;
const SB_OBJECT_TO_WORLD: usize = 16;

/// Child base pointer: 3-bit root node type, 51-bit address, 10 flag bits.
const CHILD_BASE_ADDRESS_BITS: u32 = 51;
const CHILD_BASE_FLAGS_SHIFT: u32 = 54;

/// BLAS root children mirrored in an RTIP 3.1 instance node.
pub const INSTANCE_ROOT_CHILDREN: usize = 4;

/// DXR instance flags (low 8 bits of the contribution word).
pub mod instance_flags {
    pub const TRIANGLE_CULL_DISABLE: u32 = 0x1;
    pub const TRIANGLE_FRONT_COUNTERCLOCKWISE: u32 = 0x2;
    pub const FORCE_OPAQUE: u32 = 0x4;
    pub const FORCE_NON_OPAQUE: u32 = 0x8;
}

/// 64-byte instance descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceDesc {
    /// Row-major world-to-object transform.
    pub world_to_object: [[f32; 4]; 3],
    pub instance_id: u32,
    pub mask: u8,
    pub hit_group_contribution: u32,
    pub flags: u8,
    /// Index of the referenced BLAS in the bundle.
    pub blas_index: u64,
    /// 8 bits on RTIP 1.1, 10 on RTIP 3.1.
    pub hardware_flags: u16,
    /// Node type of the BLAS root: 2 bits on RTIP 1.1, 3 on RTIP 3.1.
    pub leaf_type: u8,
}

impl InstanceDesc {
    pub fn decode(b: &[u8]) -> Self {
        let id_and_mask = read_u32(b, ID_AND_MASK);
        let contribution = read_u32(b, CONTRIBUTION_AND_FLAGS);
        let lo = read_u32(b, REFERENCE_LO) as u64;
        let hi = read_u32(b, REFERENCE_HI);
        Self {
            world_to_object: read_matrix3x4(b, WORLD_TO_OBJECT),
            instance_id: bit_field(id_and_mask, 0, 24),
            mask: (id_and_mask >> 24) as u8,
            hit_group_contribution: bit_field(contribution, 0, 24),
            flags: (contribution >> 24) as u8,
            blas_index: (lo | ((bit_field(hi, 0, 22) as u64) << 32)) & BLAS_REFERENCE_MASK,
            hardware_flags: bit_field(hi, 22, 8) as u16,
            leaf_type: bit_field(hi, 30, 2) as u8,
        }
    }

    pub fn write(&self, b: &mut [u8]) {
        write_matrix3x4(b, WORLD_TO_OBJECT, &self.world_to_object);
        write_u32(b, ID_AND_MASK, (self.instance_id & 0x00FF_FFFF) | ((self.mask as u32) << 24));
        write_u32(
            b,
            CONTRIBUTION_AND_FLAGS,
            (self.hit_group_contribution & 0x00FF_FFFF) | ((self.flags as u32) << 24),
        );
        let reference = self.blas_index & BLAS_REFERENCE_MASK;
        write_u32(b, REFERENCE_LO, reference as u32);
        let hi = ((reference >> 32) as u32)
            | (((self.hardware_flags & 0xFF) as u32) << 22)
            | (((self.leaf_type & 0x3) as u32) << 30);
        write_u32(b, REFERENCE_HI, hi);
    }
}

/// Quantized boxes of the referenced BLAS root's children, kept in the
/// RTIP 3.1 hardware node so traversal can cull before entering the BLAS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRootBox {
    pub origin: Vec3,
    /// Exponents, sort bit, child index and valid count (same layout as a
    /// BVH8 node, count limited to four).
    pub packed: u32,
    pub child_infos: [ChildInfo; INSTANCE_ROOT_CHILDREN],
}

impl Default for InstanceRootBox {
    fn default() -> Self {
        Self {
            origin: Vec3::ZERO,
            packed: 0,
            child_infos: [ChildInfo::INVALID; INSTANCE_ROOT_CHILDREN],
        }
    }
}

impl InstanceRootBox {
    fn decode(b: &[u8]) -> Self {
        let mut child_infos = [ChildInfo::default(); INSTANCE_ROOT_CHILDREN];
        for (i, info) in child_infos.iter_mut().enumerate() {
            let at = HW_ROOT_CHILD_INFOS + i * 12;
            info.words = [read_u32(b, at), read_u32(b, at + 4), read_u32(b, at + 8)];
        }
        Self {
            origin: read_vec3(b, HW_ROOT_ORIGIN),
            packed: read_u32(b, HW_ROOT_PACKED),
            child_infos,
        }
    }

    fn write(&self, b: &mut [u8]) {
        write_vec3(b, HW_ROOT_ORIGIN, self.origin);
        write_u32(b, HW_ROOT_PACKED, self.packed);
        for (i, info) in self.child_infos.iter().enumerate() {
            for (j, w) in info.words.iter().enumerate() {
                write_u32(b, HW_ROOT_CHILD_INFOS + i * 12 + j * 4, *w);
            }
        }
    }

    /// Quantize up to four child boxes of the BLAS root.
    pub fn build(children: &[Aabb]) -> Self {
        let mut root = Self::default();
        let count = children.len().min(INSTANCE_ROOT_CHILDREN);
        if count == 0 {
            return root;
        }
        let bounds = children[..count].iter().fold(Aabb::EMPTY, |acc, c| acc.union(c));
        let exponents = compute_exponents(bounds.min, bounds.max);
        root.origin = bounds.min;
        root.packed = QuantizedBvh8Node::pack_word(exponents, false, 0, count as u32);
        let o = root.origin.to_array();
        for (slot, child) in children[..count].iter().enumerate() {
            let lo = child.min.to_array();
            let hi = child.max.to_array();
            let mut q_min = [0u32; 3];
            let mut q_max = [0u32; 3];
            for axis in 0..3 {
                q_min[axis] = quantize_min(lo[axis], o[axis], exponents[axis]);
                q_max[axis] = quantize_max(hi[axis], o[axis], exponents[axis]);
            }
            root.child_infos[slot] = ChildInfo::pack(q_min, q_max, 0, 0xFF, BVH8_NODE_TYPE, 1);
        }
        root
    }

    pub fn exponents(&self) -> [u32; 3] {
        [
            bit_field(self.packed, 0, 8),
            bit_field(self.packed, 8, 8),
            bit_field(self.packed, 16, 8),
        ]
    }

    pub fn valid_child_count(&self) -> usize {
        1 + bit_field(self.packed, 28, 2) as usize
    }

    pub fn child_bounds(&self) -> SmallVec<[Aabb; INSTANCE_ROOT_CHILDREN]> {
        let exponents = self.exponents();
        self.child_infos[..self.valid_child_count()]
            .iter()
            .filter(|info| info.is_valid())
            .map(|info| info.decode_bounds(self.origin, exponents))
            .collect()
    }
}

/// Generation-specific part of an instance node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstanceLayout {
    Rtip11 {
        /// Raw pointer to the BLAS root.
        blas_root: u32,
        /// Copy of the BLAS root box in fused layouts.
        fused_root: Option<Box32Node>,
    },
    Rtip31 {
        /// Raw pointer to the box that references this instance.
        parent_pointer: u32,
        root_box: InstanceRootBox,
    },
}

/// Decoded instance leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceNode {
    pub desc: InstanceDesc,
    pub instance_index: u32,
    pub blas_metadata_size: u32,
    pub object_to_world: [[f32; 4]; 3],
    pub layout: InstanceLayout,
}

impl InstanceNode {
    /// Identity transform RTIP 1.1 instance of `blas_index`.
    pub fn new(blas_index: u64, instance_index: u32) -> Self {
        let identity = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        Self {
            desc: InstanceDesc {
                world_to_object: identity,
                instance_id: instance_index,
                mask: 0xFF,
                hit_group_contribution: 0,
                flags: 0,
                blas_index,
                hardware_flags: 0,
                leaf_type: 0,
            },
            instance_index,
            blas_metadata_size: 0,
            object_to_world: identity,
            layout: InstanceLayout::Rtip11 {
                blas_root: 0,
                fused_root: None,
            },
        }
    }

    /// Decode an RTIP 1.1 instance record. `b` is 128 bytes, or 256 for a fused node.
    pub fn decode(b: &[u8]) -> Self {
        let fused_root = if b.len() >= FUSED_INSTANCE_NODE_SIZE {
            Some(Box32Node::decode(&b[INSTANCE_NODE_SIZE..FUSED_INSTANCE_NODE_SIZE]))
        } else {
            None
        };
        Self {
            desc: InstanceDesc::decode(b),
            instance_index: read_u32(b, INSTANCE_INDEX),
            blas_metadata_size: read_u32(b, BLAS_METADATA_SIZE),
            object_to_world: read_matrix3x4(b, OBJECT_TO_WORLD),
            layout: InstanceLayout::Rtip11 {
                blas_root: read_u32(b, BLAS_ROOT),
                fused_root,
            },
        }
    }

    /// Decode an RTIP 3.1 hardware node and its sideband record.
    pub fn decode_rtip31(node: &[u8], sideband: &[u8]) -> Self {
        let child_base = read_u64(node, HW_CHILD_BASE);
        let user_data = read_u32(node, HW_USER_DATA_AND_MASK);
        let id_and_flags = read_u32(sideband, SB_ID_AND_FLAGS);
        Self {
            desc: InstanceDesc {
                world_to_object: read_matrix3x4(node, WORLD_TO_OBJECT),
                instance_id: bit_field(id_and_flags, 0, 24),
                mask: (user_data >> 24) as u8,
                hit_group_contribution: bit_field(user_data, 0, 24),
                flags: (id_and_flags >> 24) as u8,
                blas_index: (child_base >> 3) & ((1u64 << CHILD_BASE_ADDRESS_BITS) - 1),
                hardware_flags: (child_base >> CHILD_BASE_FLAGS_SHIFT) as u16,
                leaf_type: (child_base & 0x7) as u8,
            },
            instance_index: read_u32(sideband, SB_INSTANCE_INDEX),
            blas_metadata_size: read_u32(sideband, SB_BLAS_METADATA_SIZE),
            object_to_world: read_matrix3x4(sideband, SB_OBJECT_TO_WORLD),
            layout: InstanceLayout::Rtip31 {
                parent_pointer: read_u32(node, HW_PARENT),
                root_box: InstanceRootBox::decode(node),
            },
        }
    }

    /// Leaf-section bytes of the node: the RTIP 1.1 record (fused or not) or
    /// the RTIP 3.1 hardware node.
    pub fn encode(&self) -> Vec<u8> {
        match &self.layout {
            InstanceLayout::Rtip11 { blas_root, fused_root } => {
                let size = if fused_root.is_some() {
                    FUSED_INSTANCE_NODE_SIZE
                } else {
                    INSTANCE_NODE_SIZE
                };
                let mut b = vec![0u8; size];
                self.desc.write(&mut b);
                write_u32(&mut b, INSTANCE_INDEX, self.instance_index);
                write_u32(&mut b, BLAS_ROOT, *blas_root);
                write_u32(&mut b, BLAS_METADATA_SIZE, self.blas_metadata_size);
                write_matrix3x4(&mut b, OBJECT_TO_WORLD, &self.object_to_world);
                if let Some(root) = fused_root {
                    b[INSTANCE_NODE_SIZE..].copy_from_slice(&root.encode());
                }
                b
            }
            InstanceLayout::Rtip31 { parent_pointer, root_box } => {
                let mut b = vec![0u8; INSTANCE_NODE_SIZE];
                write_matrix3x4(&mut b, WORLD_TO_OBJECT, &self.desc.world_to_object);
                write_u64(&mut b, HW_CHILD_BASE, self.child_base_pointer());
                write_u32(&mut b, HW_PARENT, *parent_pointer);
                write_u32(
                    &mut b,
                    HW_USER_DATA_AND_MASK,
                    (self.desc.hit_group_contribution & 0x00FF_FFFF) | ((self.desc.mask as u32) << 24),
                );
                root_box.write(&mut b);
                b
            }
        }
    }

    /// RTIP 3.1 sideband record.
    pub fn encode_sideband(&self) -> [u8; INSTANCE_SIDEBAND_SIZE] {
        let mut b = [0u8; INSTANCE_SIDEBAND_SIZE];
        write_u32(&mut b, SB_INSTANCE_INDEX, self.instance_index);
        write_u32(
            &mut b,
            SB_ID_AND_FLAGS,
            (self.desc.instance_id & 0x00FF_FFFF) | ((self.desc.flags as u32) << 24),
        );
        write_u32(&mut b, SB_BLAS_METADATA_SIZE, self.blas_metadata_size);
        write_matrix3x4(&mut b, SB_OBJECT_TO_WORLD, &self.object_to_world);
        b
    }

    /// RTIP 3.1 child base pointer built from the descriptor.
    pub fn child_base_pointer(&self) -> u64 {
        let address = self.desc.blas_index & ((1u64 << CHILD_BASE_ADDRESS_BITS) - 1);
        ((self.desc.leaf_type & 0x7) as u64)
            | (address << 3)
            | (((self.desc.hardware_flags & 0x3FF) as u64) << CHILD_BASE_FLAGS_SHIFT)
    }

    /// A zero mask makes the instance invisible to every ray. RTIP 3.1 nodes
    /// are also inactive without a BLAS pointer or BLAS metadata.
    #[inline]
    pub fn is_active(&self) -> bool {
        match self.layout {
            InstanceLayout::Rtip11 { .. } => self.desc.mask != 0,
            InstanceLayout::Rtip31 { .. } => {
                self.desc.mask != 0 && self.blas_metadata_size != 0 && self.child_base_pointer() != 0
            }
        }
    }

    #[inline]
    pub fn blas_index(&self) -> u64 {
        self.desc.blas_index
    }

    /// Stored parent pointer; only RTIP 3.1 nodes carry one.
    pub fn parent_pointer(&self) -> Option<u32> {
        match self.layout {
            InstanceLayout::Rtip31 { parent_pointer, .. } if parent_pointer != INVALID_NODE => Some(parent_pointer),
            _ => None,
        }
    }

    pub fn world_transform(&self) -> Affine3A {
        affine_from_rows(&self.object_to_world)
    }

    pub fn inverse_transform(&self) -> Affine3A {
        affine_from_rows(&self.desc.world_to_object)
    }

    /// Set both transforms from an object-to-world matrix.
    pub fn set_transform(&mut self, object_to_world: &Affine3A) {
        self.object_to_world = crate::util::rows_from_affine(object_to_world);
        self.desc.world_to_object = crate::util::rows_from_affine(&object_to_world.inverse());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Vec3;

    #[test]
    fn test_descriptor_packing() {
        let mut node = InstanceNode::new((1u64 << 40) | 7, 3);
        node.desc.mask = 0x0F;
        node.desc.flags = instance_flags::FORCE_OPAQUE as u8;
        node.desc.hardware_flags = 0xA5;
        node.desc.leaf_type = 2;
        let bytes = node.encode();
        assert_eq!(bytes.len(), INSTANCE_NODE_SIZE);
        assert_eq!(read_u32(&bytes, 48), 0x0F00_0003);
        assert_eq!(read_u32(&bytes, 56), 7);
        assert_eq!(read_u32(&bytes, 60), (1 << 8) | (0xA5 << 22) | (2 << 30));
        assert_eq!(InstanceNode::decode(&bytes), node);
    }

    #[test]
    fn test_inactive_mask() {
        let mut node = InstanceNode::new(0, 0);
        assert!(node.is_active());
        node.desc.mask = 0;
        assert!(!node.is_active());
    }

    #[test]
    fn test_transforms() {
        let mut node = InstanceNode::new(0, 0);
        let xf = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        node.set_transform(&xf);
        let p = node.world_transform().transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::new(1.0, 2.0, 3.0));
        let back = node.inverse_transform().transform_point3(p);
        assert!(back.abs_diff_eq(Vec3::ZERO, 1e-6));
    }

    #[test]
    fn test_fused_record() {
        let mut node = InstanceNode::new(1, 0);
        node.layout = InstanceLayout::Rtip11 {
            blas_root: 0x10,
            fused_root: Some(Box32Node::default()),
        };
        let bytes = node.encode();
        assert_eq!(bytes.len(), FUSED_INSTANCE_NODE_SIZE);
        assert_eq!(InstanceNode::decode(&bytes), node);
    }

    fn rtip31_node() -> InstanceNode {
        let mut node = InstanceNode::new(3, 7);
        node.desc.instance_id = 0x12_3456;
        node.desc.mask = 0x0F;
        node.desc.flags = instance_flags::FORCE_OPAQUE as u8;
        node.desc.hit_group_contribution = 9;
        node.desc.hardware_flags = 0x2A5;
        node.desc.leaf_type = BVH8_NODE_TYPE as u8;
        node.blas_metadata_size = 128;
        node.set_transform(&Affine3A::from_translation(Vec3::new(4.0, 0.0, -2.0)));
        let root = Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::ONE);
        node.layout = InstanceLayout::Rtip31 {
            parent_pointer: (128 >> 3) | 5,
            root_box: InstanceRootBox::build(&[root]),
        };
        node
    }

    #[test]
    fn test_rtip31_hardware_node() {
        let node = rtip31_node();
        let hw = node.encode();
        assert_eq!(hw.len(), INSTANCE_NODE_SIZE);
        let child_base = read_u64(&hw, 48);
        assert_eq!(child_base & 0x7, 5);
        assert_eq!((child_base >> 3) & ((1 << 51) - 1), 3);
        assert_eq!(child_base >> 54, 0x2A5);
        assert_eq!(read_u32(&hw, 56), (128 >> 3) | 5);
        assert_eq!(read_u32(&hw, 60), 0x0F00_0009);
        // Valid count 1, stored minus one at bit 28
        assert_eq!(bit_field(read_u32(&hw, 76), 28, 2), 0);

        let sideband = node.encode_sideband();
        assert_eq!(read_u32(&sideband, 0), 7);
        assert_eq!(read_u32(&sideband, 4), 0x0412_3456);
        assert_eq!(read_u32(&sideband, 8), 128);
        assert_eq!(read_matrix3x4(&sideband, 16)[0][3], 4.0);

        let back = InstanceNode::decode_rtip31(&hw, &sideband);
        assert_eq!(back, node);
        assert_eq!(back.parent_pointer(), Some((128 >> 3) | 5));
        let InstanceLayout::Rtip31 { root_box, .. } = back.layout else {
            panic!("expected an RTIP 3.1 layout");
        };
        let boxes = root_box.child_bounds();
        assert_eq!(boxes.len(), 1);
        assert!(boxes[0].contains_box(&Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::ONE)));
    }

    #[test]
    fn test_rtip31_inactive() {
        let node = rtip31_node();
        assert!(node.is_active());

        let mut no_metadata = node;
        no_metadata.blas_metadata_size = 0;
        assert!(!no_metadata.is_active());

        let mut no_blas = node;
        no_blas.desc.blas_index = 0;
        no_blas.desc.leaf_type = 0;
        no_blas.desc.hardware_flags = 0;
        assert_eq!(no_blas.child_base_pointer(), 0);
        assert!(!no_blas.is_active());

        // RTIP 1.1 only looks at the mask
        let mut old = InstanceNode::new(0, 0);
        assert!(old.is_active());
        old.desc.mask = 0;
        assert!(!old.is_active());
    }
}
