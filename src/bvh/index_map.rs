//! Logical primitive index <-> leaf location.
//!
//! Leaves are numbered in the order the decoder walks them. Each primitive is
//! reached through a leaf pointer and a slot among the triangles that pointer
//! addresses, and is stored at a location: the record byte offset plus the
//! triangle position inside the record. The two coincide on RTIP 1.1. An
//! RTIP 3.1 leaf range can span two packets, so there the location names the
//! packet and the `pair * 2 + triangle` position in it.

use std::collections::HashMap;

use serde::Serialize;

use super::node_pointer::NodePointer;

/// Where a logical primitive lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PrimitiveLocation {
    pub byte_offset: u64,
    pub slot: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MappedPrimitive {
    leaf: NodePointer,
    slot: u8,
    location: PrimitiveLocation,
}

#[derive(Debug, Clone, Default)]
pub struct IndexReferenceMap {
    forward: Vec<MappedPrimitive>,
    reverse: HashMap<PrimitiveLocation, u32>,
}

impl IndexReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a primitive stored in the leaf record itself.
    pub fn insert(&mut self, leaf: NodePointer, slot: u8) -> u32 {
        let location = PrimitiveLocation {
            byte_offset: leaf.byte_offset(),
            slot,
        };
        self.insert_at(leaf, slot, location)
    }

    /// Record a primitive, returning its logical index. A location seen
    /// before keeps its first index.
    pub fn insert_at(&mut self, leaf: NodePointer, slot: u8, location: PrimitiveLocation) -> u32 {
        if let Some(&index) = self.reverse.get(&location) {
            return index;
        }
        let index = self.forward.len() as u32;
        self.forward.push(MappedPrimitive { leaf, slot, location });
        self.reverse.insert(location, index);
        index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Leaf pointer and slot of logical index `index`.
    pub fn location(&self, index: u32) -> Option<(NodePointer, u8)> {
        self.forward.get(index as usize).map(|m| (m.leaf, m.slot))
    }

    /// Where logical index `index` is stored.
    pub fn position(&self, index: u32) -> Option<PrimitiveLocation> {
        self.forward.get(index as usize).map(|m| m.location)
    }

    pub fn byte_offset(&self, index: u32) -> Option<u64> {
        self.position(index).map(|loc| loc.byte_offset)
    }

    pub fn index_of(&self, byte_offset: u64, slot: u8) -> Option<u32> {
        self.reverse.get(&PrimitiveLocation { byte_offset, slot }).copied()
    }

    /// Logical indices stored in the record at `byte_offset`.
    pub fn indices_at(&self, byte_offset: u64) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .reverse
            .iter()
            .filter(|(loc, _)| loc.byte_offset == byte_offset)
            .map(|(_, i)| *i)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, NodePointer, u8)> + '_ {
        self.forward
            .iter()
            .enumerate()
            .map(|(i, m)| (i as u32, m.leaf, m.slot))
    }

    /// Forward and reverse tables agree entry for entry.
    pub fn is_bijection(&self) -> bool {
        self.forward.len() == self.reverse.len()
            && self
                .forward
                .iter()
                .enumerate()
                .all(|(i, m)| self.reverse.get(&m.location) == Some(&(i as u32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::node_pointer::NodeKind;
    use crate::bvh::rtip::RtIp;

    fn tri(offset: u64, slot: u8) -> NodePointer {
        NodePointer::new(RtIp::Rtip11, NodeKind::Triangle(slot), offset).unwrap()
    }

    #[test]
    fn test_sequential_indices() {
        let mut map = IndexReferenceMap::new();
        assert_eq!(map.insert(tri(256, 0), 0), 0);
        assert_eq!(map.insert(tri(320, 1), 0), 1);
        assert_eq!(map.insert(tri(320, 1), 1), 2);
        assert_eq!(map.len(), 3);
        assert_eq!(map.byte_offset(1), Some(320));
        assert_eq!(map.index_of(320, 1), Some(2));
        assert_eq!(map.indices_at(320), vec![1, 2]);
        assert!(map.is_bijection());
    }

    #[test]
    fn test_revisit_keeps_first_index() {
        let mut map = IndexReferenceMap::new();
        map.insert(tri(256, 0), 0);
        map.insert(tri(320, 0), 0);
        assert_eq!(map.insert(tri(256, 0), 0), 0);
        assert_eq!(map.len(), 2);
        assert!(map.location(5).is_none());
    }

    #[test]
    fn test_range_spanning_packets() {
        // One leaf pointer whose second triangle lives in the next packet
        let leaf = NodePointer::new(RtIp::Rtip31, NodeKind::Triangle(1), 256).unwrap();
        let mut map = IndexReferenceMap::new();
        let first = PrimitiveLocation { byte_offset: 256, slot: 2 };
        let second = PrimitiveLocation { byte_offset: 384, slot: 0 };
        assert_eq!(map.insert_at(leaf, 0, first), 0);
        assert_eq!(map.insert_at(leaf, 1, second), 1);
        assert_eq!(map.location(1), Some((leaf, 1)));
        assert_eq!(map.position(1), Some(second));
        assert_eq!(map.byte_offset(1), Some(384));
        assert_eq!(map.index_of(384, 0), Some(1));
        assert_eq!(map.indices_at(256), vec![0]);
        assert!(map.is_bijection());
    }
}
