//! Child -> parent links for upward traversal.

use std::collections::HashMap;

use super::node_pointer::NodePointer;

/// Reverse links keyed by child byte offset.
#[derive(Debug, Clone, Default)]
pub struct ParentBlock {
    links: HashMap<u64, NodePointer>,
    stored: bool,
}

impl ParentBlock {
    /// Build from `(child offset, parent)` pairs. `stored` marks links read
    /// from the structure rather than derived from the walk.
    pub fn from_links(links: impl IntoIterator<Item = (u64, NodePointer)>, stored: bool) -> Self {
        let mut map = HashMap::new();
        for (child, parent) in links {
            map.entry(child).or_insert(parent);
        }
        Self { links: map, stored }
    }

    pub fn parent_of(&self, child_offset: u64) -> Option<NodePointer> {
        self.links.get(&child_offset).copied()
    }

    #[inline]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Whether box links came from the structure itself.
    #[inline]
    pub fn is_stored(&self) -> bool {
        self.stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::node_pointer::NodeKind;
    use crate::bvh::rtip::RtIp;

    #[test]
    fn test_first_link_wins() {
        let root = NodePointer::new(RtIp::Rtip11, NodeKind::Box32, 128).unwrap();
        let other = NodePointer::new(RtIp::Rtip11, NodeKind::Box16, 256).unwrap();
        let block = ParentBlock::from_links([(320, root), (320, other), (384, root)], false);
        assert_eq!(block.link_count(), 2);
        assert_eq!(block.parent_of(320), Some(root));
        assert_eq!(block.parent_of(128), None);
        assert!(!block.is_stored());
    }
}
