//! Packed node references.
//!
//! A node pointer is a 32-bit word holding a node-type tag in its low bits
//! and a scaled byte offset in the remaining bits. Both hardware generations
//! store `byte_offset >> 3` with the tag OR-ed into the low bits, which gives:
//!
//! | generation | tag bits | offset granularity |
//! |------------|----------|--------------------|
//! | RTIP 1.1   | 3        | 64 bytes           |
//! | RTIP 3.1   | 4        | 128 bytes          |
//!
//! Offsets are relative to the start of the structure header.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::format::INVALID_NODE;
use super::rtip::RtIp;
use crate::util::{Error, Result};

/// Kind of node a pointer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Triangle leaf; the slot selects which triangle of the record is addressed.
    Triangle(u8),
    /// Four-wide box with half precision bounds (RTIP 1.1).
    Box16,
    /// Four-wide box with full precision bounds (RTIP 1.1).
    Box32,
    /// Eight-wide box with quantized bounds (RTIP 3.1).
    QuantizedBvh8,
    /// Top-level instance leaf.
    Instance,
    /// Procedural (AABB) leaf.
    Procedural,
}

impl NodeKind {
    #[inline]
    pub fn is_box(self) -> bool {
        matches!(self, Self::Box16 | Self::Box32 | Self::QuantizedBvh8)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        !self.is_box()
    }

    #[inline]
    pub fn is_triangle(self) -> bool {
        matches!(self, Self::Triangle(_))
    }

    /// Short display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Triangle(_) => "triangle",
            Self::Box16 => "box16",
            Self::Box32 => "box32",
            Self::QuantizedBvh8 => "bvh8",
            Self::Instance => "instance",
            Self::Procedural => "procedural",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Triangle(slot) => write!(f, "triangle{}", slot),
            other => f.write_str(other.name()),
        }
    }
}

/// Tag value of `kind` under the RTIP 1.1 packing.
fn rtip11_tag(kind: NodeKind) -> Option<u32> {
    match kind {
        NodeKind::Triangle(slot) if slot < 4 => Some(slot as u32),
        NodeKind::Box16 => Some(4),
        NodeKind::Box32 => Some(5),
        NodeKind::Instance => Some(6),
        NodeKind::Procedural => Some(7),
        _ => None,
    }
}

/// Tag value of `kind` under the RTIP 3.1 packing.
fn rtip31_tag(kind: NodeKind) -> Option<u32> {
    match kind {
        NodeKind::Triangle(slot) if slot < 4 => Some(slot as u32),
        NodeKind::Triangle(slot) if slot < 8 => Some(slot as u32 + 4),
        NodeKind::QuantizedBvh8 => Some(5),
        NodeKind::Instance => Some(6),
        NodeKind::Procedural => Some(7),
        _ => None,
    }
}

/// Decoded node reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodePointer {
    rtip: RtIp,
    kind: NodeKind,
    byte_offset: u64,
}

impl NodePointer {
    /// Build a pointer, checking that the kind exists in `rtip` and the
    /// offset is representable.
    pub fn new(rtip: RtIp, kind: NodeKind, byte_offset: u64) -> Result<Self> {
        let ptr = Self { rtip, kind, byte_offset };
        ptr.try_encode()?;
        Ok(ptr)
    }

    /// Unpack a raw pointer word.
    pub fn decode(rtip: RtIp, raw: u32) -> Result<Self> {
        if raw == INVALID_NODE {
            return Err(Error::invalid_pointer(raw, "invalid node sentinel"));
        }
        let (tag, byte_offset) = match rtip {
            RtIp::Rtip11 => (raw & 0x7, ((raw >> 3) as u64) << 6),
            RtIp::Rtip31 => (raw & 0xF, ((raw >> 4) as u64) << 7),
        };
        let kind = match (rtip, tag) {
            (_, 0..=3) => NodeKind::Triangle(tag as u8),
            (RtIp::Rtip11, 4) => NodeKind::Box16,
            (RtIp::Rtip11, 5) => NodeKind::Box32,
            (RtIp::Rtip31, 5) => NodeKind::QuantizedBvh8,
            (_, 6) => NodeKind::Instance,
            (_, 7) => NodeKind::Procedural,
            (RtIp::Rtip31, 8..=11) => NodeKind::Triangle((tag - 4) as u8),
            _ => {
                return Err(Error::invalid_pointer(
                    raw,
                    format!("tag {} is not a {} node type", tag, rtip.name()),
                ))
            }
        };
        Ok(Self { rtip, kind, byte_offset })
    }

    /// Pack into the raw pointer word.
    ///
    /// Pointers built through [`new`](Self::new) or [`decode`](Self::decode)
    /// always encode.
    pub fn encode(&self) -> u32 {
        self.try_encode().unwrap_or(INVALID_NODE)
    }

    fn try_encode(&self) -> Result<u32> {
        let (tag, granularity, tag_bits) = match self.rtip {
            RtIp::Rtip11 => (rtip11_tag(self.kind), 64u64, 3u32),
            RtIp::Rtip31 => (rtip31_tag(self.kind), 128u64, 4u32),
        };
        let tag = tag.ok_or_else(|| {
            Error::invalid_pointer(INVALID_NODE, format!("{} nodes do not exist in {}", self.kind, self.rtip.name()))
        })?;
        if self.byte_offset % granularity != 0 {
            return Err(Error::invalid_pointer(
                INVALID_NODE,
                format!("offset {} is not {}-byte aligned", self.byte_offset, granularity),
            ));
        }
        let address = self.byte_offset / granularity;
        if address >= 1u64 << (32 - tag_bits) {
            return Err(Error::invalid_pointer(
                INVALID_NODE,
                format!("offset {} exceeds the pointer address range", self.byte_offset),
            ));
        }
        let raw = ((address as u32) << tag_bits) | tag;
        if raw == INVALID_NODE {
            return Err(Error::invalid_pointer(raw, "pointer collides with the invalid sentinel"));
        }
        Ok(raw)
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline]
    pub fn rtip(&self) -> RtIp {
        self.rtip
    }

    /// Byte offset from the header start.
    #[inline]
    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    /// Triangle slot, for triangle pointers.
    #[inline]
    pub fn triangle_slot(&self) -> Option<u8> {
        match self.kind {
            NodeKind::Triangle(slot) => Some(slot),
            _ => None,
        }
    }

    /// Fail with `InvalidPointer` unless the offset lies inside `stream`.
    pub fn check_within(&self, stream: &Range<u64>) -> Result<()> {
        if stream.contains(&self.byte_offset) {
            Ok(())
        } else {
            Err(Error::invalid_pointer(
                self.encode(),
                format!(
                    "offset {} outside node stream [{}, {})",
                    self.byte_offset, stream.start, stream.end
                ),
            ))
        }
    }
}

impl fmt::Debug for NodePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePointer({}@0x{:x})", self.kind, self.byte_offset)
    }
}

impl fmt::Display for NodePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@0x{:x}", self.kind, self.byte_offset)
    }
}
