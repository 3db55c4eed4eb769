//! Acceleration structure format constants.

/// Magic of a structure blob laid out for RTIP 1.1 hardware.
pub const RTIP11_MAGIC: &[u8; 4] = b"RT11";

/// Magic of a structure blob laid out for RTIP 3.1 hardware.
pub const RTIP31_MAGIC: &[u8; 4] = b"RT31";

/// Size of the blob preamble (magic, header offset, virtual address).
pub const BLOB_PREAMBLE_SIZE: usize = 16;

/// Offset of the header-offset field in the preamble.
pub const BLOB_HEADER_OFFSET_POS: usize = 4;

/// Offset of the GPU virtual address in the preamble.
pub const BLOB_VA_POS: usize = 8;

/// Size of a chunk entry frame (blob size + flags).
pub const CHUNK_FRAME_SIZE: usize = 8;

/// Chunk frame flag: entry holds a bottom-level structure.
pub const CHUNK_FLAG_BLAS: u32 = 0x1;

/// Size of the acceleration structure header.
pub const HEADER_SIZE: usize = 128;

/// Metadata alignment; writers place the header on this boundary.
pub const METADATA_ALIGNMENT: usize = 128;

/// Box node with full precision bounds.
pub const BOX32_NODE_SIZE: usize = 128;

/// Box node with half precision bounds.
pub const BOX16_NODE_SIZE: usize = 64;

/// Triangle and procedural leaf records.
pub const LEAF_NODE_SIZE: usize = 64;

/// Instance descriptor plus extra data.
pub const INSTANCE_NODE_SIZE: usize = 128;

/// Instance node followed by the BLAS root box.
pub const FUSED_INSTANCE_NODE_SIZE: usize = 256;

/// Instance descriptor part of an instance node.
pub const INSTANCE_DESC_SIZE: usize = 64;

/// RTIP 3.1 quantized 8-wide box node.
pub const QUANTIZED_BVH8_NODE_SIZE: usize = 128;

/// Allocation granularity of every RTIP 3.1 node.
pub const RTIP31_NODE_SLOT: usize = 128;

/// RTIP 3.1 compressed triangle packet.
pub const PRIMITIVE_PACKET_SIZE: usize = 128;

/// RTIP 3.1 instance data kept beside the hardware instance node.
pub const INSTANCE_SIDEBAND_SIZE: usize = 64;

/// Geometry descriptor record.
pub const GEOMETRY_INFO_SIZE: usize = 12;

/// Raw pointer marking an unused child slot.
pub const INVALID_NODE: u32 = 0xFFFF_FFFF;

/// Byte offset of the RTIP 1.1 root node (immediately after the header).
pub const RTIP11_ROOT_OFFSET: u64 = HEADER_SIZE as u64;

/// Children of a Box32 / Box16 node.
pub const BOX_CHILD_COUNT: usize = 4;

/// Children of a quantized BVH8 node.
pub const BVH8_CHILD_COUNT: usize = 8;

/// Mask of the 54-bit BLAS reference in an instance descriptor.
pub const BLAS_REFERENCE_MASK: u64 = (1 << 54) - 1;

/// Current driver structure version (16.3).
pub const ACCEL_STRUCT_VERSION: u32 = (16 << 16) | 3;

/// Align `value` up to a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
