//! Bounds-checked little-endian access to untrusted byte buffers.
//!
//! Callers slice a record or section first ([`record`], [`section`]); the
//! field accessors then index inside a slice whose length is already known.

use byteorder::{ByteOrder, LittleEndian};
use half::f16;

use super::math::{Aabb, Vec3};
use super::{Error, Result};

// ============================================================================
// Slicing
// ============================================================================

/// Borrow `stride` bytes at `offset`, or fail with `TruncatedRecord`.
pub fn record<'a>(data: &'a [u8], offset: u64, stride: usize, kind: &'static str) -> Result<&'a [u8]> {
    let available = usize::try_from(offset)
        .ok()
        .and_then(|o| data.len().checked_sub(o))
        .unwrap_or(0);
    if available < stride {
        return Err(Error::TruncatedRecord {
            kind,
            offset,
            stride,
            available,
        });
    }
    let start = offset as usize;
    Ok(&data[start..start + stride])
}

/// Borrow `len` bytes at `offset`, or fail with `TruncatedBuffer`.
pub fn section<'a>(data: &'a [u8], offset: u64, len: u64, what: &'static str) -> Result<&'a [u8]> {
    let end = offset.checked_add(len);
    match end {
        Some(end) if end <= data.len() as u64 => Ok(&data[offset as usize..end as usize]),
        _ => Err(Error::TruncatedBuffer {
            what,
            offset,
            needed: len,
            available: (data.len() as u64).saturating_sub(offset),
        }),
    }
}

// ============================================================================
// Field readers
// ============================================================================

#[inline]
pub fn read_u32(buf: &[u8], pos: usize) -> u32 {
    LittleEndian::read_u32(&buf[pos..pos + 4])
}

#[inline]
pub fn read_u64(buf: &[u8], pos: usize) -> u64 {
    LittleEndian::read_u64(&buf[pos..pos + 8])
}

#[inline]
pub fn read_f32(buf: &[u8], pos: usize) -> f32 {
    LittleEndian::read_f32(&buf[pos..pos + 4])
}

#[inline]
pub fn read_f16(buf: &[u8], pos: usize) -> f16 {
    f16::from_bits(LittleEndian::read_u16(&buf[pos..pos + 2]))
}

#[inline]
pub fn read_vec3(buf: &[u8], pos: usize) -> Vec3 {
    Vec3::new(read_f32(buf, pos), read_f32(buf, pos + 4), read_f32(buf, pos + 8))
}

/// Six floats: min xyz then max xyz.
#[inline]
pub fn read_aabb(buf: &[u8], pos: usize) -> Aabb {
    Aabb::new(read_vec3(buf, pos), read_vec3(buf, pos + 12))
}

/// Row-major 3x4 float matrix.
pub fn read_matrix3x4(buf: &[u8], pos: usize) -> [[f32; 4]; 3] {
    let mut m = [[0.0f32; 4]; 3];
    LittleEndian::read_f32_into(&buf[pos..pos + 48], bytemuck::cast_slice_mut(&mut m));
    m
}

// ============================================================================
// Field writers
// ============================================================================

#[inline]
pub fn write_u32(buf: &mut [u8], pos: usize, value: u32) {
    LittleEndian::write_u32(&mut buf[pos..pos + 4], value);
}

#[inline]
pub fn write_u64(buf: &mut [u8], pos: usize, value: u64) {
    LittleEndian::write_u64(&mut buf[pos..pos + 8], value);
}

#[inline]
pub fn write_f32(buf: &mut [u8], pos: usize, value: f32) {
    LittleEndian::write_f32(&mut buf[pos..pos + 4], value);
}

#[inline]
pub fn write_f16(buf: &mut [u8], pos: usize, value: f16) {
    LittleEndian::write_u16(&mut buf[pos..pos + 2], value.to_bits());
}

#[inline]
pub fn write_vec3(buf: &mut [u8], pos: usize, v: Vec3) {
    write_f32(buf, pos, v.x);
    write_f32(buf, pos + 4, v.y);
    write_f32(buf, pos + 8, v.z);
}

#[inline]
pub fn write_aabb(buf: &mut [u8], pos: usize, b: &Aabb) {
    write_vec3(buf, pos, b.min);
    write_vec3(buf, pos + 12, b.max);
}

pub fn write_matrix3x4(buf: &mut [u8], pos: usize, m: &[[f32; 4]; 3]) {
    LittleEndian::write_f32_into(bytemuck::cast_slice(m), &mut buf[pos..pos + 48]);
}

/// Extract `bits` bits starting at `shift`.
#[inline]
pub const fn bit_field(value: u32, shift: u32, bits: u32) -> u32 {
    (value >> shift) & ((1u32 << bits) - 1)
}

/// Insert `data` into a `bits`-wide field at `shift`.
#[inline]
pub const fn set_bit_field(value: u32, shift: u32, bits: u32, data: u32) -> u32 {
    let mask = ((1u32 << bits) - 1) << shift;
    (value & !mask) | ((data << shift) & mask)
}
