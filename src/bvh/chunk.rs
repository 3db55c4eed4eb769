//! Trace chunk framing.
//!
//! A chunk is a run of `[blob_size: u32][flags: u32][blob]` entries. BLAS and
//! TLAS entries are numbered separately, in chunk order.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use super::format::{CHUNK_FLAG_BLAS, CHUNK_FRAME_SIZE};
use crate::util::bytes::{read_u32, section};
use crate::util::{Error, Result};

/// Structure level of a chunk entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Level {
    Bottom,
    Top,
}

/// One framed structure blob.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEntry<'a> {
    /// Position among all entries.
    pub ordinal: usize,
    pub level: Level,
    /// Index among entries of the same level.
    pub slot: usize,
    /// Absolute offset of the blob (chunk base + position).
    pub offset: u64,
    pub blob: &'a [u8],
}

/// A chunk entry whose frame could not be read.
#[derive(Debug)]
pub struct FramingError {
    /// Position among all entries.
    pub ordinal: usize,
    /// Level from the frame flags; `None` when the frame header itself is cut.
    pub level: Option<Level>,
    pub error: Error,
}

/// Read-only view of a trace chunk.
#[derive(Debug, Clone, Copy)]
pub struct TraceChunk<'a> {
    data: &'a [u8],
    base_offset: u64,
}

impl<'a> TraceChunk<'a> {
    pub fn new(data: &'a [u8], base_offset: u64) -> Self {
        Self { data, base_offset }
    }

    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn entries(&self) -> ChunkEntries<'a> {
        ChunkEntries {
            chunk: *self,
            pos: 0,
            ordinal: 0,
            blas: 0,
            tlas: 0,
            done: false,
        }
    }
}

/// Iterator over chunk entries. A frame running past the chunk end yields
/// one error and ends the scan.
#[derive(Debug, Clone)]
pub struct ChunkEntries<'a> {
    chunk: TraceChunk<'a>,
    pos: usize,
    ordinal: usize,
    blas: usize,
    tlas: usize,
    done: bool,
}

impl<'a> ChunkEntries<'a> {
    fn next_entry(&mut self) -> std::result::Result<ChunkEntry<'a>, (Option<Level>, Error)> {
        let data = self.chunk.data;
        let frame = section(data, self.pos as u64, CHUNK_FRAME_SIZE as u64, "chunk entry frame")
            .map_err(|e| (None, e))?;
        let size = read_u32(frame, 0) as u64;
        let flags = read_u32(frame, 4);
        let level = if flags & CHUNK_FLAG_BLAS != 0 {
            Level::Bottom
        } else {
            Level::Top
        };
        let start = self.pos + CHUNK_FRAME_SIZE;
        let blob = section(data, start as u64, size, "chunk entry blob").map_err(|e| (Some(level), e))?;
        let slot = match level {
            Level::Bottom => {
                self.blas += 1;
                self.blas - 1
            }
            Level::Top => {
                self.tlas += 1;
                self.tlas - 1
            }
        };
        self.pos = start + blob.len();
        Ok(ChunkEntry {
            ordinal: self.ordinal,
            level,
            slot,
            offset: self.chunk.base_offset + start as u64,
            blob,
        })
    }
}

impl<'a> Iterator for ChunkEntries<'a> {
    type Item = std::result::Result<ChunkEntry<'a>, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.chunk.data.len() {
            return None;
        }
        let item = match self.next_entry() {
            Ok(entry) => Ok(entry),
            Err((level, error)) => {
                self.done = true;
                Err(FramingError {
                    ordinal: self.ordinal,
                    level,
                    error,
                })
            }
        };
        self.ordinal += 1;
        Some(item)
    }
}

/// Memory-mapped chunk file.
pub struct ChunkFile {
    mmap: Mmap,
}

impl ChunkFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // Safety: the file is opened read-only and the map is never written
        let mmap = unsafe { Mmap::map(&file) }?;
        tracing::debug!(path = %path.as_ref().display(), bytes = mmap.len(), "mapped chunk file");
        Ok(Self { mmap })
    }

    pub fn chunk(&self) -> TraceChunk<'_> {
        TraceChunk::new(&self.mmap, 0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl std::fmt::Debug for ChunkFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFile").field("len", &self.mmap.len()).finish()
    }
}
