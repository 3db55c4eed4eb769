//! All structures decoded from one trace chunk.
//!
//! Loading runs in two phases. Every BLAS decodes independently (on the rayon
//! pool when enabled); the TLAS phase starts once the BLAS slots are final, so
//! instance references resolve against a complete collection. A bundle is
//! immutable once built and is published to the loader's visible slot in one
//! swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;

use super::blas::EncodedBlas;
use super::chunk::{ChunkEntry, Level, TraceChunk};
use super::stats::BundleStats;
use super::tlas::{BlasReference, EncodedTlas};
use crate::config::DecodeOptions;
use crate::util::{Error, ErrorKind, Result};

/// A structure that failed to decode, or a degraded instance.
#[derive(Debug)]
pub struct DecodeFailure {
    /// Chunk entry ordinal.
    pub entry: usize,
    /// `None` when framing failed before the entry flags were read.
    pub level: Option<Level>,
    /// Slot among structures of the same level; `None` when framing failed
    /// before the slot was known.
    pub slot: Option<usize>,
    pub error: Error,
}

impl DecodeFailure {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// One instance -> BLAS link of the cross-reference table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrossReference {
    pub tlas: usize,
    pub instance: u32,
    pub blas: BlasReference,
}

/// Decoded BLAS and TLAS collections. Failed slots are `None`.
#[derive(Debug, Default)]
pub struct BvhBundle {
    blas: Vec<Option<EncodedBlas>>,
    tlas: Vec<Option<EncodedTlas>>,
    failures: Vec<DecodeFailure>,
}

impl BvhBundle {
    /// Decode every structure in `chunk`.
    pub fn decode(chunk: &TraceChunk<'_>, options: &DecodeOptions) -> Self {
        let never = AtomicBool::new(false);
        match decode_chunk(chunk, options, &never) {
            Ok(bundle) => bundle,
            // Unreachable without a cancel request
            Err(_) => Self::default(),
        }
    }

    /// Slots in the BLAS collection, decoded or not.
    #[inline]
    pub fn blas_count(&self) -> usize {
        self.blas.len()
    }

    #[inline]
    pub fn tlas_count(&self) -> usize {
        self.tlas.len()
    }

    pub fn get_blas(&self, index: usize) -> Option<&EncodedBlas> {
        self.blas.get(index).and_then(|b| b.as_ref())
    }

    pub fn get_tlas(&self, index: usize) -> Option<&EncodedTlas> {
        self.tlas.get(index).and_then(|t| t.as_ref())
    }

    pub fn is_blas_present(&self, index: usize) -> bool {
        self.get_blas(index).is_some()
    }

    pub fn is_tlas_present(&self, index: usize) -> bool {
        self.get_tlas(index).is_some()
    }

    pub fn blas_iter(&self) -> impl Iterator<Item = (usize, &EncodedBlas)> + '_ {
        self.blas.iter().enumerate().filter_map(|(i, b)| b.as_ref().map(|b| (i, b)))
    }

    pub fn tlas_iter(&self) -> impl Iterator<Item = (usize, &EncodedTlas)> + '_ {
        self.tlas.iter().enumerate().filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
    }

    /// Failed structures and dangling instances, in chunk order.
    #[inline]
    pub fn failures(&self) -> &[DecodeFailure] {
        &self.failures
    }

    /// Every instance -> BLAS link.
    pub fn cross_references(&self) -> impl Iterator<Item = CrossReference> + '_ {
        self.tlas_iter().flat_map(|(t, tlas)| {
            tlas.references()
                .iter()
                .enumerate()
                .map(move |(i, r)| CrossReference {
                    tlas: t,
                    instance: i as u32,
                    blas: *r,
                })
        })
    }

    /// BLAS an instance resolves to, `None` when missing.
    pub fn instance_blas(&self, tlas: usize, instance: u32) -> Option<&EncodedBlas> {
        let reference = self.get_tlas(tlas)?.instance(instance)?.blas_reference();
        self.get_blas(reference.blas()? as usize)
    }

    pub fn stats(&self) -> BundleStats {
        let mut stats = BundleStats::default();
        for b in &self.blas {
            stats.accumulate_blas(b.as_ref());
        }
        for t in &self.tlas {
            stats.accumulate_tlas(t.as_ref());
        }
        stats
    }
}

// ============================================================================
// Loading
// ============================================================================

fn decode_chunk(chunk: &TraceChunk<'_>, options: &DecodeOptions, cancel: &AtomicBool) -> Result<BvhBundle> {
    let span = tracing::info_span!("decode_chunk", bytes = chunk.data().len());
    let _guard = span.enter();

    let mut failures = Vec::new();
    let mut blas_entries: Vec<ChunkEntry<'_>> = Vec::new();
    let mut tlas_entries: Vec<ChunkEntry<'_>> = Vec::new();
    for item in chunk.entries() {
        match item {
            Ok(entry) if entry.level == Level::Bottom => blas_entries.push(entry),
            Ok(entry) => tlas_entries.push(entry),
            Err(framing) => {
                tracing::warn!(entry = framing.ordinal, level = ?framing.level, "{}", framing.error);
                failures.push(DecodeFailure {
                    entry: framing.ordinal,
                    level: framing.level,
                    slot: None,
                    error: framing.error,
                });
            }
        }
    }

    // Phase 1: bottom level
    let decode_blas = |entry: &ChunkEntry<'_>| -> Result<EncodedBlas> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        EncodedBlas::decode(entry.blob, options)
    };
    let blas_results: Vec<Result<EncodedBlas>> = if options.parallel_blas {
        blas_entries.par_iter().map(decode_blas).collect()
    } else {
        blas_entries.iter().map(decode_blas).collect()
    };
    if cancel.load(Ordering::Relaxed) {
        tracing::info!("load cancelled after BLAS phase");
        return Err(Error::Cancelled);
    }
    let mut blas = Vec::with_capacity(blas_results.len());
    for (entry, result) in blas_entries.iter().zip(blas_results) {
        blas.push(keep(entry, result, &mut failures));
    }
    let present: Vec<bool> = blas.iter().map(|b| b.is_some()).collect();

    // Phase 2: top level, against the final BLAS slots
    let mut tlas = Vec::with_capacity(tlas_entries.len());
    for entry in &tlas_entries {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!("load cancelled in TLAS phase");
            return Err(Error::Cancelled);
        }
        let mut decoded = keep(entry, EncodedTlas::decode(entry.blob, options), &mut failures);
        if let Some(t) = decoded.as_mut() {
            for error in t.resolve(&present) {
                tracing::warn!(tlas = entry.slot, "{}", error);
                failures.push(DecodeFailure {
                    entry: entry.ordinal,
                    level: Some(Level::Top),
                    slot: Some(entry.slot),
                    error,
                });
            }
        }
        tlas.push(decoded);
    }

    failures.sort_by_key(|f| f.entry);
    tracing::info!(
        blas = blas.len(),
        tlas = tlas.len(),
        failures = failures.len(),
        "decoded bundle"
    );
    Ok(BvhBundle { blas, tlas, failures })
}

fn keep<T>(entry: &ChunkEntry<'_>, result: Result<T>, failures: &mut Vec<DecodeFailure>) -> Option<T> {
    match result {
        Ok(s) => Some(s),
        Err(error) => {
            tracing::warn!(entry = entry.ordinal, slot = entry.slot, "structure skipped: {}", error);
            failures.push(DecodeFailure {
                entry: entry.ordinal,
                level: Some(entry.level),
                slot: Some(entry.slot),
                error,
            });
            None
        }
    }
}

/// Requests cancellation of a running load.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Loads bundles and holds the one consumers currently see.
#[derive(Debug, Default)]
pub struct BundleLoader {
    options: DecodeOptions,
    cancel: CancelToken,
    visible: RwLock<Option<Arc<BvhBundle>>>,
}

impl BundleLoader {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Token that cancels the load in progress.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Decode `chunk` and publish the result. A cancelled load publishes
    /// nothing and leaves the previous bundle visible.
    pub fn load(&self, chunk: &TraceChunk<'_>) -> Result<Arc<BvhBundle>> {
        self.cancel.reset();
        let bundle = Arc::new(decode_chunk(chunk, &self.options, &self.cancel.0)?);
        *self.visible.write() = Some(Arc::clone(&bundle));
        Ok(bundle)
    }

    /// Bundle currently published.
    pub fn current(&self) -> Option<Arc<BvhBundle>> {
        self.visible.read().clone()
    }

    /// Drop the published bundle (trace closed).
    pub fn clear(&self) {
        *self.visible.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::rtip::RtIp;
    use crate::bvh::writer::{BuildNode, ChunkWriter, StructureWriter};
    use crate::bvh::AccelerationStructure;
    use crate::util::{Aabb, Affine3A, Vec3};

    fn blas_blob() -> Vec<u8> {
        blas_blob_at(0)
    }

    fn blas_blob_at(va: u64) -> Vec<u8> {
        let tree = BuildNode::boxed(vec![
            BuildNode::triangle([Vec3::ZERO, Vec3::X, Vec3::Y], 0, 0),
            BuildNode::triangle([Vec3::Z, Vec3::X, Vec3::Y], 0, 0),
        ]);
        StructureWriter::blas(RtIp::Rtip11)
            .with_virtual_address(va)
            .write(&tree)
            .unwrap()
    }

    fn tlas_blob(refs: &[u64]) -> Vec<u8> {
        let unit = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let tree = BuildNode::boxed(
            refs.iter()
                .map(|r| BuildNode::instance(*r, Affine3A::IDENTITY, unit))
                .collect(),
        );
        StructureWriter::tlas(RtIp::Rtip11).write(&tree).unwrap()
    }

    fn chunk() -> Vec<u8> {
        let mut w = ChunkWriter::new();
        w.push_blas(&blas_blob()).unwrap();
        w.push_blas(&[0u8; 12]).unwrap();
        w.push_tlas(&tlas_blob(&[0, 1, 2])).unwrap();
        w.finish()
    }

    #[test]
    fn test_partial_bundle() {
        for parallel in [true, false] {
            let options = DecodeOptions {
                parallel_blas: parallel,
                ..DecodeOptions::default()
            };
            let bytes = chunk();
            let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &options);
            assert_eq!(bundle.blas_count(), 2);
            assert!(bundle.is_blas_present(0));
            assert!(!bundle.is_blas_present(1));
            assert_eq!(bundle.tlas_count(), 1);
            let refs: Vec<BlasReference> = bundle.cross_references().map(|c| c.blas).collect();
            assert_eq!(
                refs,
                vec![
                    BlasReference::Resolved(0),
                    BlasReference::Missing { blas_index: 1 },
                    BlasReference::Missing { blas_index: 2 },
                ]
            );
            assert_eq!(bundle.instance_blas(0, 0).unwrap().node_count(), 3);
            assert!(bundle.instance_blas(0, 1).is_none());
            let kinds: Vec<ErrorKind> = bundle.failures().iter().map(|f| f.kind()).collect();
            assert_eq!(kinds, vec![ErrorKind::TruncatedBuffer, ErrorKind::DanglingInstanceReference]);
            let stats = bundle.stats();
            assert_eq!(stats.absent_structures, 1);
            assert_eq!(stats.missing_instances, 2);
        }
    }

    #[test]
    fn test_resolution_ignores_blob_address() {
        let mut w = ChunkWriter::new();
        w.push_blas(&blas_blob_at(0x7f00_0000)).unwrap();
        w.push_blas(&blas_blob_at(0x4000)).unwrap();
        w.push_tlas(&tlas_blob(&[1, 0x4000])).unwrap();
        let bytes = w.finish();
        let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &DecodeOptions::default());
        assert_eq!(bundle.get_blas(1).unwrap().bvh().virtual_address(), 0x4000);
        let refs: Vec<BlasReference> = bundle.cross_references().map(|c| c.blas).collect();
        assert_eq!(
            refs,
            vec![BlasReference::Resolved(1), BlasReference::Missing { blas_index: 0x4000 }]
        );
        assert_eq!(bundle.failures().len(), 1);
        assert_eq!(bundle.failures()[0].kind(), ErrorKind::DanglingInstanceReference);
    }

    #[test]
    fn test_framing_failure_level() {
        let mut bytes = chunk();
        let tlas = tlas_blob(&[0]);
        // TLAS frame whose blob is cut short
        bytes.extend_from_slice(&(tlas.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&tlas[..tlas.len() / 2]);
        let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &DecodeOptions::default());
        assert_eq!(bundle.tlas_count(), 1);
        let framing = bundle.failures().iter().find(|f| f.entry == 3).unwrap();
        assert_eq!(framing.level, Some(Level::Top));
        assert_eq!(framing.slot, None);
        assert_eq!(framing.kind(), ErrorKind::TruncatedBuffer);

        // A cut frame header leaves the level unknown
        let mut bytes = chunk();
        bytes.extend_from_slice(&[0xff; 5]);
        let bundle = BvhBundle::decode(&TraceChunk::new(&bytes, 0), &DecodeOptions::default());
        let framing = bundle.failures().iter().find(|f| f.entry == 3).unwrap();
        assert_eq!(framing.level, None);
    }

    #[test]
    fn test_loader_publishes() {
        let loader = BundleLoader::new(DecodeOptions::default());
        assert!(loader.current().is_none());
        let bytes = chunk();
        let bundle = loader.load(&TraceChunk::new(&bytes, 0)).unwrap();
        assert!(Arc::ptr_eq(&bundle, &loader.current().unwrap()));
        loader.clear();
        assert!(loader.current().is_none());
    }

    #[test]
    fn test_cancelled_load_keeps_previous() {
        let loader = BundleLoader::new(DecodeOptions::default());
        let bytes = chunk();
        let first = loader.load(&TraceChunk::new(&bytes, 0)).unwrap();
        let token = loader.cancel_token();
        assert!(!token.is_cancelled());
        // Cancel from inside the BLAS phase
        let cancel = AtomicBool::new(true);
        let err = decode_chunk(&TraceChunk::new(&bytes, 0), &DecodeOptions::default(), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(Arc::ptr_eq(&first, &loader.current().unwrap()));
    }
}
