//! Query pipeline: embed → ANN search → id join → cached block fetch.
//!
//! The retriever owns the read-only pack and index views plus the block
//! cache; it is safe to share across threads.  Result ordering is total —
//! `(distance asc, chunk_id asc)` — so two identical queries on the same
//! pack return identical results.  Candidates whose block turns out to be
//! unrecoverable are skipped and the candidate queue keeps draining; a
//! search comes back short only when the queue is exhausted.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::ann::AnnReader;
use crate::cache::BlockCache;
use crate::embed::{normalize, EmbeddingBackend};
use crate::error::{check_deadline, MempackError, Result};
use crate::meta::{ChunkMeta, MetaValue};
use crate::reader::{chunk_slice, PackReader};
use crate::verify::{verify_pack, VerifyReport};

/// Per-call knobs.  `Default` leaves everything to the pack's config.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Override the pack's `efSearch`.
    pub ef_search: Option<usize>,
    /// Keep only chunks whose metadata matches every pair exactly.
    pub filter_meta: Option<BTreeMap<String, MetaValue>>,
    /// Keep only chunks carrying every listed tag, resolved through the
    /// pack's tag index.
    pub filter_tags: Vec<String>,
    /// Abort with `Timeout` once this instant passes.
    pub deadline: Option<Instant>,
}

/// One scored search result.
#[derive(Debug, Clone)]
pub struct Hit {
    pub chunk_id: u64,
    /// `1 - cosine_distance`; higher is closer.
    pub score: f32,
    pub text: String,
    pub meta: ChunkMeta,
}

/// A chunk fetched by id.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: u64,
    pub text: String,
    pub meta: ChunkMeta,
}

pub struct Retriever {
    pack: PackReader,
    index: AnnReader,
    cache: BlockCache,
    backend: Arc<dyn EmbeddingBackend>,
}

impl Retriever {
    /// Open a pack/index pair and bind the embedding backend.
    ///
    /// The backend must produce the dimension the index was built with.
    pub fn open(
        pack_path: &Path,
        ann_path: &Path,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Result<Retriever> {
        let pack = PackReader::open(pack_path)?;
        let index = AnnReader::open(ann_path)?;
        if index.vector_count() as u64 != pack.chunk_count() {
            return Err(MempackError::AnnCorrupt(format!(
                "index holds {} vectors for {} chunks",
                index.vector_count(),
                pack.chunk_count()
            )));
        }
        if backend.dim() != index.dim() {
            return Err(MempackError::DimensionMismatch {
                expected: index.dim(),
                found: backend.dim(),
            });
        }
        let cache = BlockCache::new(pack.info().config.block_cache_size);
        Ok(Retriever { pack, index, cache, backend })
    }

    pub fn pack(&self) -> &PackReader {
        &self.pack
    }

    pub fn index(&self) -> &AnnReader {
        &self.index
    }

    /// Resident decompressed blocks (diagnostics).
    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Top-k semantic search.
    pub fn search(&self, query: &str, top_k: usize, opts: &SearchOptions) -> Result<Vec<Hit>> {
        check_deadline(opts.deadline)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let config = &self.pack.info().config;

        // 1. Embed and normalize the query.
        let mut rows = self
            .backend
            .encode(std::slice::from_ref(&query.to_owned()))
            .map_err(|e| match e {
                MempackError::EmbedBackendError(_) => e,
                other => MempackError::EmbedBackendError(other.to_string()),
            })?;
        let mut qvec = rows
            .pop()
            .ok_or_else(|| MempackError::EmbedBackendError("backend returned no rows".into()))?;
        normalize(&mut qvec);
        check_deadline(opts.deadline)?;

        // 2. ANN candidates.  Oversample 2× when a filter may reject some.
        let ef = opts
            .ef_search
            .unwrap_or(config.index_params.ef_search as usize);
        let filtering = opts.filter_meta.is_some() || !opts.filter_tags.is_empty();
        let want = if filtering { top_k * 2 } else { top_k };
        let candidates = self
            .index
            .search(&qvec, want.max(top_k), ef.max(want))?;
        check_deadline(opts.deadline)?;

        // Tag filters resolve to a chunk-id set through the tag index.
        let tag_allow: Option<HashSet<u64>> = match opts.filter_tags.split_first() {
            None => None,
            Some((first, rest)) => {
                let mut allow: HashSet<u64> =
                    self.pack.chunks_with_tag(first).into_iter().collect();
                for tag in rest {
                    let keep: HashSet<u64> =
                        self.pack.chunks_with_tag(tag).into_iter().collect();
                    allow.retain(|id| keep.contains(id));
                }
                Some(allow)
            }
        };

        // 3./4./5. Join ids and filter on tags + metadata before touching
        // blocks.
        let mut survivors: Vec<(u64, f32, ChunkMeta)> = Vec::with_capacity(candidates.len());
        for (vector_id, dist) in candidates {
            let chunk_id = self.index.chunk_id(vector_id);
            if let Some(allow) = &tag_allow {
                if !allow.contains(&chunk_id) {
                    continue;
                }
            }
            let meta = self.pack.chunk_meta(chunk_id)?;
            if let Some(filter) = &opts.filter_meta {
                if !meta.matches(filter) {
                    continue;
                }
            }
            survivors.push((chunk_id, dist, meta));
        }

        // 6. Batched prefetch of the blocks the leading survivors need.
        if config.prefetch {
            let lead = survivors.iter().take(top_k);
            let mut block_ids: Vec<u32> = lead
                .map(|(chunk_id, _, _)| {
                    self.pack.chunk_entry(*chunk_id).map(|e| e.block_id)
                })
                .collect::<Result<_>>()?;
            block_ids.sort_unstable();
            block_ids.dedup();
            self.prefetch(&block_ids, opts.deadline);
        }

        // 7. Pull hits off the queue until top_k survive or it runs dry.
        let mut hits = Vec::with_capacity(top_k.min(survivors.len()));
        for (chunk_id, dist, meta) in survivors {
            if hits.len() == top_k {
                break;
            }
            check_deadline(opts.deadline)?;
            match self.chunk_text(chunk_id) {
                Ok(text) => hits.push(Hit {
                    chunk_id,
                    score: 1.0 - dist,
                    text,
                    meta,
                }),
                Err(MempackError::ChunkUnavailable(id)) => {
                    log::warn!("search skipping unavailable chunk {id}");
                    continue;
                }
                Err(MempackError::Timeout) => return Err(MempackError::Timeout),
                Err(other) => return Err(other),
            }
        }
        Ok(hits)
    }

    /// Fetch one chunk through the cache.
    pub fn get_chunk(&self, chunk_id: u64, deadline: Option<Instant>) -> Result<Chunk> {
        check_deadline(deadline)?;
        let meta = self.pack.chunk_meta(chunk_id)?;
        let text = self.chunk_text(chunk_id)?;
        Ok(Chunk { chunk_id, text, meta })
    }

    /// Chunk ids carrying `tag` (empty without a tag index).
    pub fn chunks_with_tag(&self, tag: &str) -> Vec<u64> {
        self.pack.chunks_with_tag(tag)
    }

    /// Verify the pack (and the bound index) block by block.
    pub fn verify(&self, deadline: Option<Instant>) -> Result<VerifyReport> {
        verify_pack(&self.pack, Some(&self.index), deadline)
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn chunk_text(&self, chunk_id: u64) -> Result<String> {
        let entry = self.pack.chunk_entry(chunk_id)?;
        let block = self
            .cache
            .get_or_load(entry.block_id, || self.pack.load_block(entry.block_id))
            .map_err(|e| match e {
                MempackError::BlockCorrupt(_) => MempackError::ChunkUnavailable(chunk_id),
                other => other,
            })?;
        chunk_slice(&block, entry, chunk_id)
    }

    /// Warm the cache for a batch of blocks.  Adjacent ids are walked as
    /// runs and each run is loaded in `io_batch_size` slices; failures are
    /// left for the demand path to report.
    fn prefetch(&self, sorted_ids: &[u32], deadline: Option<Instant>) {
        let batch = self.pack.info().config.io_batch_size.max(1);
        let mut fetched = 0usize;
        for run in adjacent_runs(sorted_ids) {
            for block_id in run.iter().copied() {
                if fetched >= batch || check_deadline(deadline).is_err() {
                    return;
                }
                fetched += 1;
                if let Err(e) = self
                    .cache
                    .get_or_load(block_id, || self.pack.load_block(block_id))
                {
                    log::debug!("prefetch of block {block_id} failed: {e}");
                }
            }
        }
    }
}

/// Split a sorted id list into maximal runs of adjacent ids.
fn adjacent_runs(sorted_ids: &[u32]) -> Vec<&[u32]> {
    let mut runs = Vec::new();
    let mut start = 0usize;
    for i in 1..=sorted_ids.len() {
        let broken = i == sorted_ids.len() || sorted_ids[i] != sorted_ids[i - 1] + 1;
        if broken {
            runs.push(&sorted_ids[start..i]);
            start = i;
        }
    }
    runs.retain(|r| !r.is_empty());
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_group_adjacent_ids() {
        let ids = [1u32, 2, 3, 7, 9, 10];
        let runs = adjacent_runs(&ids);
        assert_eq!(runs, vec![&[1, 2, 3][..], &[7][..], &[9, 10][..]]);
        assert!(adjacent_runs(&[]).is_empty());
    }
}
