//! Build pipeline: documents → chunks → embeddings → pack + index.
//!
//! Staging follows the concurrency model of the format: chunking is
//! single-threaded (its determinism anchors chunk ids), embedding fans out
//! over `embed_batch_size`-sized batches (in parallel with the `parallel`
//! feature, reassembled in chunk-id order either way), and block assembly,
//! pack writing, and graph construction are single-threaded and
//! sequential.  Two builds of the same inputs with the same config produce
//! byte-identical `.mpack` and `.ann` files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::ann::{self, HnswParams};
use crate::block;
use crate::chunker::split_text;
use crate::config::{PackConfig, PackInfo};
use crate::embed::{normalize, EmbeddingBackend, Matrix};
use crate::error::{MempackError, Result};
use crate::meta::{ChunkMeta, MetaValue};
use crate::toc::{ChunkEntry, ChunkToc, TagIndex};
use crate::writer::write_pack;

/// One input document.  `source` lands in every derived chunk's metadata
/// under the `"source"` key.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub source: String,
    pub text: String,
    pub meta: BTreeMap<String, MetaValue>,
    pub tags: BTreeSet<String>,
}

impl Document {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Document {
        Document {
            source: source.into(),
            text: text.into(),
            ..Document::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub documents: usize,
    pub chunks: u64,
    pub blocks: u32,
    pub text_bytes: u64,
    pub packed_bytes: u64,
}

impl BuildStats {
    /// Packed share of the input text: `packed_bytes / text_bytes`.
    pub fn ratio(&self) -> f64 {
        self.packed_bytes as f64 / self.text_bytes.max(1) as f64
    }
}

/// Build `pack_path` (`.mpack`) and `ann_path` (`.ann`) from `docs`.
pub fn build(
    docs: &[Document],
    backend: &dyn EmbeddingBackend,
    config: &PackConfig,
    pack_path: &Path,
    ann_path: &Path,
) -> Result<BuildStats> {
    config.validate()?;

    // ── Stage 1: chunking (single-threaded, deterministic) ───────────────
    let mut texts: Vec<String> = Vec::new();
    let mut chunk_toc = ChunkToc::default();
    let mut tag_index = TagIndex::default();

    for doc in docs {
        for text in split_text(&doc.text, config.chunk_size, config.chunk_overlap) {
            let chunk_id = texts.len() as u64;

            let mut meta = ChunkMeta {
                fields: doc.meta.clone(),
                tags: doc.tags.clone(),
            };
            meta.fields
                .insert("source".into(), MetaValue::Str(doc.source.clone()));

            let meta_offset = chunk_toc.meta_blob.len() as u64;
            meta.encode(&mut chunk_toc.meta_blob)?;
            // block_id / offset are patched after assembly below.
            chunk_toc.entries.push(ChunkEntry {
                block_id: 0,
                offset_in_block: 0,
                length: text.len() as u32,
                meta_offset,
            });
            for tag in &meta.tags {
                tag_index.entries.entry(tag.clone()).or_default().push(chunk_id);
            }
            texts.push(text);
        }
    }

    // ── Stage 2: embedding (batched; order preserved on reassembly) ──────
    let rows = embed_all(texts.as_slice(), backend, config.embed_batch_size)?;
    let mut matrix = Matrix::with_dim(backend.dim() as usize);
    for mut row in rows {
        if row.len() != backend.dim() as usize {
            return Err(MempackError::DimensionMismatch {
                expected: backend.dim(),
                found: row.len() as u32,
            });
        }
        normalize(&mut row);
        matrix.push_row(&row);
    }

    // ── Stage 3: block assembly + pack write (single-threaded) ───────────
    let blocks = block::assemble(
        &texts,
        config.block_size,
        config.compressor,
        config.compression_level,
    )?;
    for b in &blocks {
        for span in &b.spans {
            let entry = &mut chunk_toc.entries[span.chunk_id as usize];
            entry.block_id = b.block_id;
            entry.offset_in_block = span.offset_in_block;
        }
    }

    let info = PackInfo {
        config: config.clone(),
        chunk_count: texts.len() as u64,
        block_count: blocks.len() as u32,
        embedding_dim: backend.dim(),
        embedding_backend: backend.name().to_owned(),
    };
    write_pack(pack_path, &info, &chunk_toc, &blocks, &tag_index)?;

    // ── Stage 4: ANN build + write ───────────────────────────────────────
    let graph = ann::build(
        &matrix,
        HnswParams {
            m: config.index_params.m,
            ef_construction: config.index_params.ef_construction,
            seed: config.index_params.seed,
        },
    );
    // vector_id == chunk_id for a full build; the id map is omitted.
    ann::write_index(ann_path, &graph, &matrix, None)?;

    let stats = BuildStats {
        documents: docs.len(),
        chunks: texts.len() as u64,
        blocks: blocks.len() as u32,
        text_bytes: texts.iter().map(|t| t.len() as u64).sum(),
        packed_bytes: blocks.iter().map(|b| b.compressed.len() as u64).sum(),
    };
    log::info!(
        "built {}: {} doc(s) → {} chunk(s) in {} block(s), {} B text → {} B packed ({:.1}%)",
        pack_path.display(),
        stats.documents,
        stats.chunks,
        stats.blocks,
        stats.text_bytes,
        stats.packed_bytes,
        stats.ratio() * 100.0,
    );
    Ok(stats)
}

/// Encode all texts in `batch_size` batches, preserving chunk-id order.
fn embed_all(
    texts: &[String],
    backend: &dyn EmbeddingBackend,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        let batches: Vec<Result<Vec<Vec<f32>>>> = texts
            .par_chunks(batch_size)
            .map(|batch| backend.encode(batch))
            .collect();
        let mut rows = Vec::with_capacity(texts.len());
        for batch in batches {
            rows.extend(batch?);
        }
        Ok(rows)
    }

    #[cfg(not(feature = "parallel"))]
    {
        let mut rows = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            rows.extend(backend.encode(batch)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;
    use tempfile::tempdir;

    #[test]
    fn empty_corpus_builds_an_empty_pack() {
        let dir = tempdir().unwrap();
        let pack = dir.path().join("e.mpack");
        let ann = dir.path().join("e.ann");
        let backend = HashingEmbedder::new(32);
        let stats = build(&[], &backend, &PackConfig::default(), &pack, &ann).unwrap();
        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.blocks, 0);

        let reader = crate::reader::PackReader::open(&pack).unwrap();
        assert_eq!(reader.chunk_count(), 0);
        let index = crate::ann::AnnReader::open(&ann).unwrap();
        assert_eq!(index.vector_count(), 0);
    }

    #[test]
    fn invalid_config_is_rejected_before_any_io() {
        let dir = tempdir().unwrap();
        let pack = dir.path().join("x.mpack");
        let ann = dir.path().join("x.ann");
        let backend = HashingEmbedder::new(32);
        let bad = PackConfig { chunk_size: 0, ..PackConfig::default() };
        assert!(matches!(
            build(&[], &backend, &bad, &pack, &ann),
            Err(MempackError::InvalidConfig(_))
        ));
        assert!(!pack.exists());
    }
}
