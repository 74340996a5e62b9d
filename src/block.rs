//! Block assembler — groups chunks into compressed, checksummed blocks.
//!
//! Blocks are the unit of I/O and integrity.  Chunks are packed greedily in
//! chunk-id order against a target uncompressed size; a chunk that would
//! overflow the target starts a new block, and a chunk that alone exceeds
//! the target occupies its own block.  A chunk's bytes never span blocks.
//!
//! The checksum is XXH3-64 of the **compressed** payload: the read path can
//! verify a block before spending any work on decompression.

use xxhash_rust::xxh3::xxh3_64;

use crate::codec::Compressor;
use crate::error::Result;

/// Byte range of one chunk inside an assembled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_id: u64,
    pub offset_in_block: u32,
    pub length: u32,
}

/// One finished block: compressed payload plus the spans it carries.
#[derive(Debug, Clone)]
pub struct AssembledBlock {
    pub block_id: u32,
    pub compressed: Vec<u8>,
    pub uncompressed_size: u32,
    /// XXH3-64 of `compressed`.
    pub checksum: u64,
    pub spans: Vec<ChunkSpan>,
}

/// Pack `texts` (indexed by chunk id) into blocks of roughly `target_size`
/// uncompressed bytes each.
pub fn assemble(
    texts: &[String],
    target_size: usize,
    codec: Compressor,
    level: i32,
) -> Result<Vec<AssembledBlock>> {
    let mut blocks: Vec<AssembledBlock> = Vec::new();
    let mut buffer: Vec<u8> = Vec::with_capacity(target_size);
    let mut spans: Vec<ChunkSpan> = Vec::new();

    for (chunk_id, text) in texts.iter().enumerate() {
        let bytes = text.as_bytes();
        if !buffer.is_empty() && buffer.len() + bytes.len() > target_size {
            flush(&mut blocks, &mut buffer, &mut spans, codec, level)?;
        }
        spans.push(ChunkSpan {
            chunk_id: chunk_id as u64,
            offset_in_block: buffer.len() as u32,
            length: bytes.len() as u32,
        });
        buffer.extend_from_slice(bytes);
        if buffer.len() >= target_size {
            flush(&mut blocks, &mut buffer, &mut spans, codec, level)?;
        }
    }
    if !spans.is_empty() {
        flush(&mut blocks, &mut buffer, &mut spans, codec, level)?;
    }
    Ok(blocks)
}

fn flush(
    blocks: &mut Vec<AssembledBlock>,
    buffer: &mut Vec<u8>,
    spans: &mut Vec<ChunkSpan>,
    codec: Compressor,
    level: i32,
) -> Result<()> {
    let compressed = codec.compress(buffer, level)?;
    let checksum = xxh3_64(&compressed);
    blocks.push(AssembledBlock {
        block_id: blocks.len() as u32,
        uncompressed_size: buffer.len() as u32,
        compressed,
        checksum,
        spans: std::mem::take(spans),
    });
    buffer.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(sizes: &[usize]) -> Vec<String> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let c = (b'a' + (i % 26) as u8) as char;
                c.to_string().repeat(*n)
            })
            .collect()
    }

    #[test]
    fn chunks_never_span_blocks() {
        let input = texts(&[40, 40, 40, 40, 40]);
        let blocks = assemble(&input, 100, Compressor::None, 0).unwrap();
        for b in &blocks {
            for s in &b.spans {
                let end = (s.offset_in_block + s.length) as usize;
                assert!(end <= b.uncompressed_size as usize);
                let slice = &b.compressed[s.offset_in_block as usize..end];
                assert_eq!(slice, input[s.chunk_id as usize].as_bytes());
            }
        }
    }

    #[test]
    fn overflowing_chunk_starts_a_new_block() {
        let input = texts(&[60, 60]);
        let blocks = assemble(&input, 100, Compressor::None, 0).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].spans.len(), 1);
        assert_eq!(blocks[1].spans[0].chunk_id, 1);
    }

    #[test]
    fn oversized_chunk_gets_its_own_block() {
        let input = texts(&[10, 500, 10]);
        let blocks = assemble(&input, 100, Compressor::None, 0).unwrap();
        let holder = blocks
            .iter()
            .find(|b| b.spans.iter().any(|s| s.chunk_id == 1))
            .unwrap();
        assert_eq!(holder.spans.len(), 1);
        assert_eq!(holder.uncompressed_size, 500);
    }

    #[test]
    fn checksums_cover_compressed_payload() {
        let input = texts(&[300, 300]);
        let blocks = assemble(&input, 256, Compressor::Zstd, 3).unwrap();
        for b in &blocks {
            assert_eq!(b.checksum, xxh3_64(&b.compressed));
        }
    }

    #[test]
    fn block_ids_are_dense() {
        let input = texts(&[80; 10]);
        let blocks = assemble(&input, 128, Compressor::None, 0).unwrap();
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.block_id, i as u32);
        }
    }
}
