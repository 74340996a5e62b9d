//! Full-pack integrity walk with repair attempts.
//!
//! Every block's compressed payload is re-hashed against the `CSUM` table.
//! A mismatching block is counted as corrupted, then run through its parity
//! group; success counts it as recovered, failure as unrecoverable.  The
//! walk itself never fails because of damaged data — only genuine I/O
//! errors (or an expired deadline) propagate.

use std::time::Instant;

use xxhash_rust::xxh3::xxh3_64;

use crate::ann::AnnReader;
use crate::error::{check_deadline, Result};
use crate::reader::PackReader;

/// Verdict for a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Checksum held.
    Ok,
    /// Checksum failed; parity reconstruction succeeded.
    Recovered,
    /// Checksum failed and the group could not reconstruct it.
    Unrecoverable,
}

/// ANN-side consistency result, present when an index was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnCheck {
    pub vector_count: u32,
    pub chunk_count: u64,
    /// Vector count equals the chunk count (or the id-map length).
    pub consistent: bool,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// Per-block verdicts, indexed by `block_id`.
    pub blocks: Vec<BlockStatus>,
    pub ok: usize,
    /// Blocks whose stored payload failed its checksum (recovered or not).
    pub corrupted: usize,
    pub recovered: usize,
    pub unrecoverable: usize,
    pub ann: Option<AnnCheck>,
}

impl VerifyReport {
    /// True when nothing is wrong or everything wrong was repairable.
    pub fn is_healthy(&self) -> bool {
        self.unrecoverable == 0 && self.ann.map_or(true, |a| a.consistent)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} block(s): {} ok, {} corrupted, {} recovered, {} unrecoverable",
            self.blocks.len(),
            self.ok,
            self.corrupted,
            self.recovered,
            self.unrecoverable,
        )
    }
}

/// Walk every block of `pack`, optionally cross-checking `ann`.
pub fn verify_pack(
    pack: &PackReader,
    ann: Option<&AnnReader>,
    deadline: Option<Instant>,
) -> Result<VerifyReport> {
    let mut blocks = Vec::with_capacity(pack.block_count() as usize);
    let (mut ok, mut corrupted, mut recovered, mut unrecoverable) = (0, 0, 0, 0);

    for block_id in 0..pack.block_count() {
        check_deadline(deadline)?;
        let payload = pack.compressed_block(block_id)?;
        let status = if xxh3_64(&payload) == pack.checksums()[block_id as usize] {
            ok += 1;
            BlockStatus::Ok
        } else {
            corrupted += 1;
            match pack.repair_compressed(block_id) {
                Ok(_) => {
                    recovered += 1;
                    log::info!("verify: block {block_id} recovered via parity");
                    BlockStatus::Recovered
                }
                Err(e) => {
                    unrecoverable += 1;
                    log::warn!("verify: block {block_id} unrecoverable: {e}");
                    BlockStatus::Unrecoverable
                }
            }
        };
        blocks.push(status);
    }

    let ann = ann.map(|index| {
        let vector_count = index.vector_count();
        let chunk_count = pack.chunk_count();
        AnnCheck {
            vector_count,
            chunk_count,
            consistent: vector_count as u64 == chunk_count,
        }
    });

    Ok(VerifyReport {
        blocks,
        ok,
        corrupted,
        recovered,
        unrecoverable,
        ann,
    })
}
