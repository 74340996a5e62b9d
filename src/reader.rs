//! Pack reader — validated, immutable, shareable view of a `.mpack` file.
//!
//! # Open sequence
//!
//! 1. Read and validate the header (magic, version).
//! 2. Read the footer's duplicate section table and require byte-equality
//!    with the header's copy — any difference is `HeaderCorrupt`.
//! 3. Recompute the integrity hash (header + metadata sections) and compare
//!    with the footer's stored value — mismatch is `FooterCorrupt`.
//! 4. Decode `CNFG`, `TOCC`, `TOCB`, `CSUM`, and the optional `ECCG` /
//!    `TAGI` sections into memory.
//!
//! Block payloads are *not* touched at open; they are fetched on demand,
//! checksum-verified before decompression, and repaired through the parity
//! group when the pack carries ECC.  A block that fails verification and
//! repair is poisoned: every later read of it (and of any chunk inside it)
//! fails fast without re-reading the disk.
//!
//! The reader is re-entrant: all tables are immutable after open, the
//! memory map is read-only, and the poison set is the only interior
//! mutability.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::Mmap;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::PackInfo;
use crate::ecc::{self, EccTable};
use crate::error::{MempackError, Result};
use crate::format::{
    integrity_hash, PackHeader, SectionEntry, FLAG_ECC, FLAG_TAG_INDEX, TAG_BLOCKS,
    TAG_CHECKSUMS, TAG_CONFIG, TAG_ECC, TAG_FOOTER, TAG_TAG_INDEX, TAG_TOC_BLOCKS,
    TAG_TOC_CHUNKS,
};
use crate::meta::ChunkMeta;
use crate::toc::{BlockEntry, BlockToc, ChunkEntry, ChunkToc, TagIndex};

enum Backing {
    /// Zero-copy reads out of a read-only map.
    Mmap(Mmap),
    /// Positioned reads through a shared handle (`mmap = false`).
    File(Mutex<File>),
}

pub struct PackReader {
    path: PathBuf,
    backing: Backing,
    header: PackHeader,
    info: PackInfo,
    chunk_toc: ChunkToc,
    block_toc: BlockToc,
    checksums: Vec<u64>,
    ecc: Option<EccTable>,
    tag_index: Option<TagIndex>,
    poisoned: Mutex<HashSet<u32>>,
}

impl PackReader {
    /// Open a pack honoring the `mmap` choice stored in its config.
    pub fn open(path: &Path) -> Result<PackReader> {
        // The stored config is not known until the CNFG section is parsed,
        // so open through the map first and downgrade afterwards if asked.
        let reader = Self::open_with(path, true)?;
        if reader.info.config.mmap {
            Ok(reader)
        } else {
            Self::open_with(path, false)
        }
    }

    /// Open with an explicit backing choice.
    pub fn open_with(path: &Path, use_mmap: bool) -> Result<PackReader> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < PackHeader::encoded_len(0) as u64 + 8 {
            return Err(MempackError::HeaderCorrupt("file too short".into()));
        }

        // Validation walks the whole file once either way; in positioned
        // mode the bytes are read into a scratch buffer and dropped.
        let (backing, scratch);
        let data: &[u8] = if use_mmap {
            backing = Backing::Mmap(unsafe { Mmap::map(&file)? });
            scratch = Vec::new();
            match &backing {
                Backing::Mmap(m) => &m[..],
                Backing::File(_) => &scratch,
            }
        } else {
            let mut buf = Vec::with_capacity(file_len as usize);
            let mut f = file;
            f.read_to_end(&mut buf)?;
            f.seek(SeekFrom::Start(0))?;
            backing = Backing::File(Mutex::new(f));
            scratch = buf;
            &scratch
        };

        let header = PackHeader::read(&mut &data[..])?;
        for e in &header.table.entries {
            if e.end() > file_len {
                return Err(MempackError::HeaderCorrupt(format!(
                    "section {} overruns the file",
                    String::from_utf8_lossy(&e.tag)
                )));
            }
        }

        // Footer cross-check.
        let foot = header.table.require(TAG_FOOTER)?;
        let foot_bytes = section_slice(data, foot)?;
        if foot_bytes.len() < 8 {
            return Err(MempackError::HeaderCorrupt("footer too short".into()));
        }
        let (table_bytes, digest_bytes) = foot_bytes.split_at(foot_bytes.len() - 8);
        let footer_table = crate::format::SectionTable::read(&mut &table_bytes[..])?;
        if footer_table != header.table {
            return Err(MempackError::HeaderCorrupt(
                "footer section table differs from header".into(),
            ));
        }
        let stored_digest = u64::from_le_bytes(digest_bytes.try_into().unwrap());

        // Section decode.
        let info: PackInfo =
            serde_json::from_slice(section_slice(data, header.table.require(TAG_CONFIG)?)?)
                .map_err(|e| MempackError::HeaderCorrupt(format!("CNFG: {e}")))?;
        let chunk_toc =
            ChunkToc::read(section_slice(data, header.table.require(TAG_TOC_CHUNKS)?)?)?;
        let block_toc =
            BlockToc::read(section_slice(data, header.table.require(TAG_TOC_BLOCKS)?)?)?;
        let csum_bytes = section_slice(data, header.table.require(TAG_CHECKSUMS)?)?;
        if csum_bytes.len() != block_toc.entries.len() * 8 {
            return Err(MempackError::HeaderCorrupt(
                "CSUM length disagrees with TOCB".into(),
            ));
        }
        let checksums: Vec<u64> = csum_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let ecc = if header.flags & FLAG_ECC != 0 {
            let e = header.table.require(TAG_ECC)?;
            Some(EccTable::read(section_slice(data, e)?)?)
        } else {
            None
        };
        let tag_index = if header.flags & FLAG_TAG_INDEX != 0 {
            let e = header.table.require(TAG_TAG_INDEX)?;
            Some(TagIndex::read(section_slice(data, e)?)?)
        } else {
            None
        };

        // Cross-table consistency.
        if info.chunk_count != chunk_toc.entries.len() as u64
            || info.block_count != block_toc.entries.len() as u32
        {
            return Err(MempackError::HeaderCorrupt(
                "CNFG counts disagree with the TOC".into(),
            ));
        }

        // Integrity hash last: it needs the parity layout from ECCG.
        let blks = header.table.require(TAG_BLOCKS)?;
        let parity_range = ecc.as_ref().and_then(|t| {
            let ecc_entry = header.table.get(TAG_ECC)?;
            let start = t.groups.first()?.parity_offset;
            Some(start..ecc_entry.end())
        });
        let digest = integrity_hash(data, blks.offset..blks.end(), parity_range);
        if digest != stored_digest {
            return Err(MempackError::FooterCorrupt);
        }

        Ok(PackReader {
            path: path.to_owned(),
            backing,
            header,
            info,
            chunk_toc,
            block_toc,
            checksums,
            ecc,
            tag_index,
            poisoned: Mutex::new(HashSet::new()),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &PackHeader {
        &self.header
    }

    pub fn info(&self) -> &PackInfo {
        &self.info
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_toc.entries.len() as u64
    }

    pub fn block_count(&self) -> u32 {
        self.block_toc.entries.len() as u32
    }

    pub fn checksums(&self) -> &[u64] {
        &self.checksums
    }

    pub fn ecc(&self) -> Option<&EccTable> {
        self.ecc.as_ref()
    }

    pub fn tag_index(&self) -> Option<&TagIndex> {
        self.tag_index.as_ref()
    }

    /// Chunk ids carrying `tag`; empty when no tag index is present.
    pub fn chunks_with_tag(&self, tag: &str) -> Vec<u64> {
        self.tag_index
            .as_ref()
            .and_then(|t| t.entries.get(tag).cloned())
            .unwrap_or_default()
    }

    pub fn chunk_entry(&self, chunk_id: u64) -> Result<ChunkEntry> {
        self.chunk_toc
            .entries
            .get(chunk_id as usize)
            .copied()
            .ok_or(MempackError::ChunkUnavailable(chunk_id))
    }

    pub fn chunk_meta(&self, chunk_id: u64) -> Result<ChunkMeta> {
        self.chunk_toc.meta(chunk_id)
    }

    pub fn block_entry(&self, block_id: u32) -> Result<BlockEntry> {
        self.block_toc
            .entries
            .get(block_id as usize)
            .copied()
            .ok_or(MempackError::BlockCorrupt(block_id))
    }

    pub fn is_poisoned(&self, block_id: u32) -> bool {
        self.poisoned.lock().unwrap().contains(&block_id)
    }

    // ── Block fetch path ─────────────────────────────────────────────────

    /// Raw compressed payload of one block, unverified.
    pub fn compressed_block(&self, block_id: u32) -> Result<Vec<u8>> {
        let entry = self.block_entry(block_id)?;
        self.read_range(entry.file_offset, entry.compressed_size as usize)
    }

    /// Verified, decompressed payload of one block.
    ///
    /// Checksum failures trigger in-memory Reed–Solomon repair when the
    /// pack carries parity; a block that cannot be repaired is poisoned and
    /// surfaces as [`MempackError::BlockCorrupt`].
    pub fn load_block(&self, block_id: u32) -> Result<Vec<u8>> {
        if self.is_poisoned(block_id) {
            return Err(MempackError::BlockCorrupt(block_id));
        }
        let entry = self.block_entry(block_id)?;
        let expected = self.checksums[block_id as usize];

        let mut payload = self.compressed_block(block_id)?;
        if xxh3_64(&payload) != expected {
            match self.repair_compressed(block_id) {
                Ok(fixed) => {
                    log::warn!(
                        "block {block_id} failed its checksum; recovered via parity"
                    );
                    payload = fixed;
                }
                Err(e) => {
                    log::error!("block {block_id} is corrupt and unrecoverable: {e}");
                    self.poisoned.lock().unwrap().insert(block_id);
                    return Err(MempackError::BlockCorrupt(block_id));
                }
            }
        }

        self.info
            .config
            .compressor
            .decompress(&payload, entry.uncompressed_size as usize)
            .map_err(|e| {
                // Checksum-valid bytes that fail to decode are corruption.
                log::error!("block {block_id} failed to decompress: {e}");
                MempackError::BlockCorrupt(block_id)
            })
    }

    /// Attempt Reed–Solomon reconstruction of one block's compressed
    /// payload from its parity group.  Verifies the repaired bytes against
    /// the checksum table before returning them.
    pub fn repair_compressed(&self, block_id: u32) -> Result<Vec<u8>> {
        let ecc = self
            .ecc
            .as_ref()
            .ok_or(MempackError::BlockCorrupt(block_id))?;
        let entry = self.block_entry(block_id)?;
        let group = ecc
            .groups
            .get(entry.ecc_group_id as usize)
            .filter(|g| g.members.contains(&block_id))
            .ok_or(MempackError::BlockCorrupt(block_id))?;

        let padded = group.padded_size as usize;
        let mut shards: Vec<Option<Vec<u8>>> =
            Vec::with_capacity(group.members.len() + ecc.m as usize);

        for member in &group.members {
            let m_entry = self.block_entry(*member)?;
            let bytes = self.read_range(m_entry.file_offset, m_entry.compressed_size as usize)?;
            if xxh3_64(&bytes) == self.checksums[*member as usize] {
                let mut s = bytes;
                s.resize(padded, 0);
                shards.push(Some(s));
            } else {
                shards.push(None);
            }
        }
        for p in 0..ecc.m as usize {
            let at = group.parity_offset + (p * padded) as u64;
            let bytes = self.read_range(at, padded)?;
            if xxh3_64(&bytes) == group.parity_checksums[p] {
                shards.push(Some(bytes));
            } else {
                shards.push(None);
            }
        }

        ecc::reconstruct_group(group, ecc.m, &mut shards)?;

        let pos = group
            .members
            .iter()
            .position(|id| *id == block_id)
            .ok_or(MempackError::BlockCorrupt(block_id))?;
        let mut fixed = shards[pos]
            .take()
            .ok_or(MempackError::EccUnrecoverable(group.group_id))?;
        fixed.truncate(entry.compressed_size as usize);
        if xxh3_64(&fixed) != self.checksums[block_id as usize] {
            return Err(MempackError::EccUnrecoverable(group.group_id));
        }
        Ok(fixed)
    }

    /// Uncached convenience accessor: the text of one chunk.
    pub fn chunk_text(&self, chunk_id: u64) -> Result<String> {
        let entry = self.chunk_entry(chunk_id)?;
        let block = self.load_block(entry.block_id).map_err(|e| match e {
            MempackError::BlockCorrupt(_) => MempackError::ChunkUnavailable(chunk_id),
            other => other,
        })?;
        chunk_slice(&block, entry, chunk_id)
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match &self.backing {
            Backing::Mmap(map) => map
                .get(offset as usize..offset as usize + len)
                .map(|s| s.to_vec())
                .ok_or_else(|| {
                    MempackError::HeaderCorrupt(format!(
                        "read of {len} B at {offset} outside the file"
                    ))
                }),
            Backing::File(file) => {
                let mut f = file.lock().unwrap();
                f.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len];
                f.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

/// Slice one chunk's bytes out of its block's decompressed payload.
pub(crate) fn chunk_slice(block: &[u8], entry: ChunkEntry, chunk_id: u64) -> Result<String> {
    let start = entry.offset_in_block as usize;
    let end = start + entry.length as usize;
    let bytes = block
        .get(start..end)
        .ok_or(MempackError::ChunkUnavailable(chunk_id))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| MempackError::ChunkUnavailable(chunk_id))
}

fn section_slice(data: &[u8], entry: SectionEntry) -> Result<&[u8]> {
    data.get(entry.offset as usize..entry.end() as usize)
        .ok_or_else(|| {
            MempackError::HeaderCorrupt(format!(
                "section {} outside the file",
                String::from_utf8_lossy(&entry.tag)
            ))
        })
}
