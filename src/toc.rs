//! Table-of-contents sections: `TOCC` (chunks) and `TOCB` (blocks).
//!
//! # On-disk layout (little-endian)
//!
//! ```text
//! TOCC := count:u64  chunk_entry[count]  meta_blob
//! chunk_entry (20 B) := block_id:u32  offset_in_block:u32  length:u32
//!                       meta_offset:u64
//!
//! TOCB := count:u64  block_entry[count]
//! block_entry (28 B) := file_offset:u64  compressed_size:u32
//!                       uncompressed_size:u32  checksum:u64
//!                       ecc_group_id:u32
//! ```
//!
//! Ids are dense and implicit: entry `i` describes chunk/block `i`.
//! `meta_offset` is relative to the start of the meta blob that follows the
//! fixed-width chunk entries; each record there is self-delimiting TLV (see
//! `meta`).  `file_offset` is absolute.  `ecc_group_id` of `0xFFFF_FFFF`
//! means the block belongs to no parity group.

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{MempackError, Result};
use crate::meta::ChunkMeta;

pub const CHUNK_ENTRY_SIZE: usize = 20;
pub const BLOCK_ENTRY_SIZE: usize = 28;

/// `ecc_group_id` sentinel: block is not covered by parity.
pub const NO_ECC_GROUP: u32 = 0xFFFF_FFFF;

/// Locates one chunk inside its block and its metadata inside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub block_id: u32,
    pub offset_in_block: u32,
    pub length: u32,
    pub meta_offset: u64,
}

/// Locates one compressed block inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub file_offset: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub checksum: u64,
    pub ecc_group_id: u32,
}

/// In-memory image of the `TOCC` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkToc {
    pub entries: Vec<ChunkEntry>,
    pub meta_blob: Vec<u8>,
}

impl ChunkToc {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        for e in &self.entries {
            w.write_u32::<LittleEndian>(e.block_id)?;
            w.write_u32::<LittleEndian>(e.offset_in_block)?;
            w.write_u32::<LittleEndian>(e.length)?;
            w.write_u64::<LittleEndian>(e.meta_offset)?;
        }
        w.write_all(&self.meta_blob)?;
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.entries.len() * CHUNK_ENTRY_SIZE + self.meta_blob.len()
    }

    pub fn read(mut bytes: &[u8]) -> Result<ChunkToc> {
        let r = &mut bytes;
        let count = r.read_u64::<LittleEndian>()? as usize;
        if r.len() < count * CHUNK_ENTRY_SIZE {
            return Err(MempackError::HeaderCorrupt(format!(
                "TOCC declares {count} chunks but section is too short"
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(ChunkEntry {
                block_id: r.read_u32::<LittleEndian>()?,
                offset_in_block: r.read_u32::<LittleEndian>()?,
                length: r.read_u32::<LittleEndian>()?,
                meta_offset: r.read_u64::<LittleEndian>()?,
            });
        }
        Ok(ChunkToc {
            entries,
            meta_blob: r.to_vec(),
        })
    }

    /// Decode the metadata record of chunk `chunk_id`.
    pub fn meta(&self, chunk_id: u64) -> Result<ChunkMeta> {
        let entry = self
            .entries
            .get(chunk_id as usize)
            .ok_or(MempackError::ChunkUnavailable(chunk_id))?;
        ChunkMeta::decode(&self.meta_blob, entry.meta_offset)
    }
}

/// In-memory image of the `TOCB` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockToc {
    pub entries: Vec<BlockEntry>,
}

impl BlockToc {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        for e in &self.entries {
            w.write_u64::<LittleEndian>(e.file_offset)?;
            w.write_u32::<LittleEndian>(e.compressed_size)?;
            w.write_u32::<LittleEndian>(e.uncompressed_size)?;
            w.write_u64::<LittleEndian>(e.checksum)?;
            w.write_u32::<LittleEndian>(e.ecc_group_id)?;
        }
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.entries.len() * BLOCK_ENTRY_SIZE
    }

    pub fn read(mut bytes: &[u8]) -> Result<BlockToc> {
        let r = &mut bytes;
        let count = r.read_u64::<LittleEndian>()? as usize;
        if r.len() < count * BLOCK_ENTRY_SIZE {
            return Err(MempackError::HeaderCorrupt(format!(
                "TOCB declares {count} blocks but section is too short"
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(BlockEntry {
                file_offset: r.read_u64::<LittleEndian>()?,
                compressed_size: r.read_u32::<LittleEndian>()?,
                uncompressed_size: r.read_u32::<LittleEndian>()?,
                checksum: r.read_u64::<LittleEndian>()?,
                ecc_group_id: r.read_u32::<LittleEndian>()?,
            });
        }
        Ok(BlockToc { entries })
    }
}

/// In-memory image of the optional `TAGI` section.
///
/// ```text
/// TAGI := tag_count:u32  (string  count:u32  chunk_id:u64[count])*
/// ```
/// Tags are sorted lexicographically and ids ascending, so the section is
/// deterministic for a given build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagIndex {
    pub entries: std::collections::BTreeMap<String, Vec<u64>>,
}

impl TagIndex {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(|(tag, ids)| 2 + tag.len() + 4 + 8 * ids.len())
            .sum::<usize>()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for (tag, ids) in &self.entries {
            w.write_u16::<LittleEndian>(tag.len() as u16)?;
            w.write_all(tag.as_bytes())?;
            w.write_u32::<LittleEndian>(ids.len() as u32)?;
            for id in ids {
                w.write_u64::<LittleEndian>(*id)?;
            }
        }
        Ok(())
    }

    pub fn read(mut bytes: &[u8]) -> Result<TagIndex> {
        let r = &mut bytes;
        let tag_count = r.read_u32::<LittleEndian>()?;
        let mut entries = std::collections::BTreeMap::new();
        for _ in 0..tag_count {
            let len = r.read_u16::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            std::io::Read::read_exact(r, &mut buf)?;
            let tag = String::from_utf8(buf)
                .map_err(|_| MempackError::HeaderCorrupt("non-UTF-8 tag in TAGI".into()))?;
            let count = r.read_u32::<LittleEndian>()? as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(r.read_u64::<LittleEndian>()?);
            }
            entries.insert(tag, ids);
        }
        Ok(TagIndex { entries })
    }
}
