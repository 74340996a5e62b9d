//! `.mpack` container framing — header, section table, footer.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! header  := magic[4]="MPCK"  version:u16  flags:u32
//!            section_count:u16  section_entry[section_count]
//! entry   := tag[4]  offset:u64  length:u64
//! footer  := section_count:u16  section_entry[section_count]  xxh3:u64
//! ```
//!
//! Sections appear in a fixed order: `CNFG`, `TOCC`, `TOCB`, `BLKS`,
//! `CSUM`, `ECCG` (when parity is enabled), `TAGI` (when any chunk carries
//! tags), `FOOT`.  The footer duplicates the header's table; a reader
//! cross-checks the two copies and treats any difference as header
//! corruption.
//!
//! # Integrity hash
//!
//! The footer's trailing `xxh3:u64` covers the header and every metadata
//! section.  Block payloads (`BLKS`) and the parity area at the tail of
//! `ECCG` are excluded: those bytes are covered by per-block and per-shard
//! checksums instead, so a damaged block degrades into a repairable event
//! rather than an unopenable file.  The final 8 bytes (the hash itself) are
//! never hashed.

use std::io::{Read, Write};
use std::ops::Range;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::Xxh3;

use crate::error::{MempackError, Result};

pub const PACK_MAGIC: &[u8; 4] = b"MPCK";
pub const PACK_VERSION: u16 = 1;

pub const TAG_CONFIG: [u8; 4] = *b"CNFG";
pub const TAG_TOC_CHUNKS: [u8; 4] = *b"TOCC";
pub const TAG_TOC_BLOCKS: [u8; 4] = *b"TOCB";
pub const TAG_BLOCKS: [u8; 4] = *b"BLKS";
pub const TAG_CHECKSUMS: [u8; 4] = *b"CSUM";
pub const TAG_ECC: [u8; 4] = *b"ECCG";
pub const TAG_TAG_INDEX: [u8; 4] = *b"TAGI";
pub const TAG_FOOTER: [u8; 4] = *b"FOOT";

/// Pack-level flag: an `ECCG` section with Reed–Solomon parity is present.
pub const FLAG_ECC: u32 = 0x0001;
/// Pack-level flag: a `TAGI` tag index section is present.
pub const FLAG_TAG_INDEX: u32 = 0x0002;

const SECTION_ENTRY_SIZE: usize = 4 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    pub tag: [u8; 4],
    pub offset: u64,
    pub length: u64,
}

impl SectionEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionTable {
    pub entries: Vec<SectionEntry>,
}

impl SectionTable {
    pub fn get(&self, tag: [u8; 4]) -> Option<SectionEntry> {
        self.entries.iter().copied().find(|e| e.tag == tag)
    }

    /// Required-section lookup; a missing tag means the table is damaged.
    pub fn require(&self, tag: [u8; 4]) -> Result<SectionEntry> {
        self.get(tag).ok_or_else(|| {
            MempackError::HeaderCorrupt(format!(
                "section {:?} missing from table",
                String::from_utf8_lossy(&tag)
            ))
        })
    }

    /// Serialized size of a table with `count` entries.
    pub fn encoded_len(count: usize) -> usize {
        2 + count * SECTION_ENTRY_SIZE
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u16::<LittleEndian>(self.entries.len() as u16)?;
        for e in &self.entries {
            w.write_all(&e.tag)?;
            w.write_u64::<LittleEndian>(e.offset)?;
            w.write_u64::<LittleEndian>(e.length)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<SectionTable> {
        let count = r.read_u16::<LittleEndian>()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut tag = [0u8; 4];
            r.read_exact(&mut tag)?;
            let offset = r.read_u64::<LittleEndian>()?;
            let length = r.read_u64::<LittleEndian>()?;
            entries.push(SectionEntry { tag, offset, length });
        }
        Ok(SectionTable { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u16,
    pub flags: u32,
    pub table: SectionTable,
}

impl PackHeader {
    /// Serialized size of a header whose table holds `count` entries.
    pub fn encoded_len(count: usize) -> usize {
        4 + 2 + 4 + SectionTable::encoded_len(count)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(PACK_MAGIC)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        self.table.write(w)?;
        Ok(())
    }

    /// Read and validate magic and version.
    pub fn read<R: Read>(r: &mut R) -> Result<PackHeader> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != PACK_MAGIC {
            return Err(MempackError::BadMagic { expected: ".mpack" });
        }
        let version = r.read_u16::<LittleEndian>()?;
        if version != PACK_VERSION {
            return Err(MempackError::UnsupportedVersion {
                found: version,
                supported: PACK_VERSION,
            });
        }
        let flags = r.read_u32::<LittleEndian>()?;
        let table = SectionTable::read(r)?;
        Ok(PackHeader { version, flags, table })
    }
}

/// Compute the footer integrity hash over `data` (the whole file), skipping
/// the `BLKS` payload range, the optional parity range, and the trailing 8
/// checksum bytes.
pub fn integrity_hash(
    data: &[u8],
    blocks: Range<u64>,
    parity: Option<Range<u64>>,
) -> u64 {
    let end = data.len().saturating_sub(8) as u64;
    let mut skip = vec![blocks];
    if let Some(p) = parity {
        skip.push(p);
    }
    skip.retain(|r| r.start < r.end);
    skip.sort_by_key(|r| r.start);

    let mut h = Xxh3::new();
    let mut pos = 0u64;
    for r in &skip {
        if pos < r.start.min(end) {
            h.update(&data[pos as usize..r.start.min(end) as usize]);
        }
        pos = pos.max(r.end);
    }
    if pos < end {
        h.update(&data[pos as usize..end as usize]);
    }
    h.digest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_table() -> SectionTable {
        SectionTable {
            entries: vec![
                SectionEntry { tag: TAG_CONFIG, offset: 52, length: 100 },
                SectionEntry { tag: TAG_BLOCKS, offset: 152, length: 4096 },
                SectionEntry { tag: TAG_FOOTER, offset: 4248, length: 50 },
            ],
        }
    }

    #[test]
    fn header_round_trip() {
        let header = PackHeader {
            version: PACK_VERSION,
            flags: FLAG_ECC,
            table: sample_table(),
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), PackHeader::encoded_len(3));
        let back = PackHeader::read(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        PackHeader {
            version: PACK_VERSION,
            flags: 0,
            table: SectionTable::default(),
        }
        .write(&mut buf)
        .unwrap();
        buf[0] = b'X';
        assert!(matches!(
            PackHeader::read(&mut Cursor::new(&buf)),
            Err(MempackError::BadMagic { .. })
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut buf = Vec::new();
        PackHeader {
            version: PACK_VERSION,
            flags: 0,
            table: SectionTable::default(),
        }
        .write(&mut buf)
        .unwrap();
        buf[4] = 0xFF;
        assert!(matches!(
            PackHeader::read(&mut Cursor::new(&buf)),
            Err(MempackError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn integrity_hash_ignores_block_bytes_only() {
        let mut data = vec![7u8; 256];
        let blocks = 100u64..140u64;
        let before = integrity_hash(&data, blocks.clone(), None);

        data[120] ^= 0xFF; // inside BLKS — not covered
        assert_eq!(integrity_hash(&data, blocks.clone(), None), before);

        data[10] ^= 0xFF; // header area — covered
        assert_ne!(integrity_hash(&data, blocks, None), before);
    }
}
