//! Pack writer — emits the `.mpack` container.
//!
//! The write order is fixed: placeholder header → `CNFG` → `TOCC` → `TOCB`
//! → `BLKS` → `CSUM` → `ECCG`? → `TAGI`? → `FOOT` → rewrite the header's
//! section table → patch the footer checksum.  Every offset is computed
//! before the first byte is written, so two builds of the same content are
//! byte-identical.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::block::AssembledBlock;
use crate::config::PackInfo;
use crate::ecc;
use crate::error::Result;
use crate::format::{
    integrity_hash, PackHeader, SectionEntry, SectionTable, FLAG_ECC, FLAG_TAG_INDEX,
    PACK_VERSION, TAG_BLOCKS, TAG_CHECKSUMS, TAG_CONFIG, TAG_ECC, TAG_FOOTER, TAG_TAG_INDEX,
    TAG_TOC_BLOCKS, TAG_TOC_CHUNKS,
};
use crate::toc::{BlockEntry, BlockToc, ChunkToc, TagIndex, NO_ECC_GROUP};

/// Write a complete pack to `path`.
///
/// `chunk_toc` must reference the same blocks as `blocks`; the block TOC
/// and checksum table are derived here.
pub fn write_pack(
    path: &Path,
    info: &PackInfo,
    chunk_toc: &ChunkToc,
    blocks: &[AssembledBlock],
    tag_index: &TagIndex,
) -> Result<()> {
    let config = &info.config;
    let cnfg_bytes = serde_json::to_vec(info)
        .map_err(|e| crate::error::MempackError::InvalidConfig(e.to_string()))?;

    // Parity is computed up front so the section table can be final before
    // the first write.
    let mut ecc_parts = match (&config.ecc, blocks.is_empty()) {
        (Some(params), false) => Some(ecc::build_parity(blocks, params.k, params.m)?),
        _ => None,
    };

    let has_ecc = ecc_parts.is_some();
    let has_tags = !tag_index.is_empty();
    let section_count = 5 + usize::from(has_ecc) + usize::from(has_tags) + 1;
    let header_len = PackHeader::encoded_len(section_count) as u64;

    // ── Lay out every section ────────────────────────────────────────────
    let mut table = SectionTable::default();
    let mut cursor = header_len;
    let push = |table: &mut SectionTable, tag: [u8; 4], length: u64, cursor: &mut u64| {
        table.entries.push(SectionEntry { tag, offset: *cursor, length });
        *cursor += length;
    };

    push(&mut table, TAG_CONFIG, cnfg_bytes.len() as u64, &mut cursor);
    push(&mut table, TAG_TOC_CHUNKS, chunk_toc.encoded_len() as u64, &mut cursor);

    let block_toc_len = 8 + blocks.len() * crate::toc::BLOCK_ENTRY_SIZE;
    push(&mut table, TAG_TOC_BLOCKS, block_toc_len as u64, &mut cursor);

    let blks_len: u64 = blocks.iter().map(|b| b.compressed.len() as u64).sum();
    let blks_offset = cursor;
    push(&mut table, TAG_BLOCKS, blks_len, &mut cursor);

    push(&mut table, TAG_CHECKSUMS, 8 * blocks.len() as u64, &mut cursor);

    let mut parity_range = None;
    if let Some((ecc_table, parity_payloads)) = ecc_parts.as_mut() {
        let table_len = ecc_table.table_len() as u64;
        let parity_len = ecc_table.parity_len();
        let eccg_offset = cursor;
        let mut parity_at = eccg_offset + table_len;
        parity_range = Some(parity_at..parity_at + parity_len);
        for (group, payload) in ecc_table.groups.iter_mut().zip(parity_payloads.iter()) {
            group.parity_offset = parity_at;
            parity_at += payload.len() as u64;
        }
        push(&mut table, TAG_ECC, table_len + parity_len, &mut cursor);
    }

    if has_tags {
        push(&mut table, TAG_TAG_INDEX, tag_index.encoded_len() as u64, &mut cursor);
    }

    let foot_len = SectionTable::encoded_len(section_count) as u64 + 8;
    push(&mut table, TAG_FOOTER, foot_len, &mut cursor);

    // ── Derived tables ───────────────────────────────────────────────────
    let mut block_toc = BlockToc::default();
    let mut file_offset = blks_offset;
    for b in blocks {
        let ecc_group_id = match (&config.ecc, has_ecc) {
            (Some(p), true) => b.block_id / p.k as u32,
            _ => NO_ECC_GROUP,
        };
        block_toc.entries.push(BlockEntry {
            file_offset,
            compressed_size: b.compressed.len() as u32,
            uncompressed_size: b.uncompressed_size,
            checksum: b.checksum,
            ecc_group_id,
        });
        file_offset += b.compressed.len() as u64;
    }

    let mut flags = 0u32;
    if has_ecc {
        flags |= FLAG_ECC;
    }
    if has_tags {
        flags |= FLAG_TAG_INDEX;
    }
    let header = PackHeader { version: PACK_VERSION, flags, table: table.clone() };

    // ── Emit ─────────────────────────────────────────────────────────────
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&vec![0u8; header_len as usize])?; // placeholder header

    w.write_all(&cnfg_bytes)?;
    chunk_toc.write(&mut w)?;
    block_toc.write(&mut w)?;
    for b in blocks {
        w.write_all(&b.compressed)?;
    }
    for b in blocks {
        w.write_u64::<LittleEndian>(b.checksum)?;
    }
    if let Some((ecc_table, parity_payloads)) = &ecc_parts {
        ecc_table.write(&mut w)?;
        for payload in parity_payloads {
            w.write_all(payload)?;
        }
    }
    if has_tags {
        tag_index.write(&mut w)?;
    }
    table.write(&mut w)?;
    w.write_u64::<LittleEndian>(0)?; // checksum placeholder

    // Rewrite the header now that the table is final.
    w.seek(SeekFrom::Start(0))?;
    header.write(&mut w)?;
    w.flush()?;
    drop(w);

    patch_footer_checksum(path, blks_offset..blks_offset + blks_len, parity_range)?;

    log::debug!(
        "wrote pack {}: {} chunks, {} blocks, {} sections",
        path.display(),
        chunk_toc.entries.len(),
        blocks.len(),
        section_count,
    );
    Ok(())
}

/// Compute the integrity hash over the finished file and patch the final
/// 8 bytes of the footer.
fn patch_footer_checksum(
    path: &Path,
    blocks: std::ops::Range<u64>,
    parity: Option<std::ops::Range<u64>>,
) -> Result<()> {
    let mut f = OpenOptions::new().read(true).write(true).open(path)?;
    let mut data = Vec::new();
    f.read_to_end(&mut data)?;
    let digest = integrity_hash(&data, blocks, parity);
    f.seek(SeekFrom::End(-8))?;
    f.write_u64::<LittleEndian>(digest)?;
    f.sync_all()?;
    Ok(())
}
