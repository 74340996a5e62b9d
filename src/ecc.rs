//! Reed–Solomon erasure coding over block payloads.
//!
//! # Convention (frozen for v1)
//!
//! Blocks are grouped into consecutive runs of `k` in block-id order; the
//! final group may hold fewer.  Shards are the groups' compressed payloads
//! zero-padded to the largest member, plus `m` parity shards of the same
//! size.  Any `k` intact members of a `k+m` group reconstruct the rest.
//! There is no interleaving.
//!
//! # `ECCG` section layout (little-endian)
//!
//! ```text
//! ECCG  := k:u16  m:u16  group_count:u32  group[group_count]  parity_bytes
//! group := group_id:u32  member_count:u16  block_id:u32[member_count]
//!          padded_size:u32  parity_offset:u64  parity_size:u64
//!          parity_xxh3:u64[m]
//! ```
//!
//! `parity_offset` is absolute; `parity_size == m * padded_size`.  Parity
//! shards carry their own XXH3 so an erased parity member is identified the
//! same way an erased data member is: by checksum mismatch.

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use reed_solomon_erasure::galois_8::ReedSolomon;
use xxhash_rust::xxh3::xxh3_64;

use crate::block::AssembledBlock;
use crate::error::{MempackError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccGroup {
    pub group_id: u32,
    pub members: Vec<u32>,
    pub padded_size: u32,
    /// Absolute file offset of this group's parity bytes.
    pub parity_offset: u64,
    pub parity_size: u64,
    pub parity_checksums: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EccTable {
    pub k: u16,
    pub m: u16,
    pub groups: Vec<EccGroup>,
}

impl EccTable {
    /// Serialized size of the group table (excluding parity bytes).
    pub fn table_len(&self) -> usize {
        8 + self
            .groups
            .iter()
            .map(|g| 4 + 2 + 4 * g.members.len() + 4 + 8 + 8 + 8 * self.m as usize)
            .sum::<usize>()
    }

    /// Total parity bytes across all groups.
    pub fn parity_len(&self) -> u64 {
        self.groups.iter().map(|g| g.parity_size).sum()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u16::<LittleEndian>(self.k)?;
        w.write_u16::<LittleEndian>(self.m)?;
        w.write_u32::<LittleEndian>(self.groups.len() as u32)?;
        for g in &self.groups {
            w.write_u32::<LittleEndian>(g.group_id)?;
            w.write_u16::<LittleEndian>(g.members.len() as u16)?;
            for id in &g.members {
                w.write_u32::<LittleEndian>(*id)?;
            }
            w.write_u32::<LittleEndian>(g.padded_size)?;
            w.write_u64::<LittleEndian>(g.parity_offset)?;
            w.write_u64::<LittleEndian>(g.parity_size)?;
            debug_assert_eq!(g.parity_checksums.len(), self.m as usize);
            for c in &g.parity_checksums {
                w.write_u64::<LittleEndian>(*c)?;
            }
        }
        Ok(())
    }

    pub fn read(mut bytes: &[u8]) -> Result<EccTable> {
        let r = &mut bytes;
        let k = r.read_u16::<LittleEndian>()?;
        let m = r.read_u16::<LittleEndian>()?;
        let group_count = r.read_u32::<LittleEndian>()?;
        let mut groups = Vec::with_capacity(group_count as usize);
        for _ in 0..group_count {
            let group_id = r.read_u32::<LittleEndian>()?;
            let member_count = r.read_u16::<LittleEndian>()? as usize;
            let mut members = Vec::with_capacity(member_count);
            for _ in 0..member_count {
                members.push(r.read_u32::<LittleEndian>()?);
            }
            let padded_size = r.read_u32::<LittleEndian>()?;
            let parity_offset = r.read_u64::<LittleEndian>()?;
            let parity_size = r.read_u64::<LittleEndian>()?;
            let mut parity_checksums = Vec::with_capacity(m as usize);
            for _ in 0..m {
                parity_checksums.push(r.read_u64::<LittleEndian>()?);
            }
            groups.push(EccGroup {
                group_id,
                members,
                padded_size,
                parity_offset,
                parity_size,
                parity_checksums,
            });
        }
        Ok(EccTable { k, m, groups })
    }

    /// The group covering `block_id`, if any.
    pub fn group_of(&self, block_id: u32) -> Option<&EccGroup> {
        self.groups.iter().find(|g| g.members.contains(&block_id))
    }
}

/// Compute the group table and parity shards for `blocks`.
///
/// `parity_offset` fields are left at 0; the pack writer assigns absolute
/// offsets once the section position is known.  Returned parity bytes are
/// one `Vec` per group, `m * padded_size` bytes each (shards concatenated).
pub fn build_parity(
    blocks: &[AssembledBlock],
    k: u16,
    m: u16,
) -> Result<(EccTable, Vec<Vec<u8>>)> {
    let mut table = EccTable { k, m, groups: Vec::new() };
    let mut parity_payloads = Vec::new();

    for (group_id, run) in blocks.chunks(k as usize).enumerate() {
        let padded_size = run
            .iter()
            .map(|b| b.compressed.len())
            .max()
            .unwrap_or(0) as u32;

        let data_shards = run.len();
        let mut shards: Vec<Vec<u8>> = run
            .iter()
            .map(|b| {
                let mut s = b.compressed.clone();
                s.resize(padded_size as usize, 0);
                s
            })
            .collect();
        shards.extend(std::iter::repeat(vec![0u8; padded_size as usize]).take(m as usize));

        let rs = ReedSolomon::new(data_shards, m as usize)
            .map_err(|e| MempackError::InvalidConfig(format!("reed-solomon: {e:?}")))?;
        rs.encode(&mut shards)
            .map_err(|e| MempackError::InvalidConfig(format!("reed-solomon encode: {e:?}")))?;

        let parity = &shards[data_shards..];
        let parity_checksums: Vec<u64> = parity.iter().map(|s| xxh3_64(s)).collect();
        let mut payload = Vec::with_capacity(m as usize * padded_size as usize);
        for s in parity {
            payload.extend_from_slice(s);
        }

        table.groups.push(EccGroup {
            group_id: group_id as u32,
            members: run.iter().map(|b| b.block_id).collect(),
            padded_size,
            parity_offset: 0,
            parity_size: payload.len() as u64,
            parity_checksums,
        });
        parity_payloads.push(payload);
    }

    Ok((table, parity_payloads))
}

/// Reconstruct every missing shard of one group.
///
/// `shards` holds `member_count + m` entries (data first, then parity),
/// each `Some(padded bytes)` when the member passed its checksum or `None`
/// when it is erased.  Fails with `EccUnrecoverable` when fewer than
/// `member_count` shards survive.
pub fn reconstruct_group(
    group: &EccGroup,
    m: u16,
    shards: &mut Vec<Option<Vec<u8>>>,
) -> Result<()> {
    let data_shards = group.members.len();
    debug_assert_eq!(shards.len(), data_shards + m as usize);

    let intact = shards.iter().filter(|s| s.is_some()).count();
    if intact < data_shards {
        return Err(MempackError::EccUnrecoverable(group.group_id));
    }
    let rs = ReedSolomon::new(data_shards, m as usize)
        .map_err(|e| MempackError::InvalidConfig(format!("reed-solomon: {e:?}")))?;
    rs.reconstruct(shards)
        .map_err(|_| MempackError::EccUnrecoverable(group.group_id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ChunkSpan;

    fn fake_blocks(sizes: &[usize]) -> Vec<AssembledBlock> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let compressed: Vec<u8> = (0..*n).map(|j| (i * 31 + j) as u8).collect();
                AssembledBlock {
                    block_id: i as u32,
                    checksum: xxh3_64(&compressed),
                    uncompressed_size: *n as u32,
                    compressed,
                    spans: vec![ChunkSpan {
                        chunk_id: i as u64,
                        offset_in_block: 0,
                        length: *n as u32,
                    }],
                }
            })
            .collect()
    }

    fn shards_of(
        blocks: &[AssembledBlock],
        group: &EccGroup,
        parity: &[u8],
        m: u16,
    ) -> Vec<Option<Vec<u8>>> {
        let mut shards: Vec<Option<Vec<u8>>> = group
            .members
            .iter()
            .map(|id| {
                let mut s = blocks[*id as usize].compressed.clone();
                s.resize(group.padded_size as usize, 0);
                Some(s)
            })
            .collect();
        for i in 0..m as usize {
            let at = i * group.padded_size as usize;
            shards.push(Some(parity[at..at + group.padded_size as usize].to_vec()));
        }
        shards
    }

    #[test]
    fn table_round_trip() {
        let blocks = fake_blocks(&[100, 90, 110, 60, 40]);
        let (mut table, payloads) = build_parity(&blocks, 2, 2).unwrap();
        let mut offset = 5000u64;
        for (g, p) in table.groups.iter_mut().zip(&payloads) {
            g.parity_offset = offset;
            offset += p.len() as u64;
        }
        let mut buf = Vec::new();
        table.write(&mut buf).unwrap();
        assert_eq!(buf.len(), table.table_len());
        assert_eq!(EccTable::read(&buf).unwrap(), table);
    }

    #[test]
    fn last_group_may_be_short() {
        let blocks = fake_blocks(&[64, 64, 64, 64, 64]);
        let (table, _) = build_parity(&blocks, 4, 2).unwrap();
        assert_eq!(table.groups.len(), 2);
        assert_eq!(table.groups[0].members, vec![0, 1, 2, 3]);
        assert_eq!(table.groups[1].members, vec![4]);
    }

    #[test]
    fn repairs_up_to_m_erasures() {
        let blocks = fake_blocks(&[80, 70, 75, 85]);
        let (table, payloads) = build_parity(&blocks, 4, 2).unwrap();
        let group = &table.groups[0];

        let mut shards = shards_of(&blocks, group, &payloads[0], 2);
        shards[1] = None;
        shards[3] = None;
        reconstruct_group(group, 2, &mut shards).unwrap();

        let repaired = shards[1].as_ref().unwrap();
        assert_eq!(&repaired[..70], &blocks[1].compressed[..]);
        assert_eq!(xxh3_64(&repaired[..70]), blocks[1].checksum);
    }

    #[test]
    fn parity_erasure_counts_as_a_casualty() {
        let blocks = fake_blocks(&[80, 70, 75, 85]);
        let (table, payloads) = build_parity(&blocks, 4, 2).unwrap();
        let group = &table.groups[0];

        // One data + one parity shard gone: still exactly k intact.
        let mut shards = shards_of(&blocks, group, &payloads[0], 2);
        shards[0] = None;
        shards[4] = None;
        reconstruct_group(group, 2, &mut shards).unwrap();
        assert_eq!(
            &shards[0].as_ref().unwrap()[..80],
            &blocks[0].compressed[..]
        );
    }

    #[test]
    fn too_many_erasures_is_unrecoverable() {
        let blocks = fake_blocks(&[80, 70, 75, 85]);
        let (table, payloads) = build_parity(&blocks, 4, 2).unwrap();
        let group = &table.groups[0];

        let mut shards = shards_of(&blocks, group, &payloads[0], 2);
        shards[0] = None;
        shards[1] = None;
        shards[2] = None;
        assert!(matches!(
            reconstruct_group(group, 2, &mut shards),
            Err(MempackError::EccUnrecoverable(0))
        ));
    }
}
