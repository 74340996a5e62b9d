//! `.ann` index file — HNSW persisted for in-place mmap traversal.
//!
//! # On-disk layout (56-byte header, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic              = "MPAN"
//!    4      2   version            = 1
//!    6      1   algo               1 = HNSW
//!    7      4   d                  vector dimension
//!   11      4   N                  vector count
//!   15      2   M
//!   17      2   efConstruction
//!   19      1   metric             1 = cosine (L2-normalized vectors)
//!   20      4   entry_point
//!   24      8   seed               level-generation seed
//!   32      8   layer_table_offset
//!   40      8   neighbors_offset
//!   48      8   id_map_offset      0 = identity map
//! ```
//!
//! The payload after the header:
//!
//! - vectors at offset 56: `f32[N][d]`, row-major (search needs them; their
//!   position is fixed by convention rather than a header field);
//! - layer table: `levels:u8[N]` padded to 8, then
//!   `list_offsets:u64[total_lists+1]` where `total_lists = Σ(levels[i]+1)`
//!   and offsets count `u32` slots in the neighbor array;
//! - neighbor array: flat `u32` ids;
//! - id map (when present): `u64[N]`, vector id → chunk id.
//!
//! The reader binds these regions in place on the map and decodes fields on
//! access; nothing is copied at open except the per-node prefix sums.

mod hnsw;

pub use hnsw::{build, HnswGraph, HnswParams};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use memmap2::Mmap;

use crate::embed::Matrix;
use crate::error::{MempackError, Result};

pub const ANN_MAGIC: &[u8; 4] = b"MPAN";
pub const ANN_VERSION: u16 = 1;
pub const ALGO_HNSW: u8 = 1;
pub const METRIC_COSINE: u8 = 1;
pub const ANN_HEADER_SIZE: u64 = 56;

fn pad8(v: u64) -> u64 {
    (v + 7) & !7
}

/// Write `graph` + `vectors` (+ optional id map) to `path`.
///
/// The graph must have been built over exactly these vectors; `id_map`,
/// when given, must hold one chunk id per vector.
pub fn write_index(
    path: &Path,
    graph: &HnswGraph,
    vectors: &Matrix,
    id_map: Option<&[u64]>,
) -> Result<()> {
    let n = graph.len() as u64;
    if vectors.rows() as u64 != n {
        return Err(MempackError::AnnCorrupt(format!(
            "graph has {n} nodes but matrix has {} rows",
            vectors.rows()
        )));
    }
    if let Some(map) = id_map {
        if map.len() as u64 != n {
            return Err(MempackError::AnnCorrupt(format!(
                "id map has {} entries for {n} vectors",
                map.len()
            )));
        }
    }

    let total_lists: u64 = graph.levels.iter().map(|l| *l as u64 + 1).sum();
    let total_neighbors: u64 = graph
        .links
        .iter()
        .flat_map(|node| node.iter())
        .map(|list| list.len() as u64)
        .sum();

    let vectors_len = n * vectors.dim as u64 * 4;
    let layer_table_offset = pad8(ANN_HEADER_SIZE + vectors_len);
    let levels_padded = pad8(n);
    let neighbors_offset = layer_table_offset + levels_padded + 8 * (total_lists + 1);
    let id_map_offset = match id_map {
        Some(_) => pad8(neighbors_offset + 4 * total_neighbors),
        None => 0,
    };

    let mut w = BufWriter::new(File::create(path)?);

    // Header.
    w.write_all(ANN_MAGIC)?;
    w.write_u16::<LittleEndian>(ANN_VERSION)?;
    w.write_u8(ALGO_HNSW)?;
    w.write_u32::<LittleEndian>(vectors.dim as u32)?;
    w.write_u32::<LittleEndian>(n as u32)?;
    w.write_u16::<LittleEndian>(graph.params.m)?;
    w.write_u16::<LittleEndian>(graph.params.ef_construction)?;
    w.write_u8(METRIC_COSINE)?;
    w.write_u32::<LittleEndian>(graph.entry_point)?;
    w.write_u64::<LittleEndian>(graph.params.seed)?;
    w.write_u64::<LittleEndian>(layer_table_offset)?;
    w.write_u64::<LittleEndian>(neighbors_offset)?;
    w.write_u64::<LittleEndian>(id_map_offset)?;

    // Vectors.
    for x in &vectors.data {
        w.write_f32::<LittleEndian>(*x)?;
    }
    pad_to(&mut w, ANN_HEADER_SIZE + vectors_len, layer_table_offset)?;

    // Layer table: levels, padding, then cumulative list offsets.
    for level in &graph.levels {
        w.write_u8(*level)?;
    }
    pad_to(&mut w, layer_table_offset + n, layer_table_offset + levels_padded)?;
    let mut cursor = 0u64;
    w.write_u64::<LittleEndian>(0)?;
    for node in &graph.links {
        for list in node {
            cursor += list.len() as u64;
            w.write_u64::<LittleEndian>(cursor)?;
        }
    }

    // Neighbor array.
    for node in &graph.links {
        for list in node {
            for nb in list {
                w.write_u32::<LittleEndian>(*nb)?;
            }
        }
    }

    // Id map.
    if let Some(map) = id_map {
        pad_to(&mut w, neighbors_offset + 4 * total_neighbors, id_map_offset)?;
        for id in map {
            w.write_u64::<LittleEndian>(*id)?;
        }
    }

    w.flush()?;
    Ok(())
}

fn pad_to<W: Write>(w: &mut W, at: u64, target: u64) -> Result<()> {
    for _ in at..target {
        w.write_u8(0)?;
    }
    Ok(())
}

/// Read-side view: memory-maps the file and resolves the graph in place.
pub struct AnnReader {
    map: Mmap,
    d: u32,
    n: u32,
    m: u16,
    ef_construction: u16,
    entry_point: u32,
    seed: u64,
    layer_table_offset: u64,
    neighbors_offset: u64,
    id_map_offset: u64,
    /// Prefix sums of `(level + 1)` per node: node `v`'s list for layer `l`
    /// is list index `list_starts[v] + l`.
    list_starts: Vec<u64>,
    max_level: u8,
}

impl AnnReader {
    pub fn open(path: &Path) -> Result<AnnReader> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < ANN_HEADER_SIZE as usize {
            return Err(MempackError::AnnCorrupt("file shorter than header".into()));
        }
        if &map[0..4] != ANN_MAGIC {
            return Err(MempackError::BadMagic { expected: ".ann" });
        }
        let version = u16::from_le_bytes(map[4..6].try_into().unwrap());
        if version != ANN_VERSION {
            return Err(MempackError::UnsupportedVersion {
                found: version,
                supported: ANN_VERSION,
            });
        }
        let algo = map[6];
        if algo != ALGO_HNSW {
            return Err(MempackError::AnnCorrupt(format!("unknown algo tag {algo}")));
        }
        let d = u32::from_le_bytes(map[7..11].try_into().unwrap());
        let n = u32::from_le_bytes(map[11..15].try_into().unwrap());
        let m = u16::from_le_bytes(map[15..17].try_into().unwrap());
        let ef_construction = u16::from_le_bytes(map[17..19].try_into().unwrap());
        let metric = map[19];
        if metric != METRIC_COSINE {
            return Err(MempackError::AnnCorrupt(format!(
                "unknown metric tag {metric}"
            )));
        }
        let entry_point = u32::from_le_bytes(map[20..24].try_into().unwrap());
        let seed = u64::from_le_bytes(map[24..32].try_into().unwrap());
        let layer_table_offset = u64::from_le_bytes(map[32..40].try_into().unwrap());
        let neighbors_offset = u64::from_le_bytes(map[40..48].try_into().unwrap());
        let id_map_offset = u64::from_le_bytes(map[48..56].try_into().unwrap());

        if n > 0 && entry_point >= n {
            return Err(MempackError::AnnCorrupt(format!(
                "entry point {entry_point} out of range for {n} vectors"
            )));
        }
        if ANN_HEADER_SIZE + n as u64 * d as u64 * 4 > map.len() as u64 {
            return Err(MempackError::AnnCorrupt("vector area overruns file".into()));
        }
        let levels_end = layer_table_offset + n as u64;
        if levels_end > map.len() as u64 {
            return Err(MempackError::AnnCorrupt("layer table overruns file".into()));
        }

        // The only decoded state: per-node prefix sums over (level + 1).
        let mut list_starts = Vec::with_capacity(n as usize + 1);
        let mut acc = 0u64;
        let mut max_level = 0u8;
        list_starts.push(0);
        for i in 0..n as usize {
            let level = map[layer_table_offset as usize + i];
            max_level = max_level.max(level);
            acc += level as u64 + 1;
            list_starts.push(acc);
        }

        let offsets_end = layer_table_offset + pad8(n as u64) + 8 * (acc + 1);
        if offsets_end > map.len() as u64 {
            return Err(MempackError::AnnCorrupt("list offsets overrun file".into()));
        }
        if id_map_offset != 0 && id_map_offset + 8 * n as u64 > map.len() as u64 {
            return Err(MempackError::AnnCorrupt("id map overruns file".into()));
        }

        let reader = AnnReader {
            map,
            d,
            n,
            m,
            ef_construction,
            entry_point,
            seed,
            layer_table_offset,
            neighbors_offset,
            id_map_offset,
            list_starts,
            max_level,
        };
        // Bounds of the neighbor array itself.
        let total = reader.list_offset(acc);
        if reader.neighbors_offset + 4 * total > reader.map.len() as u64 {
            return Err(MempackError::AnnCorrupt("neighbor array overruns file".into()));
        }
        Ok(reader)
    }

    // ── Header accessors ─────────────────────────────────────────────────

    pub fn dim(&self) -> u32 {
        self.d
    }

    pub fn vector_count(&self) -> u32 {
        self.n
    }

    pub fn m(&self) -> u16 {
        self.m
    }

    pub fn ef_construction(&self) -> u16 {
        self.ef_construction
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn has_id_map(&self) -> bool {
        self.id_map_offset != 0
    }

    /// Translate a vector id to its chunk id (identity without a map).
    pub fn chunk_id(&self, vector_id: u32) -> u64 {
        if self.id_map_offset == 0 {
            vector_id as u64
        } else {
            let at = (self.id_map_offset + 8 * vector_id as u64) as usize;
            u64::from_le_bytes(self.map[at..at + 8].try_into().unwrap())
        }
    }

    // ── Search ───────────────────────────────────────────────────────────

    /// Top-k nearest vectors by cosine distance.
    ///
    /// `query` must be L2-normalized and match the index dimension.
    /// Results are sorted `(distance asc, vector_id asc)`.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        ef_search: usize,
    ) -> Result<Vec<(u32, f32)>> {
        if query.len() as u32 != self.d {
            return Err(MempackError::DimensionMismatch {
                expected: self.d,
                found: query.len() as u32,
            });
        }
        if self.n == 0 || top_k == 0 {
            return Ok(Vec::new());
        }
        let dist = |id: u32| self.distance_to(id, query);
        let neighbors = |id: u32, layer: usize| self.neighbors(id, layer);
        Ok(hnsw::search_graph(
            &dist,
            &neighbors,
            self.entry_point,
            self.max_level,
            ef_search,
            top_k,
        ))
    }

    fn distance_to(&self, id: u32, query: &[f32]) -> f32 {
        let at = (ANN_HEADER_SIZE + id as u64 * self.d as u64 * 4) as usize;
        let bytes = &self.map[at..at + self.d as usize * 4];
        let dot: f32 = bytes
            .chunks_exact(4)
            .zip(query)
            .map(|(c, q)| f32::from_le_bytes(c.try_into().unwrap()) * q)
            .sum();
        1.0 - dot
    }

    fn list_offset(&self, list_index: u64) -> u64 {
        let base = self.layer_table_offset + pad8(self.n as u64);
        let at = (base + 8 * list_index) as usize;
        u64::from_le_bytes(self.map[at..at + 8].try_into().unwrap())
    }

    fn neighbors(&self, node: u32, layer: usize) -> impl Iterator<Item = u32> + '_ {
        let list_index = self.list_starts[node as usize] + layer as u64;
        let start = self.list_offset(list_index);
        let end = self.list_offset(list_index + 1);
        let from = (self.neighbors_offset + 4 * start) as usize;
        let to = (self.neighbors_offset + 4 * end) as usize;
        self.map[from..to]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
    }
}
