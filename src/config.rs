//! Build and open configuration.
//!
//! [`PackConfig`] is serialized as JSON into the pack's `CNFG` section so a
//! reader never has to guess the codec, chunking parameters, or index knobs
//! a pack was built with.  Every field has a default; `validate()` rejects
//! combinations the format cannot represent.

use serde::{Deserialize, Serialize};

use crate::codec::Compressor;
use crate::error::{MempackError, Result};

/// Target uncompressed block size: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
/// Default Zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;
/// Default bound on resident decompressed blocks.
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 1024;
/// Default number of blocks fetched per prefetch batch.
pub const DEFAULT_IO_BATCH_SIZE: usize = 8;
/// Default number of texts per embedding call.
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 64;

/// ANN algorithm selector.  Only HNSW is defined for format v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Hnsw,
}

/// HNSW construction and query knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    /// Max neighbors per node on upper layers (layer 0 keeps `2*M`).
    #[serde(rename = "M")]
    pub m: u16,
    #[serde(rename = "efConstruction")]
    pub ef_construction: u16,
    #[serde(rename = "efSearch")]
    pub ef_search: u16,
    /// Level-generation seed.  Persisted so rebuilds are byte-identical.
    pub seed: u64,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: 32,
            ef_construction: 200,
            ef_search: 64,
            seed: 0x6d70_6163_6b5f_7631, // "mpack_v1"
        }
    }
}

/// Reed–Solomon fan-in: `k` data blocks protected by `m` parity blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccParams {
    pub k: u16,
    pub m: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackConfig {
    pub compressor: Compressor,
    pub compression_level: i32,
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared with the previous chunk.
    pub chunk_overlap: usize,
    /// Target uncompressed block size in bytes.
    pub block_size: usize,
    pub index_type: IndexType,
    pub index_params: IndexParams,
    /// Reed–Solomon parity; `None` disables the ECC section.
    pub ecc: Option<EccParams>,
    /// Max resident decompressed blocks in the read-side cache.
    pub block_cache_size: usize,
    /// Max blocks per prefetch batch.
    pub io_batch_size: usize,
    /// Texts per embedding backend call.
    pub embed_batch_size: usize,
    /// Memory-map the pack on open; positioned reads when false.
    pub mmap: bool,
    /// Enable batched lookahead on the read path.
    pub prefetch: bool,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            compressor: Compressor::Zstd,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            chunk_size: 1000,
            chunk_overlap: 200,
            block_size: DEFAULT_BLOCK_SIZE,
            index_type: IndexType::Hnsw,
            index_params: IndexParams::default(),
            ecc: None,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            io_batch_size: DEFAULT_IO_BATCH_SIZE,
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            mmap: true,
            prefetch: true,
        }
    }
}

impl PackConfig {
    /// Reject configurations the format cannot represent.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(MempackError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(MempackError::InvalidConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.block_size == 0 {
            return Err(MempackError::InvalidConfig("block_size must be > 0".into()));
        }
        if self.block_cache_size == 0 {
            return Err(MempackError::InvalidConfig(
                "block_cache_size must be > 0".into(),
            ));
        }
        if self.io_batch_size == 0 {
            return Err(MempackError::InvalidConfig("io_batch_size must be > 0".into()));
        }
        if self.embed_batch_size == 0 {
            return Err(MempackError::InvalidConfig(
                "embed_batch_size must be > 0".into(),
            ));
        }
        if self.index_params.m == 0 {
            return Err(MempackError::InvalidConfig("index_params.M must be > 0".into()));
        }
        if self.index_params.ef_construction == 0 || self.index_params.ef_search == 0 {
            return Err(MempackError::InvalidConfig(
                "efConstruction and efSearch must be > 0".into(),
            ));
        }
        if let Some(ecc) = &self.ecc {
            if ecc.k == 0 || ecc.m == 0 {
                return Err(MempackError::InvalidConfig(
                    "ecc.k and ecc.m must be > 0".into(),
                ));
            }
            // GF(2^8) erasure coding caps the group at 255 shards.
            if ecc.k as usize + ecc.m as usize > 255 {
                return Err(MempackError::InvalidConfig(format!(
                    "ecc k+m = {} exceeds the GF(2^8) shard limit of 255",
                    ecc.k + ecc.m
                )));
            }
        }
        Ok(())
    }
}

/// Contents of the `CNFG` section: the build configuration plus the counts
/// and embedding identity a reader needs before touching any other section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackInfo {
    pub config: PackConfig,
    pub chunk_count: u64,
    pub block_count: u32,
    pub embedding_dim: u32,
    pub embedding_backend: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PackConfig::default().validate().unwrap();
    }

    #[test]
    fn overlap_must_stay_below_chunk_size() {
        let cfg = PackConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..PackConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ecc_shard_limit_enforced() {
        let cfg = PackConfig {
            ecc: Some(EccParams { k: 250, m: 10 }),
            ..PackConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_json_round_trip() {
        let cfg = PackConfig {
            compressor: Compressor::Deflate,
            ecc: Some(EccParams { k: 4, m: 2 }),
            ..PackConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PackConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
