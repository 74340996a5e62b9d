//! Block compressors.
//!
//! Three codecs are frozen for format v1: `none` (identity), `deflate`
//! (raw deflate, no zlib wrapper), and `zstd` (framed, the default).  The
//! codec is a pack-level choice recorded in the `CNFG` section; every block
//! in a pack uses the same compressor.
//!
//! Decoders are bounded: the expected uncompressed size is passed in and a
//! payload that inflates past it (or stops short of it) is corruption, not
//! a best-effort result.

use serde::{Deserialize, Serialize};

use crate::error::{MempackError, Result};

/// Pack-level block compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    /// Payload stored verbatim.
    None,
    /// Raw deflate.  The decoder detects truncated streams.
    Deflate,
    /// Zstandard framed format (default).
    Zstd,
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor::Zstd
    }
}

impl Compressor {
    /// Parse from a CLI / config string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Compressor::None),
            "deflate" => Some(Compressor::Deflate),
            "zstd" => Some(Compressor::Zstd),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics only — never parsed back).
    pub fn name(self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Deflate => "deflate",
            Compressor::Zstd => "zstd",
        }
    }

    /// Compress one block payload.  Compression failures are fatal at build
    /// time, so the error is surfaced verbatim.
    pub fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            Compressor::Deflate => {
                // miniz accepts 0..=10; clamp the zstd-style level into range.
                let lvl = level.clamp(1, 10) as u8;
                Ok(miniz_oxide::deflate::compress_to_vec(data, lvl))
            }
            Compressor::Zstd => Ok(zstd::encode_all(data, level)?),
        }
    }

    /// Decompress one block payload.  `expected_size` is the recorded
    /// uncompressed size; any mismatch is reported as corruption.
    pub fn decompress(self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compressor::None => data.to_vec(),
            Compressor::Deflate => {
                miniz_oxide::inflate::decompress_to_vec_with_limit(data, expected_size)
                    .map_err(|e| MempackError::DecompressError(format!("deflate: {e}")))?
            }
            Compressor::Zstd => zstd::decode_all(data)
                .map_err(|e| MempackError::DecompressError(format!("zstd: {e}")))?,
        };
        if out.len() != expected_size {
            return Err(MempackError::DecompressError(format!(
                "decompressed to {} B, expected {} B",
                out.len(),
                expected_size
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"the quick brown fox jumps over the lazy dog, \
                            the quick brown fox jumps over the lazy dog";

    #[test]
    fn all_codecs_round_trip() {
        for codec in [Compressor::None, Compressor::Deflate, Compressor::Zstd] {
            let packed = codec.compress(SAMPLE, 3).unwrap();
            let unpacked = codec.decompress(&packed, SAMPLE.len()).unwrap();
            assert_eq!(unpacked, SAMPLE, "codec {}", codec.name());
        }
    }

    #[test]
    fn deflate_detects_truncation() {
        let packed = Compressor::Deflate.compress(SAMPLE, 3).unwrap();
        let cut = &packed[..packed.len() / 2];
        assert!(Compressor::Deflate.decompress(cut, SAMPLE.len()).is_err());
    }

    #[test]
    fn size_mismatch_is_corruption() {
        let packed = Compressor::Zstd.compress(SAMPLE, 3).unwrap();
        assert!(Compressor::Zstd.decompress(&packed, SAMPLE.len() + 1).is_err());
    }

    #[test]
    fn name_round_trip() {
        for codec in [Compressor::None, Compressor::Deflate, Compressor::Zstd] {
            assert_eq!(Compressor::from_name(codec.name()), Some(codec));
        }
        assert_eq!(Compressor::from_name("lz4"), None);
    }
}
