//! Crate-wide error type and the deadline helper.
//!
//! Policy (frozen for format v1):
//! - Magic, version, header, and footer failures are fatal at open time.
//! - A single-block checksum failure is *not* fatal: the read path attempts
//!   Reed–Solomon repair when the pack carries parity, and only surfaces
//!   [`MempackError::BlockCorrupt`] once repair is exhausted.
//! - Search skips `ChunkUnavailable` candidates and keeps draining the
//!   candidate queue; it never fails globally because one block is gone.

use std::io;
use std::time::Instant;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MempackError>;

#[derive(Error, Debug)]
pub enum MempackError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid magic number — not a {expected} file")]
    BadMagic { expected: &'static str },

    #[error("Unsupported format version {found} (this build handles v{supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    #[error("Header corrupt: {0}")]
    HeaderCorrupt(String),

    #[error("Footer checksum mismatch — file is corrupted")]
    FooterCorrupt,

    #[error("Block {0} is corrupt (checksum mismatch, no repair possible)")]
    BlockCorrupt(u32),

    #[error("Chunk {0} is unavailable (resides in an unrecoverable block)")]
    ChunkUnavailable(u64),

    #[error("ECC group {0} unrecoverable (fewer than k intact members)")]
    EccUnrecoverable(u32),

    #[error("Decompression failed: {0}")]
    DecompressError(String),

    #[error("ANN index corrupt: {0}")]
    AnnCorrupt(String),

    #[error("Dimension mismatch: index has d={expected}, got d={found}")]
    DimensionMismatch { expected: u32, found: u32 },

    #[error("Embedding backend error: {0}")]
    EmbedBackendError(String),

    #[error("Deadline expired before the call completed")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MempackError {
    /// Rebuild an equivalent error for a second consumer.
    ///
    /// Used by the block cache to hand one load failure to every coalesced
    /// waiter; `io::Error` is not `Clone`, so the kind and message are
    /// carried over instead.
    pub(crate) fn replicate(&self) -> MempackError {
        use MempackError::*;
        match self {
            Io(e) => Io(io::Error::new(e.kind(), e.to_string())),
            BadMagic { expected } => BadMagic { expected: *expected },
            UnsupportedVersion { found, supported } => UnsupportedVersion {
                found: *found,
                supported: *supported,
            },
            HeaderCorrupt(s) => HeaderCorrupt(s.clone()),
            FooterCorrupt => FooterCorrupt,
            BlockCorrupt(b) => BlockCorrupt(*b),
            ChunkUnavailable(c) => ChunkUnavailable(*c),
            EccUnrecoverable(g) => EccUnrecoverable(*g),
            DecompressError(s) => DecompressError(s.clone()),
            AnnCorrupt(s) => AnnCorrupt(s.clone()),
            DimensionMismatch { expected, found } => DimensionMismatch {
                expected: *expected,
                found: *found,
            },
            EmbedBackendError(s) => EmbedBackendError(s.clone()),
            Timeout => Timeout,
            InvalidConfig(s) => InvalidConfig(s.clone()),
        }
    }
}

/// Fail with [`MempackError::Timeout`] once `deadline` has passed.
///
/// Every public retrieval and verification entry point threads an optional
/// deadline through this check; expiry aborts the call without mutating any
/// shared state (the cache never publishes a partially loaded block).
pub(crate) fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(MempackError::Timeout),
        _ => Ok(()),
    }
}
