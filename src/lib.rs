//! # mempack — the `.mpack` portable knowledge-pack format
//!
//! A pack is a pair of files built once and immutable thereafter:
//!
//! - `.mpack` — compressed text blocks, chunk/block tables, per-block
//!   XXH3 checksums, optional Reed–Solomon parity, optional tag index;
//! - `.ann` — an HNSW graph over the chunk embeddings, laid out for
//!   in-place mmap traversal, with a vector-id → chunk-id map when the two
//!   are not identical.
//!
//! Format guarantees (frozen in v1):
//! - All numeric fields are little-endian; strings are length-prefixed UTF-8
//! - Every block checksum is verified before decompression; corrupt blocks
//!   are repaired through their parity group when ECC is enabled, and
//!   poisoned otherwise
//! - The footer duplicates the section table and carries an integrity hash
//!   over the header and all metadata sections; a failed footer check is
//!   fatal at open, while damage inside block payloads stays repairable
//! - Builds are deterministic: identical inputs, parameters, and seed give
//!   byte-identical `.mpack` and `.ann` files
//! - Search results are totally ordered by `(distance asc, chunk_id asc)`

pub mod ann;
pub mod block;
pub mod builder;
pub mod cache;
pub mod chunker;
pub mod codec;
pub mod config;
pub mod ecc;
pub mod embed;
pub mod error;
pub mod format;
pub mod meta;
pub mod reader;
pub mod retriever;
pub mod toc;
pub mod verify;
pub mod writer;

// Flat re-exports for the most common types.
pub use ann::AnnReader;
pub use builder::{build, BuildStats, Document};
pub use cache::BlockCache;
pub use codec::Compressor;
pub use config::{EccParams, IndexParams, PackConfig, PackInfo};
pub use embed::{EmbeddingBackend, HashingEmbedder};
pub use error::{MempackError, Result};
pub use meta::{ChunkMeta, MetaValue};
pub use reader::PackReader;
pub use retriever::{Chunk, Hit, Retriever, SearchOptions};
pub use verify::{verify_pack, BlockStatus, VerifyReport};
