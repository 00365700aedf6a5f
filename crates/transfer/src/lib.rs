//! Chunk planning, disk reads, content identifiers and progress accounting.
//!
//! These are the leaf pieces of the upload engine. None of them talk to the
//! network; the uploader crate wires them into a session.

mod chunked;
mod identifier;
mod plan;
mod progress;

pub use chunked::{ChunkSource, FileChunkSource, MemoryChunkSource, ReadyChunk};
pub use identifier::{
    ContentHasher, HashAlgorithm, IdentifierGenerator, IdentifierResolver, IdentifierStrategy,
    Md5Hasher, ResolvedIdentifier, Sha256Hasher,
};
pub use plan::{ChunkDescriptor, ChunkPlan};
pub use progress::ProgressTracker;

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default budget for chunks held in memory: 100 MiB.
pub const DEFAULT_MAX_MEMORY: u64 = 100 * 1024 * 1024;

/// Slice size used when hashing files larger than the memory budget.
pub const HASH_SLICE_SIZE: u64 = 10 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u64, total: u64 },

    #[error("range {offset}+{length} exceeds source size {size}")]
    RangeOutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("identifier generator returned an empty identifier")]
    EmptyIdentifier,
}
