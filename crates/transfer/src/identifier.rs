//! Upload identifiers: content hashes or generated names.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::chunked::{ChunkSource, ReadyChunk};
use crate::plan::{ChunkDescriptor, ChunkPlan};
use crate::{HASH_SLICE_SIZE, TransferError};

/// Caller-supplied identifier generator.
pub type IdentifierGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Incremental digest accumulator.
pub trait ContentHasher: Send {
    fn append(&mut self, data: &[u8]);

    /// Returns the hex digest of everything appended and resets the state.
    fn finish(&mut self) -> String;

    /// Discards everything appended so far.
    fn reset(&mut self);
}

/// MD5 hasher producing a 32-character lowercase hex digest.
#[derive(Default)]
pub struct Md5Hasher {
    inner: Md5,
}

impl ContentHasher for Md5Hasher {
    fn append(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finish(&mut self) -> String {
        hex::encode(self.inner.finalize_reset())
    }

    fn reset(&mut self) {
        Digest::reset(&mut self.inner);
    }
}

/// SHA-256 hasher producing a 64-character lowercase hex digest.
#[derive(Default)]
pub struct Sha256Hasher {
    inner: Sha256,
}

impl ContentHasher for Sha256Hasher {
    fn append(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finish(&mut self) -> String {
        hex::encode(self.inner.finalize_reset())
    }

    fn reset(&mut self) {
        Digest::reset(&mut self.inner);
    }
}

/// Digest used for content identifiers and the random fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    pub fn hasher(self) -> Box<dyn ContentHasher> {
        match self {
            HashAlgorithm::Md5 => Box::<Md5Hasher>::default(),
            HashAlgorithm::Sha256 => Box::<Sha256Hasher>::default(),
        }
    }
}

/// How the identifier of an upload is produced.
#[derive(Clone)]
pub enum IdentifierStrategy {
    /// Hash the whole file; identical content yields the same identifier.
    ContentHash,
    /// Use the generator if any, otherwise hash `salt`, the wall clock and a
    /// random number.
    Generated {
        generator: Option<IdentifierGenerator>,
        salt: String,
    },
}

impl fmt::Debug for IdentifierStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierStrategy::ContentHash => f.write_str("ContentHash"),
            IdentifierStrategy::Generated { generator, salt } => f
                .debug_struct("Generated")
                .field("generator", &generator.as_ref().map(|_| "<fn>"))
                .field("salt", salt)
                .finish(),
        }
    }
}

/// Result of identifier resolution.
#[derive(Debug)]
pub struct ResolvedIdentifier {
    pub identifier: String,
    /// Chunks read while hashing, kept when the file fits the memory budget.
    pub cached: Vec<ReadyChunk>,
}

/// Computes the identifier of an upload attempt.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    strategy: IdentifierStrategy,
    algorithm: HashAlgorithm,
    max_memory: u64,
}

impl IdentifierResolver {
    pub fn new(strategy: IdentifierStrategy, algorithm: HashAlgorithm, max_memory: u64) -> Self {
        Self {
            strategy,
            algorithm,
            max_memory,
        }
    }

    /// Produces a non-empty identifier or fails.
    pub async fn resolve(
        &self,
        source: &dyn ChunkSource,
        plan: &ChunkPlan,
    ) -> Result<ResolvedIdentifier, TransferError> {
        let identifier = match &self.strategy {
            IdentifierStrategy::ContentHash => return self.hash_content(source, plan).await,
            IdentifierStrategy::Generated {
                generator: Some(generator),
                ..
            } => generator(),
            IdentifierStrategy::Generated {
                generator: None,
                salt,
            } => self.random_identifier(salt),
        };

        if identifier.is_empty() {
            return Err(TransferError::EmptyIdentifier);
        }
        Ok(ResolvedIdentifier {
            identifier,
            cached: Vec::new(),
        })
    }

    fn random_identifier(&self, salt: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let nonce: u64 = rand::random();
        let mut hasher = self.algorithm.hasher();
        hasher.append(format!("{salt}-{millis}-{nonce}").as_bytes());
        hasher.finish()
    }

    /// Streams the whole source through the hasher.
    ///
    /// Files smaller than the memory budget are hashed chunk by chunk and the
    /// chunks are kept for the transfer; larger files are hashed in
    /// [`HASH_SLICE_SIZE`] slices that are dropped immediately.
    async fn hash_content(
        &self,
        source: &dyn ChunkSource,
        plan: &ChunkPlan,
    ) -> Result<ResolvedIdentifier, TransferError> {
        let total_size = plan.total_size();
        let keep = total_size < self.max_memory;
        let slice_size = if keep {
            plan.chunk_size()
        } else {
            HASH_SLICE_SIZE
        };

        let mut hasher = self.algorithm.hasher();
        let mut cached = Vec::new();
        let slices = total_size.div_ceil(slice_size);

        for i in 0..slices {
            let offset = i * slice_size;
            let length = (total_size - offset).min(slice_size);
            let data = match source.read_range(offset, length).await {
                Ok(data) => data,
                Err(e) => {
                    hasher.reset();
                    return Err(e);
                }
            };
            hasher.append(&data);
            if keep {
                let descriptor = ChunkDescriptor {
                    index: i,
                    offset,
                    length,
                };
                cached.push(ReadyChunk::new(descriptor, data));
            }
        }

        let identifier = hasher.finish();
        debug!(
            identifier = %identifier,
            slices,
            cached = cached.len(),
            "content identifier computed"
        );
        Ok(ResolvedIdentifier { identifier, cached })
    }
}
