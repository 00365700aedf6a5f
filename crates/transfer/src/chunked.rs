use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;
use crate::plan::ChunkDescriptor;

/// Random-access reader over the bytes being uploaded.
///
/// Implementations must allow several reads to run concurrently.
pub trait ChunkSource: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `length` bytes starting at `offset`.
    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send + '_>>;
}

/// A chunk read into memory and waiting to be sent.
#[derive(Debug, Clone)]
pub struct ReadyChunk {
    pub descriptor: ChunkDescriptor,
    pub payload: Bytes,
}

impl ReadyChunk {
    pub fn new(descriptor: ChunkDescriptor, payload: Bytes) -> Self {
        Self {
            descriptor,
            payload,
        }
    }

    pub fn index(&self) -> u64 {
        self.descriptor.index
    }

    /// True length of the chunk in bytes.
    pub fn len(&self) -> u64 {
        self.descriptor.length
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.length == 0
    }
}

fn check_range(offset: u64, length: u64, size: u64) -> Result<(), TransferError> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(TransferError::RangeOutOfBounds {
            offset,
            length,
            size,
        }),
    }
}

// ---------------------------------------------------------------------------
// FileChunkSource
// ---------------------------------------------------------------------------

/// Reads chunks from a local file.
///
/// Each read opens its own handle so concurrent reads never share a cursor.
#[derive(Debug, Clone)]
pub struct FileChunkSource {
    path: PathBuf,
    size: u64,
}

impl FileChunkSource {
    /// Opens `path` and records its current size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileChunkSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send + '_>> {
        Box::pin(async move {
            check_range(offset, length, self.size)?;
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryChunkSource
// ---------------------------------------------------------------------------

/// Serves chunks from a buffer already in memory.
#[derive(Debug, Clone)]
pub struct MemoryChunkSource {
    data: Bytes,
}

impl MemoryChunkSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ChunkSource for MemoryChunkSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send + '_>> {
        Box::pin(async move {
            check_range(offset, length, self.size())?;
            let start = offset as usize;
            Ok(self.data.slice(start..start + length as usize))
        })
    }
}
