use crate::TransferError;

/// Byte range of one chunk within the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    pub index: u64,
    /// Byte offset, always `index * chunk_size`.
    pub offset: u64,
    /// Chunk length; equals the chunk size except possibly for the last chunk.
    pub length: u64,
}

/// Splits a file of `total_size` bytes into fixed-size chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u64,
}

impl ChunkPlan {
    /// Creates a plan. `chunk_size` must be non-zero.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks: total_size.div_ceil(chunk_size),
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks; zero for an empty file.
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn is_empty(&self) -> bool {
        self.total_chunks == 0
    }

    /// Index of the last chunk, `None` for an empty file.
    pub fn last_index(&self) -> Option<u64> {
        self.total_chunks.checked_sub(1)
    }

    /// Returns the byte range of chunk `index`.
    pub fn descriptor(&self, index: u64) -> Result<ChunkDescriptor, TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let offset = index * self.chunk_size;
        Ok(ChunkDescriptor {
            index,
            offset,
            length: (self.total_size - offset).min(self.chunk_size),
        })
    }

    /// Iterates over every chunk in index order.
    pub fn descriptors(&self) -> impl Iterator<Item = ChunkDescriptor> + '_ {
        (0..self.total_chunks).filter_map(|i| self.descriptor(i).ok())
    }

    /// Bytes covered by the given chunk indices.
    ///
    /// Counts `chunk_size` per index and subtracts the last chunk's shortfall
    /// when the last index is among them. Indices outside the plan are ignored.
    pub fn bytes_for<'a>(&self, indices: impl IntoIterator<Item = &'a u64>) -> u64 {
        let mut count = 0u64;
        let mut has_last = false;
        for &index in indices {
            if index >= self.total_chunks {
                continue;
            }
            count += 1;
            has_last |= Some(index) == self.last_index();
        }
        let mut bytes = count * self.chunk_size;
        if has_last {
            bytes -= self.total_chunks * self.chunk_size - self.total_size;
        }
        bytes
    }
}
