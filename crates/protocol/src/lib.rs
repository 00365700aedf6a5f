//! Wire shapes shared between the upload engine and the chunk server.
//!
//! The server exposes three endpoints whose exact routes are configured by
//! the caller:
//!
//! - **verify** answers which chunks of an identifier are already stored
//! - **upload** receives one chunk as a raw body, metadata in the query
//! - **merge** concatenates stored chunks in index order

pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{ChunkUploadQuery, IdentityQuery, VerifyResponse};
pub use types::{FailCode, FailInfo, ProgressSnapshot};

/// Content type used for raw chunk bodies.
pub const CHUNK_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors produced while decoding server responses.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty response body")]
    EmptyBody,
}
