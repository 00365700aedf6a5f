//! Upload error types.

use chunkup_protocol::{FailCode, FailInfo};
use chunkup_transfer::TransferError;

use crate::remote::RequestError;

/// Errors produced by an upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("identifier computation failed: {0}")]
    Identifier(#[source] TransferError),

    #[error("verify request failed: {0}")]
    Verification(#[source] RequestError),

    #[error("reading chunk {index} failed: {source}")]
    ChunkRead {
        index: u64,
        #[source]
        source: TransferError,
    },

    #[error("uploading chunk {index} failed: {source}")]
    ChunkTransport {
        index: u64,
        #[source]
        source: RequestError,
    },

    #[error("merge request failed: {0}")]
    Merge(#[source] RequestError),

    #[error("upload cancelled")]
    Cancelled,

    #[error("an upload is already running")]
    AlreadyRunning,
}

impl UploadError {
    /// Code carried on the `fail` event, `None` for errors that never
    /// produce one.
    pub fn fail_code(&self) -> Option<FailCode> {
        match self {
            UploadError::Identifier(_) => Some(FailCode::Identifier),
            UploadError::Verification(_) => Some(FailCode::Verify),
            UploadError::ChunkRead { .. } => Some(FailCode::ChunkRead),
            UploadError::ChunkTransport { .. } => Some(FailCode::ChunkUpload),
            UploadError::Merge(_) => Some(FailCode::Merge),
            UploadError::Config(_) | UploadError::Cancelled | UploadError::AlreadyRunning => None,
        }
    }

    /// Payload of the `fail` event for fatal errors.
    pub fn fail_info(&self) -> Option<FailInfo> {
        self.fail_code().map(|err_code| FailInfo {
            err_code,
            err_msg: self.to_string(),
        })
    }

    /// True for errors that end the attempt with `fail` + `complete`.
    pub fn is_fatal(&self) -> bool {
        self.fail_code().is_some()
    }
}
