//! Resumable chunked uploads.
//!
//! This crate implements the upload engine on top of `chunkup-transfer`.
//! It has no opinion on where bytes come from or how HTTP is spoken: callers
//! hand an `UploadSession` a [`ChunkSource`](chunkup_transfer::ChunkSource)
//! and an [`HttpTransport`] implementation.
//!
//! # Protocol
//!
//! 1. **Identify**: hash the file content, or generate an identifier
//! 2. **Verify**: ask the server which chunks it already has
//! 3. **Transfer**: read and upload the missing chunks concurrently
//! 4. **Merge**: ask the server to concatenate the chunks in index order

pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod remote;
pub mod session;
pub mod transport;

// Re-export primary types for convenience.
pub use config::UploaderConfig;
pub use error::UploadError;
pub use events::{EventBus, EventKind, SubscriptionId, UploadEvent};
pub use remote::{RemoteCoordinator, RequestError, RetryPolicy, StatusClass};
pub use session::{SessionState, UploadOutcome, UploadSession};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, TransportError};
