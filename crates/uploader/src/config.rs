//! Uploader configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chunkup_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MEMORY, HashAlgorithm, IdentifierGenerator};
use serde::{Deserialize, Deserializer};

use crate::error::UploadError;

/// Settings for one upload session. Built once, never mutated afterwards.
///
/// Durations are written in milliseconds (`timeout_ms`,
/// `chunk_retry_interval_ms`) in serialized form.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Name reported to the server; defaults to the source file name.
    pub file_name: String,
    pub verify_url: String,
    pub upload_url: String,
    pub merge_url: String,
    pub chunk_size: u64,
    /// Budget for chunks held in memory, hashing cache included.
    pub max_memory: u64,
    pub max_concurrency: usize,
    /// Retries per request after the first attempt.
    pub max_chunk_retries: u32,
    #[serde(rename = "chunk_retry_interval_ms", deserialize_with = "duration_ms")]
    pub chunk_retry_interval: Duration,
    #[serde(rename = "timeout_ms", deserialize_with = "duration_ms")]
    pub timeout: Duration,
    pub success_status: Vec<u16>,
    /// Statuses that fail immediately; anything else not in
    /// `success_status` is retried.
    pub fail_status: Vec<u16>,
    /// Hash the content and verify with the server before sending.
    pub test_chunks: bool,
    /// Extra query parameters for every chunk upload.
    pub query: BTreeMap<String, String>,
    /// Extra headers for every chunk upload.
    pub headers: BTreeMap<String, String>,
    pub verbose: bool,
    pub hash_algorithm: HashAlgorithm,
    /// Identifier override used when `test_chunks` is off.
    #[serde(skip)]
    pub generate_identifier: Option<IdentifierGenerator>,
}

fn duration_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            file_name: String::new(),
            verify_url: String::new(),
            upload_url: String::new(),
            merge_url: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_memory: DEFAULT_MAX_MEMORY,
            max_concurrency: 5,
            max_chunk_retries: 0,
            chunk_retry_interval: Duration::ZERO,
            timeout: Duration::from_secs(60),
            success_status: vec![200, 201, 202],
            fail_status: vec![404, 415, 500, 501],
            test_chunks: true,
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            verbose: false,
            hash_algorithm: HashAlgorithm::default(),
            generate_identifier: None,
        }
    }
}

impl fmt::Debug for UploaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploaderConfig")
            .field("file_name", &self.file_name)
            .field("verify_url", &self.verify_url)
            .field("upload_url", &self.upload_url)
            .field("merge_url", &self.merge_url)
            .field("chunk_size", &self.chunk_size)
            .field("max_memory", &self.max_memory)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_chunk_retries", &self.max_chunk_retries)
            .field("chunk_retry_interval", &self.chunk_retry_interval)
            .field("timeout", &self.timeout)
            .field("success_status", &self.success_status)
            .field("fail_status", &self.fail_status)
            .field("test_chunks", &self.test_chunks)
            .field("query", &self.query)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("verbose", &self.verbose)
            .field("hash_algorithm", &self.hash_algorithm)
            .field(
                "generate_identifier",
                &self.generate_identifier.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl UploaderConfig {
    /// Config with the three endpoint URLs set and defaults elsewhere.
    pub fn with_urls(
        verify_url: impl Into<String>,
        upload_url: impl Into<String>,
        merge_url: impl Into<String>,
    ) -> Self {
        Self {
            verify_url: verify_url.into(),
            upload_url: upload_url.into(),
            merge_url: merge_url.into(),
            ..Self::default()
        }
    }

    /// Checks the settings an upload cannot run without.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size must be greater than zero".into()));
        }
        if self.max_concurrency == 0 {
            return Err(UploadError::Config(
                "max_concurrency must be greater than zero".into(),
            ));
        }
        if self.upload_url.is_empty() {
            return Err(UploadError::Config("upload_url is required".into()));
        }
        if self.merge_url.is_empty() {
            return Err(UploadError::Config("merge_url is required".into()));
        }
        if self.test_chunks && self.verify_url.is_empty() {
            return Err(UploadError::Config(
                "verify_url is required when test_chunks is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Chunks that may sit in memory waiting for dispatch; at least one.
    pub fn max_load_chunks(&self) -> usize {
        let chunks = self.max_memory / self.chunk_size.max(1);
        usize::try_from(chunks).unwrap_or(usize::MAX).max(1)
    }
}
