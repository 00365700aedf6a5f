use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Query string pairs in the order they are sent.
pub type QueryPairs = Vec<(String, String)>;

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

/// Names an upload on the verify and merge endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityQuery {
    pub identifier: String,
    pub file_name: String,
}

impl IdentityQuery {
    pub fn new(identifier: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            file_name: file_name.into(),
        }
    }

    /// Returns the query pairs for this request.
    pub fn to_query(&self) -> QueryPairs {
        vec![
            ("identifier".into(), self.identifier.clone()),
            ("fileName".into(), self.file_name.clone()),
        ]
    }
}

/// Metadata sent alongside one raw chunk body.
///
/// `chunk_size` is the length of *this* chunk, which is shorter than the
/// configured chunk size for the last chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadQuery {
    pub identifier: String,
    pub index: u64,
    pub chunk_size: u64,
    pub file_name: String,
    pub total_chunks: u64,
    pub total_size: u64,
}

impl ChunkUploadQuery {
    /// Returns the query pairs for this chunk followed by `extra`.
    ///
    /// Extra pairs never override the chunk metadata.
    pub fn to_query(&self, extra: &BTreeMap<String, String>) -> QueryPairs {
        let mut pairs: QueryPairs = vec![
            ("identifier".into(), self.identifier.clone()),
            ("index".into(), self.index.to_string()),
            ("chunkSize".into(), self.chunk_size.to_string()),
            ("fileName".into(), self.file_name.clone()),
            ("totalChunks".into(), self.total_chunks.to_string()),
            ("totalSize".into(), self.total_size.to_string()),
        ];
        for (key, value) in extra {
            if pairs.iter().any(|(k, _)| k == key) {
                continue;
            }
            pairs.push((key.clone(), value.clone()));
        }
        pairs
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// Answer of the verify endpoint.
///
/// `need_upload == false` means the merged object already exists on the
/// server. Otherwise `uploaded_chunks` lists the indices already stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub need_upload: bool,
    #[serde(default)]
    pub uploaded_chunks: Vec<u64>,
}

impl VerifyResponse {
    /// Decodes a verify response body.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ProtocolError::EmptyBody);
        }
        Ok(serde_json::from_slice(body)?)
    }
}
