//! CLI configuration.
//!
//! Settings come from an optional TOML file whose keys mirror
//! [`UploaderConfig`], then command-line flags override them:
//!
//! ```toml
//! verify_url = "http://localhost:3000/verify"
//! upload_url = "http://localhost:3000/upload"
//! merge_url = "http://localhost:3000/merge"
//! chunk_size = 5242880
//! max_concurrency = 5
//! timeout_ms = 60000
//!
//! [query]
//! token = "abc"
//! ```

use std::path::Path;

use chunkup_uploader::UploaderConfig;

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub verify_url: Option<String>,
    pub upload_url: Option<String>,
    pub merge_url: Option<String>,
    pub file_name: Option<String>,
    pub chunk_size: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub max_chunk_retries: Option<u32>,
    pub no_test_chunks: bool,
    pub verbose: bool,
}

/// Reads `path`, or returns the defaults when no file is given.
pub fn load(path: Option<&Path>) -> anyhow::Result<UploaderConfig> {
    let Some(path) = path else {
        return Ok(UploaderConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    let config: UploaderConfig = toml::from_str(&content)?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

impl Overrides {
    pub fn apply(self, config: &mut UploaderConfig) {
        if let Some(url) = self.verify_url {
            config.verify_url = url;
        }
        if let Some(url) = self.upload_url {
            config.upload_url = url;
        }
        if let Some(url) = self.merge_url {
            config.merge_url = url;
        }
        if let Some(name) = self.file_name {
            config.file_name = name;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
        if let Some(n) = self.max_chunk_retries {
            config.max_chunk_retries = n;
        }
        if self.no_test_chunks {
            config.test_chunks = false;
        }
        if self.verbose {
            config.verbose = true;
        }
    }
}
