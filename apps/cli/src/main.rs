//! chunkup: resumable chunked upload of one file.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use chunkup_protocol::ProgressSnapshot;
use chunkup_uploader::{
    EventKind, ReqwestTransport, UploadError, UploadEvent, UploadOutcome, UploadSession,
    UploaderConfig,
};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chunkup", version, about = "Upload a file in resumable chunks")]
struct Cli {
    /// File to upload.
    file: PathBuf,

    /// TOML file with uploader settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    verify_url: Option<String>,

    #[arg(long)]
    upload_url: Option<String>,

    #[arg(long)]
    merge_url: Option<String>,

    /// Name reported to the server (defaults to the file name).
    #[arg(long)]
    name: Option<String>,

    /// Chunk size in bytes.
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Maximum concurrent chunk uploads.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Retries per request after the first attempt.
    #[arg(long)]
    retries: Option<u32>,

    /// Skip content hashing and server verification.
    #[arg(long)]
    no_test_chunks: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            verify_url: self.verify_url.clone(),
            upload_url: self.upload_url.clone(),
            merge_url: self.merge_url.clone(),
            file_name: self.name.clone(),
            chunk_size: self.chunk_size,
            max_concurrency: self.concurrency,
            max_chunk_retries: self.retries,
            no_test_chunks: self.no_test_chunks,
            verbose: self.verbose,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = config::load(cli.config.as_deref())?;
    cli.overrides().apply(&mut config);

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        file = %cli.file.display(),
        "starting chunkup"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.file, config))
}

async fn run(file: PathBuf, config: UploaderConfig) -> anyhow::Result<()> {
    let transport = Arc::new(ReqwestTransport::new()?);
    let session = Arc::new(UploadSession::for_file(config, &file, transport).await?);

    session.subscribe(EventKind::Progress, |event| {
        if let UploadEvent::Progress(snapshot) = event {
            info!("{}", render_progress(snapshot));
        }
    });
    session.subscribe(EventKind::Retry, |event| {
        if let UploadEvent::Retry {
            status,
            url,
            attempt,
        } = event
        {
            warn!(?status, attempt, url = %url, "request retried");
        }
    });

    let interrupt = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling upload");
                session.cancel();
            }
        })
    };

    let result = session.upload().await;
    interrupt.abort();

    match result {
        Ok(UploadOutcome::Uploaded) => {
            info!(identifier = ?session.identifier(), "upload finished");
        }
        Ok(UploadOutcome::AlreadyStored) => {
            info!(identifier = ?session.identifier(), "server already has this file");
        }
        Err(UploadError::Cancelled) => warn!("upload cancelled"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// One-line progress summary, e.g. `42% 4.2 MiB/10.0 MiB at 1.1 MiB/s, eta 5s`.
fn render_progress(p: &ProgressSnapshot) -> String {
    let eta = match p.eta() {
        Some(eta) => format!("{}s", eta.as_secs()),
        None => "unknown".to_string(),
    };
    format!(
        "{}% {}/{} at {}/s, eta {}",
        p.percent,
        human_bytes(p.uploaded_size as f64),
        human_bytes(p.total_size as f64),
        human_bytes(p.average_speed),
        eta
    )
}

fn human_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
