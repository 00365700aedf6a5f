//! Upload session: identify, verify, transfer, merge.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chunkup_protocol::{IdentityQuery, ProgressSnapshot};
use chunkup_transfer::{
    ChunkPlan, ChunkSource, FileChunkSource, IdentifierResolver, IdentifierStrategy,
    ProgressTracker,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, info, info_span, warn};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::{EventBus, EventKind, SubscriptionId, UploadEvent};
use crate::pipeline::{ChunkPipeline, Control, PipelineContext};
use crate::remote::{RemoteCoordinator, RequestError, RetryPolicy};
use crate::transport::HttpTransport;

/// Phase of the current or last upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Identifying,
    Verifying,
    Transferring,
    Merging,
    Succeeded,
    Failed,
}

/// How a successful attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Chunks were sent (possibly none) and merged.
    Uploaded,
    /// The server already had the merged file.
    AlreadyStored,
}

struct SessionInner {
    state: SessionState,
    running: bool,
    paused: bool,
    identifier: Option<String>,
    progress: ProgressSnapshot,
    control: Option<mpsc::UnboundedSender<Control>>,
    cancel: Option<CancellationToken>,
}

fn lock(inner: &Mutex<SessionInner>) -> MutexGuard<'_, SessionInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks one running attempt. Dropping it before [`Attempt::finish`]
/// (the `upload()` future was dropped) stops the attempt's work and puts the
/// session back to `Idle`, so a later `upload()` can start.
struct Attempt<'a> {
    session: &'a UploadSession,
    cancel: CancellationToken,
    finished: bool,
}

impl Attempt<'_> {
    fn finish(mut self, result: &Result<UploadOutcome, UploadError>) {
        self.finished = true;
        self.session.finish_attempt(result);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.cancel.cancel();
        {
            let inner = &mut *lock(&self.session.inner);
            inner.running = false;
            inner.paused = false;
            inner.control = None;
            inner.cancel = None;
            inner.identifier = None;
            inner.state = SessionState::Idle;
        }
        self.session
            .span
            .in_scope(|| warn!("upload attempt dropped before it finished"));
        self.session.publish_idle();
    }
}

/// One file, one server, any number of upload attempts.
///
/// `upload()` runs an attempt to its end; `pause`, `resume` and `cancel` may
/// be called from other tasks while it runs.
pub struct UploadSession {
    config: Arc<UploaderConfig>,
    source: Arc<dyn ChunkSource>,
    plan: ChunkPlan,
    file_name: String,
    salt: String,
    bus: EventBus,
    remote: RemoteCoordinator,
    span: Span,
    inner: Arc<Mutex<SessionInner>>,
}

impl UploadSession {
    /// Creates a session for `source`. Fails if the config is invalid.
    pub fn new(
        config: UploaderConfig,
        source: Arc<dyn ChunkSource>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let plan = ChunkPlan::new(source.size(), config.chunk_size)
            .map_err(|e| UploadError::Config(e.to_string()))?;
        let salt = uuid::Uuid::new_v4().to_string();
        let file_name = config.file_name.clone();
        let bus = EventBus::new();
        let remote = RemoteCoordinator::new(transport, RetryPolicy::from_config(&config), bus.clone());
        let span = info_span!("upload", file = %file_name, session = %salt);

        let inner = Arc::new(Mutex::new(SessionInner {
            state: SessionState::Idle,
            running: false,
            paused: false,
            identifier: None,
            progress: ProgressSnapshot::idle(plan.total_size()),
            control: None,
            cancel: None,
        }));
        let latest = Arc::clone(&inner);
        bus.subscribe(EventKind::Progress, move |event| {
            if let UploadEvent::Progress(snapshot) = event {
                lock(&latest).progress = snapshot.clone();
            }
        });

        Ok(Self {
            config: Arc::new(config),
            source,
            plan,
            file_name,
            salt,
            bus,
            remote,
            span,
            inner,
        })
    }

    /// Opens `path` and creates a session for it.
    ///
    /// An empty `file_name` in the config is replaced by the path's file name.
    pub async fn for_file(
        mut config: UploaderConfig,
        path: impl AsRef<Path>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, UploadError> {
        let path = path.as_ref();
        if config.file_name.is_empty()
            && let Some(name) = path.file_name()
        {
            config.file_name = name.to_string_lossy().into_owned();
        }
        let source = FileChunkSource::open(path)
            .await
            .map_err(|e| UploadError::Config(format!("{}: {e}", path.display())))?;
        Self::new(config, Arc::new(source), transport)
    }

    /// Nests the session's log span under `parent`.
    pub fn with_span(mut self, parent: &Span) -> Self {
        self.span = info_span!(
            parent: parent,
            "upload",
            file = %self.file_name,
            session = %self.salt
        );
        self
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.inner).paused
    }

    /// Identifier of the current or last successful attempt.
    pub fn identifier(&self) -> Option<String> {
        lock(&self.inner).identifier.clone()
    }

    /// Last published progress snapshot.
    pub fn progress(&self) -> ProgressSnapshot {
        lock(&self.inner).progress.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Returns a receiver fed with every event from now on.
    pub fn events(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        self.bus.channel().1
    }

    /// Runs one upload attempt.
    ///
    /// Fatal errors publish `fail` then `complete` before they are returned.
    /// A cancelled attempt returns [`UploadError::Cancelled`] without events.
    pub async fn upload(&self) -> Result<UploadOutcome, UploadError> {
        let (attempt, control) = self.begin_attempt()?;
        let result = self
            .run_attempt(&attempt.cancel, control)
            .instrument(self.span.clone())
            .await;
        attempt.finish(&result);
        result
    }

    /// Aborts in-flight chunk uploads; their chunks are sent again on resume.
    pub fn pause(&self) {
        let inner = &mut *lock(&self.inner);
        if !inner.running || inner.paused {
            return;
        }
        inner.paused = true;
        if let Some(control) = &inner.control {
            let _ = control.send(Control::Pause);
        }
    }

    pub fn resume(&self) {
        let inner = &mut *lock(&self.inner);
        if !inner.paused {
            return;
        }
        inner.paused = false;
        if let Some(control) = &inner.control {
            let _ = control.send(Control::Resume);
        }
    }

    /// Stops the running attempt and resets all progress. The next
    /// `upload()` starts over with a fresh identifier.
    ///
    /// A running attempt publishes the idle snapshot itself once its
    /// transfer loop has stopped.
    pub fn cancel(&self) {
        let running = {
            let inner = &mut *lock(&self.inner);
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            if let Some(control) = inner.control.take() {
                let _ = control.send(Control::Cancel);
            }
            inner.paused = false;
            if !inner.running {
                inner.state = SessionState::Idle;
                inner.identifier = None;
            }
            inner.running
        };
        self.span.in_scope(|| info!("upload cancelled"));
        if !running {
            self.publish_idle();
        }
    }

    fn publish_idle(&self) {
        self.bus.publish(&UploadEvent::Progress(ProgressSnapshot::idle(
            self.plan.total_size(),
        )));
    }

    fn begin_attempt(
        &self,
    ) -> Result<(Attempt<'_>, mpsc::UnboundedReceiver<Control>), UploadError> {
        let inner = &mut *lock(&self.inner);
        if inner.running {
            return Err(UploadError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        inner.running = true;
        inner.paused = false;
        inner.state = SessionState::Identifying;
        inner.identifier = None;
        inner.control = Some(tx);
        inner.cancel = Some(cancel.clone());
        let attempt = Attempt {
            session: self,
            cancel,
            finished: false,
        };
        Ok((attempt, rx))
    }

    fn set_state(&self, state: SessionState) {
        lock(&self.inner).state = state;
    }

    fn pipeline_context(&self, identifier: String) -> PipelineContext {
        PipelineContext {
            plan: self.plan,
            identifier,
            file_name: self.file_name.clone(),
            upload_url: self.config.upload_url.clone(),
            query: Arc::new(self.config.query.clone()),
            headers: Arc::new(self.config.headers.clone()),
            max_concurrency: self.config.max_concurrency,
            max_load_chunks: self.config.max_load_chunks(),
            source: Arc::clone(&self.source),
            remote: self.remote.clone(),
            bus: self.bus.clone(),
        }
    }

    async fn run_attempt(
        &self,
        cancel: &CancellationToken,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) -> Result<UploadOutcome, UploadError> {
        let config = &self.config;
        let mut progress = ProgressTracker::new(self.plan.total_size());
        self.bus
            .publish(&UploadEvent::Progress(progress.reset(self.plan.total_size())));

        // 1. Identify
        let strategy = if config.test_chunks {
            IdentifierStrategy::ContentHash
        } else {
            IdentifierStrategy::Generated {
                generator: config.generate_identifier.clone(),
                salt: self.salt.clone(),
            }
        };
        let resolver = IdentifierResolver::new(strategy, config.hash_algorithm, config.max_memory);
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            r = resolver.resolve(self.source.as_ref(), &self.plan) => r.map_err(UploadError::Identifier)?,
        };
        let identifier = resolved.identifier;
        info!(identifier = %identifier, chunks = self.plan.total_chunks(), "identifier resolved");
        lock(&self.inner).identifier = Some(identifier.clone());

        let query = IdentityQuery::new(identifier.as_str(), self.file_name.as_str());
        let mut pipeline = ChunkPipeline::new(self.pipeline_context(identifier), cancel);
        pipeline.preload(resolved.cached);

        // 2. Verify
        if config.test_chunks {
            self.set_state(SessionState::Verifying);
            let verify = self
                .remote
                .verify(&config.verify_url, &query, cancel)
                .await
                .map_err(|e| request_error(e, UploadError::Verification))?;
            if !verify.need_upload {
                info!("server already stores this file");
                self.bus.publish(&UploadEvent::Progress(progress.complete()));
                return Ok(UploadOutcome::AlreadyStored);
            }
            pipeline.mark_uploaded(&verify.uploaded_chunks);
        }

        // 3. Transfer
        if pipeline.need_send().is_empty() {
            info!("no chunks to send");
            self.bus.publish(&UploadEvent::Progress(progress.complete()));
        } else {
            progress.begin(self.plan.bytes_for(pipeline.need_send()));
            let start_paused = {
                let inner = &mut *lock(&self.inner);
                inner.state = SessionState::Transferring;
                inner.paused
            };
            pipeline.run(&mut progress, &mut control, start_paused).await?;
        }
        drop(pipeline);

        // 4. Merge
        self.set_state(SessionState::Merging);
        self.remote
            .merge(&config.merge_url, &query, cancel)
            .await
            .map_err(|e| request_error(e, UploadError::Merge))?;
        info!("merge accepted");
        Ok(UploadOutcome::Uploaded)
    }

    fn finish_attempt(&self, result: &Result<UploadOutcome, UploadError>) {
        let _enter = self.span.enter();
        {
            let inner = &mut *lock(&self.inner);
            inner.running = false;
            inner.paused = false;
            inner.control = None;
            inner.cancel = None;
            inner.state = match result {
                Ok(_) => SessionState::Succeeded,
                Err(UploadError::Cancelled) => {
                    inner.identifier = None;
                    SessionState::Idle
                }
                Err(_) => SessionState::Failed,
            };
        }

        match result {
            Ok(outcome) => {
                info!(?outcome, "upload succeeded");
                self.bus.publish(&UploadEvent::Success);
                self.bus.publish(&UploadEvent::Complete);
            }
            Err(UploadError::Cancelled) => self.publish_idle(),
            Err(e) => {
                warn!(error = %e, code = ?e.fail_code(), "upload failed");
                if let Some(info) = e.fail_info() {
                    self.bus.publish(&UploadEvent::Fail(info));
                }
                self.bus.publish(&UploadEvent::Complete);
            }
        }
    }
}

/// Maps a request failure, treating aborts as cancellation.
fn request_error(e: RequestError, fatal: fn(RequestError) -> UploadError) -> UploadError {
    if e.is_aborted() {
        UploadError::Cancelled
    } else {
        fatal(e)
    }
}
