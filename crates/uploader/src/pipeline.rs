//! Bounded read-ahead and concurrent chunk dispatch.
//!
//! The pipeline is a single control loop. Disk reads and chunk uploads run as
//! spawned tasks that report back over a channel; every change to the chunk
//! index sets happens inside [`ChunkPipeline::run`], so completions arriving
//! in any order cannot break the bookkeeping.
//!
//! Each index lives in exactly one place at a time: the read queue, the set
//! of reads in progress, the ready queue, the in-flight map, or the
//! confirmed set.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chunkup_protocol::ChunkUploadQuery;
use chunkup_transfer::{ChunkPlan, ChunkSource, ProgressTracker, ReadyChunk, TransferError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::error::UploadError;
use crate::events::{EventBus, UploadEvent};
use crate::remote::{RemoteCoordinator, RequestError};

/// Commands sent to a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Cancel,
}

/// Everything a pipeline needs to read and send chunks.
#[derive(Clone)]
pub struct PipelineContext {
    pub plan: ChunkPlan,
    pub identifier: String,
    pub file_name: String,
    pub upload_url: String,
    pub query: Arc<BTreeMap<String, String>>,
    pub headers: Arc<BTreeMap<String, String>>,
    pub max_concurrency: usize,
    pub max_load_chunks: usize,
    pub source: Arc<dyn ChunkSource>,
    pub remote: RemoteCoordinator,
    pub bus: EventBus,
}

struct InFlightTask {
    id: u64,
    cancel: CancellationToken,
    length: u64,
}

enum Completion {
    Read {
        index: u64,
        task: u64,
        result: Result<ReadyChunk, TransferError>,
    },
    Upload {
        index: u64,
        task: u64,
        result: Result<(), RequestError>,
    },
}

/// Transfers every chunk the server does not have yet.
pub struct ChunkPipeline {
    ctx: PipelineContext,
    need_read: VecDeque<u64>,
    need_send: BTreeSet<u64>,
    confirmed: BTreeSet<u64>,
    ready: VecDeque<ReadyChunk>,
    reading: HashMap<u64, u64>,
    in_flight: HashMap<u64, InFlightTask>,
    uploading: bool,
    next_task: u64,
    tasks: JoinSet<()>,
    token: CancellationToken,
    _guard: DropGuard,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl ChunkPipeline {
    /// Creates a pipeline with every chunk of the plan still to send.
    ///
    /// All spawned work stops when `parent` is cancelled or the pipeline is
    /// dropped.
    pub fn new(ctx: PipelineContext, parent: &CancellationToken) -> Self {
        let total = ctx.plan.total_chunks();
        let token = parent.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            need_read: (0..total).collect(),
            need_send: (0..total).collect(),
            confirmed: BTreeSet::new(),
            ready: VecDeque::new(),
            reading: HashMap::new(),
            in_flight: HashMap::new(),
            uploading: false,
            next_task: 0,
            tasks: JoinSet::new(),
            _guard: token.clone().drop_guard(),
            token,
            tx,
            rx,
            ctx,
        }
    }

    /// Records chunks the server already stores.
    pub fn mark_uploaded(&mut self, indices: &[u64]) {
        for &index in indices {
            if index >= self.ctx.plan.total_chunks() {
                continue;
            }
            self.need_send.remove(&index);
            self.confirmed.insert(index);
        }
        self.need_read.retain(|i| !self.confirmed.contains(i));
        self.ready.retain(|c| !self.confirmed.contains(&c.index()));
    }

    /// Queues chunks already read while hashing so they are not read again.
    pub fn preload(&mut self, chunks: Vec<ReadyChunk>) {
        for chunk in chunks {
            let index = chunk.index();
            if !self.need_send.contains(&index) {
                continue;
            }
            if let Some(pos) = self.need_read.iter().position(|&i| i == index) {
                self.need_read.remove(pos);
                self.ready.push_back(chunk);
            }
        }
    }

    /// Indices still waiting for a successful upload.
    pub fn need_send(&self) -> &BTreeSet<u64> {
        &self.need_send
    }

    /// Chunks held in memory waiting for a network slot.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Runs until every needed chunk is confirmed.
    ///
    /// Returns `Cancelled` on [`Control::Cancel`], on parent cancellation or
    /// when the control channel closes. Any read failure or non-aborted
    /// upload failure tears down all in-flight work and is returned.
    ///
    /// On every error return the spawned tasks have already exited, so no
    /// event from this transfer is published after `run` returns.
    pub async fn run(
        &mut self,
        progress: &mut ProgressTracker,
        control: &mut mpsc::UnboundedReceiver<Control>,
        start_paused: bool,
    ) -> Result<(), UploadError> {
        let token = self.token.clone();
        self.uploading = !start_paused;
        info!(
            chunks = self.need_send.len(),
            concurrency = self.ctx.max_concurrency,
            load_chunks = self.ctx.max_load_chunks,
            paused = start_paused,
            "transfer started"
        );
        self.pump();

        while !self.need_send.is_empty() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.abort_all().await;
                    return Err(UploadError::Cancelled);
                }
                msg = control.recv() => match msg {
                    Some(Control::Pause) => self.pause(),
                    Some(Control::Resume) => self.resume(progress),
                    Some(Control::Cancel) | None => {
                        self.abort_all().await;
                        return Err(UploadError::Cancelled);
                    }
                },
                Some(done) = self.rx.recv() => {
                    if let Err(e) = self.on_completion(done, progress) {
                        self.abort_all().await;
                        return Err(e);
                    }
                }
            }
            while self.tasks.try_join_next().is_some() {}
        }

        self.uploading = false;
        debug!(confirmed = self.confirmed.len(), "all chunks confirmed");
        Ok(())
    }

    fn on_completion(
        &mut self,
        done: Completion,
        progress: &mut ProgressTracker,
    ) -> Result<(), UploadError> {
        match done {
            Completion::Read {
                index,
                task,
                result,
            } => {
                if self.reading.get(&index) != Some(&task) {
                    return Ok(());
                }
                self.reading.remove(&index);
                let chunk = result.map_err(|source| UploadError::ChunkRead { index, source })?;
                debug!(index, len = chunk.len(), "chunk read");
                self.ready.push_back(chunk);
                self.pump();
            }
            Completion::Upload {
                index,
                task,
                result,
            } => {
                let current = self.in_flight.get(&index).is_some_and(|t| t.id == task);
                if !current {
                    return Ok(());
                }
                let Some(flight) = self.in_flight.remove(&index) else {
                    return Ok(());
                };
                match result {
                    Ok(()) => {
                        self.need_send.remove(&index);
                        self.confirmed.insert(index);
                        debug!(index, remaining = self.need_send.len(), "chunk uploaded");
                        let snapshot = progress.record(flight.length);
                        self.ctx.bus.publish(&UploadEvent::Progress(snapshot));
                        self.pump();
                    }
                    Err(RequestError::Aborted) => {
                        self.need_read.push_back(index);
                    }
                    Err(source) => return Err(UploadError::ChunkTransport { index, source }),
                }
            }
        }
        Ok(())
    }

    fn pump(&mut self) {
        self.read_ahead();
        self.dispatch();
        self.read_ahead();
    }

    fn read_ahead(&mut self) {
        if !self.uploading {
            return;
        }
        while self.ready.len() + self.reading.len() < self.ctx.max_load_chunks {
            let Some(index) = self.need_read.pop_front() else {
                break;
            };
            if self.confirmed.contains(&index) {
                continue;
            }
            self.spawn_read(index);
        }
    }

    fn dispatch(&mut self) {
        while self.uploading && self.in_flight.len() < self.ctx.max_concurrency {
            let Some(chunk) = self.ready.pop_front() else {
                break;
            };
            if self.confirmed.contains(&chunk.index()) {
                debug!(index = chunk.index(), "skipping confirmed chunk");
                continue;
            }
            self.spawn_upload(chunk);
        }
    }

    fn pause(&mut self) {
        if !self.uploading {
            return;
        }
        self.uploading = false;
        let mut aborted: Vec<u64> = self.in_flight.keys().copied().collect();
        aborted.sort_unstable();
        for (_, task) in self.in_flight.drain() {
            task.cancel.cancel();
        }
        info!(aborted = aborted.len(), "transfer paused");
        self.need_read.extend(aborted);
    }

    fn resume(&mut self, progress: &mut ProgressTracker) {
        if self.uploading {
            return;
        }
        self.uploading = true;
        progress.resume_clock();
        self.ctx.bus.publish(&UploadEvent::Progress(progress.snapshot()));
        info!(remaining = self.need_send.len(), "transfer resumed");
        self.pump();
    }

    /// Cancels all spawned work and waits until every task has exited.
    async fn abort_all(&mut self) {
        self.uploading = false;
        self.token.cancel();
        self.in_flight.clear();
        self.reading.clear();
        self.ready.clear();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }

    fn task_id(&mut self) -> u64 {
        self.next_task += 1;
        self.next_task
    }

    fn spawn_read(&mut self, index: u64) {
        let task = self.task_id();
        self.reading.insert(index, task);

        let plan = self.ctx.plan;
        let source = Arc::clone(&self.ctx.source);
        let tx = self.tx.clone();
        let token = self.token.clone();
        self.tasks.spawn(async move {
            let read = async {
                let descriptor = plan.descriptor(index)?;
                let payload = source
                    .read_range(descriptor.offset, descriptor.length)
                    .await?;
                Ok::<_, TransferError>(ReadyChunk::new(descriptor, payload))
            };
            tokio::select! {
                _ = token.cancelled() => {}
                result = read => {
                    let _ = tx.send(Completion::Read { index, task, result });
                }
            }
        });
    }

    fn spawn_upload(&mut self, chunk: ReadyChunk) {
        let task = self.task_id();
        let index = chunk.index();
        let length = chunk.len();
        let cancel = self.token.child_token();
        self.in_flight.insert(
            index,
            InFlightTask {
                id: task,
                cancel: cancel.clone(),
                length,
            },
        );

        let query = ChunkUploadQuery {
            identifier: self.ctx.identifier.clone(),
            index,
            chunk_size: length,
            file_name: self.ctx.file_name.clone(),
            total_chunks: self.ctx.plan.total_chunks(),
            total_size: self.ctx.plan.total_size(),
        }
        .to_query(&self.ctx.query);
        let remote = self.ctx.remote.clone();
        let url = self.ctx.upload_url.clone();
        let headers = Arc::clone(&self.ctx.headers);
        let tx = self.tx.clone();

        debug!(index, len = length, in_flight = self.in_flight.len(), "dispatching chunk");
        self.tasks.spawn(async move {
            let result = remote
                .upload_chunk(&url, query, &headers, chunk.payload, &cancel)
                .await;
            let _ = tx.send(Completion::Upload {
                index,
                task,
                result,
            });
        });
    }
}
