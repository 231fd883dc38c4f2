//! Per-host coordinator owning a pool of workers.
//!
//! A runner sits between the Master and the workers of one host:
//!
//! ```text
//!                 next / previous / result / debug / stdout
//!   Master ◄──────────────────────────────────────────── Runner
//!          ────────────────────────────────────────────►   │
//!                 configure / file                         │  process / close
//!                                                          ▼
//!                                              Worker A:0 .. A:n-1
//! ```
//!
//! # Lifecycle
//!
//! 1. [`serve`] reads the `configure` handshake from the Master.
//! 2. Preparation steps run once per slot ([`prepare`]).
//! 3. The default framework's environment is loaded once.
//! 4. `process_count` workers are started with that framework.
//! 5. The dispatch loop hands files to ready workers until the queue drains,
//!    the abort token is cancelled, or the Master goes away. After an abort,
//!    files already running are allowed to report before the runner exits.
//!
//! A worker asking for work when the next file belongs to another framework
//! is closed and replaced, in the same slot, by a worker for that framework;
//! the file goes back to the front of the global queue. A worker that dies is
//! not replaced.

pub mod output;
pub mod pool;
pub mod prepare;
pub mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, wait_any};
use crate::framework::{FrameworkError, FrameworkRegistry, FrameworkShim};
use crate::process::{ProcessError, ProcessHandle, reap_all};
use crate::protocol::{FileResult, Message, RunnerSettings};

pub use pool::{Worker, WorkerPool};
pub use worker::{CommandLauncher, WorkerLauncher, WorkerRequest};

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that stop a runner before it starts dispatching.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The first message from the Master was not `configure`.
    #[error("Expected a configure message from the master, got {0}")]
    Handshake(&'static str),

    /// The Master closed the channel before the handshake.
    #[error("Master closed the channel before configuring the runner")]
    NotConfigured,

    /// A preparation step failed for at least one slot.
    #[error("Preparation step {step} failed:\n{output}")]
    Prepare { step: String, output: String },

    #[error(transparent)]
    Framework(#[from] FrameworkError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a runner stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// Every worker was closed because the queue ran out, or died.
    Drained,
    /// The abort token was cancelled and every running file has reported.
    Aborted,
    /// The channel to the Master reached end-of-stream.
    MasterLost,
}

/// A readable channel found by the dispatch loop.
#[derive(Debug, Clone, Copy)]
enum Source {
    Upstream,
    Worker(usize),
}

/// Reads the handshake from `upstream` and runs a runner until it stops.
///
/// This is the whole body of `nitra runner`.
pub async fn serve<L: WorkerLauncher>(
    mut upstream: Channel,
    launcher: L,
    abort: CancellationToken,
) -> RunnerResult<RunnerExit> {
    let (id, settings) = match upstream.read().await {
        Some(Message::Configure {
            runner_id,
            settings,
        }) => (runner_id, settings),
        Some(other) => return Err(RunnerError::Handshake(other.command())),
        None => return Err(RunnerError::NotConfigured),
    };

    let registry = FrameworkRegistry::from_config(&settings.frameworks)?;
    debug!(
        "Runner {} configured: {} workers, {} environment",
        id, settings.process_count, settings.environment
    );

    Runner::new(id, settings, registry, upstream, launcher)
        .with_abort(abort)
        .run()
        .await
}

/// Coordinator for the workers of one host.
pub struct Runner<L> {
    id: String,
    settings: RunnerSettings,
    registry: FrameworkRegistry,
    upstream: Channel,
    launcher: L,
    abort: CancellationToken,
    pool: WorkerPool,
    /// Handles of workers that left the pool, reaped at shutdown.
    retired: Vec<ProcessHandle>,
}

impl<L: WorkerLauncher> Runner<L> {
    pub fn new(
        id: impl Into<String>,
        settings: RunnerSettings,
        registry: FrameworkRegistry,
        upstream: Channel,
        launcher: L,
    ) -> Self {
        Self {
            id: id.into(),
            settings,
            registry,
            upstream,
            launcher,
            abort: CancellationToken::new(),
            pool: WorkerPool::new(),
            retired: Vec::new(),
        }
    }

    /// Sets the cooperative abort token.
    ///
    /// Once cancelled, the runner stops asking for files, closes idle workers
    /// and waits for the files still running to report.
    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Prepares the host, starts the workers and dispatches until done.
    pub async fn run(mut self) -> RunnerResult<RunnerExit> {
        if let Err(e) = self.start().await {
            self.shutdown(RunnerExit::Drained).await;
            return Err(e);
        }

        let exit = self.dispatch().await;
        info!("Runner {} stopped: {:?}", self.id, exit);

        self.shutdown(exit).await;
        Ok(exit)
    }

    async fn start(&mut self) -> RunnerResult<()> {
        for step in prepare::steps(&self.settings.prepare) {
            self.diagnostic(format!("running {}...", step.name)).await;
            let text =
                prepare::run_step(&step, self.settings.process_count, &self.settings.environment)
                    .await?;
            self.relay(Message::Stdout {
                process: step.name,
                text,
            })
            .await;
        }

        let shim = self.registry.get(&self.settings.default_framework)?.clone();

        self.diagnostic(format!("loading {} environment...", shim.name())).await;
        if let Some(text) = shim.load_environment(&self.settings.environment).await? {
            self.relay(Message::Stdout {
                process: format!("{} initialisation", shim.name()),
                text,
            })
            .await;
        }

        if self.abort.is_cancelled() {
            return Ok(());
        }

        for slot in 0..self.settings.process_count {
            self.start_worker(slot, &shim).await;
        }

        if self.pool.is_empty() {
            warn!("Runner {} could not start any workers", self.id);
        }
        Ok(())
    }

    async fn start_worker(&mut self, slot: usize, shim: &Arc<dyn FrameworkShim>) {
        let request = WorkerRequest {
            runner_id: &self.id,
            slot,
            shim: &**shim,
            environment: &self.settings.environment,
        };

        match self.launcher.launch(request).await {
            Ok(spawned) => {
                debug!("Started worker {} with {}", request.label(), shim.name());
                self.pool.add(slot, shim.name(), spawned);
            }
            Err(e) => warn!("Failed to start worker {}: {}", request.label(), e),
        }
    }

    async fn dispatch(&mut self) -> RunnerExit {
        let abort = self.abort.clone();

        loop {
            if abort.is_cancelled() {
                // Idle workers are closed; busy ones may still report.
                self.retire_idle().await;
                if self.pool.is_empty() {
                    return RunnerExit::Aborted;
                }
            }
            if self.pool.is_empty() {
                return RunnerExit::Drained;
            }

            let ids = self.pool.ids();
            let ready = {
                let mut channels = self.pool.channels_mut();
                channels.push(&mut self.upstream);

                if abort.is_cancelled() {
                    wait_any(&mut channels).await
                } else {
                    tokio::select! {
                        ready = wait_any(&mut channels) => ready,
                        _ = abort.cancelled() => continue,
                    }
                }
            };

            let mut sources: Vec<Source> = ready
                .into_iter()
                .map(|index| ids.get(index).map_or(Source::Upstream, |&id| Source::Worker(id)))
                .collect();
            sources.sort_by_key(|source| !matches!(source, Source::Upstream));

            for source in sources {
                let exit = match source {
                    Source::Upstream => self.handle_upstream().await,
                    Source::Worker(id) => self.handle_worker(id).await,
                };
                if let Some(exit) = exit {
                    return exit;
                }
            }
        }
    }

    async fn handle_upstream(&mut self) -> Option<RunnerExit> {
        // A reply consumed by `assign` earlier in the same round.
        if !self.upstream.is_ready() {
            return None;
        }

        match self.upstream.read().await {
            None => {
                warn!("Runner {} lost its master, killing workers", self.id);
                Some(RunnerExit::MasterLost)
            }
            Some(message) => {
                debug!("Runner {} ignoring unexpected {} from master", self.id, message.command());
                None
            }
        }
    }

    async fn handle_worker(&mut self, id: usize) -> Option<RunnerExit> {
        let worker = self.pool.get_mut(id)?;
        let message = worker.channel.read().await;
        let loaded = worker.framework.clone();

        match message {
            None => {
                self.worker_died(id).await;
                None
            }
            Some(Message::Ready { framework }) => {
                if framework != loaded {
                    debug!("Worker {} reports {} but was started with {}", id, framework, loaded);
                }
                if self.abort.is_cancelled() {
                    self.retire(id).await;
                    return None;
                }
                self.assign(id, loaded).await
            }
            Some(Message::Result(result)) => self.forward_result(id, result).await,
            Some(message @ (Message::Debug { .. } | Message::Stdout { .. })) => {
                self.relay(message).await
            }
            Some(other) => {
                warn!("Ignoring unexpected {} from worker {}", other.command(), id);
                None
            }
        }
    }

    /// Serves a `ready` worker from the global queue.
    async fn assign(&mut self, id: usize, framework: String) -> Option<RunnerExit> {
        loop {
            if let Err(exit) = self.send_upstream(&Message::Next).await {
                return Some(exit);
            }

            let filename = match self.await_file().await {
                Ok(Some(filename)) => filename,
                Ok(None) => {
                    self.diagnostic(format!("queue drained, closing worker {}", id)).await;
                    self.retire(id).await;
                    return None;
                }
                Err(exit) => return Some(exit),
            };

            let shim = match self.registry.shim_for_file(&filename) {
                Ok(shim) => shim.clone(),
                Err(e) => {
                    warn!("Cannot run {}: {}", filename, e);
                    let mut result = FileResult::new(filename, format!("nitra: {}\n", e), 1);
                    result.failure_count = 1;
                    if let Err(exit) = self.send_upstream(&Message::Result(result)).await {
                        return Some(exit);
                    }
                    continue;
                }
            };

            return if shim.name() == framework {
                self.process(id, filename).await
            } else {
                self.switch(id, filename, shim).await
            };
        }
    }

    async fn await_file(&mut self) -> Result<Option<String>, RunnerExit> {
        loop {
            match self.upstream.read().await {
                Some(Message::File { filename }) => return Ok(filename),
                Some(other) => {
                    debug!("Runner {} ignoring {} while waiting for a file", self.id, other.command())
                }
                None => {
                    warn!("Runner {} lost its master, killing workers", self.id);
                    return Err(RunnerExit::MasterLost);
                }
            }
        }
    }

    async fn process(&mut self, id: usize, filename: String) -> Option<RunnerExit> {
        let written = match self.pool.get_mut(id) {
            Some(worker) => {
                let message = Message::Process {
                    filename: filename.clone(),
                };
                let written = worker.channel.write(&message).await;
                if written.is_ok() {
                    debug!("Sent {} to worker {}", filename, worker.label());
                    worker.current = Some(filename.clone());
                }
                written.is_ok()
            }
            None => false,
        };

        if written {
            return None;
        }

        warn!("Worker {} is gone, returning {} to the queue", id, filename);
        if let Some(worker) = self.pool.remove(id) {
            self.retired.push(worker.handle);
        }
        self.send_upstream(&Message::Previous { filename }).await.err()
    }

    /// Replaces worker `id` with one for `shim` and returns `filename` to the queue.
    async fn switch(
        &mut self,
        id: usize,
        filename: String,
        shim: Arc<dyn FrameworkShim>,
    ) -> Option<RunnerExit> {
        self.diagnostic(format!(
            "wrong framework for {}, replacing worker {} with {}",
            filename,
            id,
            shim.name()
        ))
        .await;

        if let Err(exit) = self.send_upstream(&Message::Previous { filename }).await {
            return Some(exit);
        }

        let slot = self.retire(id).await?;
        self.start_worker(slot, &shim).await;
        None
    }

    async fn forward_result(&mut self, id: usize, mut result: FileResult) -> Option<RunnerExit> {
        let current = self.pool.get_mut(id).and_then(|worker| worker.current.take());
        if result.filename.is_empty() {
            if let Some(current) = current {
                result.filename = current;
            }
        }

        match self.registry.summarize(&result.text) {
            Some(summary) => {
                result.example_count = summary.example_count;
                result.failure_count = summary.failure_count;
            }
            None if result.return_code != 0 => {
                result.failure_count = result.failure_count.max(1);
            }
            None => {}
        }
        result.text = output::clean_output(&result.text);

        self.send_upstream(&Message::Result(result)).await.err()
    }

    /// Closes worker `id` and takes it out of the pool, returning its slot.
    async fn retire(&mut self, id: usize) -> Option<usize> {
        let mut worker = self.pool.remove(id)?;

        if let Err(e) = worker.channel.write(&Message::Close).await {
            debug!("Close to worker {} failed: {}", worker.label(), e);
        }
        worker.channel.close().await;

        let slot = worker.slot;
        self.retired.push(worker.handle);
        Some(slot)
    }

    /// Closes every worker that is not running a file.
    async fn retire_idle(&mut self) {
        for id in self.pool.idle_ids() {
            self.retire(id).await;
        }
    }

    async fn worker_died(&mut self, id: usize) {
        let Some(mut worker) = self.pool.remove(id) else {
            return;
        };

        match &worker.current {
            Some(filename) => warn!(
                "Worker {} died while running {}; the file will not be rerun",
                worker.label(),
                filename
            ),
            None => warn!("Worker {} unexpectedly died", worker.label()),
        }

        worker.channel.close().await;
        self.retired.push(worker.handle);
    }

    /// Forwards a `debug`/`stdout` message upstream when debugging.
    async fn relay(&mut self, message: Message) -> Option<RunnerExit> {
        if !self.settings.debug {
            debug!("Runner {} dropping {}", self.id, message.command());
            return None;
        }
        self.send_upstream(&message).await.err()
    }

    async fn diagnostic(&mut self, text: String) {
        debug!("Runner {}: {}", self.id, text);
        if self.settings.debug {
            let message = Message::Debug {
                text: format!("runner {}: {}", self.id, text),
            };
            if let Err(e) = self.upstream.write(&message).await {
                debug!("Debug message to master failed: {}", e);
            }
        }
    }

    async fn send_upstream(&mut self, message: &Message) -> Result<(), RunnerExit> {
        self.upstream.write(message).await.map_err(|e| {
            warn!("Runner {} cannot reach its master: {}", self.id, e);
            RunnerExit::MasterLost
        })
    }

    async fn shutdown(&mut self, exit: RunnerExit) {
        for mut worker in self.pool.take_all() {
            if exit == RunnerExit::MasterLost {
                worker.handle.kill();
            } else if let Err(e) = worker.channel.write(&Message::Close).await {
                debug!("Close to worker {} failed: {}", worker.label(), e);
            }
            worker.channel.close().await;
            self.retired.push(worker.handle);
        }

        reap_all(&mut self.retired).await;
        self.upstream.close().await;
    }
}
