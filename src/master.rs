//! Top-level coordinator.
//!
//! The Master owns the only work queue of the run. Every runner, local or
//! remote, pulls files from it one at a time with `next`, so faster hosts
//! simply take more files.
//!
//! # Run Sequence
//!
//! 1. Collect explicit files plus every enabled framework's discovered files.
//! 2. Seed run times from the history file and sort ([`crate::file`]).
//! 3. Start the local runner (`A`) and connect to slaves (`B`, `C`, ...),
//!    sending each a `configure` handshake.
//! 4. Serve `next`/`previous`/`result` until every runner channel closes.
//! 5. Reap runners and write the new history.
//!
//! The progress callback runs once with `(progress, None)` before runners
//! start and once per completed file afterwards.

pub mod launcher;
pub mod queue;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, wait_any};
use crate::config::Config;
use crate::file::{FileState, TestFile, sort_for_schedule};
use crate::framework::{FrameworkError, FrameworkRegistry};
use crate::history::RunHistory;
use crate::process::{ProcessError, Spawned, reap_all};
use crate::progress::Progress;
use crate::protocol::{FileResult, Message, RunnerSettings};

pub use launcher::{ProcessLauncher, RunnerLauncher};
pub use queue::WorkQueue;

/// Result type for master operations.
pub type MasterResult<T> = Result<T, MasterError>;

/// Errors that prevent a run from starting.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error(transparent)]
    Framework(#[from] FrameworkError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Neither the local runner nor any slave could be started.
    #[error("No runner could be started")]
    NoRunners,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub progress: Progress,
    pub aborted: bool,
    pub duration: Duration,
}

impl RunSummary {
    /// Every file ran, nothing failed, and the run was not aborted.
    pub fn success(&self) -> bool {
        !self.aborted
            && self.progress.files_completed == self.progress.file_count
            && self.progress.failure_count == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Label of the `n`th runner: `A` is local, slaves follow alphabetically.
fn runner_id(n: usize) -> String {
    match u8::try_from(n).ok().filter(|n| *n < 26) {
        Some(n) => char::from(b'A' + n).to_string(),
        None => format!("R{}", n),
    }
}

pub struct Master<L> {
    config: Config,
    registry: FrameworkRegistry,
    launcher: L,
    files: Vec<String>,
    abort: CancellationToken,
}

impl<L: RunnerLauncher> Master<L> {
    pub fn new(config: Config, registry: FrameworkRegistry, launcher: L) -> Self {
        Self {
            config,
            registry,
            launcher,
            files: Vec::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Runs these files in addition to the discovered ones.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Sets the abort token.
    ///
    /// Once cancelled, `next` is answered with no file so runners drain, and
    /// the run is reported as aborted.
    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    /// Location of the run history, with `~` expanded.
    pub fn history_path(&self) -> PathBuf {
        let path = self.config.nitra.history_file.to_string_lossy();
        PathBuf::from(shellexpand::tilde(&path).into_owned())
    }

    /// Builds the ordered file list for a run.
    pub fn collect_files(&self, history: &RunHistory) -> MasterResult<Vec<TestFile>> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();

        for filename in &self.files {
            if seen.insert(filename.clone()) {
                files.push(TestFile::new(filename.clone(), &self.registry)?);
            }
        }

        for name in &self.config.nitra.frameworks {
            let shim = self.registry.get(name)?;
            for filename in shim.discover()? {
                if seen.insert(filename.clone()) {
                    files.push(TestFile::new(filename, &self.registry)?);
                }
            }
        }

        history.seed(&mut files);
        sort_for_schedule(&mut files);
        Ok(files)
    }

    /// Runs every file and returns the summary, or `None` if there were no files.
    pub async fn run<F>(&mut self, mut on_progress: F) -> MasterResult<Option<RunSummary>>
    where
        F: FnMut(&Progress, Option<&FileResult>),
    {
        let started = Instant::now();
        let history_path = self.history_path();
        let files = self.collect_files(&RunHistory::load(&history_path))?;

        let Some(first) = files.first() else {
            info!("No test files to run");
            return Ok(None);
        };
        let default_framework = first.framework.clone();
        info!("Running {} files, starting with {}", files.len(), default_framework);

        let mut queue = WorkQueue::new(files);
        let mut progress = Progress::new(queue.len());
        on_progress(&progress, None);

        let (mut handles, mut channels): (Vec<_>, Vec<_>) = self
            .start_runners(&default_framework)
            .await?
            .into_iter()
            .map(|spawned| (spawned.handle, spawned.channel))
            .unzip();

        while !channels.is_empty() {
            let ready = {
                let mut set: Vec<&mut Channel> = channels.iter_mut().collect();
                wait_any(&mut set).await
            };

            let mut closed = Vec::new();
            for index in ready {
                let channel = &mut channels[index];
                match channel.read().await {
                    Some(message) => {
                        self.handle(message, channel, &mut queue, &mut progress, &mut on_progress)
                            .await
                    }
                    None => {
                        debug!("{} closed its channel", channel.label());
                        closed.push(index);
                    }
                }
            }

            for index in closed.into_iter().rev() {
                channels.remove(index).close().await;
            }
        }

        debug!("Waiting for all runners to exit...");
        reap_all(&mut handles).await;

        let lost = queue.count(FileState::InFlight);
        if lost > 0 {
            warn!("{} files were handed out but never reported", lost);
        }
        if self.abort.is_cancelled() {
            info!("Aborted with {} files not completed", progress.remaining());
        }

        debug!("Writing run history to {}", history_path.display());
        if let Err(e) = RunHistory::from_files(queue.files()).save(&history_path) {
            warn!("Failed to save run history: {:#}", e);
        }

        Ok(Some(RunSummary {
            progress,
            aborted: self.abort.is_cancelled(),
            duration: started.elapsed(),
        }))
    }

    async fn start_runners(&self, default_framework: &str) -> MasterResult<Vec<Spawned>> {
        let mut runners = Vec::new();

        if self.config.nitra.process_count > 0 {
            let id = runner_id(0);
            match self.launcher.launch_local(&id).await {
                Ok(spawned) => {
                    let settings = self.settings(self.config.nitra.process_count, default_framework);
                    runners.push(configure(spawned, &id, settings).await);
                }
                Err(e) => warn!("Failed to start local runner: {}", e),
            }
        }

        for (n, slave) in self.config.slaves.iter().enumerate() {
            let id = runner_id(n + 1);
            match self.launcher.connect_slave(&id, slave).await {
                Ok(spawned) => {
                    let settings = self.settings(slave.capacity, default_framework);
                    runners.push(configure(spawned, &id, settings).await);
                }
                Err(e) => warn!("Failed to connect to slave {}: {}", slave.host, e),
            }
        }

        if runners.is_empty() {
            return Err(MasterError::NoRunners);
        }
        Ok(runners)
    }

    fn settings(&self, process_count: usize, default_framework: &str) -> RunnerSettings {
        RunnerSettings {
            process_count,
            environment: self.config.nitra.environment.clone(),
            default_framework: default_framework.to_string(),
            debug: self.config.nitra.debug,
            prepare: self.config.prepare.clone(),
            frameworks: self.config.frameworks.clone(),
        }
    }

    async fn handle<F>(
        &self,
        message: Message,
        channel: &mut Channel,
        queue: &mut WorkQueue,
        progress: &mut Progress,
        on_progress: &mut F,
    ) where
        F: FnMut(&Progress, Option<&FileResult>),
    {
        match message {
            Message::Next => {
                let filename = if self.abort.is_cancelled() {
                    None
                } else {
                    queue.pop_next()
                };

                let reply = Message::File {
                    filename: filename.clone(),
                };
                if let Err(e) = channel.write(&reply).await {
                    debug!("Reply to {} failed: {}", channel.label(), e);
                    if let Some(filename) = filename {
                        queue.push_front(&filename);
                    }
                }
            }
            Message::Previous { filename } => {
                debug!("{} returned {}", channel.label(), filename);
                queue.push_front(&filename);
            }
            Message::Result(result) => {
                if queue.complete(&result.filename) {
                    progress.record(&result);
                    on_progress(progress, Some(&result));
                }
            }
            Message::Debug { text } => {
                if self.config.nitra.debug {
                    info!("[DEBUG] {}", text);
                }
            }
            Message::Stdout { process, text } => {
                if self.config.nitra.debug && !text.is_empty() {
                    info!("STDOUT for {}:\n{}", process, text);
                }
            }
            other => warn!("Ignoring unexpected {} from {}", other.command(), channel.label()),
        }
    }
}

async fn configure(mut spawned: Spawned, id: &str, settings: RunnerSettings) -> Spawned {
    let handshake = Message::Configure {
        runner_id: id.to_string(),
        settings,
    };
    if let Err(e) = spawned.channel.write(&handshake).await {
        warn!("Runner {} did not accept its configuration: {}", id, e);
    }
    spawned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlaveConfig;
    use crate::process::spawn_task;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// A runner that serves the protocol directly, without workers.
    #[derive(Clone, Copy)]
    enum Script {
        /// Completes every file with one example and no failures.
        Drain,
        /// Returns the first file it gets once, then drains.
        BounceFirst,
    }

    struct ScriptedLauncher {
        script: Script,
        configured: Arc<Mutex<Vec<(String, usize)>>>,
    }

    impl ScriptedLauncher {
        fn new(script: Script) -> Self {
            Self {
                script,
                configured: Arc::default(),
            }
        }

        fn spawn(&self, label: String) -> Spawned {
            let script = self.script;
            let configured = self.configured.clone();

            spawn_task(label, move |mut channel| async move {
                if let Some(Message::Configure {
                    runner_id,
                    settings,
                }) = channel.read().await
                {
                    configured
                        .lock()
                        .unwrap()
                        .push((runner_id, settings.process_count));
                }

                let mut bounced = false;
                loop {
                    channel.write(&Message::Next).await.unwrap();
                    let Some(Message::File {
                        filename: Some(filename),
                    }) = channel.read().await
                    else {
                        break;
                    };

                    if matches!(script, Script::BounceFirst) && !bounced {
                        bounced = true;
                        channel.write(&Message::Previous { filename }).await.unwrap();
                        continue;
                    }

                    let mut result = FileResult::new(filename, "ok\n", 0);
                    result.example_count = 1;
                    channel.write(&Message::Result(result)).await.unwrap();
                }
                channel.close().await;
            })
        }
    }

    #[async_trait]
    impl RunnerLauncher for ScriptedLauncher {
        async fn launch_local(&self, runner_id: &str) -> MasterResult<Spawned> {
            Ok(self.spawn(format!("runner {}", runner_id)))
        }

        async fn connect_slave(&self, runner_id: &str, slave: &SlaveConfig) -> MasterResult<Spawned> {
            Ok(self.spawn(format!("runner {}@{}", runner_id, slave.host)))
        }
    }

    fn config(dir: &tempfile::TempDir, process_count: usize) -> Config {
        let mut config = Config::default();
        config.nitra.process_count = process_count;
        config.nitra.frameworks = Vec::new();
        config.nitra.history_file = dir.path().join("history.json");
        config
    }

    fn spec_files(dir: &tempfile::TempDir, count: usize) -> Vec<String> {
        (0..count)
            .map(|n| {
                let path = dir.path().join(format!("file{}_spec.rb", n));
                std::fs::write(&path, "x".repeat(n + 1)).unwrap();
                path.to_string_lossy().into_owned()
            })
            .collect()
    }

    #[test]
    fn test_runner_ids() {
        assert_eq!(runner_id(0), "A");
        assert_eq!(runner_id(2), "C");
        assert_eq!(runner_id(25), "Z");
        assert_eq!(runner_id(26), "R26");
    }

    #[test]
    fn test_success_requires_everything() {
        let mut summary = RunSummary {
            progress: Progress::new(2),
            aborted: false,
            duration: Duration::ZERO,
        };
        summary.progress.files_completed = 2;
        assert!(summary.success());
        assert_eq!(summary.exit_code(), 0);

        summary.progress.failure_count = 1;
        assert!(!summary.success());

        summary.progress.failure_count = 0;
        summary.aborted = true;
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_no_files_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = Master::new(
            config(&dir, 1),
            FrameworkRegistry::builtin(),
            ScriptedLauncher::new(Script::Drain),
        );

        assert!(master.run(|_, _| {}).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_runners_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = Master::new(
            config(&dir, 0),
            FrameworkRegistry::builtin(),
            ScriptedLauncher::new(Script::Drain),
        )
        .with_files(spec_files(&dir, 1));

        assert!(matches!(master.run(|_, _| {}).await, Err(MasterError::NoRunners)));
    }

    #[tokio::test]
    async fn test_local_and_slave_runners_share_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, 3);
        config.slaves.push(SlaveConfig::parse("box:5").unwrap());

        let launcher = ScriptedLauncher::new(Script::Drain);
        let configured = launcher.configured.clone();
        let files = spec_files(&dir, 6);

        let mut calls = Vec::new();
        let mut master = Master::new(config, FrameworkRegistry::builtin(), launcher)
            .with_files(files.iter().chain(files.iter()).cloned().collect());
        let summary = master
            .run(|progress, result| calls.push((progress.files_completed, result.is_some())))
            .await
            .unwrap()
            .unwrap();

        assert!(summary.success());
        assert_eq!(summary.progress.file_count, 6);
        assert_eq!(summary.progress.example_count, 6);
        assert_eq!(calls.len(), 7);
        assert_eq!(calls[0], (0, false));
        assert_eq!(calls[6], (6, true));

        let mut configured = configured.lock().unwrap().clone();
        configured.sort();
        assert_eq!(configured, vec![("A".to_string(), 3), ("B".to_string(), 5)]);

        let history = RunHistory::load(&dir.path().join("history.json"));
        assert_eq!(history.len(), 6);
    }

    #[tokio::test]
    async fn test_previous_puts_file_back_first() {
        let dir = tempfile::tempdir().unwrap();
        let files = spec_files(&dir, 3);

        let mut order = Vec::new();
        let mut master = Master::new(
            config(&dir, 1),
            FrameworkRegistry::builtin(),
            ScriptedLauncher::new(Script::BounceFirst),
        )
        .with_files(files);

        let summary = master
            .run(|_, result| {
                if let Some(result) = result {
                    order.push(result.filename.clone());
                }
            })
            .await
            .unwrap()
            .unwrap();

        assert!(summary.success());
        assert_eq!(order.len(), 3);
        // Largest file is scheduled first and comes back to the front after the bounce.
        assert!(order[0].ends_with("file2_spec.rb"));
    }

    #[tokio::test]
    async fn test_abort_stops_handing_out_files() {
        let dir = tempfile::tempdir().unwrap();
        let abort = CancellationToken::new();

        let mut master = Master::new(
            config(&dir, 1),
            FrameworkRegistry::builtin(),
            ScriptedLauncher::new(Script::Drain),
        )
        .with_files(spec_files(&dir, 5))
        .with_abort(abort.clone());

        let summary = master
            .run(|progress, _| {
                if progress.files_completed == 2 {
                    abort.cancel();
                }
            })
            .await
            .unwrap()
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.progress.files_completed, 2);
        assert!(!summary.success());

        let history = RunHistory::load(&dir.path().join("history.json"));
        assert_eq!(history.len(), 2);
    }
}
