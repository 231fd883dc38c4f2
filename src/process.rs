//! Process spawning with attached channels.
//!
//! Every coordinator-to-child link in nitra is a spawned thing plus a
//! [`Channel`] to it. [`spawn_command`] starts an OS process and speaks to it
//! over its stdin/stdout; [`spawn_task`] runs the peer as a tokio task over an
//! in-memory pair, which is how the distribution engine is exercised without
//! real test frameworks.
//!
//! Either way the caller gets a [`Spawned`]: a [`ProcessHandle`] to kill and
//! reap, and the channel.

use std::future::Future;
use std::process::Stdio;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::Channel;

/// Result type for spawning operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors that can occur while starting a child.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The command line is empty or cannot be split into words.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The OS refused to start the process.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process started but its stdio could not be captured.
    #[error("Failed to capture {0} of child process")]
    Stdio(&'static str),
}

/// A command to spawn.
///
/// Commands are built using a fluent builder API.
///
/// # Example
///
/// ```
/// use nitra::process::Command;
///
/// let cmd = Command::parse("bundle exec nitra-worker rspec")
///     .unwrap()
///     .env("TEST_ENV_NUMBER", "2");
///
/// assert_eq!(cmd.program, "bundle");
/// assert_eq!(cmd.args, vec!["exec", "nitra-worker", "rspec"]);
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Environment variables added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Splits a shell-style command line into program and arguments.
    pub fn parse(line: &str) -> ProcessResult<Self> {
        let words = shell_words::split(line)
            .map_err(|e| ProcessError::InvalidCommand(format!("{}: {}", line, e)))?;
        Self::from_argv(&words)
    }

    /// Builds a command from an already split argument vector.
    pub fn from_argv(argv: &[String]) -> ProcessResult<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProcessError::InvalidCommand("empty command".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Converts the command to a shell-escaped string, for logging.
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_words::quote(&self.program).into_owned()];
        parts.extend(self.args.iter().map(|a| shell_words::quote(a).into_owned()));
        parts.join(" ")
    }

    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(&self.program);
        process.args(&self.args);
        for (key, value) in &self.env {
            process.env(key, value);
        }
        process
    }
}

/// Something that was spawned and can be killed and reaped.
#[derive(Debug)]
pub enum ProcessHandle {
    /// An OS child process.
    Child {
        label: String,
        child: tokio::process::Child,
    },

    /// A peer running as a task in this process.
    Task { label: String, task: JoinHandle<()> },
}

impl ProcessHandle {
    /// Returns the diagnostic label of the process.
    pub fn label(&self) -> &str {
        match self {
            ProcessHandle::Child { label, .. } | ProcessHandle::Task { label, .. } => label,
        }
    }

    /// Forcibly terminates the process without waiting for it.
    pub fn kill(&mut self) {
        match self {
            ProcessHandle::Child { label, child } => {
                if let Err(e) = child.start_kill() {
                    debug!("Kill of {} failed (probably already exited): {}", label, e);
                }
            }
            ProcessHandle::Task { task, .. } => task.abort(),
        }
    }

    /// Waits for the process to exit, returning its exit code when known.
    pub async fn wait(&mut self) -> Option<i32> {
        match self {
            ProcessHandle::Child { label, child } => match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    debug!("Wait for {} failed: {}", label, e);
                    None
                }
            },
            ProcessHandle::Task { task, .. } => match task.await {
                Ok(()) => Some(0),
                Err(_) => None,
            },
        }
    }
}

/// A freshly started peer and the channel to it.
#[derive(Debug)]
pub struct Spawned {
    pub handle: ProcessHandle,
    pub channel: Channel,
}

/// Starts `command` as a child process whose stdin/stdout form the channel.
///
/// The child's stderr is inherited so crashes stay visible on the terminal.
pub fn spawn_command(label: impl Into<String>, command: &Command) -> ProcessResult<Spawned> {
    let label = label.into();
    debug!("Spawning {}: {}", label, command.to_shell_string());

    let mut process = command.to_tokio();
    process
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = process.spawn().map_err(|source| ProcessError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    let stdin = child.stdin.take().ok_or(ProcessError::Stdio("stdin"))?;
    let stdout = child.stdout.take().ok_or(ProcessError::Stdio("stdout"))?;

    Ok(Spawned {
        channel: Channel::new(label.clone(), stdout, stdin),
        handle: ProcessHandle::Child { label, child },
    })
}

/// Runs `body` as a task holding the far end of a fresh in-memory channel.
pub fn spawn_task<F, Fut>(label: impl Into<String>, body: F) -> Spawned
where
    F: FnOnce(Channel) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let label = label.into();
    let (near, far) = Channel::open();
    let task = tokio::spawn(body(far.with_label(format!("{}:upstream", label))));

    Spawned {
        channel: near.with_label(label.clone()),
        handle: ProcessHandle::Task { label, task },
    }
}

/// Waits for every handle to exit.
pub async fn reap_all(handles: &mut Vec<ProcessHandle>) {
    for mut handle in handles.drain(..) {
        let code = handle.wait().await;
        debug!("{} exited with {:?}", handle.label(), code);
    }
}
