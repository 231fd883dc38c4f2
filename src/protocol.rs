//! Inter-process message set.
//!
//! Every message travels as a single JSON object on its own line, tagged by a
//! `"command"` field that selects the variant:
//!
//! ```text
//! {"command":"ready","framework":"rspec"}
//! {"command":"process","filename":"spec/models/user_spec.rb"}
//! {"command":"result","filename":"spec/models/user_spec.rb","text":"...","return_code":0}
//! {"command":"close"}
//! ```
//!
//! # Directions
//!
//! | Message | Sender | Receiver |
//! |---------|--------|----------|
//! | `configure` | Master | Runner (first message only) |
//! | `next` | Runner | Master |
//! | `file` | Master | Runner (reply to `next`) |
//! | `previous` | Runner | Master |
//! | `result` | Worker → Runner → Master | |
//! | `debug`, `stdout` | Worker/Runner | Runner/Master |
//! | `ready` | Worker | Runner |
//! | `process`, `close` | Runner | Worker |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{FrameworkConfig, PrepareConfig};

/// A single message exchanged over a [`Channel`](crate::channel::Channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Message {
    /// Handshake from the Master telling a Runner who it is and how to behave.
    Configure {
        runner_id: String,
        settings: RunnerSettings,
    },

    /// Request for the next file from the global queue.
    Next,

    /// Reply to [`Message::Next`]. `None` means the queue is exhausted.
    File { filename: Option<String> },

    /// Put a file back at the front of the global queue.
    Previous { filename: String },

    /// Outcome of running one file.
    Result(FileResult),

    /// Diagnostic text, only surfaced when debugging is enabled.
    Debug { text: String },

    /// Captured output of a helper process.
    Stdout { process: String, text: String },

    /// A worker announcing it is idle with the given framework loaded.
    Ready { framework: String },

    /// Instruct a worker to run one file.
    Process { filename: String },

    /// Instruct a worker to exit cleanly.
    Close,
}

impl Message {
    /// Returns the wire tag of this message, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Configure { .. } => "configure",
            Message::Next => "next",
            Message::File { .. } => "file",
            Message::Previous { .. } => "previous",
            Message::Result(_) => "result",
            Message::Debug { .. } => "debug",
            Message::Stdout { .. } => "stdout",
            Message::Ready { .. } => "ready",
            Message::Process { .. } => "process",
            Message::Close => "close",
        }
    }
}

/// Result payload for one completed file.
///
/// Workers send only `filename`, `text` and `return_code`; the Runner fills in
/// the counts it extracts from `text` before forwarding upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    pub filename: String,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub example_count: u64,

    #[serde(default)]
    pub failure_count: u64,

    #[serde(default)]
    pub return_code: i32,
}

impl FileResult {
    /// Creates a result carrying raw worker output.
    pub fn new(filename: impl Into<String>, text: impl Into<String>, return_code: i32) -> Self {
        Self {
            filename: filename.into(),
            text: text.into(),
            return_code,
            ..Default::default()
        }
    }
}

/// Everything a Runner needs to know, sent by the Master in the handshake.
///
/// Remote runners get their whole configuration this way, so slave hosts do
/// not need a configuration file of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Number of workers this runner keeps alive.
    pub process_count: usize,

    /// Value exported as `RAILS_ENV` to helper and worker processes.
    pub environment: String,

    /// Framework every worker is started with.
    pub default_framework: String,

    /// Relay `debug`/`stdout` diagnostics upstream.
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub prepare: PrepareConfig,

    /// Framework overrides and custom framework definitions.
    #[serde(default)]
    pub frameworks: BTreeMap<String, FrameworkConfig>,
}
