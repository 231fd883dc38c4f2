//! Persisted per-file run times.
//!
//! At the end of every run the Master writes how long each completed file
//! took; the next run reads it back to seed [`TestFile::last_run_time`]. The
//! store only ever reflects the most recent run: files that did not complete
//! are dropped.
//!
//! The file is JSON (default `log/nitra_filemap.json`):
//!
//! ```json
//! {
//!   "recorded_at": "2026-10-19T09:12:44Z",
//!   "files": {
//!     "spec/models/user_spec.rb": { "secs": 4, "nanos": 120000000 }
//!   }
//! }
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nitra::history::RunHistory;
//! use std::path::Path;
//!
//! let history = RunHistory::load(Path::new("log/nitra_filemap.json"));
//! if let Some(duration) = history.get("spec/models/user_spec.rb") {
//!     println!("took {:?} last time", duration);
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::file::{FileState, TestFile};

/// Run times observed by one run, keyed by filename.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    /// When the run that produced this history finished.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub files: BTreeMap<String, Duration>,
}

impl RunHistory {
    /// Loads history from `path`.
    ///
    /// A missing or unreadable file yields an empty history; scheduling then
    /// falls back to file sizes.
    pub fn load(path: &Path) -> Self {
        tracing::debug!("Loading run history from: {}", path.display());

        if !path.exists() {
            tracing::debug!("History file does not exist, starting without history");
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RunHistory>(&contents) {
                Ok(history) => {
                    tracing::debug!("Loaded run times for {} files", history.files.len());
                    history
                }
                Err(e) => {
                    tracing::warn!("Failed to parse history file, ignoring it: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read history file, ignoring it: {}", e);
                Self::default()
            }
        }
    }

    /// Writes the history to `path`, replacing any previous contents.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create history directory: {}", parent.display())
            })?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize run history")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write history file: {}", path.display()))?;

        tracing::debug!("Saved run times for {} files to {}", self.files.len(), path.display());
        Ok(())
    }

    /// Builds the history of a finished run from its completed files.
    pub fn from_files(files: &[TestFile]) -> Self {
        let files = files
            .iter()
            .filter(|file| file.state == FileState::Completed)
            .filter_map(|file| Some((file.filename.clone(), file.observed_duration()?)))
            .collect();

        Self {
            recorded_at: Some(Utc::now()),
            files,
        }
    }

    /// Recorded duration for `filename`, if any.
    pub fn get(&self, filename: &str) -> Option<Duration> {
        self.files.get(filename).copied()
    }

    /// Seeds [`TestFile::last_run_time`] for every file with a record.
    pub fn seed(&self, files: &mut [TestFile]) {
        for file in files.iter_mut() {
            file.last_run_time = self.get(&file.filename);
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
