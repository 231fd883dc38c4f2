//! Aggregate run counters.

use crate::protocol::FileResult;

/// Counters and accumulated output of a run.
///
/// Owned by the Master and changed only when a `result` arrives; callers see
/// snapshots through the progress callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    /// Number of files queued at the start of the run.
    pub file_count: usize,
    pub files_completed: usize,
    pub example_count: u64,
    pub failure_count: u64,

    /// Output of every completed file, in completion order.
    pub output: String,
}

impl Progress {
    pub fn new(file_count: usize) -> Self {
        Self {
            file_count,
            ..Default::default()
        }
    }

    /// Merges one file's result.
    pub fn record(&mut self, result: &FileResult) {
        self.files_completed += 1;
        self.example_count += result.example_count;
        self.failure_count += result.failure_count;
        self.output.push_str(&result.text);
    }

    /// Files not yet reported.
    pub fn remaining(&self) -> usize {
        self.file_count.saturating_sub(self.files_completed)
    }
}
