//! The global work queue.
//!
//! Every file of the run lives here from start to finish and is in exactly one
//! [`FileState`]. Only the Master mutates the queue.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tracing::warn;

use crate::file::{FileState, TestFile};

#[derive(Debug, Default)]
pub struct WorkQueue {
    files: Vec<TestFile>,
    index: HashMap<String, usize>,
    pending: VecDeque<usize>,
}

impl WorkQueue {
    /// Queues `files` in the given order, all pending.
    pub fn new(files: Vec<TestFile>) -> Self {
        let index = files
            .iter()
            .enumerate()
            .map(|(position, file)| (file.filename.clone(), position))
            .collect();
        let pending = (0..files.len()).collect();

        Self {
            files,
            index,
            pending,
        }
    }

    /// Takes the head of the queue and marks it in flight.
    pub fn pop_next(&mut self) -> Option<String> {
        let position = self.pending.pop_front()?;
        let file = &mut self.files[position];

        file.state = FileState::InFlight;
        file.dispatched_at = Some(Instant::now());
        Some(file.filename.clone())
    }

    /// Returns an in-flight file to the head of the queue.
    pub fn push_front(&mut self, filename: &str) -> bool {
        let Some(&position) = self.index.get(filename) else {
            warn!("Ignoring previous for unknown file {}", filename);
            return false;
        };

        let file = &mut self.files[position];
        if file.state != FileState::InFlight {
            warn!("Ignoring previous for {} which is {:?}", filename, file.state);
            return false;
        }

        file.state = FileState::Pending;
        file.dispatched_at = None;
        self.pending.push_front(position);
        true
    }

    /// Marks an in-flight file completed.
    ///
    /// Returns `false`, changing nothing, for unknown files and files that are
    /// not in flight.
    pub fn complete(&mut self, filename: &str) -> bool {
        let Some(&position) = self.index.get(filename) else {
            warn!("Ignoring result for unknown file {}", filename);
            return false;
        };

        let file = &mut self.files[position];
        if file.state != FileState::InFlight {
            warn!("Ignoring result for {} which is {:?}", filename, file.state);
            return false;
        }

        file.state = FileState::Completed;
        file.completed_at = Some(Instant::now());
        true
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of files in `state`.
    pub fn count(&self, state: FileState) -> usize {
        self.files.iter().filter(|f| f.state == state).count()
    }

    pub fn files(&self) -> &[TestFile] {
        &self.files
    }
}
