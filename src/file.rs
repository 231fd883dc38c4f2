//! Test files and the order in which they are scheduled.
//!
//! # Scheduling Order
//!
//! The queue is sorted once, before anything is dispatched:
//!
//! 1. By framework order, ascending, so each framework's files are contiguous.
//! 2. Within a framework, files with a recorded run time go longest first.
//! 3. Files without one go largest first.
//! 4. A file with a recorded run time always precedes one without.
//!
//! Handing out the longest jobs first keeps a fixed pool busy until the end
//! of the run. Rule 4 is not expressible as a single sort key, so
//! [`TestFile::compare`] branches on it explicitly.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::framework::{FrameworkRegistry, FrameworkResult};

/// Where a file is in its lifecycle. A file is in exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Waiting in the global queue.
    Pending,
    /// Handed to a runner and not yet reported.
    InFlight,
    /// Its result has been received.
    Completed,
}

/// One test file of the run.
#[derive(Debug, Clone)]
pub struct TestFile {
    pub filename: String,

    /// Size on disk in bytes.
    pub size: u64,

    /// Name of the framework the file belongs to.
    pub framework: String,

    /// Scheduling order of that framework.
    pub order: i32,

    /// Duration observed for this file in the previous run.
    pub last_run_time: Option<Duration>,

    pub state: FileState,
    pub dispatched_at: Option<Instant>,
    pub completed_at: Option<Instant>,
}

impl TestFile {
    /// Classifies `filename` and reads its size from disk.
    pub fn new(filename: impl Into<String>, registry: &FrameworkRegistry) -> FrameworkResult<Self> {
        let filename = filename.into();
        let shim = registry.shim_for_file(&filename)?;
        let size = std::fs::metadata(&filename)?.len();

        Ok(Self::with_metadata(filename, size, shim.name(), shim.order()))
    }

    /// Builds a file from already known metadata.
    pub fn with_metadata(
        filename: impl Into<String>,
        size: u64,
        framework: impl Into<String>,
        order: i32,
    ) -> Self {
        Self {
            filename: filename.into(),
            size,
            framework: framework.into(),
            order,
            last_run_time: None,
            state: FileState::Pending,
            dispatched_at: None,
            completed_at: None,
        }
    }

    /// Sets the run time recorded by a previous run.
    pub fn with_last_run_time(mut self, duration: Duration) -> Self {
        self.last_run_time = Some(duration);
        self
    }

    /// Time between dispatch and completion, once both happened.
    pub fn observed_duration(&self) -> Option<Duration> {
        match (self.dispatched_at, self.completed_at) {
            (Some(dispatched), Some(completed)) => Some(completed.saturating_duration_since(dispatched)),
            _ => None,
        }
    }

    /// Scheduling comparator; `Less` means `self` is dispatched first.
    pub fn compare(&self, other: &TestFile) -> Ordering {
        // Frameworks sharing an order still run as contiguous groups.
        let group = (self.order, &self.framework).cmp(&(other.order, &other.framework));
        if group != Ordering::Equal {
            return group;
        }

        match (self.last_run_time, other.last_run_time) {
            (Some(mine), Some(theirs)) => theirs.cmp(&mine),
            (None, None) => other.size.cmp(&self.size),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
        }
    }
}

/// Sorts files into dispatch order. Ties keep their input order.
pub fn sort_for_schedule(files: &mut [TestFile]) {
    files.sort_by(|a, b| a.compare(b));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rspec(name: &str, size: u64) -> TestFile {
        TestFile::with_metadata(name, size, "rspec", 0)
    }

    fn names(files: &[TestFile]) -> Vec<&str> {
        files.iter().map(|f| f.filename.as_str()).collect()
    }

    #[test]
    fn test_mixed_history_scenario() {
        let mut files = vec![
            rspec("a_spec.rb", 500),
            rspec("b_spec.rb", 100).with_last_run_time(Duration::from_secs(2)),
            TestFile::with_metadata("c.feature", 50, "cucumber", 1),
        ];

        sort_for_schedule(&mut files);
        assert_eq!(names(&files), vec!["b_spec.rb", "a_spec.rb", "c.feature"]);
    }

    #[test]
    fn test_known_durations_longest_first() {
        let mut files = vec![
            rspec("short_spec.rb", 9000).with_last_run_time(Duration::from_millis(100)),
            rspec("long_spec.rb", 10).with_last_run_time(Duration::from_secs(30)),
        ];

        sort_for_schedule(&mut files);
        assert_eq!(names(&files), vec!["long_spec.rb", "short_spec.rb"]);
    }

    #[test]
    fn test_unknown_durations_largest_first() {
        let mut files = vec![rspec("small_spec.rb", 10), rspec("big_spec.rb", 9000)];

        sort_for_schedule(&mut files);
        assert_eq!(names(&files), vec!["big_spec.rb", "small_spec.rb"]);
    }

    #[test]
    fn test_known_beats_unknown_regardless_of_magnitude() {
        let tiny = rspec("tiny_spec.rb", 1).with_last_run_time(Duration::from_nanos(1));
        let huge = rspec("huge_spec.rb", u64::MAX);

        assert_eq!(tiny.compare(&huge), Ordering::Less);
        assert_eq!(huge.compare(&tiny), Ordering::Greater);
    }

    #[test]
    fn test_framework_order_dominates() {
        let feature = TestFile::with_metadata("slow.feature", 1 << 20, "cucumber", 1)
            .with_last_run_time(Duration::from_secs(600));
        let spec = rspec("fast_spec.rb", 1);

        assert_eq!(spec.compare(&feature), Ordering::Less);
    }

    #[test]
    fn test_same_order_frameworks_stay_grouped() {
        let mut files = vec![
            TestFile::with_metadata("a_test.rb", 900, "minitest", 100),
            TestFile::with_metadata("b.js", 800, "jest", 100),
            TestFile::with_metadata("c_test.rb", 700, "minitest", 100),
            TestFile::with_metadata("d.js", 600, "jest", 100),
        ];

        sort_for_schedule(&mut files);
        assert_eq!(names(&files), vec!["b.js", "d.js", "a_test.rb", "c_test.rb"]);
    }

    #[test]
    fn test_ties_are_stable() {
        let mut files = vec![rspec("first_spec.rb", 10), rspec("second_spec.rb", 10)];

        sort_for_schedule(&mut files);
        assert_eq!(names(&files), vec!["first_spec.rb", "second_spec.rb"]);
    }

    #[test]
    fn test_observed_duration_needs_both_stamps() {
        let mut file = rspec("a_spec.rb", 1);
        assert_eq!(file.observed_duration(), None);

        let start = Instant::now();
        file.dispatched_at = Some(start);
        assert_eq!(file.observed_duration(), None);

        file.completed_at = Some(start + Duration::from_millis(250));
        assert_eq!(file.observed_duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_new_classifies_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_spec.rb");
        std::fs::write(&path, "describe User do; end\n").unwrap();

        let registry = FrameworkRegistry::builtin();
        let file = TestFile::new(path.to_string_lossy(), &registry).unwrap();
        assert_eq!(file.framework, "rspec");
        assert_eq!(file.order, 0);
        assert_eq!(file.size, 22);
        assert_eq!(file.state, FileState::Pending);

        assert!(TestFile::new("missing_spec.rb", &registry).is_err());
    }
}
