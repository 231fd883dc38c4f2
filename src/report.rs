//! Console output for the client.
//!
//! Shows a progress bar while files complete, optionally the output of each
//! failing file as it arrives, and at the end the combined output of all
//! files followed by the summary lines:
//!
//! ```text
//! 118/120 files processed, 1534 examples, 2 failures
//! Finished in 94.3 seconds
//! ```

use std::sync::LazyLock;

use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;

use crate::master::RunSummary;
use crate::progress::Progress;
use crate::protocol::FileResult;

static BLANK_RUNS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n\n\n+").ok());

/// Collapses runs of blank lines into a single blank line.
pub fn collapse_blank_lines(text: &str) -> String {
    match BLANK_RUNS.as_ref() {
        Some(pattern) => pattern.replace_all(text, "\n\n").into_owned(),
        None => text.to_string(),
    }
}

/// `N/M files processed, E examples, F failures`
pub fn summary_line(progress: &Progress) -> String {
    format!(
        "{}/{} files processed, {} examples, {} failures",
        progress.files_completed, progress.file_count, progress.example_count, progress.failure_count
    )
}

/// `Finished in X.Y seconds`, or `Aborted after X.Y seconds`.
pub fn timing_line(summary: &RunSummary) -> String {
    format!(
        "{} {:.1} seconds",
        if summary.aborted { "Aborted after" } else { "Finished in" },
        summary.duration.as_secs_f64()
    )
}

/// Progress display driven by the Master's progress callback.
pub struct ConsoleReporter {
    bar: Option<ProgressBar>,
    quiet: bool,
    print_failures: bool,
}

impl ConsoleReporter {
    pub fn new(quiet: bool, print_failures: bool) -> Self {
        Self {
            bar: None,
            quiet,
            print_failures,
        }
    }

    /// Handles one progress callback.
    pub fn on_progress(&mut self, progress: &Progress, result: Option<&FileResult>) {
        if self.bar.is_none() && !self.quiet {
            let bar = ProgressBar::new(progress.file_count as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            {
                bar.set_style(style.progress_chars("X.."));
            }
            self.bar = Some(bar);
        }

        if let Some(bar) = &self.bar {
            bar.set_position(progress.files_completed as u64);
            bar.set_message(format!(
                "{} examples, {} failures",
                progress.example_count, progress.failure_count
            ));
        }

        let Some(result) = result else {
            return;
        };

        if self.print_failures && result.failure_count != 0 {
            let text = format!(
                "=== output for {} {}\n{}",
                result.filename,
                "=".repeat(40),
                collapse_blank_lines(&result.text)
            );
            match &self.bar {
                Some(bar) => bar.println(text),
                None => println!("{}", text),
            }
        }
    }

    /// Prints the combined output and the summary.
    pub fn finish(&mut self, summary: &RunSummary) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }

        println!("{}", collapse_blank_lines(&summary.progress.output));
        println!();

        let line = summary_line(&summary.progress);
        if summary.success() {
            println!("{}", console::style(line).green().bold());
        } else {
            println!("{}", console::style(line).red().bold());
        }

        if !self.quiet {
            println!("{}", timing_line(summary));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb\n\nc\n"), "a\n\nb\n\nc\n");
    }

    #[test]
    fn test_summary_lines() {
        let mut progress = Progress::new(120);
        progress.files_completed = 118;
        progress.example_count = 1534;
        progress.failure_count = 2;
        assert_eq!(
            summary_line(&progress),
            "118/120 files processed, 1534 examples, 2 failures"
        );

        let mut summary = RunSummary {
            progress,
            aborted: false,
            duration: Duration::from_millis(94_340),
        };
        assert_eq!(timing_line(&summary), "Finished in 94.3 seconds");

        summary.aborted = true;
        assert_eq!(timing_line(&summary), "Aborted after 94.3 seconds");
    }

    #[test]
    fn test_quiet_reporter_has_no_bar() {
        let mut reporter = ConsoleReporter::new(true, false);
        reporter.on_progress(&Progress::new(3), None);
        assert!(reporter.bar.is_none());

        let mut reporter = ConsoleReporter::new(false, false);
        reporter.on_progress(&Progress::new(3), None);
        assert!(reporter.bar.is_some());
    }
}
