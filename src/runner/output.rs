//! Noise removal for worker output.
//!
//! Per-file output is concatenated into the run's final report, so lines that
//! only make sense once per framework run (progress dots, timing, the summary
//! line, the list of failed examples) are stripped before forwarding.

use std::sync::LazyLock;

use regex::Regex;

static NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)^[.FP*]+$",
        r"(?s)\nFailed examples:.+",
        r"(?m)^Finished in.+$",
        r"(?m)^\d+ example.+$",
        r"(?m)^No examples found.$",
        r"(?m)^Failures:$",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Strips per-run noise lines from a worker's raw output.
pub fn clean_output(text: &str) -> String {
    NOISE.iter().fold(text.to_string(), |text, pattern| {
        pattern.replace_all(&text, "").into_owned()
    })
}
