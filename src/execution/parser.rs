//! Solver stdout parsing.
//!
//! The solver writes everything of interest to stdout: fatal diagnostics, and
//! progress lines of the form
//!
//! ```text
//! [PROGRESS]: 45% [ 10/22 ] Time Update, estimated remaining time 1 minutes 23 seconds @ 123.45 MCells/s
//! ```
//!
//! Each line is classified independently. The only state kept across calls is
//! which progress milestones were already reported for the current attempt.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

/// Milestones surfaced to the operator, in percent.
pub const MILESTONES: [u32; 3] = [0, 33, 66];

/// Phrases that mark a fatal solver diagnostic. Matched case-sensitively so
/// summary lines such as "0 errors" do not trip them.
const ERROR_PHRASES: &[&str] = &[
    "ERROR:",
    "Error:",
    "FATAL",
    "Fatal error",
    "Simulation aborted",
    "Segmentation fault",
    "CUDA error",
    "Exception:",
];

/// Out-of-memory signatures, matched against the lowercased line.
const OUT_OF_MEMORY_PHRASES: &[&str] = &[
    "out of memory",
    "cudaerrormemoryallocation",
    "bad_alloc",
    "insufficient memory",
    "memory allocation failed",
];

fn progress_regex() -> &'static Regex {
    static PROGRESS: OnceLock<Regex> = OnceLock::new();
    PROGRESS.get_or_init(|| {
        Regex::new(
            r"\[PROGRESS\]:\s*(\d+(?:\.\d+)?)%.*?estimated remaining time\s+(.+?)(?:\s+@\s+(\S+\s*\S*))?\s*$",
        )
        .expect("progress pattern is valid")
    })
}

fn duration_unit_regex() -> &'static Regex {
    static UNITS: OnceLock<Regex> = OnceLock::new();
    UNITS.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)\b")
            .expect("duration pattern is valid")
    })
}

fn clock_regex() -> &'static Regex {
    static CLOCK: OnceLock<Regex> = OnceLock::new();
    CLOCK.get_or_init(|| {
        Regex::new(r"^(\d+):(\d{1,2}):(\d{1,2})$").expect("clock pattern is valid")
    })
}

/// Progress sample extracted from a solver line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    /// Completion percentage reported by the solver.
    pub percentage: f64,
    /// Remaining time normalized to `HH:MM:SS`.
    pub time_remaining: String,
    /// Throughput text, e.g. `123.45 MCells/s`.
    pub speed: Option<String>,
}

/// Classification of one solver output line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    pub is_error: bool,
    pub error_message: Option<String>,
    /// Set when the error is the out-of-memory signature.
    pub is_out_of_memory: bool,
    pub progress_info: Option<ProgressInfo>,
}

impl ParsedLine {
    /// Whether the line carried nothing the engine acts on.
    pub fn is_unrecognized(&self) -> bool {
        !self.is_error && self.progress_info.is_none()
    }
}

/// Stateless-per-line parser with per-attempt milestone tracking.
#[derive(Debug, Default)]
pub struct OutputParser {
    logged_milestones: BTreeSet<u32>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a single raw line.
    pub fn parse_line(&self, line: &str) -> ParsedLine {
        let trimmed = line.trim_end();
        let mut parsed = ParsedLine::default();

        if is_out_of_memory(trimmed) {
            parsed.is_error = true;
            parsed.is_out_of_memory = true;
            parsed.error_message = Some(trimmed.trim().to_string());
            return parsed;
        }

        if ERROR_PHRASES.iter().any(|phrase| trimmed.contains(phrase)) {
            parsed.is_error = true;
            parsed.error_message = Some(trimmed.trim().to_string());
            return parsed;
        }

        if let Some(captures) = progress_regex().captures(trimmed) {
            let percentage = captures
                .get(1)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(0.0);
            let time_remaining = captures
                .get(2)
                .map(|m| format_time(m.as_str()))
                .unwrap_or_else(|| "00:00:00".to_string());
            let speed = captures.get(3).map(|m| m.as_str().trim().to_string());
            parsed.progress_info = Some(ProgressInfo {
                percentage,
                time_remaining,
                speed,
            });
        }

        parsed
    }

    /// Returns true the first time a sample reaches a milestone in this attempt.
    ///
    /// The solver never prints an exact 0%, so the first sample at or above 1%
    /// stands in for the 0% milestone.
    pub fn should_log_milestone(&mut self, percentage: f64) -> bool {
        !self.crossed_milestones(percentage).is_empty()
    }

    /// Milestones reached by `percentage` that were not yet logged this
    /// attempt, lowest first. A sample that jumps past several milestones
    /// reports all of them.
    pub fn crossed_milestones(&mut self, percentage: f64) -> Vec<u32> {
        let Some(reached) = milestone_for(percentage) else {
            return Vec::new();
        };
        MILESTONES
            .iter()
            .copied()
            .filter(|milestone| *milestone <= reached)
            .filter(|milestone| self.logged_milestones.insert(*milestone))
            .collect()
    }

    /// Forget logged milestones so a retried attempt reports them again.
    pub fn reset_milestones(&mut self) {
        self.logged_milestones.clear();
    }
}

/// Map a percentage to the highest milestone it has reached.
pub fn milestone_for(percentage: f64) -> Option<u32> {
    if percentage >= 66.0 {
        Some(66)
    } else if percentage >= 33.0 {
        Some(33)
    } else if percentage >= 1.0 {
        Some(0)
    } else {
        None
    }
}

/// Whether a line carries the out-of-memory signature.
pub fn is_out_of_memory(line: &str) -> bool {
    let lower = line.to_lowercase();
    OUT_OF_MEMORY_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
}

/// Normalize free-form remaining-time text to `HH:MM:SS`.
///
/// Accepts the solver's "1 hours 2 minutes 3 seconds" wording, short forms
/// such as "1h 2m 3s", and clock text. Text without any recognizable amount is
/// returned trimmed and unchanged.
pub fn format_time(text: &str) -> String {
    let text = text.trim();

    if let Some(captures) = clock_regex().captures(text) {
        let part = |i: usize| {
            captures
                .get(i)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0)
        };
        return clock(part(1) * 3600 + part(2) * 60 + part(3));
    }

    let mut total = 0.0_f64;
    let mut matched = false;
    for captures in duration_unit_regex().captures_iter(text) {
        let Some(amount) = captures.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
            continue;
        };
        let unit = captures
            .get(2)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();
        let factor = match unit.chars().next() {
            Some('h') => 3600.0,
            Some('m') => 60.0,
            _ => 1.0,
        };
        total += amount * factor;
        matched = true;
    }

    if matched {
        clock(total.round() as u64)
    } else {
        text.to_string()
    }
}

fn clock(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRESS_LINE: &str = "[PROGRESS]: 45% [ 10/22 ] Time Update, estimated remaining time 1 minutes 23 seconds @ 123.45 MCells/s";

    #[test]
    fn test_parse_progress_line() {
        let parser = OutputParser::new();
        let parsed = parser.parse_line(PROGRESS_LINE);

        assert!(!parsed.is_error);
        let info = parsed.progress_info.expect("progress");
        assert_eq!(info.percentage, 45.0);
        assert_eq!(info.time_remaining, "00:01:23");
        assert_eq!(info.speed.as_deref(), Some("123.45 MCells/s"));
    }

    #[test]
    fn test_parse_progress_without_speed() {
        let parser = OutputParser::new();
        let parsed =
            parser.parse_line("[PROGRESS]: 1% [ 1/22 ] Time Update, estimated remaining time 2 hours 5 seconds");
        let info = parsed.progress_info.expect("progress");
        assert_eq!(info.percentage, 1.0);
        assert_eq!(info.time_remaining, "02:00:05");
        assert!(info.speed.is_none());
    }

    #[test]
    fn test_parse_error_line() {
        let parser = OutputParser::new();
        let parsed = parser.parse_line("ERROR: Grid has zero cells");
        assert!(parsed.is_error);
        assert!(!parsed.is_out_of_memory);
        assert_eq!(parsed.error_message.as_deref(), Some("ERROR: Grid has zero cells"));
    }

    #[test]
    fn test_parse_out_of_memory_line() {
        let parser = OutputParser::new();
        let parsed = parser.parse_line("CUDA runtime: cudaErrorMemoryAllocation (Out of Memory)");
        assert!(parsed.is_error);
        assert!(parsed.is_out_of_memory);
    }

    #[test]
    fn test_summary_line_with_zero_errors_is_not_error() {
        let parser = OutputParser::new();
        let parsed = parser.parse_line("Simulation finished with 0 errors and 0 warnings");
        assert!(parsed.is_unrecognized());
    }

    #[test]
    fn test_unrecognized_line() {
        let parser = OutputParser::new();
        assert!(parser.parse_line("Voxelizing model...").is_unrecognized());
    }

    #[test]
    fn test_first_one_percent_stands_in_for_zero() {
        let mut parser = OutputParser::new();
        assert!(!parser.should_log_milestone(0.0));
        assert!(parser.should_log_milestone(1.0));
        assert!(!parser.should_log_milestone(2.0));
        assert!(!parser.should_log_milestone(32.0));
        assert!(parser.should_log_milestone(33.0));
        assert!(!parser.should_log_milestone(50.0));
        assert!(parser.should_log_milestone(66.0));
        assert!(!parser.should_log_milestone(99.0));
    }

    #[test]
    fn test_exactly_three_milestones_over_full_run() {
        let mut parser = OutputParser::new();
        let logged = (1..=100)
            .filter(|pct| parser.should_log_milestone(*pct as f64))
            .count();
        assert_eq!(logged, MILESTONES.len());
    }

    #[test]
    fn test_jumping_samples_report_skipped_milestones() {
        let mut parser = OutputParser::new();
        let logged: Vec<u32> = [40.0, 80.0, 95.0]
            .iter()
            .flat_map(|pct| parser.crossed_milestones(*pct))
            .collect();
        assert_eq!(logged, vec![0, 33, 66]);

        let mut parser = OutputParser::new();
        assert_eq!(parser.crossed_milestones(20.0), vec![0]);
        assert_eq!(parser.crossed_milestones(70.0), vec![33, 66]);
        assert!(!parser.should_log_milestone(90.0));
    }

    #[test]
    fn test_milestones_repeat_after_reset() {
        let mut parser = OutputParser::new();
        assert!(parser.should_log_milestone(33.0));
        assert!(!parser.should_log_milestone(33.0));
        parser.reset_milestones();
        assert!(parser.should_log_milestone(33.0));
    }

    #[test]
    fn test_format_time_variants() {
        assert_eq!(format_time("1 minutes 23 seconds"), "00:01:23");
        assert_eq!(format_time("3 hours 4 minutes"), "03:04:00");
        assert_eq!(format_time("45 seconds"), "00:00:45");
        assert_eq!(format_time("1h 2m 3s"), "01:02:03");
        assert_eq!(format_time("1:2:3"), "01:02:03");
        assert_eq!(format_time("  unknown  "), "unknown");
    }
}
