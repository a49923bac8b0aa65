use std::fmt::Write;

use owo_colors::OwoColorize;

use crate::checkpoint::PhaseValidity;
use crate::pipeline::{format_duration, SweepSummary, UnitOutcome};
use crate::progress::Phase;
use crate::work_unit::WorkUnit;

/// Final report of a sweep.
pub fn render_summary(summary: &SweepSummary, use_colors: bool) -> String {
    let mut out = String::new();
    for outcome in &summary.outcomes {
        let line = match outcome {
            UnitOutcome::Completed(report) => {
                let mark = paint(use_colors, "ok", Tone::Good);
                let detail = if let Some(job) = &report.submitted_job {
                    format!("submitted as {}", job)
                } else if report.executed.is_empty() {
                    "all phases checkpointed".to_string()
                } else {
                    format!(
                        "ran {} ({} attempt{})",
                        join_phases(&report.executed),
                        report.attempts,
                        if report.attempts == 1 { "" } else { "s" }
                    )
                };
                format!("{:>6}  {}  {}", mark, report.unit, detail)
            }
            UnitOutcome::Failed { unit, error } => {
                let mark = paint(use_colors, "failed", Tone::Bad);
                format!("{:>6}  {}  {}", mark, unit, error)
            }
        };
        let _ = writeln!(out, "{}", line);
    }

    let completed = summary.completed().count();
    let failed = summary.failed_count();
    let headline = format!(
        "{} completed, {} failed, {} not started in {}",
        completed,
        failed,
        summary.not_started(),
        format_duration(summary.duration)
    );
    let tone = if summary.is_success() {
        Tone::Good
    } else if summary.cancelled {
        Tone::Warn
    } else {
        Tone::Bad
    };
    let _ = writeln!(out, "{}", paint(use_colors, &headline, tone));
    if summary.cancelled {
        let _ = writeln!(out, "{}", paint(use_colors, "sweep cancelled", Tone::Warn));
    }
    out
}

/// Per-unit phase validity table.
pub fn render_status(rows: &[(WorkUnit, PhaseValidity)], use_colors: bool) -> String {
    let width = rows
        .iter()
        .map(|(unit, _)| unit.to_string().len())
        .max()
        .unwrap_or(4)
        .max(4);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$}  {:<7}  {:<7}  {:<7}  primary",
        "unit",
        "setup",
        "run",
        "extract",
        width = width
    );
    for (unit, validity) in rows {
        let cells: Vec<String> = Phase::ALL
            .iter()
            .map(|phase| {
                let (text, tone) = if validity.is_valid(*phase) {
                    ("valid", Tone::Good)
                } else {
                    ("pending", Tone::Warn)
                };
                // Pad before painting so escape codes do not break alignment.
                paint(use_colors, &format!("{:<7}", text), tone)
            })
            .collect();
        let _ = writeln!(
            out,
            "{:<width$}  {}  {}  {}  {}",
            unit.to_string(),
            cells[0],
            cells[1],
            cells[2],
            validity.primary,
            width = width
        );
    }
    let done = rows
        .iter()
        .filter(|(_, validity)| Phase::ALL.iter().all(|phase| validity.is_valid(*phase)))
        .count();
    let _ = writeln!(out, "{}/{} units fully checkpointed", done, rows.len());
    out
}

#[derive(Clone, Copy)]
enum Tone {
    Good,
    Warn,
    Bad,
}

fn paint(use_colors: bool, text: &str, tone: Tone) -> String {
    if !use_colors {
        return text.to_string();
    }
    match tone {
        Tone::Good => text.green().to_string(),
        Tone::Warn => text.yellow().to_string(),
        Tone::Bad => text.red().to_string(),
    }
}

fn join_phases(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(Phase::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ArtifactState;
    use crate::pipeline::UnitReport;
    use std::time::Duration;

    fn unit() -> WorkUnit {
        WorkUnit::new("thelonious", 700, "by_cheek", "center", "vertical")
    }

    #[test]
    fn test_summary_lists_units_and_totals() {
        let summary = SweepSummary {
            total: 2,
            outcomes: vec![UnitOutcome::Completed(UnitReport {
                unit: unit(),
                executed: vec![Phase::Run, Phase::Extract],
                skipped: vec![Phase::Setup],
                attempts: 3,
                submitted_job: None,
                duration: Duration::from_secs(5),
            })],
            cancelled: true,
            duration: Duration::from_secs(65),
        };
        let text = render_summary(&summary, false);
        assert!(text.contains("thelonious/700MHz/by_cheek_center_vertical  ran run, extract (3 attempts)"));
        assert!(text.contains("1 completed, 0 failed, 1 not started in 00:01:05"));
        assert!(text.contains("sweep cancelled"));
    }

    #[test]
    fn test_status_table() {
        let rows = vec![(
            unit(),
            PhaseValidity {
                setup_valid: true,
                run_valid: false,
                extract_valid: false,
                primary: ArtifactState::Valid,
                record_matches: true,
            },
        )];
        let text = render_status(&rows, false);
        assert!(text.contains("valid    pending  pending"));
        assert!(text.ends_with("0/1 units fully checkpointed\n"));
    }
}
