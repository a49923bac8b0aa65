use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;

use crate::pipeline::format_duration;
use crate::progress::Phase;
use crate::telemetry::{Severity, TelemetrySink};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}";

/// Sweep-level progress bar on stderr. Log lines are printed above the bar.
#[derive(Debug)]
pub struct ProgressBarSink {
    bar: ProgressBar,
    verbose: bool,
    use_colors: bool,
    target: Mutex<Option<u64>>,
}

impl ProgressBarSink {
    pub fn new(verbose: bool, use_colors: bool) -> Self {
        let bar = ProgressBar::with_draw_target(Some(100), ProgressDrawTarget::stderr());
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        bar.set_style(style);
        Self {
            bar,
            verbose,
            use_colors,
            target: Mutex::new(None),
        }
    }

    /// Hidden bar, log lines still go to stderr.
    pub fn hidden(verbose: bool) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            verbose,
            use_colors: false,
            target: Mutex::new(None),
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn print(&self, line: String) {
        if self.bar.is_hidden() {
            eprintln!("{}", line);
        } else {
            self.bar.println(line);
        }
    }

    fn decorate(&self, severity: Severity, message: &str) -> String {
        if !self.use_colors {
            return format!("[{}] {}", severity, message);
        }
        match severity {
            Severity::Verbose => format!("{}", message.dimmed()),
            Severity::Progress => message.to_string(),
            Severity::Success => format!("{} {}", "✓".green(), message),
            Severity::Warning => format!("{} {}", "!".yellow(), message.yellow()),
            Severity::Error | Severity::Fatal => {
                format!("{} {}", "✗".red().bold(), message.red())
            }
        }
    }
}

impl TelemetrySink for ProgressBarSink {
    fn log(&self, severity: Severity, message: &str) {
        if severity == Severity::Verbose && !self.verbose {
            return;
        }
        self.print(self.decorate(severity, message));
    }

    fn progress(&self, phase: Phase, current: u64, total: u64) {
        if total > 0 && current < total {
            self.bar
                .set_message(format!("{} {}%", phase, current * 100 / total));
        } else {
            self.bar.set_message(phase.to_string());
        }
    }

    fn start_animation(&self, estimated: Duration, target_step: u64) {
        if let Ok(mut target) = self.target.lock() {
            *target = Some(target_step.min(100));
        }
        self.bar
            .set_message(format!("expected {}", format_duration(estimated)));
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    fn stop_animation(&self) {
        self.bar.disable_steady_tick();
        let target = self.target.lock().ok().and_then(|mut target| target.take());
        if let Some(step) = target {
            if step > self.bar.position() {
                self.bar.set_position(step);
            }
        }
    }
}
