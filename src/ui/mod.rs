//! Terminal output for the `sweep` binary.

pub mod progress;
pub mod summary;

pub use progress::ProgressBarSink;
pub use summary::{render_status, render_summary};
