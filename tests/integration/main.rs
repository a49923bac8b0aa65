//! CLI integration tests for the `sweep` binary.

mod cli_sweep;
