//! End-to-end runs of the `sweep` binary against shell-script stand-ins for
//! the solver and the setup/extract hooks.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const STUDY: &str = r#"{
    "simulation_parameters": {"max_step_mm": 1.5},
    "phantoms": ["thelonious"],
    "frequencies_mhz": [700, 900],
    "antenna_config": {"700": {"grid_mm": 2.0}, "900": {"grid_mm": 1.8}},
    "placement_scenarios": {
        "by_cheek": {"positions": {"center": {}}, "orientations": {"vertical": {}}}
    }
}"#;

/// Get a Command instance for the sweep binary
#[allow(deprecated)]
fn sweep_cmd() -> Command {
    Command::cargo_bin("sweep").expect("Failed to find sweep binary")
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("study.json"), STUDY).unwrap();
        fs::write(
            dir.path().join("setup.sh"),
            "printf '\\211HDF\\r\\n\\032\\nscene' > \"$1\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("extract.sh"),
            "echo '{\"psSAR10g\": 1.0}' > \"$1/sar_results.json\"\n",
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn results(&self) -> PathBuf {
        self.path().join("results")
    }

    /// Solver script that fails `failures` times per unit with `failure_line`.
    #[cfg(unix)]
    fn write_solver(&self, failures: u32, failure_line: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = format!(
            r#"#!/bin/sh
input="$2"
dir=$(dirname "$input")
count=$(cat "$dir/attempts" 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > "$dir/attempts"
if [ "$count" -le {failures} ]; then
  echo "{failure_line}"
  exit 1
fi
echo "[PROGRESS]: 10% [ 1/10 ] Time Update, estimated remaining time 9 seconds @ 100.00 MCells/s"
echo "[PROGRESS]: 70% [ 7/10 ] Time Update, estimated remaining time 3 seconds @ 100.00 MCells/s"
mkdir -p "$dir/project.smash_Results"
echo fields > "$dir/project.smash_Results/run_Output.h5"
exit 0
"#
        );
        let path = self.path().join("solver.sh");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn write_config(&self, solver: &Path, extra: &str) -> PathBuf {
        let config = format!(
            r#"
[execution]
solver_binary = "{solver}"
poll_interval_ms = 20
retry_delay_ms = 0
settle_time_ms = 0
result_name = "**/*_Output.h5"
keep_awake = false
{extra}

[sweep]
results_root = "{results}"

[hooks]
setup = ["sh", "{setup}", "{{project}}"]
extract = ["sh", "{extract}", "{{unit_dir}}"]
"#,
            solver = solver.display(),
            results = self.results().display(),
            setup = self.path().join("setup.sh").display(),
            extract = self.path().join("extract.sh").display(),
            extra = extra,
        );
        let path = self.path().join("sweep.toml");
        fs::write(&path, config).unwrap();
        path
    }

    fn cmd(&self, subcommand: &str, config: &Path) -> Command {
        let mut cmd = sweep_cmd();
        cmd.arg(subcommand)
            .arg("--config")
            .arg(config)
            .arg("--study")
            .arg(self.path().join("study.json"))
            .env_remove("RUST_LOG");
        cmd
    }

    fn unit_dir(&self, frequency: u32) -> PathBuf {
        self.results()
            .join("thelonious")
            .join(format!("{}MHz", frequency))
            .join("by_cheek_center_vertical")
    }
}

#[test]
fn test_print_config_defaults() {
    sweep_cmd()
        .arg("print-config")
        .env_remove("RUST_LOG")
        .assert()
        .success()
        .stdout(predicate::str::contains("[execution]"))
        .stdout(predicate::str::contains("strategy = \"direct\""))
        .stdout(predicate::str::contains("[checkpoint.artifacts]"));
}

#[test]
fn test_unsupported_strategy_is_rejected() {
    let ws = Workspace::new();
    let config = ws.write_config(Path::new("/bin/true"), "strategy = \"local_api\"");
    ws.cmd("run", &config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("needs an embedding application"));
}

#[cfg(unix)]
#[test]
fn test_run_then_resume_skips_checkpointed_units() {
    let ws = Workspace::new();
    let solver = ws.write_solver(0, "");
    let config = ws.write_config(&solver, "");

    ws.cmd("status", &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("0/2 units fully checkpointed"));

    ws.cmd("run", &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 completed, 0 failed, 0 not started"))
        .stdout(predicate::str::contains("ran setup, run, extract (1 attempt)"));

    for frequency in [700, 900] {
        let dir = ws.unit_dir(frequency);
        assert!(dir.join("checkpoint.json").exists());
        assert!(dir.join("sar_results.json").exists());
        assert!(dir.join("snapshot.json").exists());
    }
    assert!(ws.results().join("sweep_history.json").exists());

    ws.cmd("status", &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("2/2 units fully checkpointed"));

    ws.cmd("run", &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("all phases checkpointed"));
    assert_eq!(
        fs::read_to_string(ws.unit_dir(700).join("attempts")).unwrap().trim(),
        "1"
    );
}

#[cfg(unix)]
#[test]
fn test_transient_failure_is_retried() {
    let ws = Workspace::new();
    let solver = ws.write_solver(1, "ERROR: license server not responding");
    let config = ws.write_config(&solver, "");

    ws.cmd("run", &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("(2 attempts)"))
        .stderr(predicate::str::contains("retrying"));
}

#[cfg(unix)]
#[test]
fn test_out_of_memory_fails_units() {
    let ws = Workspace::new();
    let solver = ws.write_solver(5, "ERROR: out of memory while allocating field arrays");
    let config = ws.write_config(&solver, "");

    ws.cmd("run", &config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("0 completed, 2 failed"))
        .stdout(predicate::str::contains("out of memory"));
    assert_eq!(
        fs::read_to_string(ws.unit_dir(900).join("attempts")).unwrap().trim(),
        "1"
    );
}

#[cfg(unix)]
#[test]
fn test_capped_attempts_from_command_line() {
    let ws = Workspace::new();
    let solver = ws.write_solver(5, "ERROR: solver crashed");
    let config = ws.write_config(&solver, "");

    ws.cmd("run", &config)
        .arg("--max-attempts")
        .arg("2")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("giving up after 2 attempts"));
}

#[cfg(unix)]
#[test]
fn test_skipping_setup_without_checkpoint_fails() {
    let ws = Workspace::new();
    let solver = ws.write_solver(0, "");
    let config = ws.write_config(&solver, "");

    ws.cmd("run", &config)
        .arg("--skip")
        .arg("setup")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("run needs setup"));
    assert!(!ws.unit_dir(700).join("attempts").exists());
}

#[cfg(unix)]
#[test]
fn test_shards_split_the_sweep() {
    let ws = Workspace::new();
    let solver = ws.write_solver(0, "");
    let config = ws.write_config(&solver, "");

    ws.cmd("run", &config)
        .args(["--shard-index", "1", "--shard-count", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 completed"));
    assert!(!ws.unit_dir(700).join("checkpoint.json").exists());
    assert!(ws.unit_dir(900).join("checkpoint.json").exists());
}
