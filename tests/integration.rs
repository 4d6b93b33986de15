//! Integration tests for the gridrun CLI.
//!
//! Each test runs the compiled binary against an isolated temporary work
//! directory and validates that:
//!   1. stdout contains valid JSON only.
//!   2. The JSON carries the `ok` / `type` envelope fields.
//!   3. Command-specific fields are present.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Path to the compiled binary.
fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop(); // remove test binary name
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("gridrun");
    p
}

/// Test harness owning an isolated temporary directory with a generated
/// task configuration and an optional stub-executable dir for `PATH`.
struct TestHarness {
    tmp: tempfile::TempDir,
    config_path: PathBuf,
    stub_dir: PathBuf,
}

impl TestHarness {
    fn new(extra_config: &str) -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let stub_dir = tmp.path().join("bin");
        std::fs::create_dir(&stub_dir).expect("create stub dir");

        let config = format!(
            r#"
working_dir = {workdir:?}
sandbox_path = {sandbox:?}
wall_time = "1:00:00"
executable = "payload.sh"
task_id = "GCitest"
{extra_config}
"#,
            workdir = tmp.path().join("work").display().to_string(),
            sandbox = tmp.path().join("sandbox").display().to_string(),
        );
        let config_path = tmp.path().join("task.toml");
        std::fs::write(&config_path, config).expect("write config");

        TestHarness {
            tmp,
            config_path,
            stub_dir,
        }
    }

    fn add_stub(&self, name: &str, body: &str) {
        let path = self.stub_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");
    }

    /// Run the binary with PATH pointing only at the stub dir; panic on
    /// non-JSON stdout.
    fn run(&self, args: &[&str]) -> serde_json::Value {
        let output = Command::new(binary())
            .arg("--config")
            .arg(&self.config_path)
            .args(args)
            .env("PATH", &self.stub_dir)
            .output()
            .expect("run binary");
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            !stdout.trim().is_empty(),
            "stdout is empty (stderr: {stderr})\nargs: {args:?}"
        );
        serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
            panic!("stdout is not valid JSON: {e}\nstdout: {stdout}\nstderr: {stderr}")
        })
    }

    fn work_dir(&self) -> PathBuf {
        self.tmp.path().join("work")
    }

    fn sandbox_dir(&self) -> PathBuf {
        self.tmp.path().join("sandbox")
    }
}

fn assert_envelope(v: &serde_json::Value, expected_type: &str, expected_ok: bool) {
    assert_eq!(v["ok"].as_bool(), Some(expected_ok), "ok mismatch: {v}");
    assert_eq!(
        v["type"].as_str(),
        Some(expected_type),
        "type mismatch: {v}"
    );
}

fn find_marker(base: &Path, gc_id: &str) -> Option<PathBuf> {
    for entry in std::fs::read_dir(base).ok()?.flatten() {
        let candidate = entry.path().join(gc_id);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

// ── detect ─────────────────────────────────────────────────────────────────

#[test]
fn detect_reports_lsf_when_only_bsub_is_present() {
    let h = TestHarness::new("");
    h.add_stub("bsub", "exit 0");
    let v = h.run(&["detect"]);
    assert_envelope(&v, "detect", true);
    assert_eq!(v["backend"].as_str(), Some("LSF"));
}

#[test]
fn detect_without_any_backend_is_a_typed_error() {
    let h = TestHarness::new("");
    let v = h.run(&["detect"]);
    assert_envelope(&v, "error", false);
    assert_eq!(v["error"]["code"].as_str(), Some("backend_error"));
    let message = v["error"]["message"].as_str().unwrap_or("");
    for probe in ["sacct", "sgepasswd", "pbs-config", "qsub", "bsub", "job_slurm"] {
        assert!(message.contains(probe), "{probe} missing from: {message}");
    }
}

// ── submit / status ────────────────────────────────────────────────────────

#[test]
fn submit_records_backend_id_and_marker_file() {
    let h = TestHarness::new(
        r#"
wms = "SLURM"
[[parameter]]
name = "SEED"
values = ["271828"]
"#,
    );
    h.add_stub("sbatch", "echo 'Submitted batch job 4242'");

    let v = h.run(&["submit"]);
    assert_envelope(&v, "submit", true);
    assert_eq!(v["backend"].as_str(), Some("SLURM"));
    assert_eq!(v["submitted"].as_u64(), Some(1));
    assert_eq!(v["failed"].as_u64(), Some(0));
    assert_eq!(v["jobs"][0]["gc_id"].as_str(), Some("WMSID.SLURM.4242"));

    // The job record was committed with the new state.
    let record =
        std::fs::read_to_string(h.work_dir().join("jobs/job_0.txt")).expect("job record");
    assert!(record.contains("id=WMSID.SLURM.4242"), "record: {record}");
    assert!(record.contains("status=SUBMITTED"), "record: {record}");
    assert!(record.contains("attempt=1"), "record: {record}");

    // The sandbox carries the reverse-lookup marker.
    assert!(find_marker(&h.sandbox_dir(), "WMSID.SLURM.4242").is_some());

    let v = h.run(&["status"]);
    assert_envelope(&v, "status", true);
    assert_eq!(v["jobs"].as_u64(), Some(1));
    assert_eq!(v["states"]["SUBMITTED"].as_u64(), Some(1));
}

#[test]
fn failed_submission_leaves_job_in_init() {
    let h = TestHarness::new(
        r#"
wms = "SLURM"
[[parameter]]
name = "SEED"
values = ["1"]
"#,
    );
    h.add_stub("sbatch", "echo 'sbatch: error: something went wrong' >&2; exit 1");

    let v = h.run(&["submit"]);
    assert_envelope(&v, "submit", true);
    assert_eq!(v["submitted"].as_u64(), Some(0));
    assert_eq!(v["failed"].as_u64(), Some(1));

    let v = h.run(&["status"]);
    assert_eq!(v["states"]["INIT"].as_u64(), Some(1));
}

#[test]
fn status_without_submissions_reports_init_jobs() {
    let h = TestHarness::new(
        r#"
[[parameter]]
name = "A"
values = ["x", "y"]
[[parameter]]
name = "B"
values = ["1", "2", "3"]
"#,
    );
    let v = h.run(&["status"]);
    assert_envelope(&v, "status", true);
    assert_eq!(v["task_id"].as_str(), Some("GCitest"));
    // 2 x 3 cross product.
    assert_eq!(v["jobs"].as_u64(), Some(6));
    assert_eq!(v["states"]["INIT"].as_u64(), Some(6));
}

// ── resync ─────────────────────────────────────────────────────────────────

#[test]
fn resync_with_unchanged_space_reports_nothing() {
    let h = TestHarness::new(
        r#"
[[parameter]]
name = "SEED"
values = ["1", "2"]
"#,
    );
    let v = h.run(&["resync"]);
    assert_envelope(&v, "resync", true);
    assert_eq!(v["redo"].as_array().map(Vec::len), Some(0));
    assert_eq!(v["disable"].as_array().map(Vec::len), Some(0));
    assert_eq!(v["size_changed"].as_bool(), Some(false));
}

// ── error envelope ─────────────────────────────────────────────────────────

#[test]
fn missing_executable_is_a_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    let config_path = tmp.path().join("task.toml");
    std::fs::write(
        &config_path,
        format!(
            "working_dir = {:?}\nwall_time = \"1:00:00\"\n",
            tmp.path().join("work").display().to_string()
        ),
    )
    .unwrap();

    let output = Command::new(binary())
        .args(["--config", config_path.to_str().unwrap(), "status"])
        .output()
        .expect("run binary");
    assert!(!output.status.success());
    let v: serde_json::Value =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_envelope(&v, "error", false);
    assert_eq!(v["error"]["code"].as_str(), Some("config_error"));
}
