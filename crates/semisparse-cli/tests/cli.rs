//! CLI integration tests for semisparse-cli

#![allow(clippy::unwrap_used)] // Tests can use unwrap

use assert_cmd::Command;
use predicates::prelude::*;

// ============================================================================
// Helper Functions
// ============================================================================

/// Create a semisparse command
fn semisparse() -> Command {
    Command::cargo_bin("semisparse").expect("Failed to find semisparse binary")
}

// ============================================================================
// Help and arguments
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    semisparse()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bench"))
        .stdout(predicate::str::contains("checkpoint"));
}

#[test]
fn test_bench_requires_mode() {
    semisparse()
        .arg("bench")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--mode"));
}

#[test]
fn test_bench_rejects_unknown_mode() {
    semisparse()
        .args(["bench", "--mode", "resnet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nvidia-fixed-mn"));
}

#[test]
fn test_bench_rejects_non_positive_run_time() {
    let dir = tempfile::tempdir().unwrap();
    semisparse()
        .args(["bench", "--mode", "test", "--min-run-time", "0"])
        .arg("--output-dir")
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--min-run-time"));
}

// ============================================================================
// bench
// ============================================================================

#[test]
fn test_bench_test_mode_writes_csv() {
    let dir = tempfile::tempdir().unwrap();
    semisparse()
        .args(["-q", "bench", "--mode", "test", "--min-run-time", "0.01"])
        .arg("--output-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("speedup (d/s)"))
        .stdout(predicate::str::contains("test.csv"));

    let csv = std::fs::read_to_string(dir.path().join("test.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next().unwrap(),
        ",m,k,n,dtype,sparse_latency (ms),dense_latency (ms),speedup (d/s),correct"
    );
    let row = lines.next().unwrap();
    assert!(row.starts_with("0,64,128,64,float16,"), "{row}");
    assert!(row.ends_with(",True"), "{row}");
    assert!(lines.next().is_none());
}

// ============================================================================
// checkpoint
// ============================================================================

#[test]
fn test_checkpoint_default_mesh() {
    let dir = tempfile::tempdir().unwrap();
    semisparse()
        .args(["checkpoint", "--dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("4 ranks"))
        .stdout(predicate::str::contains("__3_0.distcp"))
        .stdout(predicate::str::contains("[PASS]"));
    assert!(dir.path().join(".metadata").exists());
}

#[test]
fn test_checkpoint_in_temporary_directory() {
    semisparse()
        .args(["checkpoint", "--dp", "1", "--tp", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dp=1 x tp=4"));
}

#[test]
fn test_verbose_logs_parsed_command() {
    semisparse()
        .env_remove("RUST_LOG")
        .args(["-v", "checkpoint", "--dp", "1", "--tp", "1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed command"))
        .stderr(predicate::str::contains("Checkpoint"));
}

#[test]
fn test_checkpoint_rejects_indivisible_tp() {
    semisparse()
        .args(["checkpoint", "--dp", "1", "--tp", "3"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_checkpoint_rejects_empty_mesh() {
    semisparse()
        .args(["checkpoint", "--dp", "0"])
        .assert()
        .code(2);
}
