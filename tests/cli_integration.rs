//! CLI Integration Tests
//!
//! These tests verify that the CLI commands work correctly end-to-end.
//! They test the actual binary behavior, not just the library.
//!
//! Run with:
//! ```bash
//! cargo test --test cli_integration
//! ```

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

/// Get the path to the built binary
fn rollupdb_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rollupdb"))
}

/// Run rollupdb command and return (stdout, stderr, success)
fn run_rollupdb(args: &[&str], dir: &Path) -> (String, String, bool) {
    let db_path = dir.join("db.rollup");
    let config_path = dir.join("config.json");
    let output = Command::new(rollupdb_binary())
        .env_remove("ROLLUP_DB_BACKEND")
        .env_remove("ROLLUP_DB_PATH")
        .env_remove("ROLLUP_DB_MAX_HEIGHT")
        .env_remove("ROLLUP_DB_WORKERS")
        .arg("-d")
        .arg(&db_path)
        .arg("-c")
        .arg(&config_path)
        .args(["-f", "json"])
        .args(args)
        .output()
        .expect("Failed to execute rollupdb");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

/// Run a command that must succeed and parse its JSON output
fn run_json(args: &[&str], dir: &Path) -> Value {
    let (stdout, stderr, success) = run_rollupdb(args, dir);
    assert!(success, "{:?} failed: {}", args, stderr);
    serde_json::from_str(stdout.trim()).expect("output should be JSON")
}

// ============================================================================
// Database Initialization Tests
// ============================================================================

#[test]
fn test_cli_init_creates_database() {
    let dir = tempdir().unwrap();

    let value = run_json(&["init"], dir.path());

    assert_eq!(value["status"], "ok");
    assert_eq!(value["collections"].as_array().unwrap().len(), 0);
    assert!(dir.path().join("db.rollup").exists(), "database file should be created");
}

#[test]
fn test_cli_default_path_is_rollup_db() {
    let output = Command::new(rollupdb_binary())
        .args(["--help"])
        .output()
        .expect("Failed to execute rollupdb");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("rollup.db"),
        "Default database path should be rollup.db, got: {}",
        stdout
    );
}

// ============================================================================
// Collection and Document Tests
// ============================================================================

#[test]
fn test_cli_create_collection() {
    let dir = tempdir().unwrap();

    let value = run_json(&["create", "docs", "--height", "8"], dir.path());
    assert_eq!(value["collection"], "docs");
    assert_eq!(value["height"], 8);

    let (_, stderr, success) = run_rollupdb(&["create", "docs"], dir.path());
    assert!(!success, "duplicate create should fail");
    assert!(stderr.contains("docs"), "error should name the collection: {}", stderr);
}

#[test]
fn test_cli_rejects_reserved_names() {
    let dir = tempdir().unwrap();
    let (_, _, success) = run_rollupdb(&["create", "__chain__"], dir.path());
    assert!(!success);
}

#[test]
fn test_cli_put_and_get_persist_across_invocations() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "8"], dir.path());

    let put = run_json(&["put", "docs", "3", "hello world"], dir.path());
    assert_eq!(put["sequence"], 0);
    assert_eq!(put["kind"], "insert");

    let get = run_json(&["get", "docs", "3"], dir.path());
    assert_eq!(get["document"], "hello world");

    let root = run_json(&["root", "docs"], dir.path());
    assert_eq!(root["root"], put["root"]);

    let missing = run_json(&["get", "docs", "4"], dir.path());
    assert!(missing["document"].is_null());
}

#[test]
fn test_cli_put_conflicts_fail() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "8"], dir.path());
    run_json(&["put", "docs", "1", "a"], dir.path());

    let (_, _, success) = run_rollupdb(&["put", "docs", "1", "b"], dir.path());
    assert!(!success, "insert into occupied slot should fail");

    let (_, _, success) = run_rollupdb(&["put", "docs", "2", "b", "--kind", "update"], dir.path());
    assert!(!success, "update of empty slot should fail");

    let (_, _, success) = run_rollupdb(&["put", "docs", "256", "b"], dir.path());
    assert!(!success, "index beyond the tree should fail");

    let update = run_json(&["put", "docs", "1", "b", "--kind", "update"], dir.path());
    assert_eq!(update["sequence"], 1);
}

#[test]
fn test_cli_delete_clears_slot() {
    let dir = tempdir().unwrap();
    let created = run_json(&["create", "docs", "--height", "8"], dir.path());
    run_json(&["put", "docs", "5", "temp"], dir.path());

    let deleted = run_json(&["delete", "docs", "5"], dir.path());
    assert_eq!(deleted["root"], created["root"]);

    let get = run_json(&["get", "docs", "5"], dir.path());
    assert!(get["document"].is_null());
}

#[test]
fn test_cli_witness_verifies() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "8"], dir.path());
    run_json(&["put", "docs", "7", "payload"], dir.path());

    let witness = run_json(&["witness", "docs", "7"], dir.path());
    assert_eq!(witness["valid"], true);
    assert_eq!(witness["path"].as_array().unwrap().len(), 8);

    let empty = run_json(&["witness", "docs", "8"], dir.path());
    assert_eq!(empty["valid"], true);
    assert_eq!(empty["leaf"], "0".repeat(64));
}

// ============================================================================
// Pipeline Tests
// ============================================================================

#[test]
fn test_cli_prove_and_rollup_settle() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "8"], dir.path());
    run_json(&["put", "docs", "1", "a"], dir.path());
    run_json(&["put", "docs", "2", "b"], dir.path());

    let proved = run_json(&["prove", "docs"], dir.path());
    assert_eq!(proved["handled"], 2);
    assert_eq!(proved["proved"], 2);

    let rollup = run_json(&["rollup", "docs", "--settle"], dir.path());
    let outcomes = rollup["outcomes"].as_array().unwrap();
    assert_eq!(outcomes[0]["outcome"], "submitted");
    assert_eq!(outcomes[1]["outcome"], "confirmed");
    assert_eq!(rollup["status"]["pending_action_count"], 0);
    assert_eq!(
        rollup["status"]["confirmed_root"],
        rollup["status"]["current_root"]
    );

    let status = run_json(&["status", "docs"], dir.path());
    assert_eq!(status["last_rollup_status"], "confirmed");
    assert_eq!(status["phase"], "idle");
}

#[test]
fn test_cli_rollup_waits_across_invocations() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "8"], dir.path());
    run_json(&["put", "docs", "1", "a"], dir.path());
    run_json(&["prove", "docs"], dir.path());

    let submitted = run_json(&["rollup", "docs"], dir.path());
    assert_eq!(submitted["outcomes"][0]["outcome"], "submitted");
    assert_eq!(submitted["status"]["phase"], "waiting_confirmation");

    let settled = run_json(&["rollup", "docs", "--settle"], dir.path());
    let outcomes = settled["outcomes"].as_array().unwrap();
    assert_eq!(outcomes[0]["outcome"], "waiting");
    assert_eq!(outcomes[1]["outcome"], "confirmed");
}

#[test]
fn test_cli_rollup_without_proofs_is_idle() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "8"], dir.path());
    run_json(&["put", "docs", "1", "a"], dir.path());

    let rollup = run_json(&["rollup", "docs"], dir.path());
    assert_eq!(rollup["outcomes"][0]["outcome"], "idle");
    assert_eq!(rollup["status"]["pending_action_count"], 1);
}

#[test]
fn test_cli_run_settles_every_collection() {
    let dir = tempdir().unwrap();
    run_json(&["create", "alpha", "--height", "6"], dir.path());
    run_json(&["create", "beta", "--height", "6"], dir.path());
    for i in 0..5 {
        let index = i.to_string();
        run_json(&["put", "alpha", &index, "a"], dir.path());
        run_json(&["put", "beta", &index, "b"], dir.path());
    }

    let run = run_json(&["run", "--timeout", "20", "--interval", "5"], dir.path());
    assert_eq!(run["settled"], true, "run output: {}", run);
    for status in run["collections"].as_array().unwrap() {
        assert_eq!(status["pending_action_count"], 0);
        assert_eq!(status["confirmed_root"], status["current_root"]);
    }

    // Settlement is saved with the rest of the state
    let status = run_json(&["status", "beta"], dir.path());
    assert_eq!(status["last_rollup_status"], "confirmed");
    assert_eq!(status["phase"], "idle");
}

#[test]
fn test_cli_status_lists_collections() {
    let dir = tempdir().unwrap();
    run_json(&["create", "alpha", "--height", "4"], dir.path());
    run_json(&["create", "beta", "--height", "4"], dir.path());

    let status = run_json(&["status"], dir.path());
    let collections = status["collections"].as_array().unwrap();
    assert_eq!(collections.len(), 2);
    assert_eq!(collections[0]["collection"], "alpha");
    assert_eq!(collections[1]["collection"], "beta");
    assert_eq!(status["quarantined"].as_array().unwrap().len(), 0);
}

#[test]
fn test_cli_drop_collection() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "4"], dir.path());
    run_json(&["drop", "docs"], dir.path());

    let (_, _, success) = run_rollupdb(&["get", "docs", "0"], dir.path());
    assert!(!success, "dropped collection should be gone");
}

#[test]
fn test_cli_unknown_collection_fails() {
    let dir = tempdir().unwrap();
    let (_, stderr, success) = run_rollupdb(&["status", "nope"], dir.path());
    assert!(!success);
    assert!(stderr.contains("nope"), "error should name the collection: {}", stderr);
}

#[test]
fn test_cli_retry_unknown_task_fails() {
    let dir = tempdir().unwrap();
    run_json(&["create", "docs", "--height", "4"], dir.path());
    let (_, _, success) = run_rollupdb(&["retry", "docs", "42"], dir.path());
    assert!(!success);
}
