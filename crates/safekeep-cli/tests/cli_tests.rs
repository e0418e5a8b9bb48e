//! Integration tests for the `safekeep` CLI binary.
//!
//! These tests run the CLI as a subprocess against a redb file in a
//! temporary directory, so state carries over between invocations of the
//! same test.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Command;

use serde_json::Value;

/// Helper: locate the `safekeep` binary built by `cargo test`.
fn safekeep_bin() -> String {
    let path = env!("CARGO_BIN_EXE_safekeep");
    assert!(
        Path::new(path).exists(),
        "safekeep binary not found at {path}"
    );
    path.to_owned()
}

/// Helper: run safekeep with args against `store` and return
/// (`exit_code`, stdout, stderr).
fn run_in(store: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new(safekeep_bin())
        .args(args)
        .env("SAFEKEEP_STORAGE", "redb")
        .env("SAFEKEEP_STORAGE_PATH", store.join("safekeep.redb"))
        .env("SAFEKEEP_LOG_LEVEL", "off")
        .env("SAFEKEEP_AUDIT_FILE", store.join("audit.log"))
        .env_remove("SAFEKEEP_PRINCIPAL")
        .env_remove("SAFEKEEP_GROUPS")
        .env_remove("SAFEKEEP_ADMINS")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute safekeep");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

/// Helper: run a command that must succeed and parse its JSON output.
fn ok_json(store: &Path, args: &[&str]) -> Value {
    let (code, stdout, stderr) = run_in(store, args);
    assert_eq!(code, 0, "safekeep {args:?} failed: {stderr}");
    serde_json::from_str(&stdout).expect("stdout should be JSON")
}

/// Helper: run a command that must fail and return the error kind.
fn err_kind(store: &Path, args: &[&str]) -> String {
    let (code, _, stderr) = run_in(store, args);
    assert_eq!(code, 1, "safekeep {args:?} should exit 1");
    let body: Value = serde_json::from_str(stderr.trim()).expect("stderr should be JSON");
    body["error"]["kind"].as_str().unwrap().to_owned()
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["--version"]);
    assert_eq!(code, 0, "safekeep --version should exit 0");
    assert!(
        stdout.contains("safekeep"),
        "version output should contain 'safekeep': {stdout}"
    );
}

#[test]
fn test_help_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["--help"]);
    assert_eq!(code, 0, "safekeep --help should exit 0");
    assert!(stdout.contains("SafeKeep CLI"), "help should mention SafeKeep CLI");
    for sub in ["safe", "approle", "aws"] {
        assert!(stdout.contains(sub), "help should list '{sub}'");
    }
}

#[test]
fn test_subcommand_help() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["safe", "--help"]);
    assert_eq!(code, 0);
    for sub in ["create", "grant", "transfer", "list-all"] {
        assert!(stdout.contains(sub), "safe help should list '{sub}'");
    }
}

// ── Input validation ─────────────────────────────────────────────────

#[test]
fn test_missing_principal() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(err_kind(dir.path(), &["safe", "get", "shared/team"]), "cli");
}

#[test]
fn test_invalid_permission_rejected_by_parser() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run_in(
        dir.path(),
        &["--as", "user:alice", "safe", "grant", "shared/team", "user:bob", "admin"],
    );
    assert_eq!(code, 2, "clap usage errors exit 2");
    assert!(stderr.contains("admin"));
}

#[test]
fn test_invalid_safe_path() {
    let dir = tempfile::tempdir().unwrap();
    let kind = err_kind(dir.path(), &["--as", "user:alice", "safe", "create", "vault/team"]);
    assert_eq!(kind, "invalid_argument");
}

// ── Safe lifecycle ───────────────────────────────────────────────────

#[test]
fn test_safe_lifecycle_persists_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path();

    let created = ok_json(
        store,
        &["--as", "user:alice", "safe", "create", "shared/team", "--description", "team secrets"],
    );
    assert_eq!(created["path"], "shared/team");
    assert_eq!(created["description"], "team secrets");

    let granted = ok_json(
        store,
        &["--as", "user:alice", "safe", "grant", "shared/team", "user:bob", "read"],
    );
    assert_eq!(granted["changed"], true);

    let listed = ok_json(store, &["--as", "user:bob", "safe", "list-all"]);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["path"], "shared/team");

    assert_eq!(
        err_kind(store, &["--as", "user:bob", "safe", "grant", "shared/team", "user:eve", "read"]),
        "permission_denied"
    );
    assert_eq!(
        err_kind(store, &["--as", "user:alice", "safe", "create", "shared/team"]),
        "already_exists"
    );

    let transferred = ok_json(
        store,
        &["--as", "user:alice", "safe", "transfer", "shared/team", "user:bob"],
    );
    assert_eq!(transferred["stage"], "completed");
    assert_eq!(transferred["new_owner"]["kind"], "user");
    assert_eq!(transferred["new_owner"]["id"], "bob");

    let names = ok_json(store, &["--as", "user:bob", "safe", "names"]);
    assert_eq!(names["shared"][0], "team");

    ok_json(store, &["--as", "user:bob", "safe", "delete", "shared/team"]);
    assert_eq!(
        err_kind(store, &["--as", "user:bob", "safe", "get", "shared/team"]),
        "not_found"
    );

    let audit = std::fs::read_to_string(store.join("audit.log")).unwrap();
    assert_eq!(audit.lines().count(), 4);
}

// ── AppRole lifecycle ────────────────────────────────────────────────

#[test]
fn test_approle_secret_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path();

    let created = ok_json(
        store,
        &[
            "--as", "user:alice", "approle", "create", "ci-runner",
            "--token-ttl", "600", "--token-max-ttl", "3600", "--policies", "default,ci",
        ],
    );
    assert_eq!(created["name"], "ci-runner");
    assert_eq!(created["policies"], serde_json::json!(["default", "ci"]));

    let issued = ok_json(store, &["--as", "user:alice", "approle", "secret-id", "ci-runner"]);
    let accessor = issued["accessor"].as_str().unwrap().to_owned();
    assert!(issued["secret_id"].as_str().is_some());

    let accessors = ok_json(store, &["--as", "user:alice", "approle", "accessors", "ci-runner"]);
    assert_eq!(accessors, serde_json::json!([accessor]));

    let report = ok_json(
        store,
        &["--as", "user:alice", "approle", "revoke", "ci-runner", &accessor, "missing"],
    );
    assert_eq!(report["items"][0]["status"], "revoked");
    assert_eq!(report["items"][1]["status"], "not_found");
    assert_eq!(report["partial_failure"], true);

    assert_eq!(
        err_kind(
            store,
            &["--as", "user:alice", "approle", "update", "ci-runner", "--token-ttl", "7200"]
        ),
        "invalid_argument"
    );

    let deleted = ok_json(store, &["--as", "user:alice", "approle", "delete", "ci-runner"]);
    assert_eq!(deleted["deleted"], "ci-runner");
    assert_eq!(
        err_kind(store, &["--as", "user:alice", "approle", "read", "ci-runner"]),
        "not_found"
    );
}

#[test]
fn test_aws_attach_and_detach() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path();

    ok_json(store, &["--as", "user:alice", "safe", "create", "apps/billing"]);
    ok_json(
        store,
        &[
            "--as", "user:alice", "aws", "create-iam", "billing-role",
            "--bound-iam-principal-arn", "arn:aws:iam::123456789012:role/billing",
        ],
    );
    let attached = ok_json(
        store,
        &["--as", "user:alice", "aws", "attach", "billing-role", "apps/billing", "read"],
    );
    assert_eq!(attached["changed"], true);

    let detached = ok_json(
        store,
        &["--as", "user:alice", "aws", "detach", "billing-role", "apps/billing"],
    );
    assert_eq!(detached["changed"], true);

    let roles = ok_json(store, &["--as", "user:alice", "aws", "list"]);
    assert_eq!(roles, serde_json::json!(["billing-role"]));

    assert_eq!(
        err_kind(
            store,
            &["--as", "user:alice", "aws", "create-ec2", "unbounded-role"]
        ),
        "invalid_argument"
    );
}
