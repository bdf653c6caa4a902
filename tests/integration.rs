use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kbase_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kbase");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    ).unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.",
    )
    .unwrap();
    fs::write(files_dir.join("notes.xlsx"), "not a spreadsheet").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/kb.db"

[storage]
data_dir = "{root}/data"
upload_dir = "{root}/data/uploads"

[server]
bind = "127.0.0.1:8099"
"#,
        root = root.display()
    );

    let config_path = root.join("kbase.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kbase(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kbase_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kbase binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kbase(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("kb.db").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_kbase(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_kbase(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_list_empty() {
    let (_tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let (stdout, _, success) = run_kbase(&config_path, &["list"]);
    assert!(success);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_ingest_errors_when_embedding_disabled() {
    let (tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let file = tmp.path().join("files").join("alpha.md");
    let (_, stderr, success) = run_kbase(&config_path, &["ingest", file.to_str().unwrap()]);
    assert!(!success, "ingest should fail with the disabled provider");
    assert!(
        stderr.contains("disabled"),
        "Should mention the disabled provider, got: {}",
        stderr
    );
}

#[test]
fn test_failed_ingest_leaves_a_failed_row() {
    let (tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let file = tmp.path().join("files").join("gamma.txt");
    run_kbase(&config_path, &["ingest", file.to_str().unwrap()]);

    // The row survives so the failure is visible; the stored file does not.
    let (stdout, _, success) = run_kbase(&config_path, &["list"]);
    assert!(success);
    assert!(
        stdout.contains("failed"),
        "Expected a failed row after embedding failure, got: {}",
        stdout
    );
    assert!(stdout.contains("gamma.txt"));
}

#[test]
fn test_ingest_unsupported_extension() {
    let (tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let file = tmp.path().join("files").join("notes.xlsx");
    let (_, stderr, success) = run_kbase(&config_path, &["ingest", file.to_str().unwrap()]);
    assert!(!success, "Unsupported extension should fail");
    assert!(
        stderr.contains("unsupported format"),
        "Should report the format, got: {}",
        stderr
    );

    // Rejected before any state was created.
    let (stdout, _, _) = run_kbase(&config_path, &["list"]);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_query_empty_knowledge_base() {
    let (_tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let (_, stderr, success) = run_kbase(&config_path, &["query", "anything at all"]);
    assert!(!success, "Query over an empty knowledge base should fail");
    assert!(
        stderr.contains("knowledge base is empty"),
        "Should report emptiness, got: {}",
        stderr
    );
}

#[test]
fn test_check_empty_store_is_consistent() {
    let (_tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let (stdout, _, success) = run_kbase(&config_path, &["check"]);
    assert!(success, "check on an empty store should pass");
    assert!(stdout.contains("Consistent."));
    assert!(stdout.contains("0 slots"));
}

#[test]
fn test_delete_missing_document() {
    let (_tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let (_, stderr, success) = run_kbase(&config_path, &["delete", "nonexistent-id"]);
    assert!(!success, "delete with missing ID should fail");
    assert!(
        stderr.contains("not found"),
        "Should report not found, got: {}",
        stderr
    );
}

#[test]
fn test_clear_requires_confirmation() {
    let (_tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let (stdout, _, success) = run_kbase(&config_path, &["clear"]);
    assert!(success, "clear without --yes should exit cleanly");
    assert!(
        stdout.contains("--yes"),
        "Should hint at the confirmation flag, got: {}",
        stdout
    );

    // Nothing was removed.
    let (stdout, _, _) = run_kbase(&config_path, &["check"]);
    assert!(stdout.contains("Consistent."));
}

#[test]
fn test_clear_empty_store() {
    let (_tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let (stdout, _, success) = run_kbase(&config_path, &["clear", "--yes"]);
    assert!(success);
    assert!(stdout.contains("Cleared 0 documents."));
}

#[test]
fn test_rebuild_empty_catalog() {
    let (_tmp, config_path) = setup_test_env();

    run_kbase(&config_path, &["init"]);
    let (stdout, _, success) = run_kbase(&config_path, &["rebuild"]);
    assert!(success);
    assert!(stdout.contains("Rebuilt 0 documents."));
}

#[test]
fn test_missing_config_errors() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("does-not-exist.toml");

    let binary = kbase_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("init")
        .output()
        .unwrap();
    assert!(!output.status.success(), "Missing config should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("config"),
        "Should mention the config file, got: {}",
        stderr
    );
}

#[test]
fn test_invalid_config_errors() {
    let (tmp, _) = setup_test_env();
    let config_path = tmp.path().join("bad.toml");
    fs::write(
        &config_path,
        format!(
            r#"[db]
path = "{}/data/kb.db"

[server]
bind = "127.0.0.1:8099"

[retrieval]
relevance_threshold = 1.5
"#,
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_kbase(&config_path, &["init"]);
    assert!(!success, "Out-of-range threshold should fail validation");
    assert!(
        stderr.contains("relevance_threshold"),
        "Should name the bad field, got: {}",
        stderr
    );
}
