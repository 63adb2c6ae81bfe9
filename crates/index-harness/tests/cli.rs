use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ixh_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ixh");
    path
}

fn page(prefix: &str, count: usize) -> serde_json::Value {
    let items: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            serde_json::json!({ "document": {
                "id": format!("{}{}", prefix, i),
                "source": "fixture",
                "semantic_identifier": format!("{} #{}", prefix, i),
                "body": "standup notes about the release train",
                "resource_id": "C-eng"
            }})
        })
        .collect();
    serde_json::json!({ "items": items })
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let fixtures_dir = config_dir.join("fixtures");
    fs::create_dir_all(&fixtures_dir).unwrap();

    let docs = serde_json::json!({ "pages": [page("a", 5), page("b", 5), page("c", 5)] });
    fs::write(fixtures_dir.join("docs.json"), docs.to_string()).unwrap();

    let flaky = serde_json::json!({ "pages": [
        { "items": [
            { "failure": { "failed_document": { "id": "f1" }, "message": "rate limited" } }
        ]},
        { "items": [], "unhandled_exception": "connection reset" }
    ]});
    fs::write(fixtures_dir.join("flaky.json"), flaky.to_string()).unwrap();

    let directory = serde_json::json!({
        "users": { "U1": "alice@example.com", "U2": "bob@example.com" },
        "resources": [{ "id": "C-eng", "visibility": "private", "members": ["U1"] }]
    });
    fs::write(fixtures_dir.join("identities.json"), directory.to_string()).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/ixh.sqlite"

[chunking]
max_tokens = 700

[coordination]
heartbeat_interval_secs = 1
max_concurrent_batches = 2

[connectors.fixture.docs]
cc_pair_id = 1
path = "fixtures/docs.json"
resolver_path = "fixtures/identities.json"

[connectors.fixture.flaky]
cc_pair_id = 2
path = "fixtures/flaky.json"
"#,
        root.display()
    );

    let config_path = config_dir.join("ixh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ixh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ixh_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ixh binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_ixh(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/ixh.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run_ixh(&config, &["init"]);
    let (_, stderr, second) = run_ixh(&config, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_sources_lists_fixtures() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_ixh(&config, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("fixture:docs"));
    assert!(stdout.contains("fixture:flaky"));
}

#[test]
fn test_run_create_and_work() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);

    let (stdout, stderr, success) = run_ixh(&config, &["run", "create", "docs"]);
    assert!(success, "create failed: {}", stderr);
    assert!(stdout.contains("created run 1 for fixture:docs"));

    let (stdout, stderr, success) = run_ixh(&config, &["run", "work", "1", "--progress", "off"]);
    assert!(success, "work failed: {}", stderr);
    assert!(stdout.contains("run 1 fixture:docs"));
    assert!(stdout.contains("batches: 3/3"));
    assert!(stdout.contains("new documents: 15"));
    assert!(stdout.contains("success"));

    let (stdout, _, success) = run_ixh(&config, &["run", "status", "1"]);
    assert!(success);
    assert!(stdout.contains("status: success"));
    assert!(stdout.contains("checkpoint:"));
}

#[test]
fn test_run_work_json_progress() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    run_ixh(&config, &["run", "create", "fixture:docs"]);

    let (_, stderr, success) = run_ixh(&config, &["run", "work", "1", "--progress", "json"]);
    assert!(success, "work failed: {}", stderr);
    assert!(stderr.contains(r#""event":"started""#));
    assert!(stderr.contains(r#""event":"finished""#));
}

#[test]
fn test_failed_run_exits_nonzero_and_keeps_errors() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    run_ixh(&config, &["run", "create", "flaky"]);

    let (stdout, stderr, success) = run_ixh(&config, &["run", "work", "1", "--progress", "off"]);
    assert!(!success);
    assert!(stdout.contains("open errors: 1"));
    assert!(stderr.contains("connection reset"));

    let (stdout, _, _) = run_ixh(&config, &["run", "status", "1"]);
    assert!(stdout.contains("failed batches: 1"));

    let (stdout, _, success) = run_ixh(&config, &["errors", "list", "1"]);
    assert!(success);
    assert!(stdout.contains("f1: rate limited"));

    let (stdout, _, success) = run_ixh(&config, &["errors", "resolve", "1"]);
    assert!(success);
    assert!(stdout.contains("error #1 resolved"));

    let (stdout, _, _) = run_ixh(&config, &["errors", "list", "1"]);
    assert!(stdout.contains("No errors for run 1."));
    let (stdout, _, _) = run_ixh(&config, &["errors", "list", "1", "--all"]);
    assert!(stdout.contains("[resolved]"));
}

#[test]
fn test_cancel_before_work() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    run_ixh(&config, &["run", "create", "docs"]);

    let (stdout, _, success) = run_ixh(&config, &["run", "cancel", "1"]);
    assert!(success);
    assert!(stdout.contains("cancellation requested for run 1"));

    let (stdout, stderr, success) = run_ixh(&config, &["run", "work", "1", "--progress", "off"]);
    assert!(success, "work failed: {}", stderr);
    assert!(stdout.contains("canceled"));

    let (stdout, _, _) = run_ixh(&config, &["run", "cancel", "1"]);
    assert!(stdout.contains("already finished (canceled)"));
}

#[test]
fn test_status_lists_runs() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    let (stdout, _, _) = run_ixh(&config, &["run", "status"]);
    assert!(stdout.contains("No indexing runs."));

    run_ixh(&config, &["run", "create", "docs"]);
    run_ixh(&config, &["run", "create", "flaky", "--from-beginning"]);
    let (stdout, _, success) = run_ixh(&config, &["run", "status"]);
    assert!(success);
    assert!(stdout.contains("RUN"));
    assert_eq!(stdout.matches("not_started").count(), 2);
}

#[test]
fn test_reconcile_once_without_runs() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    let (stdout, stderr, success) = run_ixh(&config, &["reconcile", "--once"]);
    assert!(success, "reconcile failed: {}", stderr);
    assert!(stdout.contains("runs checked: 0"));
    assert!(stdout.contains("errors: 0"));
}

#[test]
fn test_perm_sync_updates_documents() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    run_ixh(&config, &["run", "create", "docs"]);
    run_ixh(&config, &["run", "work", "1", "--progress", "off"]);

    let (stdout, stderr, success) = run_ixh(&config, &["perm-sync", "docs"]);
    assert!(success, "perm-sync failed: {}", stderr);
    assert!(stdout.contains("documents resolved: 15"));
    assert!(stdout.contains("public: 0"));
    assert!(stdout.contains("documents updated: 15"));
}

#[test]
fn test_perm_sync_requires_resolver() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    let (_, stderr, success) = run_ixh(&config, &["perm-sync", "flaky"]);
    assert!(!success);
    assert!(stderr.contains("resolver_path"));
}

#[test]
fn test_unknown_connector() {
    let (_tmp, config) = setup_test_env();
    run_ixh(&config, &["init"]);
    let (_, stderr, success) = run_ixh(&config, &["run", "create", "nope"]);
    assert!(!success);
    assert!(stderr.contains("No connector named 'nope'"));
}
