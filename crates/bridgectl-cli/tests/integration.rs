#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const LOOP: &str = "while true; do sleep 1; done\n";
const IGNORES_TERM: &str = "trap '' TERM\nwhile true; do sleep 1; done\n";

fn bridgectl(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("bridgectl").unwrap();
    cmd.current_dir(dir.path())
        .env("BRIDGECTL_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

/// A project whose bridge is `sh bridge.sh`, with fast timings and a
/// private service directory so nothing touches the real service manager.
fn project(script: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let script_path = dir.path().join("bridge.sh");
    std::fs::write(&script_path, script).unwrap();
    write_config(&dir, "[]");
    dir
}

fn write_config(dir: &TempDir, preconditions: &str) {
    let config = format!(
        "bridge:\n  program: /bin/sh\n  args: ['{script}']\n  preconditions: {preconditions}\n\
         timing:\n  settle_secs: 1\n  stop_timeout_secs: 2\n  poll_interval_ms: 100\n\
         service:\n  install_dir: '{services}'\n",
        script = dir.path().join("bridge.sh").display(),
        services = dir.path().join("services").display(),
    );
    std::fs::write(dir.path().join("bridgectl.yaml"), config).unwrap();
}

fn pid_file(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join("data/bridge.pid"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn status_json(dir: &TempDir) -> serde_json::Value {
    let out = bridgectl(dir).args(["status", "--json"]).output().unwrap();
    assert!(out.status.success());
    serde_json::from_slice(&out.stdout).unwrap()
}

/// Stops the bridge when a test finishes, pass or fail.
struct Running<'a>(&'a TempDir);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let _ = bridgectl(self.0).arg("stop").output();
    }
}

// ---------------------------------------------------------------------------
// start / stop
// ---------------------------------------------------------------------------

#[test]
fn start_twice_leaves_a_single_instance() {
    let dir = project(LOOP);
    let _running = Running(&dir);

    bridgectl(&dir)
        .arg("start")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bridge started"));
    let first = pid_file(dir.path()).expect("pid file after first start");

    bridgectl(&dir)
        .arg("start")
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped existing instance first."));
    let second = pid_file(dir.path()).expect("pid file after second start");
    assert_ne!(first, second);

    let status = status_json(&dir);
    assert_eq!(status["running"], true);
    assert_eq!(status["process"]["pid"], second);
}

#[test]
fn stop_when_not_running_succeeds() {
    let dir = project(LOOP);
    bridgectl(&dir)
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bridge not running."));
}

#[test]
fn start_then_stop_clears_pid_file() {
    let dir = project(LOOP);
    let _running = Running(&dir);

    bridgectl(&dir).arg("start").assert().success();
    assert!(pid_file(dir.path()).is_some());

    bridgectl(&dir)
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bridge stopped"));
    assert!(pid_file(dir.path()).is_none());
    assert_eq!(status_json(&dir)["running"], false);
}

#[test]
fn stop_escalates_when_sigterm_is_ignored() {
    let dir = project(IGNORES_TERM);
    let _running = Running(&dir);

    bridgectl(&dir).arg("start").assert().success();
    bridgectl(&dir)
        .arg("stop")
        .assert()
        .success()
        .stderr(predicate::str::contains("sent SIGKILL"))
        .stdout(predicate::str::contains("forced"));
    assert_eq!(status_json(&dir)["running"], false);
}

#[test]
fn restart_replaces_the_process() {
    let dir = project(LOOP);
    let _running = Running(&dir);

    bridgectl(&dir).arg("start").assert().success();
    let before = pid_file(dir.path()).unwrap();

    bridgectl(&dir).arg("restart").assert().success();
    let after = pid_file(dir.path()).unwrap();
    assert_ne!(before, after);
}

// ---------------------------------------------------------------------------
// lock + preconditions
// ---------------------------------------------------------------------------

#[test]
fn held_lock_fails_fast_without_side_effects() {
    let dir = project(LOOP);
    let lock = dir.path().join("data/bridge-start.lock");
    std::fs::create_dir_all(&lock).unwrap();
    std::fs::write(
        lock.join("owner.json"),
        format!(
            r#"{{"pid": {}, "operation": "update", "acquired_at": "{}"}}"#,
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        ),
    )
    .unwrap();

    let started = std::time::Instant::now();
    bridgectl(&dir)
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("another operation is in progress"));
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert!(pid_file(dir.path()).is_none());
    assert!(dir.path().join("data/bridge-start.lock").is_dir());
    assert_eq!(status_json(&dir)["running"], false);
}

#[test]
fn missing_precondition_names_the_remedy() {
    let dir = project(LOOP);
    write_config(&dir, "[{path: .env, remedy: cp .env.example .env}]");

    bridgectl(&dir)
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains(".env not found, run: cp .env.example .env"));
    assert!(pid_file(dir.path()).is_none());
}

#[test]
fn early_exit_points_at_error_log() {
    let dir = project("echo boom >&2\nexit 3\n");
    bridgectl(&dir)
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("bridge.error.log"));
}

// ---------------------------------------------------------------------------
// health / status / logs
// ---------------------------------------------------------------------------

#[test]
fn health_fails_when_not_running() {
    let dir = project(LOOP);
    bridgectl(&dir)
        .arg("health")
        .assert()
        .failure()
        .stdout(predicate::str::contains("bridge is not running"));
}

#[test]
fn health_reports_error_log_keywords() {
    let dir = project(LOOP);
    let _running = Running(&dir);
    bridgectl(&dir).arg("start").assert().success();

    bridgectl(&dir).arg("health").assert().success();

    std::fs::write(
        dir.path().join("logs/bridge.error.log"),
        "Traceback (most recent call last):\nConnectionError: disconnected\n",
    )
    .unwrap();
    bridgectl(&dir)
        .arg("health")
        .assert()
        .failure()
        .stdout(predicate::str::contains("[unhealthy]"));
}

#[test]
fn status_shows_stopped_bridge() {
    let dir = project(LOOP);
    bridgectl(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));
}

#[test]
fn logs_prints_the_tail() {
    let dir = project(LOOP);
    std::fs::create_dir_all(dir.path().join("logs")).unwrap();
    std::fs::write(dir.path().join("logs/bridge.log"), "one\ntwo\nthree\n").unwrap();

    bridgectl(&dir)
        .args(["logs", "-n", "2"])
        .assert()
        .success()
        .stdout(predicate::eq("two\nthree\n"));
}

// ---------------------------------------------------------------------------
// watchdog / update / install
// ---------------------------------------------------------------------------

#[test]
fn watchdog_starts_a_dead_bridge() {
    let dir = project(LOOP);
    let _running = Running(&dir);

    bridgectl(&dir)
        .arg("watchdog")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bridge was down; started"));
    assert_eq!(status_json(&dir)["running"], true);
}

#[test]
fn update_outside_a_git_checkout_fails() {
    let dir = project(LOOP);
    bridgectl(&dir).arg("update").assert().failure();
    assert!(!dir.path().join("data/update.lock").exists());
}

#[test]
fn install_dry_run_renders_all_jobs_without_writing() {
    let dir = project(LOOP);
    bridgectl(&dir)
        .args(["install", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("com.valor.bridge"))
        .stdout(predicate::str::contains("com.valor.update"))
        .stdout(predicate::str::contains("com.valor.watchdog"));
    assert!(!dir.path().join("services").exists());
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_init_writes_defaults_once() {
    let dir = TempDir::new().unwrap();
    bridgectl(&dir).args(["config", "init"]).assert().success();
    assert!(dir.path().join("bridgectl.yaml").exists());

    bridgectl(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    bridgectl(&dir).args(["config", "validate"]).assert().success();
}

#[test]
fn config_validate_rejects_bad_update_time() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("bridgectl.yaml"),
        "service:\n  update_times: ['25:00']\n",
    )
    .unwrap();
    bridgectl(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_show_json_reflects_file() {
    let dir = project(LOOP);
    let out = bridgectl(&dir)
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["bridge"]["program"], "/bin/sh");
    assert_eq!(value["timing"]["stop_timeout_secs"], 2);
}

// ---------------------------------------------------------------------------
// usage
// ---------------------------------------------------------------------------

#[test]
fn unknown_subcommand_prints_usage() {
    let dir = TempDir::new().unwrap();
    bridgectl(&dir)
        .arg("reboot")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}
