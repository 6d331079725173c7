//! Exit-code contract of the `dipwatch` binary

use std::path::Path;
use std::process::{Command, Output};

fn dipwatch(args: &[&str], home: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dipwatch"))
        .args(args)
        .arg("--no-file-log")
        .arg("--config")
        .arg(home.join("config.toml"))
        .output()
        .expect("failed to run dipwatch binary")
}

#[test]
fn evaluate_on_missing_database_exits_1_without_creating_it() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("missing.db");

    let out = dipwatch(&["evaluate", "--db", db.to_str().unwrap()], dir.path());
    assert_eq!(out.status.code(), Some(1));
    assert!(!db.exists());
}

#[test]
fn init_then_evaluate_exits_0() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("dipwatch.db");
    let db_arg = db.to_str().unwrap();

    let out = dipwatch(&["init", "--db", db_arg], dir.path());
    assert_eq!(out.status.code(), Some(0));
    assert!(db.exists());

    let out = dipwatch(&["evaluate", "--db", db_arg], dir.path());
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Examined 0"));

    let out = dipwatch(&["status", "--json", "--db", db_arg], dir.path());
    assert_eq!(out.status.code(), Some(0));
    let parsed: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(parsed["summary"]["total_signals"], 0);
}

#[test]
fn invalid_config_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.toml"), "[trigger]\ntp1_pct = \"lots\"\n").unwrap();
    let db = dir.path().join("dipwatch.db");

    let out = dipwatch(&["init", "--db", db.to_str().unwrap()], dir.path());
    assert_eq!(out.status.code(), Some(1));
    assert!(!db.exists());
}

#[cfg(target_os = "linux")]
#[test]
fn run_exits_2_when_lock_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("dipwatch.db");
    let db_arg = db.to_str().unwrap();
    assert_eq!(dipwatch(&["init", "--db", db_arg], dir.path()).status.code(), Some(0));

    // pid 1 is always alive; a fresh heartbeat makes the lock live
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let record = serde_json::json!({
        "owner_pid": 1,
        "acquired_at_ms": now,
        "heartbeat_at_ms": now,
    });
    std::fs::write(dir.path().join("dipwatch.db.lock"), record.to_string()).unwrap();

    let out = dipwatch(&["run", "--cycles", "1", "--db", db_arg], dir.path());
    assert_eq!(out.status.code(), Some(2));
}
