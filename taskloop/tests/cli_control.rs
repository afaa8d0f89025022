//! CLI tests for the control commands.
//!
//! Spawns the taskloop binary against a temp state dir and checks exit codes
//! and the files each command leaves behind.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use taskloop::core::status::RunStatus;
use taskloop::exit_codes;
use taskloop::io::state_store::StateStore;

fn taskloop(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_taskloop"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("spawn taskloop")
}

fn init_with_plan(dir: &Path) {
    fs::write(dir.join("plan.md"), "- [ ] A\n- [ ] B\n").expect("plan file");
    let out = taskloop(dir, &["init", "Ship it", "--plan-file", "plan.md", "--max-prs", "3"]);
    assert_eq!(out.status.code(), Some(exit_codes::SUCCESS), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn init_then_status_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_plan(temp.path());

    let out = taskloop(temp.path(), &["status", "--json"]);
    assert_eq!(out.status.code(), Some(exit_codes::SUCCESS));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).expect("status json");
    assert_eq!(report["status"], "planning");
    assert_eq!(report["tasks_total"], 2);
    assert_eq!(report["options"]["max_prs"], 3);
    assert_eq!(report["active"], false);
}

#[test]
fn paused_run_must_be_resumed_before_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_plan(temp.path());

    let out = taskloop(temp.path(), &["pause", "--reason", "lunch"]);
    assert_eq!(out.status.code(), Some(exit_codes::SUCCESS));
    let store = StateStore::new(temp.path().join(".taskloop"));
    assert_eq!(store.load().expect("load").status, RunStatus::Paused);

    let out = taskloop(temp.path(), &["run"]);
    assert_eq!(out.status.code(), Some(exit_codes::BLOCKED));
    assert!(String::from_utf8_lossy(&out.stderr).contains("resume it first"));
}

#[test]
fn stop_with_cleanup_removes_run_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_plan(temp.path());

    let out = taskloop(temp.path(), &["stop", "--reason", "abandoned", "--cleanup"]);
    assert_eq!(out.status.code(), Some(exit_codes::SUCCESS));
    let state_dir = temp.path().join(".taskloop");
    assert!(!state_dir.join("state.json").exists());
    assert!(state_dir.join("logs").exists());

    let out = taskloop(temp.path(), &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::BLOCKED));
}

#[test]
fn mailbox_send_status_clear() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_plan(temp.path());

    let out = taskloop(temp.path(), &["mailbox", "send", "add caching", "--priority", "high", "--sender", "ana"]);
    assert_eq!(out.status.code(), Some(exit_codes::SUCCESS));

    let out = taskloop(temp.path(), &["mailbox", "status"]);
    let status: serde_json::Value = serde_json::from_slice(&out.stdout).expect("mailbox json");
    assert_eq!(status["count"], 1);
    assert_eq!(status["previews"][0]["sender"], "ana");

    let out = taskloop(temp.path(), &["mailbox", "clear"]);
    assert!(String::from_utf8_lossy(&out.stdout).contains("cleared 1"));
}

#[test]
fn invalid_priority_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_plan(temp.path());
    let out = taskloop(temp.path(), &["mailbox", "send", "x", "--priority", "9"]);
    assert_ne!(out.status.code(), Some(exit_codes::SUCCESS));
}
