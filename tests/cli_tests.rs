// SPDX-License-Identifier: PMPL-1.0-or-later

//! Exit-status checks against the built binary

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn market_attack() -> Command {
    Command::new(env!("CARGO_BIN_EXE_market-attack"))
}

#[test]
fn test_attack_with_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    let output = market_attack()
        .arg("attack")
        .arg(dir.path().join("missing.yaml"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("reading experiment config"));
}

#[test]
fn test_batch_requires_config_dir() {
    let output = market_attack().arg("batch").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_batch_rejects_zero_parallel() {
    let dir = TempDir::new().unwrap();
    let output = market_attack()
        .args(["batch", "--parallel", "0", "--config-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_gen_configs_then_dry_run_batch() {
    let dir = TempDir::new().unwrap();
    let configs = dir.path().join("configs");
    let status = market_attack()
        .current_dir(dir.path())
        .arg("gen-configs")
        .status()
        .unwrap();
    assert!(status.success());
    assert!(configs.is_dir());

    let output = market_attack()
        .current_dir(dir.path())
        .args(["batch", "--config-dir", "configs", "--dry-run"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("36 configs under configs:"));
}

#[test]
fn test_process_logs_uses_underscore_flags() {
    let dir = TempDir::new().unwrap();
    let results = dir.path().join("raw");
    fs::create_dir_all(&results).unwrap();
    let output_dir = dir.path().join("tables");

    let status = market_attack()
        .arg("process-logs")
        .arg("--result_path")
        .arg(&results)
        .arg("--output_dir")
        .arg(&output_dir)
        .status()
        .unwrap();
    assert!(status.success());
    assert!(output_dir.is_dir());
}

#[test]
fn test_process_logs_missing_result_path_fails() {
    let dir = TempDir::new().unwrap();
    let status = market_attack()
        .current_dir(dir.path())
        .arg("process-logs")
        .status()
        .unwrap();
    assert!(!status.success());
}
