//! End-to-end runs of the binary with real worker processes

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn harness() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pipeline-harness"));
    cmd.env_remove("FLEET_UNIVERSE_SIZE").env_remove("RUST_LOG");
    cmd
}

fn write_policy(temp: &TempDir, stages: &str) -> std::path::PathBuf {
    let path = temp.path().join("pipeline.json");
    let policy = format!(
        r#"{{
            "name": "e2e",
            "stages": {},
            "dir": {{ "default_root": {:?} }}
        }}"#,
        stages,
        temp.path().join("runs").display().to_string()
    );
    std::fs::write(&path, policy).unwrap();
    path
}

fn run(policy: &Path, run_id: &str, universe_size: &str) -> Output {
    harness()
        .args(["run", "-q", "--connect-timeout", "20", "--universe-size", universe_size])
        .arg(policy)
        .arg(run_id)
        .output()
        .unwrap()
}

const MARK: &str = r#"touch \"$FLEET_DIR_OUTPUT/$FLEET_STAGE_NAME-$FLEET_RANK\""#;

#[test]
fn test_fleet_runs_every_stage_on_every_worker() {
    let temp = TempDir::new().unwrap();
    let stages = format!(
        r#"[
            {{ "name": "detrend", "command": "{mark}" }},
            {{ "name": "calibrate", "command": "{mark}", "share_data": true }},
            {{ "name": "combine", "command": "{mark}" }}
        ]"#,
        mark = MARK
    );
    let policy = write_policy(&temp, &stages);

    let output = run(&policy, "e2e-ok", "4");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let out_dir = temp.path().join("runs/e2e-ok/output");
    for stage in ["detrend", "calibrate", "combine"] {
        for rank in 1..=3 {
            let marker = out_dir.join(format!("{}-{}", stage, rank));
            assert!(marker.exists(), "{} missing", marker.display());
        }
    }
}

#[test]
fn test_failing_worker_fails_the_run() {
    let temp = TempDir::new().unwrap();
    let stages = format!(
        r#"[
            {{ "name": "detrend", "command": "{mark}" }},
            {{ "name": "calibrate", "command": "test \"$FLEET_RANK\" != 2 || exit 3" }},
            {{ "name": "combine", "command": "{mark}" }}
        ]"#,
        mark = MARK
    );
    let policy = write_policy(&temp, &stages);

    let output = run(&policy, "e2e-fail", "4");
    assert_eq!(output.status.code(), Some(2));

    let out_dir = temp.path().join("runs/e2e-fail/output");
    assert!(out_dir.join("detrend-2").exists());
    for rank in 1..=3 {
        assert!(!out_dir.join(format!("combine-{}", rank)).exists());
    }
}

#[test]
fn test_zero_universe_is_a_bootstrap_failure() {
    let temp = TempDir::new().unwrap();
    let policy = write_policy(&temp, r#"[ { "name": "only" } ]"#);

    let output = run(&policy, "e2e-zero", "0");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_missing_policy_exits_with_config_failure() {
    let temp = TempDir::new().unwrap();
    let output = run(&temp.path().join("absent.json"), "e2e-none", "2");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("absent.json"));
}

#[test]
fn test_single_slot_runs_with_no_workers() {
    let temp = TempDir::new().unwrap();
    let policy = write_policy(&temp, r#"[ { "name": "a" }, { "name": "b" } ]"#);

    let output = run(&policy, "e2e-solo", "1");
    assert!(output.status.success());
    assert!(temp.path().join("runs/e2e-solo/work").is_dir());
}
