//! CLI test cases, driving the built binary end-to-end against a scripted
//! fake quest interpreter instead of the real (native, out-of-scope)
//! engine.

use std::{
    fs,
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    process::Command,
};

use assert_cmd::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("quest-engine").unwrap()
}

fn fixture(name: &str) -> PathBuf {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    // Git doesn't reliably preserve the executable bit across checkouts;
    // make sure our fake interpreters are runnable regardless.
    if path.extension().and_then(|e| e.to_str()) == Some("sh") {
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

fn write_agent_config(dir: &Path, name: &str, model: &str, skip_single: bool) -> PathBuf {
    let path = dir.join(name);
    let config = serde_json::json!({
        "agent_id": name.trim_end_matches(".json"),
        "model": model,
        "system_template": "You are playing a text quest.",
        "action_template": "Location: {{observation}}\nChoices: {{choices}}",
        "skip_single": skip_single,
    });
    fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_run_success_with_fake_interpreter() {
    let dir = tempfile::tempdir().unwrap();
    let agent_path = write_agent_config(dir.path(), "agent.json", "random_local:baseline", false);

    let assert = cmd()
        .env("RANDOM_LOCAL_SEED", "1")
        .arg("run")
        .arg("--quest")
        .arg(fixture("dummy.qm"))
        .arg("--agent")
        .arg(&agent_path)
        .arg("--interpreter")
        .arg(fixture("fake_interpreter.sh"))
        .arg("--timeout")
        .arg("30")
        .arg("--results-dir")
        .arg(dir.path().join("results"))
        .arg("--db")
        .arg(dir.path().join("metrics.db"))
        .assert();

    // Both branches of the first choice converge on the same winning path,
    // so the outcome is deterministic regardless of which index
    // `random_local` happens to pick first.
    assert.success();

    let run_dirs: Vec<_> = fs::read_dir(dir.path().join("results").join("agent"))
        .unwrap()
        .collect();
    assert_eq!(run_dirs.len(), 1, "expected exactly one quest directory");
}

#[test]
fn test_run_noise_tolerance_matches_clean_run() {
    let dir = tempfile::tempdir().unwrap();
    let agent_path = write_agent_config(dir.path(), "agent.json", "random_local:baseline", false);

    cmd()
        .env("RANDOM_LOCAL_SEED", "7")
        .arg("run")
        .arg("--quest")
        .arg(fixture("dummy.qm"))
        .arg("--agent")
        .arg(&agent_path)
        .arg("--interpreter")
        .arg(fixture("fake_interpreter_noisy.sh"))
        .arg("--timeout")
        .arg("30")
        .arg("--results-dir")
        .arg(dir.path().join("results"))
        .arg("--db")
        .arg(dir.path().join("metrics.db"))
        .assert()
        .success();
}

#[test]
fn test_run_timeout_commits_timeout_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let agent_path = write_agent_config(dir.path(), "agent.json", "random_local:baseline", false);

    // Exit code 2 is the documented TIMEOUT exit code (see main.rs).
    cmd()
        .env("RANDOM_LOCAL_SEED", "1")
        .arg("run")
        .arg("--quest")
        .arg(fixture("dummy.qm"))
        .arg("--agent")
        .arg(&agent_path)
        .arg("--interpreter")
        .arg(fixture("fake_interpreter_slow.sh"))
        .arg("--timeout")
        .arg("1")
        .arg("--results-dir")
        .arg(dir.path().join("results"))
        .arg("--db")
        .arg(dir.path().join("metrics.db"))
        .assert()
        .code(2);
}

#[test]
fn test_benchmark_matrix_completes() {
    let dir = tempfile::tempdir().unwrap();
    let agent_a = write_agent_config(dir.path(), "agent_a.json", "random_local:a", false);
    let agent_b = write_agent_config(dir.path(), "agent_b.json", "random_local:b", false);

    let agent_a_config: serde_json::Value =
        serde_json::from_slice(&fs::read(&agent_a).unwrap()).unwrap();
    let agent_b_config: serde_json::Value =
        serde_json::from_slice(&fs::read(&agent_b).unwrap()).unwrap();

    let results_dir = dir.path().join("results");
    let benchmark_config = serde_json::json!({
        "interpreter_path": fixture("fake_interpreter.sh"),
        "quests": [fixture("dummy.qm")],
        "agents": [agent_a_config, agent_b_config],
        "timeout_per_run_secs": 30,
        "max_workers": 2,
        "benchmark_id": "test-bench-1",
        "results_dir": results_dir,
    });
    let config_path = dir.path().join("benchmark.json");
    fs::write(&config_path, serde_json::to_vec_pretty(&benchmark_config).unwrap()).unwrap();

    cmd()
        .env("RANDOM_LOCAL_SEED", "3")
        .arg("benchmark")
        .arg("--config")
        .arg(&config_path)
        .arg("--db")
        .arg(dir.path().join("metrics.db"))
        .assert()
        .success();

    let summary_path = results_dir
        .join("benchmarks")
        .join("test-bench-1")
        .join("benchmark_summary.json");
    let summary: serde_json::Value =
        serde_json::from_slice(&fs::read(&summary_path).unwrap()).unwrap();
    assert_eq!(summary["total_runs"], 2);
}

#[test]
fn test_benchmark_matrix_mixed_outcomes() {
    // 2 quests x 2 agents, one quest always wins and the other always
    // fails regardless of which choice either agent picks, so the
    // per-agent and per-quest breakdowns in the summary are exercised
    // with both a success and a failure count.
    let dir = tempfile::tempdir().unwrap();
    let agent_a = write_agent_config(dir.path(), "agent_a.json", "random_local:a", false);
    let agent_b = write_agent_config(dir.path(), "agent_b.json", "random_local:b", false);

    let agent_a_config: serde_json::Value =
        serde_json::from_slice(&fs::read(&agent_a).unwrap()).unwrap();
    let agent_b_config: serde_json::Value =
        serde_json::from_slice(&fs::read(&agent_b).unwrap()).unwrap();

    let results_dir = dir.path().join("results");
    let benchmark_config = serde_json::json!({
        "interpreter_path": fixture("fake_interpreter_matrix.sh"),
        "quests": [fixture("dummy_win.qm"), fixture("dummy_fail.qm")],
        "agents": [agent_a_config, agent_b_config],
        "timeout_per_run_secs": 30,
        "max_workers": 2,
        "benchmark_id": "test-bench-mixed",
        "results_dir": results_dir,
    });
    let config_path = dir.path().join("benchmark.json");
    fs::write(&config_path, serde_json::to_vec_pretty(&benchmark_config).unwrap()).unwrap();

    cmd()
        .env("RANDOM_LOCAL_SEED", "42")
        .arg("benchmark")
        .arg("--config")
        .arg(&config_path)
        .arg("--db")
        .arg(dir.path().join("metrics.db"))
        .assert()
        .success();

    let summary_path = results_dir
        .join("benchmarks")
        .join("test-bench-mixed")
        .join("benchmark_summary.json");
    let summary: serde_json::Value =
        serde_json::from_slice(&fs::read(&summary_path).unwrap()).unwrap();

    assert_eq!(summary["total_runs"], 4);
    for agent_id in ["agent_a", "agent_b"] {
        assert_eq!(summary["per_agent"][agent_id]["ok"], 1);
        assert_eq!(summary["per_agent"][agent_id]["fail"], 1);
    }
    assert_eq!(summary["per_quest"]["dummy_win"]["ok"], 2);
    assert_eq!(summary["per_quest"]["dummy_fail"]["fail"], 2);
}
