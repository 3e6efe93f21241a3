#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn relay(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("relay").unwrap();
    cmd.current_dir(dir.path())
        .env("RELAY_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    relay(dir).arg("init").assert().success();
}

fn json(dir: &TempDir, args: &[&str]) -> Value {
    let out = relay(dir).arg("--json").args(args).output().unwrap();
    assert!(
        out.status.success(),
        "relay {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).unwrap()
}

fn write_config(dir: &TempDir, roles: &str) {
    let config = format!(
        "version: 1\nproject:\n  name: demo\nconventions:\n  paths: {{ docs: docs, src: src, tests: tests }}\nactors:\n  default: {{ type: stub, status: passed, score: 9.0 }}\n  roles:\n{roles}"
    );
    std::fs::write(dir.path().join(".relay/config.yaml"), config).unwrap();
}

fn stage<'a>(report: &'a Value, id: &str) -> &'a Value {
    report["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["stage"] == id)
        .unwrap()
}

// ---------------------------------------------------------------------------
// relay init / validate
// ---------------------------------------------------------------------------

#[test]
fn init_creates_directory_tree() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .relay/pipeline.yaml"));

    assert!(dir.path().join(".relay/config.yaml").exists());
    assert!(dir.path().join(".relay/pipeline.yaml").exists());
    assert!(dir.path().join(".relay/agents/spec-writer.md").exists());
    assert!(dir.path().join(".relay/agents/implementer.yaml").exists());
    assert!(dir.path().join(".relay/runs").is_dir());
    assert!(dir.path().join(".relay/archive").is_dir());
}

#[test]
fn init_is_idempotent_and_keeps_edits() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let pipeline = dir.path().join(".relay/pipeline.yaml");
    std::fs::write(&pipeline, "name: custom\nstages:\n  - { id: only, role: writer }\n").unwrap();

    relay(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .relay/pipeline.yaml"));
    assert!(std::fs::read_to_string(pipeline).unwrap().contains("custom"));
}

#[test]
fn validate_scaffold_is_clean() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    relay(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline 'feature': 6 stages, 6 profiles"))
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn validate_requires_init() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn validate_reports_cycle() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".relay/pipeline.yaml"),
        "name: loop\nstages:\n  - { id: a, role: writer, after: [b] }\n  - { id: b, role: writer, after: [a] }\n",
    )
    .unwrap();
    relay(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cyclic pipeline"));
}

// ---------------------------------------------------------------------------
// relay check
// ---------------------------------------------------------------------------

#[test]
fn check_denies_write_outside_scope() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    relay(&dir)
        .args(["check", "--actor", "test-writer", "--write", "src/models/user.rs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Verdict: deny"))
        .stdout(predicate::str::contains("no scope covers path"));
}

#[test]
fn check_allows_write_inside_aliased_scope() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let v = json(
        &dir,
        &["check", "--actor", "tester", "--write", "tests/user_test.rs"],
    );
    assert_eq!(v["actor"], "test-writer");
    assert_eq!(v["verdict"]["verdict"], "allow");
    assert_eq!(v["verdict"]["rule"], "fs_scopes[0] allow write 'tests/**'");
}

#[test]
fn check_ask_first_command() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    relay(&dir)
        .args(["check", "--actor", "implementer", "--command", "git push origin main"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Verdict: ask"));
}

#[test]
fn check_needs_exactly_one_action() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    relay(&dir)
        .args(["check", "--actor", "implementer"])
        .assert()
        .failure();
    relay(&dir)
        .args(["check", "--actor", "implementer", "--read", "a", "--write", "b"])
        .assert()
        .failure();
}

#[test]
fn check_unknown_actor() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    relay(&dir)
        .args(["check", "--actor", "ghost", "--read", "README.md"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no profile for actor 'ghost'"));
}

// ---------------------------------------------------------------------------
// relay run
// ---------------------------------------------------------------------------

#[test]
fn stub_rehearsal_completes_and_archives() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let report = json(&dir, &["run", "start", "login form"]);
    assert_eq!(report["state"], "completed");
    assert_eq!(report["feature"], "login form");
    let run_id = report["run_id"].as_str().unwrap().to_string();
    assert!(dir
        .path()
        .join(format!(".relay/archive/{run_id}.yaml"))
        .exists());

    let active = json(&dir, &["run", "list"]);
    assert!(active.as_array().unwrap().is_empty());
    let all = json(&dir, &["run", "list", "--all"]);
    assert_eq!(all[0]["run_id"], run_id.as_str());

    let status = json(&dir, &["run", "status", &run_id]);
    assert_eq!(stage(&status, "audit")["status"], "passed");

    relay(&dir)
        .args(["run", "resume", &run_id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already completed"));
}

#[test]
fn low_review_score_halts_then_retry_and_abort() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_config(
        &dir,
        "    reviewer: { type: stub, status: passed, score: 5.0 }\n",
    );

    let report = json(&dir, &["run", "start", "search"]);
    assert_eq!(report["state"], "halted");
    assert_eq!(report["halted"][0]["stage"], "spec-review");
    assert_eq!(report["halted"][0]["retries"], 2);
    assert_eq!(stage(&report, "red")["status"], "pending");
    let run_id = report["run_id"].as_str().unwrap().to_string();

    relay(&dir)
        .args(["next", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("spec-review"))
        .stdout(predicate::str::contains("halted"));

    let retried = json(&dir, &["run", "retry", &run_id, "spec-review"]);
    assert_eq!(retried["state"], "active");
    assert_eq!(stage(&retried, "spec-review")["status"], "pending");
    assert_eq!(stage(&retried, "spec-review")["retries"], 0);

    let aborted = json(&dir, &["run", "abort", &run_id]);
    assert_eq!(aborted["state"], "aborted");
    assert_eq!(stage(&aborted, "spec-review")["status"], "blocked");
    assert_eq!(stage(&aborted, "specify")["status"], "passed");

    relay(&dir)
        .args(["run", "abort", &run_id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid transition"));
}

#[test]
fn script_actor_writing_outside_scope_blocks_stage() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join("tester.sh"),
        r#"read req
echo '{"type":"log","message":"writing tests"}'
echo '{"type":"declare","actions":[{"kind":"write","target":"src/models/user.rs"}]}'
read verdict
echo '{"type":"outcome","status":"passed"}'
"#,
    )
    .unwrap();
    write_config(&dir, "    tester: { type: script, command: \"sh tester.sh\" }\n");

    let report = json(&dir, &["run", "start", "signup"]);
    assert_eq!(report["state"], "blocked");
    assert_eq!(stage(&report, "red")["status"], "blocked");
    assert_eq!(stage(&report, "green")["status"], "pending");
    assert_eq!(report["blocked"][0]["stage"], "red");
    assert_eq!(report["blocked"][0]["reason"], "no scope covers path");

    let run_id = report["run_id"].as_str().unwrap().to_string();
    relay(&dir)
        .args(["run", "status", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Blocked: red"));
}

#[test]
fn script_actor_reporting_outcome_advances() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join("tester.sh"),
        r#"read req
echo '{"type":"declare","actions":[{"kind":"write","target":"tests/signup_test.rs"}]}'
read verdict
echo '{"type":"outcome","status":"passed","artifact_ref":"tests/signup_test.rs"}'
"#,
    )
    .unwrap();
    write_config(&dir, "    tester: { type: script, command: \"sh tester.sh\" }\n");

    let report = json(&dir, &["run", "start", "signup"]);
    assert_eq!(report["state"], "completed");
    assert_eq!(stage(&report, "red")["status"], "passed");
}

#[test]
fn locked_run_refuses_a_second_coordinator() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_config(
        &dir,
        "    reviewer: { type: stub, status: passed, score: 5.0 }\n",
    );
    let report = json(&dir, &["run", "start", "search"]);
    let run_id = report["run_id"].as_str().unwrap().to_string();
    let lock = dir.path().join(format!(".relay/runs/{run_id}.lock"));
    assert!(!lock.exists());

    std::fs::write(&lock, "4242\n").unwrap();
    relay(&dir)
        .args(["run", "resume", &run_id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("held by another coordinator"));
    relay(&dir)
        .args(["run", "retry", &run_id, "spec-review"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("held by another coordinator"));

    std::fs::remove_file(&lock).unwrap();
    let retried = json(&dir, &["run", "retry", &run_id, "spec-review"]);
    assert_eq!(retried["state"], "active");
    assert!(!lock.exists());
}

#[test]
fn status_of_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    relay(&dir)
        .args(["run", "status", "no-such-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run not found: no-such-run"));
}
