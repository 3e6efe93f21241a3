use anyhow::Context;
use relay_core::config::{ActorBackend, Config};
use relay_core::io;
use relay_core::paths;
use relay_core::types::StageStatus;
use std::path::Path;

const PIPELINE: &str = r#"name: feature
description: Spec, test-first implementation, lint and audit for one feature.
stages:
  - id: specify
    role: writer
    description: Write the feature spec.
  - id: spec-review
    role: reviewer
    after: [specify]
    gate: { kind: threshold, comparator: ">=", value: 7 }
    rework_from: specify
  - id: red
    role: tester
    after: [spec-review]
    description: Write failing tests for the spec.
  - id: green
    role: implementer
    after: [red]
    description: Make the tests pass.
  - id: lint
    role: linter
    after: [green]
    gate: { kind: boolean }
    rework_from: green
    actions:
      - { kind: command, target: "make lint" }
  - id: audit
    role: auditor
    after: [lint]
    gate: { kind: threshold, comparator: ">=", value: 8 }
    rework_from: green
terminal: [audit]
"#;

const PROFILES: &[(&str, &str)] = &[
    (
        "spec-writer.md",
        r#"---
actor_id: spec-writer
role: writer
tools: [editor]
fs_scopes:
  - { glob: "$docs/**", mode: write }
  - { glob: "**", mode: read }
---
Write a concise feature spec under the docs directory.
"#,
    ),
    (
        "spec-reviewer.yaml",
        r#"actor_id: spec-reviewer
role: reviewer
fs_scopes:
  - { glob: "**", mode: read }
"#,
    ),
    (
        "test-writer.yaml",
        r#"actor_id: test-writer
role: tester
tools: [editor]
fs_scopes:
  - { glob: "$tests/**", mode: write }
  - { glob: "$src/**", mode: read }
commands:
  - { glob: "make test*", effect: allow }
"#,
    ),
    (
        "implementer.yaml",
        r#"actor_id: implementer
role: implementer
tools: [editor]
fs_scopes:
  - { glob: "$src/**", mode: write }
  - { glob: "$tests/**", mode: read }
commands:
  - { glob: "make *", effect: allow }
  - { glob: "git push*", effect: ask }
  - { glob: "rm -rf*", effect: deny }
"#,
    ),
    (
        "linter.yaml",
        r#"actor_id: linter
role: linter
fs_scopes:
  - { glob: "**", mode: read }
commands:
  - { glob: "make lint*", effect: allow }
"#,
    ),
    (
        "auditor.yaml",
        r#"actor_id: auditor
role: auditor
fs_scopes:
  - { glob: "**", mode: read }
  - { glob: ".env*", mode: read, effect: deny }
"#,
    ),
];

pub fn run(root: &Path) -> anyhow::Result<()> {
    let project_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    println!("Initializing relay in: {}", root.display());

    for dir in [
        paths::RELAY_DIR,
        paths::AGENTS_DIR,
        paths::RUNS_DIR,
        paths::ARCHIVE_DIR,
        paths::ARTIFACTS_DIR,
    ] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        let mut cfg = Config::new(&project_name);
        for (alias, dir) in [("docs", "docs"), ("src", "src"), ("tests", "tests")] {
            cfg.conventions.paths.insert(alias.into(), dir.into());
        }
        cfg.actors.default = Some(ActorBackend::Stub {
            status: StageStatus::Passed,
            score: Some(9.0),
        });
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    scaffold(&paths::pipeline_path(root), paths::PIPELINE_FILE, PIPELINE)?;
    for (file, body) in PROFILES {
        let rel = format!("{}/{file}", paths::AGENTS_DIR);
        scaffold(&paths::agents_dir(root).join(file), &rel, body)?;
    }

    println!("\nEvery role is bound to a stub actor. Edit actors in {} to", paths::CONFIG_FILE);
    println!("wire up real scripts, then: relay run start <feature>");
    Ok(())
}

fn scaffold(path: &Path, display: &str, body: &str) -> anyhow::Result<()> {
    let created = io::write_if_missing(path, body.as_bytes())
        .with_context(|| format!("failed to write {display}"))?;
    if created {
        println!("  created: {display}");
    } else {
        println!("  exists:  {display}");
    }
    Ok(())
}
