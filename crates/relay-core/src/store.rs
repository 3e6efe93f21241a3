use crate::error::{RelayError, Result};
use crate::io;
use crate::paths;
use crate::run::{RunState, WorkflowRun};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Exclusive claim on one run. The lock file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

/// YAML persistence for workflow runs under `.relay/runs/`, with finished
/// runs moved to `.relay/archive/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(&self, run: &WorkflowRun) -> Result<()> {
        paths::validate_id(&run.run_id)?;
        let data = serde_yaml::to_string(run)?;
        io::atomic_write(&paths::run_path(&self.root, &run.run_id), data.as_bytes())
    }

    /// Load an active run, falling back to the archive.
    pub fn load(&self, run_id: &str) -> Result<WorkflowRun> {
        paths::validate_id(run_id)?;
        let active = paths::run_path(&self.root, run_id);
        let path = if active.exists() {
            active
        } else {
            let archived = paths::archived_run_path(&self.root, run_id);
            if !archived.exists() {
                return Err(RelayError::RunNotFound(run_id.to_string()));
            }
            archived
        };
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn is_archived(&self, run_id: &str) -> bool {
        paths::archived_run_path(&self.root, run_id).exists()
    }

    /// Write the final state to the archive and drop the active copy.
    pub fn archive(&self, run: &WorkflowRun) -> Result<()> {
        paths::validate_id(&run.run_id)?;
        let data = serde_yaml::to_string(run)?;
        io::atomic_write(
            &paths::archived_run_path(&self.root, &run.run_id),
            data.as_bytes(),
        )?;
        let active = paths::run_path(&self.root, &run.run_id);
        if active.exists() {
            std::fs::remove_file(active)?;
        }
        Ok(())
    }

    /// Claim `run_id` for one coordinator. Fails while another claim is held.
    ///
    /// A lock left behind by a killed process has to be removed by hand.
    pub fn lock(&self, run_id: &str) -> Result<RunLock> {
        paths::validate_id(run_id)?;
        io::ensure_dir(&paths::runs_dir(&self.root))?;
        let path = paths::run_lock_path(&self.root, run_id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(RunLock { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(RelayError::InvalidTransition {
                from: "locked".to_string(),
                to: RunState::Active.to_string(),
                reason: format!(
                    "run '{run_id}' is held by another coordinator (remove {} if none is running)",
                    path.display()
                ),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Active runs, oldest first.
    pub fn list(&self) -> Result<Vec<WorkflowRun>> {
        Self::read_dir(&paths::runs_dir(&self.root))
    }

    pub fn list_archived(&self) -> Result<Vec<WorkflowRun>> {
        Self::read_dir(&paths::archive_dir(&self.root))
    }

    fn read_dir(dir: &Path) -> Result<Vec<WorkflowRun>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            match serde_yaml::from_str::<WorkflowRun>(&data) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run file")
                }
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Conventions;
    use crate::pipeline::{PipelineDoc, PipelineGraph};
    use crate::stage::StageDefinition;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn run() -> WorkflowRun {
        let graph = PipelineGraph::new(
            PipelineDoc {
                name: "feature".into(),
                description: None,
                stages: vec![StageDefinition::new("spec", "writer")],
                terminal: vec![],
            },
            Arc::new(Conventions::default()),
        )
        .unwrap();
        WorkflowRun::new(&graph, "login")
    }

    #[test]
    fn save_load_list() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let a = run();
        let b = run();
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let loaded = store.load(&a.run_id).unwrap();
        assert_eq!(loaded.feature, "login");
        let ids: std::collections::BTreeSet<_> =
            store.list().unwrap().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.run_id) && ids.contains(&b.run_id));
    }

    #[test]
    fn archive_moves_run() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let mut r = run();
        store.save(&r).unwrap();
        r.set_state(RunState::Completed);
        store.archive(&r).unwrap();

        assert!(store.list().unwrap().is_empty());
        assert!(store.is_archived(&r.run_id));
        assert_eq!(store.load(&r.run_id).unwrap().state, RunState::Completed);
        assert_eq!(store.list_archived().unwrap().len(), 1);
    }

    #[test]
    fn missing_and_malformed_ids() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(matches!(
            store.load("0b0c9a1e-0000-4000-8000-000000000000"),
            Err(RelayError::RunNotFound(_))
        ));
        assert!(matches!(
            store.load("../config"),
            Err(RelayError::InvalidId(_))
        ));
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let r = run();
        store.save(&r).unwrap();

        let held = store.lock(&r.run_id).unwrap();
        assert!(held.path().exists());
        let err = store.lock(&r.run_id).unwrap_err();
        assert!(matches!(err, RelayError::InvalidTransition { .. }));
        assert!(err.to_string().contains("held by another coordinator"), "{err}");
        assert_eq!(store.list().unwrap().len(), 1, "lock files are not runs");

        let path = held.path().to_path_buf();
        drop(held);
        assert!(!path.exists());
        store.lock(&r.run_id).unwrap();
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        store.save(&run()).unwrap();
        std::fs::write(paths::runs_dir(dir.path()).join("junk.yaml"), "not: [a run").unwrap();
        std::fs::write(paths::runs_dir(dir.path()).join("notes.txt"), "hello").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
