use crate::error::{RelayError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const RELAY_DIR: &str = ".relay";
pub const AGENTS_DIR: &str = ".relay/agents";
pub const RUNS_DIR: &str = ".relay/runs";
pub const ARCHIVE_DIR: &str = ".relay/archive";
pub const ARTIFACTS_DIR: &str = ".relay/artifacts";

pub const CONFIG_FILE: &str = ".relay/config.yaml";
pub const PIPELINE_FILE: &str = ".relay/pipeline.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn relay_dir(root: &Path) -> PathBuf {
    root.join(RELAY_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn pipeline_path(root: &Path) -> PathBuf {
    root.join(PIPELINE_FILE)
}

pub fn agents_dir(root: &Path) -> PathBuf {
    root.join(AGENTS_DIR)
}

pub fn runs_dir(root: &Path) -> PathBuf {
    root.join(RUNS_DIR)
}

pub fn archive_dir(root: &Path) -> PathBuf {
    root.join(ARCHIVE_DIR)
}

pub fn run_path(root: &Path, run_id: &str) -> PathBuf {
    runs_dir(root).join(format!("{run_id}.yaml"))
}

/// Held by the coordinator currently driving or steering `run_id`.
pub fn run_lock_path(root: &Path, run_id: &str) -> PathBuf {
    runs_dir(root).join(format!("{run_id}.lock"))
}

pub fn archived_run_path(root: &Path, run_id: &str) -> PathBuf {
    archive_dir(root).join(format!("{run_id}.yaml"))
}

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_\-]*[a-z0-9]$|^[a-z0-9]$").expect("static regex")
    })
}

/// Validate a stage, role, actor, or run id.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !id_re().is_match(id) {
        return Err(RelayError::InvalidId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        for id in ["spec", "review-2", "red_phase", "a", "x1"] {
            validate_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_ids() {
        for id in ["", "-lead", "trail-", "has space", "Upper", "a/b"] {
            assert!(validate_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(config_path(root), PathBuf::from("/tmp/proj/.relay/config.yaml"));
        assert_eq!(
            run_path(root, "abc"),
            PathBuf::from("/tmp/proj/.relay/runs/abc.yaml")
        );
        assert_eq!(
            archived_run_path(root, "abc"),
            PathBuf::from("/tmp/proj/.relay/archive/abc.yaml")
        );
        assert_eq!(
            run_lock_path(root, "abc"),
            PathBuf::from("/tmp/proj/.relay/runs/abc.lock")
        );
    }
}
