use crate::error::{RelayError, Result};
use crate::paths;
use crate::types::StageStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Conventions
// ---------------------------------------------------------------------------

/// Project-wide layout and budget conventions shared by every capability
/// profile and the pipeline. Loaded once per process and handed out behind
/// an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conventions {
    /// Retry budget for gated stages that do not set their own.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-stage timeout. `0` disables the timeout.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,
    /// Directory actors write artifacts under, relative to the project root.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    /// Path aliases usable as `$name` at the start of any fs scope glob,
    /// e.g. `tests: spec` lets a profile say `$tests/**`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paths: BTreeMap<String, String>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_stage_timeout() -> u64 {
    1800
}

fn default_artifact_dir() -> String {
    paths::ARTIFACTS_DIR.to_string()
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stage_timeout_seconds: default_stage_timeout(),
            artifact_dir: default_artifact_dir(),
            paths: BTreeMap::new(),
        }
    }
}

impl Conventions {
    /// Expand a leading `$alias` in a glob. Unknown aliases are a
    /// configuration error rather than a literal `$` match.
    pub fn expand(&self, glob: &str) -> Result<String> {
        let Some(rest) = glob.strip_prefix('$') else {
            return Ok(glob.to_string());
        };
        let (name, tail) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let base = self.paths.get(name).ok_or_else(|| {
            RelayError::config(format!("unknown path alias '${name}' in '{glob}'"))
        })?;
        Ok(format!("{}{}", base.trim_end_matches('/'), tail))
    }
}

// ---------------------------------------------------------------------------
// ActorBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorBackend {
    /// A subprocess speaking the relay JSON-lines protocol.
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Reports a fixed result without doing any work. Used to rehearse a
    /// pipeline before real actors are wired up.
    Stub {
        #[serde(default = "default_stub_status")]
        status: StageStatus,
        #[serde(default)]
        score: Option<f64>,
    },
}

fn default_stub_status() -> StageStatus {
    StageStatus::Passed
}

// ---------------------------------------------------------------------------
// ActorsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActorsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ActorBackend>,
    #[serde(default)]
    pub roles: HashMap<String, ActorBackend>,
}

impl ActorsConfig {
    pub fn backend_for(&self, role: &str) -> Option<&ActorBackend> {
        self.roles.get(role).or(self.default.as_ref())
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub conventions: Conventions,
    #[serde(default)]
    pub actors: ActorsConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            conventions: Conventions::default(),
            actors: ActorsConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(RelayError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Non-fatal checks against the roles the pipeline actually uses.
    pub fn validate(&self, pipeline_roles: &BTreeSet<String>) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for role in self.actors.roles.keys() {
            if !pipeline_roles.contains(role) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("actor binding for unknown role '{role}' in actors.roles"),
                });
            }
        }

        for role in pipeline_roles {
            if self.actors.backend_for(role).is_none() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("role '{role}' has no actor binding and no default"),
                });
            }
        }

        let backends = self
            .actors
            .roles
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(self.actors.default.iter().map(|b| ("default", b)));
        for (name, backend) in backends {
            if let ActorBackend::Script { command, .. } = backend {
                if command.trim().is_empty() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("actor '{name}' has an empty command"),
                    });
                }
            }
        }

        if self.conventions.max_retries > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "conventions.max_retries={} (>10 is unusual)",
                    self.conventions.max_retries
                ),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
