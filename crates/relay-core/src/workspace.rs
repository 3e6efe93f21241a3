//! Everything a project declares under `.relay/`, loaded together.
//!
//! Loading is all-or-nothing: a malformed profile or an invalid pipeline
//! fails the whole load, so no run can start against a half-read project.

use crate::actor::ActorRegistry;
use crate::config::{Config, ConfigWarning, Conventions, WarnLevel};
use crate::dispatcher::Dispatcher;
use crate::error::{RelayError, Result};
use crate::paths;
use crate::pipeline::PipelineGraph;
use crate::profile::{CapabilityProfile, ProfileSet};
use crate::store::RunStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config: Config,
    pub conventions: Arc<Conventions>,
    pub profiles: Arc<ProfileSet>,
    pub pipeline: Arc<PipelineGraph>,
}

impl Workspace {
    pub fn load(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let conventions = Arc::new(config.conventions.clone());
        let profiles = ProfileSet::load_dir(&paths::agents_dir(root), Arc::clone(&conventions))?;
        let pipeline = PipelineGraph::load(root, Arc::clone(&conventions))?;

        for role in pipeline.roles() {
            profiles.for_role(&role)?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            config,
            conventions,
            profiles: Arc::new(profiles),
            pipeline: Arc::new(pipeline),
        })
    }

    /// Config warnings plus profiles that no stage uses.
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let roles = self.pipeline.roles();
        let mut warnings = self.config.validate(&roles);
        for profile in self.profiles.iter() {
            if !roles.contains(&profile.role) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "profile '{}' (role '{}') is not used by any stage",
                        profile.actor_id, profile.role
                    ),
                });
            }
        }
        warnings
    }

    pub fn store(&self) -> RunStore {
        RunStore::new(&self.root)
    }

    /// Look a profile up by actor id, falling back to role.
    pub fn profile(&self, actor: &str) -> Result<&Arc<CapabilityProfile>> {
        self.profiles
            .iter()
            .find(|p| p.actor_id == actor)
            .map(Ok)
            .unwrap_or_else(|| self.profiles.for_role(actor))
    }

    /// A dispatcher over this workspace that persists runs to `.relay/runs/`.
    pub fn dispatcher(&self, actors: ActorRegistry) -> Result<Dispatcher> {
        Ok(Dispatcher::new(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.profiles),
            actors,
        )?
        .with_store(self.store()))
    }

    pub fn require_initialized(root: &Path) -> Result<()> {
        if paths::config_path(root).exists() {
            Ok(())
        } else {
            Err(RelayError::NotInitialized)
        }
    }
}
