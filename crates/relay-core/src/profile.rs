//! Capability profiles: the declared permission set of one actor.
//!
//! A profile is compiled once from its document and never mutated. All glob
//! validation and ambiguity checks happen here so that evaluation in
//! [`crate::policy`] cannot fail.

use crate::config::Conventions;
use crate::error::{RelayError, Result};
use crate::paths;
use crate::pattern::{normalize_path, Pattern};
use crate::types::{Effect, FsMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDoc {
    #[serde(alias = "name")]
    pub actor_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub fs_scopes: Vec<FsScopeDoc>,
    #[serde(default)]
    pub commands: Vec<CommandRuleDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsScopeDoc {
    pub glob: String,
    pub mode: FsMode,
    #[serde(default)]
    pub effect: Effect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandRuleDoc {
    pub glob: String,
    pub effect: Effect,
    #[serde(default)]
    pub priority: i32,
}

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FsScope {
    pub pattern: Pattern,
    pub mode: FsMode,
    pub effect: Effect,
    /// Declaration index, kept only for audit labels.
    pub index: usize,
}

impl FsScope {
    /// Whether this scope participates in a decision about `requested`.
    pub fn covers(&self, requested: FsMode) -> bool {
        match self.effect {
            Effect::Deny => self.mode.revokes(requested),
            Effect::Allow | Effect::Ask => self.mode.grants(requested),
        }
    }
}

impl fmt::Display for FsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fs_scopes[{}] {} {} '{}'",
            self.index,
            self.effect,
            self.mode,
            self.pattern.as_str()
        )
    }
}

#[derive(Debug, Clone)]
pub struct CommandRule {
    pub pattern: Pattern,
    pub effect: Effect,
    pub priority: i32,
    pub index: usize,
}

impl fmt::Display for CommandRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commands[{}] {} '{}' (priority {})",
            self.index,
            self.effect,
            self.pattern.as_str(),
            self.priority
        )
    }
}

// ---------------------------------------------------------------------------
// CapabilityProfile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CapabilityProfile {
    pub actor_id: String,
    pub role: String,
    pub description: Option<String>,
    pub allowed_tools: BTreeSet<String>,
    pub fs_scopes: Vec<FsScope>,
    pub command_rules: Vec<CommandRule>,
    /// Free-form body of a Markdown agent definition. Opaque to the engine.
    pub instructions: String,
    pub conventions: Arc<Conventions>,
}

impl CapabilityProfile {
    pub fn from_doc(doc: ProfileDoc, conventions: Arc<Conventions>) -> Result<Self> {
        paths::validate_id(&doc.actor_id)?;
        paths::validate_id(&doc.role)?;

        let mut fs_scopes = Vec::with_capacity(doc.fs_scopes.len());
        for (index, scope) in doc.fs_scopes.into_iter().enumerate() {
            let expanded = conventions.expand(scope.glob.trim())?;
            fs_scopes.push(FsScope {
                pattern: Pattern::path(&expanded)?,
                mode: scope.mode,
                effect: scope.effect,
                index,
            });
        }
        check_ambiguous_scopes(&doc.actor_id, &fs_scopes)?;

        let mut command_rules = Vec::with_capacity(doc.commands.len());
        for (index, rule) in doc.commands.into_iter().enumerate() {
            command_rules.push(CommandRule {
                pattern: Pattern::command(&rule.glob)?,
                effect: rule.effect,
                priority: rule.priority,
                index,
            });
        }

        let mut allowed_tools = BTreeSet::new();
        for tool in doc.tools {
            let tool = tool.trim();
            if tool.is_empty() {
                return Err(RelayError::config(format!(
                    "profile '{}' lists an empty tool name",
                    doc.actor_id
                )));
            }
            allowed_tools.insert(tool.to_string());
        }

        Ok(Self {
            actor_id: doc.actor_id,
            role: doc.role,
            description: doc.description,
            allowed_tools,
            fs_scopes,
            command_rules,
            instructions: String::new(),
            conventions,
        })
    }

    pub fn from_yaml(data: &str, conventions: Arc<Conventions>) -> Result<Self> {
        let doc: ProfileDoc = serde_yaml::from_str(data)?;
        Self::from_doc(doc, conventions)
    }

    /// Parse a Markdown agent definition: YAML frontmatter plus a prose body.
    pub fn from_markdown(data: &str, conventions: Arc<Conventions>) -> Result<Self> {
        let (front, body) = crate::io::split_frontmatter(data)
            .ok_or_else(|| RelayError::config("agent definition is missing YAML frontmatter"))?;
        let doc: ProfileDoc = serde_yaml::from_str(front)?;
        let mut profile = Self::from_doc(doc, conventions)?;
        profile.instructions = body.to_string();
        Ok(profile)
    }

    pub fn load(path: &Path, conventions: Arc<Conventions>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("md") => Self::from_markdown(&data, conventions),
            _ => Self::from_yaml(&data, conventions),
        };
        parsed.map_err(|e| match e {
            RelayError::Configuration(msg) => {
                RelayError::Configuration(format!("{}: {msg}", path.display()))
            }
            RelayError::Yaml(err) => {
                RelayError::Configuration(format!("{}: {err}", path.display()))
            }
            other => other,
        })
    }

    pub fn forbids(&self, tool: &str) -> bool {
        !self.allowed_tools.contains(tool)
    }

    /// The scope that decides access to `path` for `mode`, if any.
    ///
    /// The most specific covering scope wins; at equal specificity the most
    /// restrictive effect wins. Returns `None` for paths that escape the
    /// workspace or that no scope covers.
    pub fn scope_for(&self, path: &str, mode: FsMode) -> Option<&FsScope> {
        let path = normalize_path(path)?;
        self.fs_scopes
            .iter()
            .filter(|s| s.covers(mode) && s.pattern.is_match(&path))
            .max_by(|a, b| {
                (a.pattern.specificity(), a.effect.rank(), std::cmp::Reverse(a.index)).cmp(&(
                    b.pattern.specificity(),
                    b.effect.rank(),
                    std::cmp::Reverse(b.index),
                ))
            })
    }
}

/// Two scopes on the same glob with different modes and no deny between them
/// leave the intended access level undecidable.
fn check_ambiguous_scopes(actor_id: &str, scopes: &[FsScope]) -> Result<()> {
    let mut by_glob: BTreeMap<&str, Vec<&FsScope>> = BTreeMap::new();
    for scope in scopes {
        by_glob.entry(scope.pattern.as_str()).or_default().push(scope);
    }
    for (glob, group) in by_glob {
        if group.iter().any(|s| s.effect == Effect::Deny) {
            continue;
        }
        let modes: BTreeSet<_> = group.iter().map(|s| s.mode.to_string()).collect();
        if modes.len() > 1 {
            return Err(RelayError::config(format!(
                "profile '{actor_id}' declares conflicting modes ({}) for '{glob}'",
                modes.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ProfileSet
// ---------------------------------------------------------------------------

/// Every loaded profile, keyed by the role it fills.
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    by_role: BTreeMap<String, Arc<CapabilityProfile>>,
}

impl ProfileSet {
    pub fn new(profiles: Vec<CapabilityProfile>) -> Result<Self> {
        let mut by_role = BTreeMap::new();
        let mut actors = BTreeSet::new();
        for profile in profiles {
            if !actors.insert(profile.actor_id.clone()) {
                return Err(RelayError::config(format!(
                    "duplicate actor id '{}'",
                    profile.actor_id
                )));
            }
            let role = profile.role.clone();
            if by_role.insert(role.clone(), Arc::new(profile)).is_some() {
                return Err(RelayError::config(format!(
                    "role '{role}' is filled by more than one profile"
                )));
            }
        }
        Ok(Self { by_role })
    }

    /// Load every `*.yaml`, `*.yml`, and `*.md` file in `dir`, in name order.
    pub fn load_dir(dir: &Path, conventions: Arc<Conventions>) -> Result<Self> {
        if !dir.is_dir() {
            return Ok(Self::default());
        }
        let mut files: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml" | "md")
                )
            })
            .collect();
        files.sort();
        let profiles = files
            .iter()
            .map(|p| CapabilityProfile::load(p, Arc::clone(&conventions)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(profiles)
    }

    pub fn for_role(&self, role: &str) -> Result<&Arc<CapabilityProfile>> {
        self.by_role
            .get(role)
            .ok_or_else(|| RelayError::ProfileNotFound(role.to_string()))
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.by_role.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CapabilityProfile>> {
        self.by_role.values()
    }

    pub fn len(&self) -> usize {
        self.by_role.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_role.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn conv() -> Arc<Conventions> {
        let mut c = Conventions::default();
        c.paths.insert("tests".into(), "test".into());
        Arc::new(c)
    }

    const TESTER: &str = r#"
actor_id: test-writer
role: red
tools: [Read, Write, Bash]
fs_scopes:
  - glob: "**"
    mode: read
  - glob: "$tests/**"
    mode: write
  - glob: "test/fixtures/secrets/**"
    mode: read
    effect: deny
commands:
  - glob: "bundle exec rspec *"
    effect: allow
  - glob: "git push *"
    effect: deny
"#;

    #[test]
    fn loads_yaml_profile() {
        let p = CapabilityProfile::from_yaml(TESTER, conv()).unwrap();
        assert_eq!(p.actor_id, "test-writer");
        assert_eq!(p.role, "red");
        assert_eq!(p.fs_scopes.len(), 3);
        assert_eq!(p.fs_scopes[1].pattern.as_str(), "test/**");
        assert_eq!(p.command_rules.len(), 2);
        assert!(!p.forbids("Bash"));
        assert!(p.forbids("WebFetch"));
    }

    #[test]
    fn scope_for_prefers_specific_deny() {
        let p = CapabilityProfile::from_yaml(TESTER, conv()).unwrap();
        let s = p.scope_for("test/fixtures/secrets/key.pem", FsMode::Read).unwrap();
        assert_eq!(s.effect, Effect::Deny);
        let s = p.scope_for("test/models/user_test.rb", FsMode::Write).unwrap();
        assert_eq!(s.effect, Effect::Allow);
        assert_eq!(s.mode, FsMode::Write);
        assert!(p.scope_for("app/models/user.rb", FsMode::Write).is_none());
        assert!(p.scope_for("app/models/user.rb", FsMode::Read).is_some());
    }

    #[test]
    fn scope_for_rejects_traversal() {
        let p = CapabilityProfile::from_yaml(TESTER, conv()).unwrap();
        assert!(p.scope_for("test/../app/models/user.rb", FsMode::Write).is_none());
    }

    #[test]
    fn conflicting_modes_rejected_at_load() {
        let yaml = r#"
actor_id: a
role: r
fs_scopes:
  - { glob: "app/**", mode: read }
  - { glob: "app/**", mode: write }
"#;
        let err = CapabilityProfile::from_yaml(yaml, conv()).unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
        assert!(err.to_string().contains("conflicting modes"));
    }

    #[test]
    fn deny_breaks_mode_conflict() {
        let yaml = r#"
actor_id: a
role: r
fs_scopes:
  - { glob: "app/**", mode: read }
  - { glob: "app/**", mode: write, effect: deny }
"#;
        assert!(CapabilityProfile::from_yaml(yaml, conv()).is_ok());
    }

    #[test]
    fn malformed_glob_rejected() {
        let yaml = "actor_id: a\nrole: r\ncommands:\n  - { glob: \"rm [\", effect: deny }\n";
        assert!(matches!(
            CapabilityProfile::from_yaml(yaml, conv()),
            Err(RelayError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_rule_field_rejected() {
        let yaml = "actor_id: a\nrole: r\ncommands:\n  - { glob: \"ls\", efect: allow }\n";
        assert!(CapabilityProfile::from_yaml(yaml, conv()).is_err());
    }

    #[test]
    fn markdown_definition_keeps_body() {
        let md = "---\nname: reviewer\nrole: review\ntools: [Read]\n---\n\n# Reviewer\nScore the spec 1-10.\n";
        let p = CapabilityProfile::from_markdown(md, conv()).unwrap();
        assert_eq!(p.actor_id, "reviewer");
        assert!(p.instructions.contains("Score the spec"));
    }

    #[test]
    fn profile_set_rejects_duplicate_roles() {
        let a = CapabilityProfile::from_yaml("actor_id: a\nrole: r\n", conv()).unwrap();
        let b = CapabilityProfile::from_yaml("actor_id: b\nrole: r\n", conv()).unwrap();
        let err = ProfileSet::new(vec![a, b]).unwrap_err();
        assert!(err.to_string().contains("more than one profile"));
    }

    #[test]
    fn load_dir_reads_yaml_and_markdown() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tester.yaml"), TESTER).unwrap();
        std::fs::write(
            dir.path().join("reviewer.md"),
            "---\nactor_id: reviewer\nrole: review\n---\nbody\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let set = ProfileSet::load_dir(dir.path(), conv()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.for_role("red").unwrap().actor_id, "test-writer");
        assert!(matches!(set.for_role("lint"), Err(RelayError::ProfileNotFound(_))));
    }

    #[test]
    fn load_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "actor_id: a\nrole: r\nfs_scopes:\n  - { glob: \"$nope/**\", mode: read }\n").unwrap();
        let err = CapabilityProfile::load(&path, conv()).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }
}
