use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Read,
    Write,
    Command,
    Tool,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Read => "read",
            ActionKind::Write => "write",
            ActionKind::Command => "command",
            ActionKind::Tool => "tool",
        }
    }

    /// The filesystem mode this action needs, if it touches the filesystem.
    pub fn fs_mode(self) -> Option<FsMode> {
        match self {
            ActionKind::Read => Some(FsMode::Read),
            ActionKind::Write => Some(FsMode::Write),
            ActionKind::Command | ActionKind::Tool => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = crate::error::RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(ActionKind::Read),
            "write" => Ok(ActionKind::Write),
            "command" => Ok(ActionKind::Command),
            "tool" => Ok(ActionKind::Tool),
            _ => Err(crate::error::RelayError::config(format!(
                "unknown action kind '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A single side effect an actor intends to perform: a file access, a shell
/// command, or the use of a named tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: String,
}

impl Action {
    pub fn new(kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::new(ActionKind::Read, path)
    }

    pub fn write(path: impl Into<String>) -> Self {
        Self::new(ActionKind::Write, path)
    }

    pub fn command(line: impl Into<String>) -> Self {
        Self::new(ActionKind::Command, line)
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self::new(ActionKind::Tool, name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.target)
    }
}

// ---------------------------------------------------------------------------
// FsMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsMode {
    Read,
    Write,
}

impl FsMode {
    /// Whether a scope granting `self` also grants `requested`.
    /// A write scope covers reads; a read scope covers only reads.
    pub fn grants(self, requested: FsMode) -> bool {
        matches!(
            (self, requested),
            (FsMode::Write, _) | (FsMode::Read, FsMode::Read)
        )
    }

    /// Whether a deny scope on `self` revokes `requested`.
    /// Denying read revokes all access; denying write revokes only writes.
    pub fn revokes(self, requested: FsMode) -> bool {
        matches!(
            (self, requested),
            (FsMode::Read, _) | (FsMode::Write, FsMode::Write)
        )
    }
}

impl fmt::Display for FsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FsMode::Read => "read",
            FsMode::Write => "write",
        })
    }
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

/// What a matching rule does. Maps the "Always / Ask first / Never" tiers of
/// an agent definition onto allow / ask / deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    Allow,
    Ask,
    Deny,
}

impl Effect {
    /// Restrictiveness rank used to break ties at equal specificity.
    pub fn rank(self) -> u8 {
        match self {
            Effect::Allow => 0,
            Effect::Ask => 1,
            Effect::Deny => 2,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Effect::Allow => "allow",
            Effect::Ask => "ask",
            Effect::Deny => "deny",
        })
    }
}

// ---------------------------------------------------------------------------
// StageStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    Blocked,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Passed => "passed",
            StageStatus::Failed => "failed",
            StageStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
