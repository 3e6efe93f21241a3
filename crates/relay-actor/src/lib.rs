//! `relay-actor` — concrete actors for relay pipeline stages.
//!
//! The engine in `relay-core` only knows the [`Actor`](relay_core::actor::Actor)
//! trait. This crate supplies the two backends a project can configure in
//! `.relay/config.yaml`: a subprocess speaking a JSON-lines protocol, and a
//! stub that reports a fixed result.
//!
//! # Protocol
//!
//! ```text
//! engine ──stdin──▶ {"type":"request", "stage_id": …, "actions": […], …}
//! actor  ─stdout──▶ {"type":"log", "level":"info", "message": …}      (any number)
//! actor  ─stdout──▶ {"type":"declare", "actions":[{"kind":"write","target":…}]}
//! engine ──stdin──▶ {"type":"verdict", "allowed": true}
//! actor  ─stdout──▶ {"type":"outcome", "status":"passed", "score": 8.5, …}
//! ```
//!
//! A refused declaration is answered with `"allowed": false` and the process
//! is killed. Stdout lines with an unknown `"type"` are skipped. Closing
//! stdout without an outcome fails the stage with the exit code and stderr.

pub mod error;
pub mod registry;
pub mod script;
pub mod stub;
pub mod types;

pub(crate) mod process;


pub use error::ActorProcessError;
pub use registry::{build_actor, registry_from_config};
pub use script::ScriptActor;
pub use stub::StubActor;
pub use types::{ActorMessage, EngineMessage, LogLevel, RequestPayload};

pub type Result<T> = std::result::Result<T, ActorProcessError>;
