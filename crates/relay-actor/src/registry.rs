use std::path::Path;
use std::sync::Arc;

use relay_core::actor::{Actor, ActorRegistry};
use relay_core::config::{ActorBackend, ActorsConfig};

use crate::script::ScriptActor;
use crate::stub::StubActor;

/// Build the concrete actor for one configured backend. Script actors run
/// with `root` as their working directory.
pub fn build_actor(name: &str, backend: &ActorBackend, root: &Path) -> Arc<dyn Actor> {
    match backend {
        ActorBackend::Script { command, args, env } => Arc::new(
            ScriptActor::new(name, command.clone(), root)
                .with_args(args.clone())
                .with_env(env.clone()),
        ),
        ActorBackend::Stub { status, score } => Arc::new(StubActor::new(name, *status, *score)),
    }
}

/// Bind every role in `actors.roles`, with `actors.default` as the fallback
/// for roles that have no binding of their own.
pub fn registry_from_config(actors: &ActorsConfig, root: &Path) -> ActorRegistry {
    let mut registry = ActorRegistry::new();
    for (role, backend) in &actors.roles {
        registry.bind(role.clone(), build_actor(role, backend, root));
    }
    if let Some(default) = &actors.default {
        registry.set_fallback(build_actor("default", default, root));
    }
    registry
}
