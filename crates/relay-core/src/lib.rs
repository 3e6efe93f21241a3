pub mod actor;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod io;
pub mod paths;
pub mod pattern;
pub mod pipeline;
pub mod policy;
pub mod profile;
pub mod run;
pub mod stage;
pub mod store;
pub mod types;
pub mod workspace;

pub use error::{RelayError, Result};
