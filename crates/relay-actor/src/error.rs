use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActorProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse actor output: {source}\n  line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("process error: {0}")]
    Process(String),

    #[error("command not found: {command}")]
    CommandNotFound {
        command: String,
        #[source]
        source: which::Error,
    },
}
