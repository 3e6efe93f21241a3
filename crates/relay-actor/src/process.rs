use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::types::{ActorMessage, EngineMessage};
use crate::{ActorProcessError, Result};

/// Stderr lines kept for error reports. Older lines are dropped.
const STDERR_TAIL_LINES: usize = 40;

const KNOWN_TYPES: [&str; 3] = ["log", "declare", "outcome"];

// ─── StderrTail ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        if let Ok(mut tail) = self.0.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    fn joined(&self) -> String {
        self.0
            .lock()
            .map(|tail| tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    fn drain_from<R>(self, stream: R) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                self.push(line);
            }
        })
    }
}

// ─── ScriptProcess ────────────────────────────────────────────────────────

/// A running actor subprocess speaking the relay JSON-lines protocol.
///
/// Engine messages go to stdin, actor messages are read from stdout. The
/// last lines of stderr are kept for exit errors. The child is killed when
/// the handle is dropped, so a timed-out or cancelled stage never leaves an
/// orphan behind.
pub(crate) struct ScriptProcess {
    child: Child,
    stdout: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    stdin: Option<ChildStdin>,
    stderr: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

impl ScriptProcess {
    pub(crate) fn spawn(mut cmd: Command) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            return Err(ActorProcessError::Process("stdout not captured".into()));
        };
        let stderr = StderrTail::default();
        let stderr_task = child.stderr.take().map(|s| stderr.clone().drain_from(s));

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: BufReader::new(stdout).lines(),
            child,
            stderr,
            stderr_task,
        })
    }

    /// Write one engine message as a single line and flush it.
    pub(crate) async fn send(&mut self, msg: &EngineMessage) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ActorProcessError::Process("stdin already closed".into()));
        };
        let mut line = serde_json::to_string(msg)
            .map_err(|e| ActorProcessError::Process(format!("cannot encode engine message: {e}")))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub(crate) fn close_stdin(&mut self) {
        drop(self.stdin.take());
    }

    /// Next actor message; `Ok(None)` at EOF.
    pub(crate) async fn next_message(&mut self) -> Result<Option<ActorMessage>> {
        while let Some(line) = self.stdout.next_line().await? {
            if let Some(msg) = decode(line.trim())? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    pub(crate) fn stderr(&self) -> String {
        self.stderr.joined()
    }

    /// Wait for exit after stdout closed without an outcome and describe why.
    pub(crate) async fn exit_error(&mut self) -> ActorProcessError {
        let status = match self.child.wait().await {
            Ok(s) => s,
            Err(e) => return ActorProcessError::Io(e),
        };
        // Stderr closes with the process; give the drain a moment to finish.
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        let mut message = match status.code() {
            Some(0) => "actor exited without reporting an outcome".to_string(),
            Some(code) => format!("actor exited with code {code} without reporting an outcome"),
            None => "actor terminated by signal".to_string(),
        };
        let stderr = self.stderr();
        if !stderr.is_empty() {
            message.push_str("\nstderr: ");
            message.push_str(&stderr);
        }
        ActorProcessError::Process(message)
    }

    pub(crate) async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Blank lines and well-formed JSON with an unrecognised `"type"` decode to
/// `None`. Anything else that fails to parse, including a known type with
/// bad fields, is an error.
fn decode(line: &str) -> Result<Option<ActorMessage>> {
    if line.is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|source| ActorProcessError::Parse {
            line: line.to_owned(),
            source,
        })?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) if !KNOWN_TYPES.contains(&kind) => {
            tracing::debug!(kind, "skipping unknown actor message");
            Ok(None)
        }
        _ => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| ActorProcessError::Parse {
                line: line.to_owned(),
                source,
            }),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ScriptProcess {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        ScriptProcess::spawn(cmd).unwrap()
    }

    #[tokio::test]
    async fn skips_blank_and_unknown_lines() {
        let mut p = sh(r#"echo ''; echo '{"type":"heartbeat"}'; echo '{"type":"log","message":"hi"}'"#);
        let msg = p.next_message().await.unwrap().unwrap();
        assert!(matches!(msg, ActorMessage::Log { ref message, .. } if message == "hi"));
        assert!(p.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        let mut p = sh("echo 'not json'");
        let err = p.next_message().await.unwrap_err();
        assert!(matches!(err, ActorProcessError::Parse { ref line, .. } if line == "not json"));
    }

    #[tokio::test]
    async fn known_type_with_bad_fields_is_a_parse_error() {
        let mut p = sh(r#"echo '{"type":"declare","actions":"everything"}'"#);
        assert!(matches!(
            p.next_message().await,
            Err(ActorProcessError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn exit_error_includes_stderr() {
        let mut p = sh("echo 'boom' >&2; exit 3");
        assert!(p.next_message().await.unwrap().is_none());
        let err = p.exit_error().await.to_string();
        assert!(err.contains("code 3"), "{err}");
        assert!(err.contains("stderr: boom"), "{err}");
    }

    #[tokio::test]
    async fn stderr_keeps_only_the_tail() {
        let mut p = sh("i=0; while [ $i -lt 100 ]; do echo \"line $i\" >&2; i=$((i+1)); done; exit 1");
        assert!(p.next_message().await.unwrap().is_none());
        let err = p.exit_error().await.to_string();
        assert!(err.contains("line 99"), "{err}");
        assert!(!err.contains("line 59\n"), "{err}");
        assert_eq!(p.stderr().lines().count(), STDERR_TAIL_LINES);
    }

    #[tokio::test]
    async fn send_writes_one_json_line() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(r#"read line; echo '{"type":"log","level":"warn","message":"got it"}'"#);
        let mut p = ScriptProcess::spawn(cmd).unwrap();
        p.send(&EngineMessage::allowed()).await.unwrap();
        let msg = p.next_message().await.unwrap().unwrap();
        assert_eq!(
            msg,
            ActorMessage::Log {
                level: crate::types::LogLevel::Warn,
                message: "got it".into()
            }
        );
        p.close_stdin();
        assert!(p.send(&EngineMessage::allowed()).await.is_err());
    }
}
