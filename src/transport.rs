//! Bridges to the external device-session automation library and the
//! keyword-driven check framework.
//!
//! netverify never constructs raw sockets or speaks device CLI protocols
//! itself. Instead it consumes two capabilities:
//!
//! 1. A [`Transport`] that can open a session to a controller and execute
//!    commands on it (the device-session automation library).
//! 2. A [`CheckRunner`] that executes one declarative check body and streams
//!    its results through the collector (the keyword-driven test framework).
//!
//! Both seams ship with shell bridges so the binary can drive any external
//! implementation through a small line-oriented protocol:
//!
//! ## Connect / exec protocol ([`ShellTransport`])
//! ```bash
//! connector --connect <identity>          # prints {"handle": "..."}
//! connector --exec <handle> <command...>  # prints {"exit_code": 0, "output": "..."}
//! ```
//!
//! ## Check protocol ([`ShellCheckRunner`])
//! ```bash
//! run-check <unit-path>
//! ```
//! The check process emits one JSON event per stdout line:
//! ```json
//! {"event": "command_execution", "command": "show version", "output": "...", "duration_ms": 12}
//! {"event": "result", "status": "passed", "message": "version matches", "duration_ms": 40}
//! ```
//! The bridge assigns one execution context per result event: command events
//! are linked to the context of the result that follows them, and a fresh
//! context is started after each result. Non-JSON lines are ignored.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use crate::auth::AuthSession;
use crate::discovery::TestUnit;
use crate::pool::PooledConnection;
use crate::stream::{
    CheckStatus, CommandExecutionRecord, ExecutionContext, ResultRecord, UnitStream,
};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors from the device-session transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Opening a session to the controller failed.
    #[error("Failed to connect to '{identity}': {reason}")]
    ConnectFailed { identity: String, reason: String },

    /// A command could not be executed on an open session.
    #[error("Command execution failed: {0}")]
    ExecFailed(String),

    /// The transport operation exceeded its deadline.
    #[error("Transport timed out: {0}")]
    Timeout(String),

    /// I/O error talking to the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The device-session capability pair consumed by the connection pool.
///
/// `connect` opens a session to a controller identity; `execute` runs one
/// command on an open session and returns its output. Implementations must
/// be `Send + Sync` so the pool can be shared across concurrent check units.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The session/client handle type produced by `connect`.
    type Client: Send + 'static;

    /// Opens a session to the given controller identity.
    async fn connect(&self, identity: &str) -> TransportResult<Self::Client>;

    /// Executes a command on an open session and returns its output.
    async fn execute(&self, client: &mut Self::Client, command: &str)
    -> TransportResult<String>;

    /// Transport name, for logging.
    fn name(&self) -> &str;
}

/// Executes one check unit against a controller, streaming results and
/// command traces through the unit's collector stream.
///
/// The stream is the only write surface a check body may use: every
/// verification records exactly one [`ResultRecord`] and zero or more
/// [`CommandExecutionRecord`]s sharing that result's execution context.
///
/// Returns the worst status the check resolved to. Implementations should
/// return `Err` only for infrastructure failures (the orchestrator records
/// those as errored results); ordinary check failures are recorded on the
/// stream and returned as a status.
#[async_trait]
pub trait CheckRunner<T: Transport>: Send + Sync {
    async fn run_check(
        &self,
        unit: &TestUnit,
        session: &AuthSession,
        conn: &mut PooledConnection<T>,
        stream: &UnitStream,
    ) -> anyhow::Result<CheckStatus>;
}

/// A session handle produced by [`ShellTransport`].
#[derive(Debug, Clone)]
pub struct ShellSession {
    /// Opaque handle the connector uses to address this session.
    pub handle: String,
    /// Controller identity the session was opened against.
    pub identity: String,
}

#[derive(Debug, Deserialize)]
struct ConnectReply {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct ExecReply {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    output: String,
}

/// A transport that shells out to an external connector executable.
///
/// This allows the device-session automation library to be written in any
/// language. The connector must follow the connect/exec protocol described
/// in the module docs.
pub struct ShellTransport {
    /// The base command to run (e.g., `"python3 connector.py"`).
    command: String,
    /// Working directory for the connector process.
    working_dir: Option<PathBuf>,
    /// Per-invocation timeout.
    timeout: Duration,
}

impl ShellTransport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Splits the base command string into argv parts, respecting quotes.
    fn command_parts(&self) -> Vec<String> {
        shell_words::split(&self.command).unwrap_or_else(|_| vec![self.command.clone()])
    }

    async fn invoke(&self, extra: &[String]) -> TransportResult<std::process::Output> {
        let mut parts = self.command_parts();
        parts.extend(extra.iter().cloned());

        debug!("Running connector: {:?}", parts);

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout(format!("connector {:?}", extra)))?
            .map_err(|e| TransportError::ExecFailed(format!("Failed to run connector: {}", e)))
    }
}

/// Finds the last stdout line that parses as the expected JSON reply.
fn last_json_line<'a, T: Deserialize<'a>>(stdout: &'a str) -> Option<T> {
    stdout
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .and_then(|line| serde_json::from_str(line.trim()).ok())
}

#[async_trait]
impl Transport for ShellTransport {
    type Client = ShellSession;

    async fn connect(&self, identity: &str) -> TransportResult<Self::Client> {
        let output = self
            .invoke(&["--connect".to_string(), identity.to_string()])
            .await?;

        if !output.status.success() {
            return Err(TransportError::ConnectFailed {
                identity: identity.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: ConnectReply =
            last_json_line(&stdout).ok_or_else(|| TransportError::ConnectFailed {
                identity: identity.to_string(),
                reason: "connector printed no session handle".to_string(),
            })?;

        Ok(ShellSession {
            handle: reply.handle,
            identity: identity.to_string(),
        })
    }

    async fn execute(
        &self,
        client: &mut Self::Client,
        command: &str,
    ) -> TransportResult<String> {
        let mut extra = vec!["--exec".to_string(), client.handle.clone()];
        extra.extend(
            shell_words::split(command).unwrap_or_else(|_| vec![command.to_string()]),
        );

        let output = self.invoke(&extra).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        match last_json_line::<ExecReply>(&stdout) {
            Some(reply) if reply.exit_code == 0 => Ok(reply.output),
            Some(reply) => Err(TransportError::ExecFailed(format!(
                "connector exec exited {} for '{}'",
                reply.exit_code, client.identity
            ))),
            // Older connectors print raw output without the JSON envelope.
            None if output.status.success() => Ok(stdout),
            None => Err(TransportError::ExecFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        &self.command
    }
}

/// One event line emitted by an external check process.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RunnerEvent {
    CommandExecution {
        command: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        duration_ms: u64,
    },
    Result {
        status: CheckStatus,
        #[serde(default)]
        message: String,
        #[serde(default)]
        expected: Option<String>,
        #[serde(default)]
        actual: Option<String>,
        #[serde(default)]
        duration_ms: u64,
    },
}

/// A check runner that shells out to an external check executable.
///
/// The external keyword-driven framework emits JSON events on stdout (see
/// module docs); the bridge translates them into stream records, assigning
/// one execution context per verification.
pub struct ShellCheckRunner {
    /// The base command to run (unit path is appended).
    command: String,
    /// Working directory for the check process.
    working_dir: Option<PathBuf>,
}

impl ShellCheckRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

#[async_trait]
impl<T: Transport> CheckRunner<T> for ShellCheckRunner {
    async fn run_check(
        &self,
        unit: &TestUnit,
        session: &AuthSession,
        _conn: &mut PooledConnection<T>,
        stream: &UnitStream,
    ) -> anyhow::Result<CheckStatus> {
        let mut parts = shell_words::split(&self.command)
            .unwrap_or_else(|_| vec![self.command.clone()]);
        parts.push(unit.path.to_string_lossy().to_string());

        debug!("Running check: {:?}", parts);

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd.env("NETVERIFY_CONTROLLER", &unit.controller);
        cmd.env("NETVERIFY_TOKEN", &session.credential.token);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn check process: {}", e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture check stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture check stderr"))?;

        // Merge stdout and stderr; events arrive on stdout, diagnostics on
        // stderr.
        let stdout_stream = LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| (false, line.unwrap_or_default()));
        let stderr_stream = LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| (true, line.unwrap_or_default()));
        let mut combined = futures::stream::select(stdout_stream, stderr_stream);

        // Commands are linked to the verification that follows them; a fresh
        // context starts after every result event.
        let mut context = ExecutionContext::generate(&unit.key());
        let mut worst: Option<CheckStatus> = None;

        while let Some((is_stderr, line)) = combined.next().await {
            let trimmed = line.trim();
            if is_stderr {
                if !trimmed.is_empty() {
                    warn!("[{}] {}", unit.key(), trimmed);
                }
                continue;
            }
            if !trimmed.starts_with('{') {
                debug!("[{}] {}", unit.key(), trimmed);
                continue;
            }
            match serde_json::from_str::<RunnerEvent>(trimmed) {
                Ok(RunnerEvent::CommandExecution {
                    command,
                    output,
                    duration_ms,
                }) => {
                    stream.record_command(
                        CommandExecutionRecord::new(command, output, &context)
                            .with_duration(Duration::from_millis(duration_ms)),
                    );
                }
                Ok(RunnerEvent::Result {
                    status,
                    message,
                    expected,
                    actual,
                    duration_ms,
                }) => {
                    let mut record = ResultRecord::new(status, message, &context)
                        .with_duration(Duration::from_millis(duration_ms));
                    record.expected = expected;
                    record.actual = actual;
                    stream.record_result(record);
                    worst = Some(worst.map_or(status, |w| w.worst(status)));
                    context = ExecutionContext::generate(&unit.key());
                }
                Err(e) => {
                    warn!("Ignoring malformed check event: {} ({})", trimmed, e);
                }
            }
        }

        let status = child.wait().await?;
        match worst {
            Some(worst) => Ok(worst),
            None if status.success() => Ok(CheckStatus::Passed),
            None => Err(anyhow::anyhow!(
                "check process exited {} without recording a result",
                status.code().unwrap_or(-1)
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_json_line_picks_trailing_json() {
        let stdout = "booting connector\nready\n{\"handle\": \"sess-1\"}\n";
        let reply: ConnectReply = last_json_line(stdout).unwrap();
        assert_eq!(reply.handle, "sess-1");
    }

    #[test]
    fn test_last_json_line_none_for_plain_output() {
        let reply: Option<ConnectReply> = last_json_line("no json here\n");
        assert!(reply.is_none());
    }

    #[test]
    fn test_runner_event_parsing() {
        let line = r#"{"event": "result", "status": "failed", "message": "mismatch", "expected": "up", "actual": "down"}"#;
        match serde_json::from_str::<RunnerEvent>(line).unwrap() {
            RunnerEvent::Result {
                status,
                message,
                expected,
                actual,
                ..
            } => {
                assert_eq!(status, CheckStatus::Failed);
                assert_eq!(message, "mismatch");
                assert_eq!(expected.as_deref(), Some("up"));
                assert_eq!(actual.as_deref(), Some("down"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_runner_event_tolerates_missing_optionals() {
        let line = r#"{"event": "command_execution", "command": "show version"}"#;
        match serde_json::from_str::<RunnerEvent>(line).unwrap() {
            RunnerEvent::CommandExecution {
                command,
                output,
                duration_ms,
            } => {
                assert_eq!(command, "show version");
                assert!(output.is_empty());
                assert_eq!(duration_ms, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
