//! Subprocess-isolated login execution.
//!
//! Some login flows must not run in-process (TLS state created here would be
//! poisoned for pooled reuse in forked deployments), so login is delegated to
//! a short-lived child process: the login script is materialized to a scoped
//! temporary file, executed under a timeout, and its stdout parsed as the
//! credential. The temporary file is removed on every exit path — success,
//! failure, or panic — by the [`tempfile::NamedTempFile`] guard.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use tracing::debug;

use super::{AuthError, AuthResult, SessionCredential};

/// Describes one login flow: an interpreter plus the script it runs.
#[derive(Debug, Clone)]
pub struct LoginDescriptor {
    /// Interpreter command (e.g., `"/bin/sh"` or `"python3 -u"`).
    pub interpreter: String,

    /// Script body, materialized to a temporary file for execution.
    pub script: String,

    /// Extra arguments appended after the script path.
    pub args: Vec<String>,

    /// Environment variables for the login process.
    pub env: Vec<(String, String)>,
}

impl LoginDescriptor {
    pub fn new(interpreter: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Executes login flows in disposable child processes.
///
/// Spawns exactly one subprocess per [`execute`](Self::execute) call; callers
/// should go through the [`AuthCache`](super::AuthCache) rather than calling
/// this directly, so logins happen at most once per controller identity.
pub struct SubprocessAuthExecutor {
    timeout: Duration,
}

impl SubprocessAuthExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs the login flow and parses its stdout as a credential.
    ///
    /// The last stdout line that parses as a [`SessionCredential`] JSON
    /// object wins, so login scripts are free to print diagnostics first.
    ///
    /// # Errors
    ///
    /// [`AuthError::Execution`] on non-zero exit (with captured stderr),
    /// [`AuthError::MalformedOutput`] when no credential line is found,
    /// [`AuthError::Timeout`] when the deadline elapses, and
    /// [`AuthError::Spawn`]/[`AuthError::Io`] for process/file failures.
    pub async fn execute(&self, descriptor: &LoginDescriptor) -> AuthResult<SessionCredential> {
        // Scoped acquisition: the guard removes the file on every exit path.
        let mut script_file = tempfile::Builder::new()
            .prefix("netverify-login-")
            .suffix(".script")
            .tempfile()
            .map_err(|e| AuthError::Io(e.to_string()))?;
        script_file
            .write_all(descriptor.script.as_bytes())
            .and_then(|_| script_file.flush())
            .map_err(|e| AuthError::Io(e.to_string()))?;

        let mut parts = shell_words::split(&descriptor.interpreter)
            .unwrap_or_else(|_| vec![descriptor.interpreter.clone()]);
        parts.push(script_file.path().to_string_lossy().to_string());
        parts.extend(descriptor.args.iter().cloned());

        debug!("Spawning login subprocess: {:?}", parts);

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AuthError::Timeout(self.timeout))?
            .map_err(|e| AuthError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(AuthError::Execution {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .filter(|line| line.trim_start().starts_with('{'))
            .find_map(|line| serde_json::from_str::<SessionCredential>(line.trim()).ok())
            .ok_or_else(|| {
                let preview: String = stdout.chars().take(200).collect();
                AuthError::MalformedOutput(preview)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn executor() -> SubprocessAuthExecutor {
        SubprocessAuthExecutor::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_execute_parses_credential() {
        let descriptor = LoginDescriptor::new(
            "/bin/sh",
            "echo logging in\necho '{\"token\": \"tok-1\", \"cookie\": \"sid=9\"}'\n",
        );
        let cred = executor().execute(&descriptor).await.unwrap();
        assert_eq!(cred.token, "tok-1");
        assert_eq!(cred.cookie.as_deref(), Some("sid=9"));
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let descriptor = LoginDescriptor::new("/bin/sh", "echo denied >&2\nexit 3\n");
        let err = executor().execute(&descriptor).await.unwrap_err();
        match err {
            AuthError::Execution { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "denied");
            }
            other => panic!("expected Execution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_malformed_output() {
        let descriptor = LoginDescriptor::new("/bin/sh", "echo not a credential\n");
        let err = executor().execute(&descriptor).await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let descriptor = LoginDescriptor::new("/bin/sh", "sleep 5\n");
        let executor = SubprocessAuthExecutor::new(Duration::from_millis(50));
        let err = executor.execute(&descriptor).await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_script_file_removed_on_success() {
        // The script records its own path so we can check it afterwards.
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("script-path");
        let script = format!(
            "echo \"$0\" > {}\necho '{{\"token\": \"t\"}}'\n",
            marker.display()
        );
        let descriptor = LoginDescriptor::new("/bin/sh", script);

        let cred = executor().execute(&descriptor).await.unwrap();
        assert_eq!(cred.token, "t");

        let recorded = std::fs::read_to_string(&marker).unwrap();
        assert!(!Path::new(recorded.trim()).exists(), "script file leaked");
    }

    #[tokio::test]
    async fn test_script_file_removed_on_failure() {
        // The failing script reports its own path on stderr; after execute
        // returns, that path must be gone.
        let descriptor = LoginDescriptor::new("/bin/sh", "echo \"$0\" >&2\nexit 1\n");
        let err = executor().execute(&descriptor).await.unwrap_err();
        let AuthError::Execution { stderr, .. } = err else {
            panic!("expected Execution error");
        };
        assert!(!stderr.is_empty());
        assert!(!Path::new(stderr.trim()).exists(), "script file leaked");
    }

    #[tokio::test]
    async fn test_env_is_passed_through() {
        let descriptor = LoginDescriptor::new(
            "/bin/sh",
            "echo \"{\\\"token\\\": \\\"$NV_IDENTITY\\\"}\"\n",
        )
        .with_env("NV_IDENTITY", "ctrl-a");
        let cred = executor().execute(&descriptor).await.unwrap();
        assert_eq!(cred.token, "ctrl-a");
    }
}
