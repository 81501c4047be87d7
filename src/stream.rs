//! Streaming result collection.
//!
//! Every test unit streams its results and command traces into an
//! append-only JSON Lines shard while it executes. Each entry is one
//! self-delimited JSON object per line, written with a single atomic append
//! and flushed immediately: a crash mid-run loses at most the unflushed
//! tail, never corrupts prior entries. Shards are keyed by unit so the
//! report generator can locate every shard of one run.
//!
//! # Stream format
//!
//! ```json
//! {"type": "command_execution", "command": "show bgp", "output": "...", "context": "u1:ab12", ...}
//! {"type": "result", "status": "passed", "message": "bgp peers up", "context": "u1:ab12", ...}
//! ```
//!
//! Readers must tolerate unknown additional fields and skip unparseable
//! lines; ordering across parallel shards is unspecified and grouping is by
//! execution context, never arrival order.
//!
//! # Failed-only mode
//!
//! Bulk command output dwarfs result metadata, so the collector can retain
//! command detail only for units whose final status resolves to a failure.
//! Commands are buffered per unit and the retention decision is made once in
//! [`UnitStream::finish`], when the overall status is known — a command
//! cannot know in advance whether its parent check will ultimately fail.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::discovery::{D2D_DIR, TestUnit, UnitCategory};

/// Errors opening a stream shard. Write failures after open are logged and
/// counted, never propagated — losing a report line is lower-severity than
/// losing a controller change.
#[derive(Debug, thiserror::Error)]
pub enum StreamWriteError {
    #[error("Failed to create stream directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open stream shard {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Terminal status of one logical verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Verification succeeded.
    Passed,
    /// Verification ran and its expectation was not met.
    Failed,
    /// Verification was not run (e.g., its controller login failed).
    Skipped,
    /// Verification could not complete (infrastructure failure).
    Errored,
    /// Verification was cancelled by a run-level timeout or signal.
    Cancelled,
}

impl CheckStatus {
    /// Sort priority: failures first, then skips, then passes.
    pub fn priority(&self) -> u8 {
        match self {
            CheckStatus::Failed | CheckStatus::Errored | CheckStatus::Cancelled => 0,
            CheckStatus::Skipped => 1,
            CheckStatus::Passed => 2,
        }
    }

    /// Whether this status counts as a failure for retention and exit codes.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CheckStatus::Failed | CheckStatus::Errored | CheckStatus::Cancelled
        )
    }

    /// Worst-of precedence: failed/errored/cancelled > skipped > passed.
    pub fn worst(self, other: CheckStatus) -> CheckStatus {
        if other.priority() < self.priority() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckStatus::Passed => "passed",
            CheckStatus::Failed => "failed",
            CheckStatus::Skipped => "skipped",
            CheckStatus::Errored => "errored",
            CheckStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Correlation key linking command traces to the verification result that
/// produced them.
///
/// One context per logical verification, reused across all of its sub-calls.
/// Creating a new context mid-verification is a correctness bug: the command
/// records written under the abandoned context become orphans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionContext(String);

impl ExecutionContext {
    /// Creates a fresh context for one logical verification of a unit.
    pub fn generate(unit_key: &str) -> Self {
        Self(format!("{}:{}", unit_key, uuid::Uuid::new_v4()))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One verification outcome. Append-only; one per logical verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Terminal status of the verification.
    pub status: CheckStatus,

    /// Human-readable outcome message.
    pub message: String,

    /// Execution context linking this result to its command traces.
    pub context: String,

    /// Expected value, for comparison-style checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,

    /// Observed value, for comparison-style checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,

    /// Time the underlying API call(s) took.
    #[serde(default)]
    pub api_duration: Duration,

    /// When the result was produced.
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(status: CheckStatus, message: impl Into<String>, context: &ExecutionContext) -> Self {
        Self {
            status,
            message: message.into(),
            context: context.as_str().to_string(),
            expected: None,
            actual: None,
            api_duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.api_duration = duration;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One command/API call trace. Append-only; zero or more per context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecutionRecord {
    /// The command or API call issued.
    pub command: String,

    /// Captured output of the command.
    pub output: String,

    /// Execution context of the verification this command belongs to.
    pub context: String,

    /// How long the command took.
    #[serde(default)]
    pub duration: Duration,

    /// When the command completed.
    pub timestamp: DateTime<Utc>,
}

impl CommandExecutionRecord {
    pub fn new(
        command: impl Into<String>,
        output: impl Into<String>,
        context: &ExecutionContext,
    ) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            context: context.as_str().to_string(),
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// The atomic unit written to the append-only stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEntry {
    Result(ResultRecord),
    CommandExecution(CommandExecutionRecord),
}

/// Root of the results tree for one category.
///
/// API results live at the results root; device-to-device results live in a
/// nested tree. The primary placement is a hard external contract — existing
/// automation pipelines depend on the original root location.
pub fn category_root(root: &Path, category: UnitCategory) -> PathBuf {
    match category {
        UnitCategory::Api => root.to_path_buf(),
        UnitCategory::DeviceToDevice => root.join(D2D_DIR),
    }
}

/// Directory holding the stream shards for one category.
pub fn streams_dir(root: &Path, category: UnitCategory) -> PathBuf {
    category_root(root, category).join("streams")
}

/// Opens per-unit stream shards under the results tree.
pub struct StreamCollector {
    root: PathBuf,
    failed_only: bool,
}

impl StreamCollector {
    /// Creates a collector writing under `root`.
    ///
    /// With `failed_only` enabled, command detail is retained only for units
    /// whose final status resolves to a failure.
    pub fn new(root: impl Into<PathBuf>, failed_only: bool) -> Self {
        Self {
            root: root.into(),
            failed_only,
        }
    }

    /// Opens the stream shard for one test unit.
    pub fn unit_stream(&self, unit: &TestUnit) -> Result<UnitStream, StreamWriteError> {
        let dir = streams_dir(&self.root, unit.category);
        std::fs::create_dir_all(&dir).map_err(|source| StreamWriteError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!("{}.jsonl", unit.key()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StreamWriteError::Open {
                path: path.clone(),
                source,
            })?;

        debug!("Opened stream shard {}", path.display());

        Ok(UnitStream {
            path,
            file: Mutex::new(file),
            failed_only: self.failed_only,
            pending: Mutex::new(Vec::new()),
            worst: Mutex::new(None),
            results: AtomicUsize::new(0),
            write_failures: AtomicUsize::new(0),
        })
    }
}

/// The append-only stream for one test unit.
///
/// This is the only write surface a check body may use. Thread-safe: a unit
/// may record from multiple tasks, each append is a single atomic write.
pub struct UnitStream {
    path: PathBuf,
    file: Mutex<File>,
    failed_only: bool,
    /// Commands held back until the retention decision in failed-only mode.
    pending: Mutex<Vec<CommandExecutionRecord>>,
    worst: Mutex<Option<CheckStatus>>,
    results: AtomicUsize,
    write_failures: AtomicUsize,
}

impl UnitStream {
    /// Path of the underlying shard file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a verification result.
    pub fn record_result(&self, record: ResultRecord) {
        {
            let mut worst = self.worst.lock().expect("worst status lock poisoned");
            *worst = Some(worst.map_or(record.status, |w| w.worst(record.status)));
        }
        self.results.fetch_add(1, Ordering::SeqCst);
        self.append(&StreamEntry::Result(record));
    }

    /// Appends a command trace, or buffers it when failed-only mode defers
    /// the retention decision to [`finish`](Self::finish).
    pub fn record_command(&self, record: CommandExecutionRecord) {
        if self.failed_only {
            self.pending
                .lock()
                .expect("pending commands lock poisoned")
                .push(record);
        } else {
            self.append(&StreamEntry::CommandExecution(record));
        }
    }

    /// Worst status recorded so far.
    pub fn worst_status(&self) -> Option<CheckStatus> {
        *self.worst.lock().expect("worst status lock poisoned")
    }

    /// Number of result records written.
    pub fn result_count(&self) -> usize {
        self.results.load(Ordering::SeqCst)
    }

    /// Number of appends that failed (logged, not propagated).
    pub fn write_failures(&self) -> usize {
        self.write_failures.load(Ordering::SeqCst)
    }

    /// Resolves failed-only retention: buffered command detail is flushed
    /// when the unit's final status is a failure and dropped otherwise.
    ///
    /// Must be called once per unit after its last result is recorded.
    pub fn finish(&self) {
        if !self.failed_only {
            return;
        }
        let pending = std::mem::take(
            &mut *self.pending.lock().expect("pending commands lock poisoned"),
        );
        if pending.is_empty() {
            return;
        }
        let retain = self.worst_status().is_some_and(|s| s.is_failure());
        if retain {
            debug!(
                "Retaining {} command records for failed unit ({})",
                pending.len(),
                self.path.display()
            );
            for record in pending {
                self.append(&StreamEntry::CommandExecution(record));
            }
        } else {
            debug!(
                "Dropping {} command records for non-failed unit ({})",
                pending.len(),
                self.path.display()
            );
        }
    }

    fn append(&self, entry: &StreamEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize stream entry: {}", e);
                self.write_failures.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock().expect("stream file lock poisoned");
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            warn!(
                "Failed to append to stream shard {}: {}",
                self.path.display(),
                e
            );
            self.write_failures.fetch_add(1, Ordering::SeqCst);
        }
    }
}
