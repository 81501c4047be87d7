//! Run orchestration: fan-out, backpressure, and lifecycle.
//!
//! The orchestrator ties the leaf services together under bounded
//! concurrency:
//!
//! ```text
//!   discovery ──► TestUnits
//!                    │
//!        per unit    ▼            (two semaphores: API / device-session)
//!   AuthCache.get_or_fetch ──► ConnectionPool.acquire ──► CheckRunner
//!                    │                                        │
//!                    └── skip on auth failure                 ▼
//!                                                   UnitStream records
//!                    after all units                          │
//!                         ▼                                   ▼
//!                  report::aggregate ◄──────────── JSONL stream shards
//! ```
//!
//! A single unit's failure — auth, pool exhaustion, or the check itself —
//! never aborts sibling units: it is recorded as a terminal result and the
//! run proceeds. Run-level cancellation (deadline or external signal)
//! propagates to in-flight units, which record a distinct `cancelled` status
//! and release their pool slots and auth waits rather than leaking them.
//!
//! The Auth Cache and Connection Pool are the only components with
//! cross-unit mutable shared state; both are owned by the orchestrator with
//! an explicit lifecycle (constructed once per run, dropped at run end),
//! never ambient globals.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthCache, LoginDescriptor, SubprocessAuthExecutor};
use crate::config::Config;
use crate::discovery::{TestUnit, UnitCategory};
use crate::pool::ConnectionPool;
use crate::report::{self, Report};
use crate::stream::{
    CheckStatus, ExecutionContext, ResultRecord, StreamCollector, UnitStream, category_root,
    streams_dir,
};
use crate::transport::{CheckRunner, Transport};

/// Aggregated outcome of an entire run.
///
/// Counts are per logical verification (aggregated record), except
/// `total_units` and `not_run`, which are per test unit.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | No failed/errored/cancelled verifications and every unit ran |
/// | 1 | At least one failure, cancellation, or unit that produced nothing |
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Number of test units scheduled.
    pub total_units: usize,

    /// Verifications that passed.
    pub passed: usize,

    /// Verifications that failed.
    pub failed: usize,

    /// Verifications that were skipped (including auth-unavailable skips).
    pub skipped: usize,

    /// Verifications that errored (infrastructure failures).
    pub errored: usize,

    /// Verifications cancelled by the run deadline or an external signal.
    pub cancelled: usize,

    /// Units that produced no records at all.
    pub not_run: usize,

    /// Orphaned command records detected by the aggregator.
    pub orphaned_commands: usize,

    /// Aggregation warnings (malformed entries, orphan groups).
    pub warnings: usize,

    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunSummary {
    /// Whether the run as a whole succeeded.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.cancelled == 0 && self.not_run == 0
    }

    /// Process exit code derived from worst-of precedence.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Coordinates discovery output through execution to the final report.
///
/// # Type Parameters
///
/// - `T`: the device-session transport
/// - `R`: the external check framework bridge
pub struct Orchestrator<T: Transport, R: CheckRunner<T>> {
    config: Config,
    pool: ConnectionPool<T>,
    auth: AuthCache,
    login: SubprocessAuthExecutor,
    runner: R,
    cancel: CancellationToken,
}

impl<T: Transport, R: CheckRunner<T>> Orchestrator<T, R> {
    /// Creates an orchestrator with its owned services.
    ///
    /// All configuration is read here, once; there is no runtime
    /// reconfiguration.
    pub fn new(config: Config, transport: T, runner: R) -> Self {
        let pool = ConnectionPool::new(
            Arc::new(transport),
            config.pool.max_per_identity,
            Duration::from_secs(config.pool.acquire_timeout_secs),
        );
        let auth = AuthCache::new(Duration::from_secs(config.auth.ttl_secs));
        let login =
            SubprocessAuthExecutor::new(Duration::from_secs(config.auth.login_timeout_secs));

        Self {
            config,
            pool,
            auth,
            login,
            runner,
            cancel: CancellationToken::new(),
        }
    }

    /// Token external callers may cancel to stop the run early.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn login_descriptor(&self, identity: &str) -> LoginDescriptor {
        let script = self.config.auth.script.replace("{identity}", identity);
        LoginDescriptor::new(&self.config.auth.interpreter, script)
            .with_env("NETVERIFY_IDENTITY", identity)
    }

    /// Runs all units to completion (or cancellation) and aggregates the
    /// streamed results into the final report.
    pub async fn run(&self, units: &[TestUnit]) -> anyhow::Result<RunSummary> {
        let start = Instant::now();
        let output_dir = &self.config.report.output_dir;

        // Clear stale shards from a previous run.
        if output_dir.exists() {
            std::fs::remove_dir_all(output_dir).ok();
        }
        std::fs::create_dir_all(category_root(output_dir, UnitCategory::Api)).ok();
        std::fs::create_dir_all(category_root(output_dir, UnitCategory::DeviceToDevice)).ok();

        if units.is_empty() {
            warn!("No test units to run");
            return Ok(RunSummary {
                total_units: 0,
                passed: 0,
                failed: 0,
                skipped: 0,
                errored: 0,
                cancelled: 0,
                not_run: 0,
                orphaned_commands: 0,
                warnings: 0,
                duration: start.elapsed(),
            });
        }

        let collector =
            StreamCollector::new(output_dir.clone(), self.config.report.failed_only);
        let api_slots = Arc::new(Semaphore::new(self.config.runner.max_api_concurrency));
        let device_slots = Arc::new(Semaphore::new(self.config.runner.max_device_concurrency));

        info!(
            "Running {} units ({} api slots, {} device slots)",
            units.len(),
            self.config.runner.max_api_concurrency,
            self.config.runner.max_device_concurrency
        );

        // Arm the run-level deadline, if configured.
        let deadline = self.config.runner.run_timeout_secs.map(|secs| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                warn!("Run deadline reached, cancelling in-flight units");
                cancel.cancel();
            })
        });

        tokio_scoped::scope(|scope| {
            for unit in units {
                let slots = match unit.category {
                    UnitCategory::Api => &api_slots,
                    UnitCategory::DeviceToDevice => &device_slots,
                };
                let collector = &collector;
                scope.spawn(async move {
                    self.run_unit(unit, slots, collector).await;
                });
            }
        });

        if let Some(timer) = deadline {
            timer.abort();
        }

        // Reconstruct each category tree and honor the layout contract:
        // API results at the root, device results nested beneath it.
        let api_report = report::aggregate(&[streams_dir(output_dir, UnitCategory::Api)]);
        let d2d_report =
            report::aggregate(&[streams_dir(output_dir, UnitCategory::DeviceToDevice)]);
        report::write_report(&api_report, &category_root(output_dir, UnitCategory::Api))?;
        report::write_report(
            &d2d_report,
            &category_root(output_dir, UnitCategory::DeviceToDevice),
        )?;

        let summary = self.summarize(units, &api_report, &d2d_report, start.elapsed());
        info!(
            "Run complete: {} passed, {} failed, {} skipped, {} errored, {} cancelled ({:?})",
            summary.passed,
            summary.failed,
            summary.skipped,
            summary.errored,
            summary.cancelled,
            summary.duration
        );

        Ok(summary)
    }

    /// Executes one unit end to end. Never panics the scope; every exit
    /// path records a terminal result (or at worst logs when the shard
    /// itself cannot be opened).
    async fn run_unit(&self, unit: &TestUnit, slots: &Semaphore, collector: &StreamCollector) {
        let stream = match collector.unit_stream(unit) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot open stream shard for '{}': {}", unit.key(), e);
                return;
            }
        };

        // Backpressure: wait for a slot in this unit's resource class.
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.record_terminal(
                    &stream,
                    unit,
                    CheckStatus::Cancelled,
                    "run cancelled before the unit started",
                );
                return;
            }
            permit = slots.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        // At-most-one login per controller identity across all units.
        // Abandoning the wait on cancel kills an in-flight login subprocess
        // rather than waiting it out.
        let descriptor = self.login_descriptor(&unit.controller);
        let session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.record_terminal(
                    &stream,
                    unit,
                    CheckStatus::Cancelled,
                    "run cancelled while waiting for authentication",
                );
                return;
            }
            session = self.auth.get_or_fetch(&unit.controller, || async {
                self.login.execute(&descriptor).await
            }) => match session {
                Ok(session) => session,
                Err(e) => {
                    // Attributable skip, not a generic failure.
                    self.record_terminal(
                        &stream,
                        unit,
                        CheckStatus::Skipped,
                        format!("authentication unavailable for '{}': {}", unit.controller, e),
                    );
                    return;
                }
            },
        };

        let mut conn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.record_terminal(
                    &stream,
                    unit,
                    CheckStatus::Cancelled,
                    "run cancelled while waiting for a connection",
                );
                return;
            }
            conn = self.pool.acquire(&unit.controller) => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    self.record_terminal(&stream, unit, CheckStatus::Errored, e.to_string());
                    return;
                }
            },
        };

        let check_timeout = Duration::from_secs(self.config.runner.check_timeout_secs);
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.record_terminal(&stream, unit, CheckStatus::Cancelled, "run cancelled");
                return;
            }
            outcome = tokio::time::timeout(
                check_timeout,
                self.runner.run_check(unit, &session, &mut conn, &stream),
            ) => outcome,
        };

        match outcome {
            Ok(Ok(status)) => {
                debug!("Unit '{}' resolved to {}", unit.key(), status);
                // A runner that streams nothing would otherwise vanish from
                // the report; record its returned status instead.
                if stream.result_count() == 0 {
                    self.record_terminal(
                        &stream,
                        unit,
                        status,
                        "check completed without streaming a result",
                    );
                    return;
                }
                stream.finish();
            }
            Ok(Err(e)) => {
                self.record_terminal(
                    &stream,
                    unit,
                    CheckStatus::Errored,
                    format!("check execution error: {}", e),
                );
            }
            Err(_) => {
                self.record_terminal(
                    &stream,
                    unit,
                    CheckStatus::Errored,
                    format!("check timed out after {:?}", check_timeout),
                );
            }
        }
    }

    /// Records an orchestrator-level terminal result and resolves the
    /// unit's retention decision.
    fn record_terminal(
        &self,
        stream: &UnitStream,
        unit: &TestUnit,
        status: CheckStatus,
        message: impl Into<String>,
    ) {
        let context = ExecutionContext::generate(&unit.key());
        stream.record_result(ResultRecord::new(status, message, &context));
        stream.finish();
    }

    fn summarize(
        &self,
        units: &[TestUnit],
        api: &Report,
        d2d: &Report,
        duration: Duration,
    ) -> RunSummary {
        let count =
            |status: CheckStatus| -> usize { api.count(status) + d2d.count(status) };

        let mut seen = api.units_seen();
        seen.extend(d2d.units_seen());
        let not_run = units
            .iter()
            .filter(|u| !seen.contains(u.key().as_str()))
            .count();

        RunSummary {
            total_units: units.len(),
            passed: count(CheckStatus::Passed),
            failed: count(CheckStatus::Failed),
            skipped: count(CheckStatus::Skipped),
            errored: count(CheckStatus::Errored),
            cancelled: count(CheckStatus::Cancelled),
            not_run,
            orphaned_commands: api.orphans.len() + d2d.orphans.len(),
            warnings: api.warnings.len() + d2d.warnings.len(),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSession;
    use crate::config::{
        AuthConfig, Config, DiscoveryConfig, PoolConfig, ReportConfig, RunnerConfig,
        TransportConfig,
    };
    use crate::pool::PooledConnection;
    use crate::stream::CommandExecutionRecord;
    use crate::transport::TransportResult;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct StubTransport;

    #[async_trait]
    impl Transport for StubTransport {
        type Client = ();

        async fn connect(&self, _identity: &str) -> TransportResult<Self::Client> {
            Ok(())
        }

        async fn execute(
            &self,
            _client: &mut Self::Client,
            _command: &str,
        ) -> TransportResult<String> {
            Ok(String::new())
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    /// Runner that streams one command and one result per unit, failing the
    /// unit whose path contains `fail_marker`.
    struct ScriptedRunner {
        fail_marker: Option<String>,
    }

    #[async_trait]
    impl CheckRunner<StubTransport> for ScriptedRunner {
        async fn run_check(
            &self,
            unit: &TestUnit,
            _session: &AuthSession,
            _conn: &mut PooledConnection<StubTransport>,
            stream: &UnitStream,
        ) -> anyhow::Result<CheckStatus> {
            let ctx = ExecutionContext::generate(&unit.key());
            stream.record_command(CommandExecutionRecord::new("show state", "ok", &ctx));

            let fails = self
                .fail_marker
                .as_ref()
                .is_some_and(|m| unit.path.to_string_lossy().contains(m.as_str()));
            let status = if fails {
                CheckStatus::Failed
            } else {
                CheckStatus::Passed
            };
            stream.record_result(ResultRecord::new(status, "verified", &ctx));
            Ok(status)
        }
    }

    fn test_config(output_dir: PathBuf, login_script: String) -> Config {
        Config {
            runner: RunnerConfig {
                max_api_concurrency: 4,
                max_device_concurrency: 2,
                check_timeout_secs: 30,
                run_timeout_secs: None,
                debug: false,
            },
            auth: AuthConfig {
                ttl_secs: 300,
                login_timeout_secs: 10,
                interpreter: "/bin/sh".to_string(),
                script: login_script,
            },
            pool: PoolConfig {
                max_per_identity: 2,
                acquire_timeout_secs: 5,
            },
            discovery: DiscoveryConfig {
                paths: vec![],
                strict: false,
            },
            transport: TransportConfig::default(),
            report: ReportConfig {
                output_dir,
                failed_only: false,
            },
        }
    }

    fn api_unit(name: &str, controller: &str) -> TestUnit {
        TestUnit::new(
            format!("checks/api/{}/{}.yaml", controller, name),
            UnitCategory::Api,
            controller,
        )
    }

    /// Login script that appends one line to a counter file per invocation,
    /// then prints a credential.
    fn counting_login(counter: &Path) -> String {
        format!(
            "echo x >> {}\necho '{{\"token\": \"tok-{{identity}}\"}}'\n",
            counter.display()
        )
    }

    fn login_count(counter: &Path) -> usize {
        std::fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_passes_and_logs_in_once_per_identity() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("logins");
        let config = test_config(dir.path().join("results"), counting_login(&counter));
        let orchestrator =
            Orchestrator::new(config, StubTransport, ScriptedRunner { fail_marker: None });

        let units = vec![api_unit("t1", "ctrl-a"), api_unit("t2", "ctrl-a")];
        let summary = orchestrator.run(&units).await.unwrap();

        assert_eq!(summary.total_units, 2);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.not_run, 0);
        assert_eq!(summary.exit_code(), 0);

        // Single-flight: both units share one login for ctrl-a.
        assert_eq!(login_count(&counter), 1);

        // Layout contract: API report at the results root.
        assert!(dir.path().join("results").join("report.json").exists());
        assert!(
            dir.path()
                .join("results")
                .join("device_to_device")
                .join("report.json")
                .exists()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unit_failure_does_not_abort_siblings() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("logins");
        let config = test_config(dir.path().join("results"), counting_login(&counter));
        let orchestrator = Orchestrator::new(
            config,
            StubTransport,
            ScriptedRunner {
                fail_marker: Some("t2".to_string()),
            },
        );

        let units = vec![api_unit("t1", "ctrl-a"), api_unit("t2", "ctrl-a")];
        let summary = orchestrator.run(&units).await.unwrap();

        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_failure_surfaces_as_attributable_skip() {
        let dir = TempDir::new().unwrap();
        let config = test_config(
            dir.path().join("results"),
            "echo denied >&2\nexit 1\n".to_string(),
        );
        let orchestrator =
            Orchestrator::new(config, StubTransport, ScriptedRunner { fail_marker: None });

        let units = vec![api_unit("t1", "ctrl-a"), api_unit("t2", "ctrl-a")];
        let summary = orchestrator.run(&units).await.unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.not_run, 0);
        // Auth-unavailable units are skips, not failures.
        assert_eq!(summary.exit_code(), 0);

        let report = report::aggregate(&[streams_dir(
            &dir.path().join("results"),
            UnitCategory::Api,
        )]);
        assert!(
            report
                .records
                .iter()
                .all(|r| r.results[0].message.contains("authentication unavailable"))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_run_records_cancelled_units() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("logins");
        let config = test_config(dir.path().join("results"), counting_login(&counter));
        let orchestrator =
            Orchestrator::new(config, StubTransport, ScriptedRunner { fail_marker: None });

        // Cancel before anything starts: every unit must still be recorded
        // with the distinct cancelled status, never silently omitted.
        orchestrator.cancellation_token().cancel();
        let units = vec![api_unit("t1", "ctrl-a"), api_unit("t2", "ctrl-a")];
        let summary = orchestrator.run(&units).await.unwrap();

        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.not_run, 0);
        assert_eq!(summary.exit_code(), 1);
        // No login was ever attempted.
        assert_eq!(login_count(&counter), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_interrupts_in_flight_login() {
        let dir = TempDir::new().unwrap();
        let config = test_config(
            dir.path().join("results"),
            "sleep 3\necho '{\"token\": \"t\"}'\n".to_string(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            StubTransport,
            ScriptedRunner { fail_marker: None },
        ));
        let cancel = orchestrator.cancellation_token();

        let started = Instant::now();
        let run = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let units = vec![api_unit("t1", "ctrl-a")];
                orchestrator.run(&units).await.unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let summary = run.await.unwrap();

        // The unit must be recorded cancelled without waiting out the login.
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "run waited out the login: {:?}",
            started.elapsed()
        );
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_run_is_clean() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path().join("results"), "exit 0".to_string());
        let orchestrator =
            Orchestrator::new(config, StubTransport, ScriptedRunner { fail_marker: None });

        let summary = orchestrator.run(&[]).await.unwrap();
        assert_eq!(summary.total_units, 0);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_d2d_units_report_in_nested_tree() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("logins");
        let config = test_config(dir.path().join("results"), counting_login(&counter));
        let orchestrator =
            Orchestrator::new(config, StubTransport, ScriptedRunner { fail_marker: None });

        let units = vec![TestUnit::new(
            "checks/device_to_device/pair-1/link.yaml",
            UnitCategory::DeviceToDevice,
            "pair-1",
        )];
        let summary = orchestrator.run(&units).await.unwrap();
        assert_eq!(summary.passed, 1);

        let nested = report::aggregate(&[streams_dir(
            &dir.path().join("results"),
            UnitCategory::DeviceToDevice,
        )]);
        assert_eq!(nested.records.len(), 1);
    }
}
