//! Report generation: reconstructing, ordering, and filtering streamed
//! results.
//!
//! The aggregator reads every stream shard of a run, groups entries by
//! execution context, and produces an ordered sequence of
//! [`AggregatedTestRecord`]s. Grouping is by context, never by arrival
//! order: parallel workers interleave arbitrarily and a reader must not
//! assume command records precede their result.
//!
//! Partial-result tolerance is the governing principle here: malformed lines
//! are skipped with a warning, command records whose context has no matching
//! result are surfaced as orphans (the primary diagnostic of the
//! context-matching protocol), and neither aborts the aggregation.
//!
//! # Ordering
//!
//! | Key | Rule |
//! |-----|------|
//! | primary | status priority (failed/errored/cancelled = 0, skipped = 1, passed = 2) |
//! | secondary | earliest result timestamp, ascending |
//! | tertiary | context (for deterministic, idempotent output) |
//!
//! Failures always surface first regardless of arrival order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::stream::{CheckStatus, CommandExecutionRecord, ResultRecord, StreamEntry};

/// One context group: a verification's results plus its command traces.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedTestRecord {
    /// Shard key of the unit that produced this verification.
    pub unit: String,

    /// The execution context shared by the group.
    pub context: String,

    /// All results recorded under the context (normally exactly one).
    pub results: Vec<ResultRecord>,

    /// All command traces recorded under the context.
    pub commands: Vec<CommandExecutionRecord>,

    /// Worst-of precedence over the group's results.
    pub overall: CheckStatus,
}

impl AggregatedTestRecord {
    /// Earliest result timestamp, used as the ordering tiebreak.
    fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.results.iter().map(|r| r.timestamp).min()
    }
}

/// A non-fatal problem found while aggregating.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationWarning {
    /// A stream line that could not be parsed and was skipped.
    MalformedEntry {
        shard: String,
        line: usize,
        reason: String,
    },

    /// Command records whose context has no matching result record.
    OrphanedCommands { context: String, count: usize },
}

/// The reconstructed view of one run (or one category tree of it).
#[derive(Debug, Default, Serialize)]
pub struct Report {
    /// Context groups ordered failures-first (see module docs).
    pub records: Vec<AggregatedTestRecord>,

    /// Command records with no matching result — flagged, never dropped.
    pub orphans: Vec<CommandExecutionRecord>,

    /// Non-fatal problems encountered during aggregation.
    pub warnings: Vec<AggregationWarning>,
}

impl Report {
    /// Worst-of precedence across all aggregated records.
    pub fn overall_status(&self) -> CheckStatus {
        self.records
            .iter()
            .fold(CheckStatus::Passed, |acc, r| acc.worst(r.overall))
    }

    /// Number of records with the given overall status.
    pub fn count(&self, status: CheckStatus) -> usize {
        self.records.iter().filter(|r| r.overall == status).count()
    }

    /// Shard keys of every unit that contributed at least one record.
    pub fn units_seen(&self) -> std::collections::HashSet<&str> {
        self.records.iter().map(|r| r.unit.as_str()).collect()
    }
}

#[derive(Default)]
struct ContextGroup {
    unit: String,
    results: Vec<ResultRecord>,
    commands: Vec<CommandExecutionRecord>,
}

/// Reads all stream shards under the given directories and reconstructs the
/// run.
///
/// Shards are visited in sorted order and entries grouped by context, so
/// aggregating the same streams twice yields identical output. Missing
/// directories contribute nothing (a clean run of an empty category).
pub fn aggregate(stream_dirs: &[PathBuf]) -> Report {
    let mut groups: BTreeMap<String, ContextGroup> = BTreeMap::new();
    let mut warnings = Vec::new();

    for dir in stream_dirs {
        for shard in shard_paths(dir) {
            let unit = shard
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            read_shard(&shard, &unit, &mut groups, &mut warnings);
        }
    }

    let mut records = Vec::new();
    let mut orphans = Vec::new();

    for (context, group) in groups {
        if group.results.is_empty() {
            // Commands without a result: the context-matching protocol was
            // violated somewhere. Surface, never hide.
            warn!(
                "Orphaned command records for context '{}' ({} commands)",
                context,
                group.commands.len()
            );
            warnings.push(AggregationWarning::OrphanedCommands {
                context: context.clone(),
                count: group.commands.len(),
            });
            orphans.extend(group.commands);
            continue;
        }

        let overall = group
            .results
            .iter()
            .fold(CheckStatus::Passed, |acc, r| acc.worst(r.status));

        records.push(AggregatedTestRecord {
            unit: group.unit,
            context,
            results: group.results,
            commands: group.commands,
            overall,
        });
    }

    records.sort_by(|a, b| {
        (a.overall.priority(), a.first_timestamp(), a.context.as_str()).cmp(&(
            b.overall.priority(),
            b.first_timestamp(),
            b.context.as_str(),
        ))
    });

    debug!(
        "Aggregated {} records, {} orphaned commands, {} warnings",
        records.len(),
        orphans.len(),
        warnings.len()
    );

    Report {
        records,
        orphans,
        warnings,
    }
}

/// Stream shards under `dir`, sorted for deterministic aggregation.
fn shard_paths(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut shards: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    shards.sort();
    shards
}

fn read_shard(
    shard: &Path,
    unit: &str,
    groups: &mut BTreeMap<String, ContextGroup>,
    warnings: &mut Vec<AggregationWarning>,
) {
    let contents = match std::fs::read_to_string(shard) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("Failed to read stream shard {}: {}", shard.display(), e);
            warnings.push(AggregationWarning::MalformedEntry {
                shard: shard.display().to_string(),
                line: 0,
                reason: e.to_string(),
            });
            return;
        }
    };

    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamEntry>(line) {
            Ok(StreamEntry::Result(record)) => {
                let group = groups.entry(record.context.clone()).or_default();
                if group.unit.is_empty() {
                    group.unit = unit.to_string();
                }
                group.results.push(record);
            }
            Ok(StreamEntry::CommandExecution(record)) => {
                let group = groups.entry(record.context.clone()).or_default();
                if group.unit.is_empty() {
                    group.unit = unit.to_string();
                }
                group.commands.push(record);
            }
            Err(e) => {
                // Partial-result tolerance: a torn tail or a foreign line
                // must not abort the whole aggregation.
                warn!(
                    "Skipping malformed entry at {}:{}: {}",
                    shard.display(),
                    idx + 1,
                    e
                );
                warnings.push(AggregationWarning::MalformedEntry {
                    shard: shard.display().to_string(),
                    line: idx + 1,
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// The JSON document written per category tree for downstream renderers.
#[derive(Debug, Serialize)]
pub struct ReportDocument<'a> {
    pub generated_at: DateTime<Utc>,
    pub overall: CheckStatus,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub cancelled: usize,
    #[serde(flatten)]
    pub report: &'a Report,
}

/// Writes the report as `report.json` under `dir`.
///
/// Produces data only; rendering is the consumer's concern.
pub fn write_report(report: &Report, dir: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory {}", dir.display()))?;

    let document = ReportDocument {
        generated_at: Utc::now(),
        overall: report.overall_status(),
        passed: report.count(CheckStatus::Passed),
        failed: report.count(CheckStatus::Failed),
        skipped: report.count(CheckStatus::Skipped),
        errored: report.count(CheckStatus::Errored),
        cancelled: report.count(CheckStatus::Cancelled),
        report,
    };

    let path = dir.join("report.json");
    let contents =
        serde_json::to_string_pretty(&document).context("Failed to serialize report")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;

    debug!("Wrote report to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{TestUnit, UnitCategory};
    use crate::stream::{ExecutionContext, StreamCollector};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, seconds).unwrap()
    }

    fn write_shard(dir: &Path, name: &str, entries: &[StreamEntry]) {
        std::fs::create_dir_all(dir).unwrap();
        let lines: Vec<String> = entries
            .iter()
            .map(|e| serde_json::to_string(e).unwrap())
            .collect();
        std::fs::write(dir.join(name), lines.join("\n") + "\n").unwrap();
    }

    fn result(status: CheckStatus, context: &str, seconds: u32) -> StreamEntry {
        StreamEntry::Result(
            ResultRecord::new(status, "m", &ExecutionContext::new(context))
                .with_timestamp(ts(seconds)),
        )
    }

    fn command(context: &str) -> StreamEntry {
        StreamEntry::CommandExecution(
            CommandExecutionRecord::new("cmd", "out", &ExecutionContext::new(context))
                .with_timestamp(ts(0)),
        )
    }

    #[test]
    fn test_ordering_failures_first_then_timestamp() {
        let dir = TempDir::new().unwrap();
        let streams = dir.path().join("streams");
        write_shard(
            &streams,
            "unit.jsonl",
            &[
                result(CheckStatus::Passed, "c1", 1),
                result(CheckStatus::Failed, "c2", 2),
                result(CheckStatus::Skipped, "c3", 3),
                result(CheckStatus::Passed, "c4", 4),
                result(CheckStatus::Errored, "c5", 5),
            ],
        );

        let report = aggregate(&[streams]);
        let ordered: Vec<CheckStatus> = report.records.iter().map(|r| r.overall).collect();
        assert_eq!(
            ordered,
            vec![
                CheckStatus::Failed,
                CheckStatus::Errored,
                CheckStatus::Skipped,
                CheckStatus::Passed,
                CheckStatus::Passed,
            ]
        );
        // Timestamp tiebreak within the same priority.
        assert_eq!(report.records[0].context, "c2");
        assert_eq!(report.records[1].context, "c5");
        assert_eq!(report.records[3].context, "c1");
        assert_eq!(report.records[4].context, "c4");
    }

    #[test]
    fn test_grouping_is_by_context_not_arrival_order() {
        let dir = TempDir::new().unwrap();
        let streams = dir.path().join("streams");
        // Result arrives before its commands; grouping must not care.
        write_shard(
            &streams,
            "unit.jsonl",
            &[
                result(CheckStatus::Passed, "ctx", 1),
                command("ctx"),
                command("ctx"),
            ],
        );

        let report = aggregate(&[streams]);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].commands.len(), 2);
        assert!(report.orphans.is_empty());
    }

    #[test]
    fn test_orphaned_commands_are_flagged() {
        let dir = TempDir::new().unwrap();
        let streams = dir.path().join("streams");
        write_shard(
            &streams,
            "unit.jsonl",
            &[
                result(CheckStatus::Passed, "ctx-ok", 1),
                command("ctx-ok"),
                command("X"),
            ],
        );

        let report = aggregate(&[streams]);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].context, "X");
        assert!(report.warnings.iter().any(|w| matches!(
            w,
            AggregationWarning::OrphanedCommands { context, count: 1 } if context == "X"
        )));
    }

    #[test]
    fn test_malformed_lines_skipped_with_warning() {
        let dir = TempDir::new().unwrap();
        let streams = dir.path().join("streams");
        std::fs::create_dir_all(&streams).unwrap();
        let good = serde_json::to_string(&result(CheckStatus::Passed, "ctx", 1)).unwrap();
        std::fs::write(
            streams.join("unit.jsonl"),
            format!("{}\n{{torn line\nnot json at all\n", good),
        )
        .unwrap();

        let report = aggregate(&[streams]);
        assert_eq!(report.records.len(), 1);
        let malformed = report
            .warnings
            .iter()
            .filter(|w| matches!(w, AggregationWarning::MalformedEntry { .. }))
            .count();
        assert_eq!(malformed, 2);
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let streams = dir.path().join("streams");
        write_shard(
            &streams,
            "a.jsonl",
            &[
                result(CheckStatus::Failed, "c1", 2),
                command("c1"),
                result(CheckStatus::Passed, "c2", 1),
            ],
        );
        write_shard(&streams, "b.jsonl", &[result(CheckStatus::Skipped, "c3", 3)]);

        let dirs = vec![streams];
        let first = serde_json::to_string(&aggregate(&dirs).records).unwrap();
        let second = serde_json::to_string(&aggregate(&dirs).records).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_round_trip_through_collector() {
        let dir = TempDir::new().unwrap();
        let collector = StreamCollector::new(dir.path(), false);
        let unit = TestUnit::new("checks/api/ctrl-a/t.yaml", UnitCategory::Api, "ctrl-a");
        let stream = collector.unit_stream(&unit).unwrap();

        let ctx_a = ExecutionContext::generate(&unit.key());
        let ctx_b = ExecutionContext::generate(&unit.key());
        stream.record_command(CommandExecutionRecord::new("show a", "a", &ctx_a));
        stream.record_result(ResultRecord::new(CheckStatus::Passed, "a ok", &ctx_a));
        stream.record_command(CommandExecutionRecord::new("show b", "b", &ctx_b));
        stream.record_result(ResultRecord::new(CheckStatus::Failed, "b bad", &ctx_b));

        let report = aggregate(&[dir.path().join("streams")]);
        assert_eq!(report.records.len(), 2);
        assert!(report.orphans.is_empty());

        let by_ctx: BTreeMap<&str, &AggregatedTestRecord> = report
            .records
            .iter()
            .map(|r| (r.context.as_str(), r))
            .collect();
        assert_eq!(by_ctx[ctx_a.as_str()].commands.len(), 1);
        assert_eq!(by_ctx[ctx_a.as_str()].overall, CheckStatus::Passed);
        assert_eq!(by_ctx[ctx_b.as_str()].commands.len(), 1);
        assert_eq!(by_ctx[ctx_b.as_str()].overall, CheckStatus::Failed);
    }

    #[test]
    fn test_skip_dominant_over_passed() {
        let dir = TempDir::new().unwrap();
        let streams = dir.path().join("streams");
        // One context with both a skipped and a passed sub-result.
        write_shard(
            &streams,
            "unit.jsonl",
            &[
                result(CheckStatus::Passed, "ctx", 1),
                result(CheckStatus::Skipped, "ctx", 2),
            ],
        );

        let report = aggregate(&[streams]);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].overall, CheckStatus::Skipped);
    }

    #[test]
    fn test_missing_stream_dir_is_empty_report() {
        let report = aggregate(&[PathBuf::from("/nonexistent/streams")]);
        assert!(report.records.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(report.overall_status(), CheckStatus::Passed);
    }

    #[test]
    fn test_write_report_document() {
        let dir = TempDir::new().unwrap();
        let streams = dir.path().join("streams");
        write_shard(
            &streams,
            "unit.jsonl",
            &[
                result(CheckStatus::Failed, "c1", 1),
                result(CheckStatus::Passed, "c2", 2),
            ],
        );

        let report = aggregate(&[streams]);
        write_report(&report, dir.path()).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap())
                .unwrap();
        assert_eq!(doc["overall"], "failed");
        assert_eq!(doc["failed"], 1);
        assert_eq!(doc["passed"], 1);
        assert_eq!(doc["records"].as_array().unwrap().len(), 2);
    }
}
