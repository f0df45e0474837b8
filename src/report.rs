//! Report generation
//!
//! Renders a finished run as `report.json` (machine-readable) and
//! `REPORT.md` (human-readable) under `reports/<run_id>/`, plus a rolling
//! `latest-report.md`. The new-failures / fixed section is the only place
//! cross-run comparison lives; it is a set-difference against the
//! immediately preceding run and is simply omitted when there is none.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::RunStore;
use crate::tracker::{RunSummary, TestResult, TestRun, TestStatus};

/// Failing checks printed per test are capped to avoid flooding.
const MAX_CHECKS_SHOWN: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDiff {
    pub previous_run_id: String,
    pub new_failures: Vec<String>,
    pub fixed: Vec<String>,
}

/// Machine-readable report document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: RunSummary,
    #[serde(default)]
    pub diff: Option<RunDiff>,
    pub run: TestRun,
}

pub struct ReportPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
    pub latest: PathBuf,
}

pub struct ReportGenerator<'a> {
    store: &'a RunStore,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(store: &'a RunStore) -> Self {
        Self { store }
    }

    /// Build the report for `run`, diffing against the run immediately
    /// preceding it on disk (if any).
    pub fn build(&self, run: &TestRun) -> Result<TestReport> {
        let previous = self.previous_run(&run.run_id)?;
        let diff = previous.map(|prev| diff_runs(run, &prev));
        Ok(TestReport {
            run_id: run.run_id.clone(),
            generated_at: Utc::now(),
            summary: run.summary,
            diff,
            run: run.clone(),
        })
    }

    /// Write `report.json`, `REPORT.md`, and refresh `latest-report.md`.
    pub fn write(&self, report: &TestReport) -> Result<ReportPaths> {
        let dir = self.store.reports_dir().join(&report.run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create report dir {}", dir.display()))?;

        let json_path = dir.join("report.json");
        let json = serde_json::to_vec_pretty(report).context("failed to serialize report")?;
        fs::write(&json_path, json)
            .with_context(|| format!("failed to write {}", json_path.display()))?;

        let markdown = render_markdown(report);
        let md_path = dir.join("REPORT.md");
        fs::write(&md_path, &markdown)
            .with_context(|| format!("failed to write {}", md_path.display()))?;

        let latest = self.store.reports_dir().join("latest-report.md");
        fs::write(&latest, &markdown)
            .with_context(|| format!("failed to write {}", latest.display()))?;

        info!(run_id = %report.run_id, path = %md_path.display(), "wrote run report");
        Ok(ReportPaths {
            json: json_path,
            markdown: md_path,
            latest,
        })
    }

    fn previous_run(&self, run_id: &str) -> Result<Option<TestRun>> {
        let ids = self.store.list_run_ids()?;
        let prev_id = ids
            .iter()
            .filter(|id| id.as_str() < run_id)
            .next_back()
            .cloned();
        match prev_id {
            Some(id) => self.store.load_run(&id),
            None => Ok(None),
        }
    }
}

fn diff_runs(current: &TestRun, previous: &TestRun) -> RunDiff {
    let now: BTreeSet<String> = current.failing_test_ids().into_iter().collect();
    let before: BTreeSet<String> = previous.failing_test_ids().into_iter().collect();
    RunDiff {
        previous_run_id: previous.run_id.clone(),
        new_failures: now.difference(&before).cloned().collect(),
        fixed: before.difference(&now).cloned().collect(),
    }
}

fn status_label(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Pending => "pending",
        TestStatus::Passed => "passed",
        TestStatus::Failed => "failed",
        TestStatus::Skipped => "skipped",
        TestStatus::Timeout => "timeout",
        TestStatus::Error => "error",
    }
}

/// Render the human-readable Markdown report. Every count bucket is always
/// shown, zeros included, so a partial run never looks fully green.
pub fn render_markdown(report: &TestReport) -> String {
    let run = &report.run;
    let summary = &report.summary;
    let mut md = String::new();

    md.push_str(&format!("# Test Report: {}\n\n", report.run_id));
    md.push_str(&format!(
        "Generated: {}  \nRun status: {:?}  \nMode: {:?}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        run.status,
        run.mode
    ));

    md.push_str("## Summary\n\n");
    md.push_str("| Metric | Count |\n|---|---|\n");
    md.push_str(&format!("| Total | {} |\n", summary.total));
    md.push_str(&format!("| Executed | {} |\n", summary.executed));
    md.push_str(&format!("| Passed | {} |\n", summary.passed));
    md.push_str(&format!("| Failed | {} |\n", summary.failed));
    md.push_str(&format!("| Skipped | {} |\n", summary.skipped));
    md.push_str(&format!("| Pending | {} |\n", summary.pending));
    md.push_str(&format!(
        "| Semantic review | {}/{} |\n\n",
        summary.semantic_completed, summary.semantic_required
    ));

    if let Some(diff) = &report.diff {
        md.push_str(&format!("## Changes since {}\n\n", diff.previous_run_id));
        if diff.new_failures.is_empty() && diff.fixed.is_empty() {
            md.push_str("No change in failing tests.\n\n");
        } else {
            if !diff.new_failures.is_empty() {
                md.push_str("**New failures:**\n\n");
                for id in &diff.new_failures {
                    md.push_str(&format!("- {id}\n"));
                }
                md.push('\n');
            }
            if !diff.fixed.is_empty() {
                md.push_str("**Fixed:**\n\n");
                for id in &diff.fixed {
                    md.push_str(&format!("- {id}\n"));
                }
                md.push('\n');
            }
        }
    }

    md.push_str("## Results\n\n");
    md.push_str("| Test | Status | Duration | Checks | Semantic |\n|---|---|---|---|---|\n");
    for (id, result) in &run.results {
        let checks_cell = if result.checks.is_empty() {
            "-".to_string()
        } else {
            let failed = result.checks.iter().filter(|c| !c.passed).count();
            format!("{}/{} ok", result.checks.len() - failed, result.checks.len())
        };
        let semantic_cell = match (&result.semantic, result.semantic_required) {
            (Some(s), _) => format!(
                "{} ({}%)",
                if s.passed { "passed" } else { "failed" },
                s.confidence
            ),
            (None, true) => "awaiting review".to_string(),
            (None, false) => "-".to_string(),
        };
        md.push_str(&format!(
            "| {} | {} | {}ms | {} | {} |\n",
            id,
            status_label(result.status),
            result.duration_ms,
            checks_cell,
            semantic_cell
        ));
    }
    md.push('\n');

    let failures: Vec<(&String, &TestResult)> = run
        .results
        .iter()
        .filter(|(_, r)| {
            matches!(
                r.status,
                TestStatus::Failed | TestStatus::Timeout | TestStatus::Error
            )
        })
        .collect();
    if !failures.is_empty() {
        md.push_str("## Failure details\n\n");
        for (id, result) in failures {
            md.push_str(&format!("### {}: {}\n\n", id, status_label(result.status)));
            if let Some(error) = &result.error {
                md.push_str(&format!("Error: {error}\n\n"));
            }
            let failing = result.failing_checks();
            for check in failing.iter().take(MAX_CHECKS_SHOWN) {
                md.push_str(&format!("- **{}**: {}\n", check.name, check.reasoning));
            }
            if failing.len() > MAX_CHECKS_SHOWN {
                md.push_str(&format!(
                    "- … and {} more failing check(s)\n",
                    failing.len() - MAX_CHECKS_SHOWN
                ));
            }
            md.push('\n');
        }
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{compute_summary, RunMode, RunStatus};
    use crate::validation::{CheckKind, ValidationCheck};
    use std::collections::BTreeMap;

    fn run(run_id: &str, results: BTreeMap<String, TestResult>) -> TestRun {
        let now = Utc::now();
        TestRun {
            run_id: run_id.to_string(),
            status: RunStatus::Completed,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
            mode: RunMode::Full,
            filters: None,
            summary: compute_summary(&results),
            results,
        }
    }

    fn result(status: TestStatus) -> TestResult {
        TestResult {
            status,
            ..TestResult::pending()
        }
    }

    #[test]
    fn diff_is_set_difference_of_failing_ids() {
        let prev = run(
            "run-2025-01-01-001",
            BTreeMap::from([
                ("a".to_string(), result(TestStatus::Failed)),
                ("b".to_string(), result(TestStatus::Passed)),
                ("c".to_string(), result(TestStatus::Timeout)),
            ]),
        );
        let current = run(
            "run-2025-01-01-002",
            BTreeMap::from([
                ("a".to_string(), result(TestStatus::Passed)),
                ("b".to_string(), result(TestStatus::Failed)),
                ("c".to_string(), result(TestStatus::Timeout)),
            ]),
        );
        let diff = diff_runs(&current, &prev);
        assert_eq!(diff.new_failures, vec!["b".to_string()]);
        assert_eq!(diff.fixed, vec!["a".to_string()]);
    }

    #[test]
    fn report_without_previous_run_omits_diff() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let current = run(
            "run-2025-01-01-001",
            BTreeMap::from([("a".to_string(), result(TestStatus::Passed))]),
        );
        store.save_run(&current).unwrap();

        let report = ReportGenerator::new(&store).build(&current).unwrap();
        assert!(report.diff.is_none());
        let md = render_markdown(&report);
        assert!(!md.contains("Changes since"));
    }

    #[test]
    fn diff_uses_immediately_preceding_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let r1 = run(
            "run-2025-01-01-001",
            BTreeMap::from([("a".to_string(), result(TestStatus::Failed))]),
        );
        let r2 = run(
            "run-2025-01-01-002",
            BTreeMap::from([("a".to_string(), result(TestStatus::Passed))]),
        );
        store.save_run(&r1).unwrap();
        store.save_run(&r2).unwrap();

        let report = ReportGenerator::new(&store).build(&r2).unwrap();
        let diff = report.diff.unwrap();
        assert_eq!(diff.previous_run_id, "run-2025-01-01-001");
        assert_eq!(diff.fixed, vec!["a".to_string()]);
    }

    #[test]
    fn markdown_always_shows_zero_buckets() {
        let all_pass = run(
            "run-2025-01-01-001",
            BTreeMap::from([("a".to_string(), result(TestStatus::Passed))]),
        );
        let report = TestReport {
            run_id: all_pass.run_id.clone(),
            generated_at: Utc::now(),
            summary: all_pass.summary,
            diff: None,
            run: all_pass,
        };
        let md = render_markdown(&report);
        assert!(md.contains("| Failed | 0 |"));
        assert!(md.contains("| Pending | 0 |"));
        assert!(md.contains("| Skipped | 0 |"));
    }

    #[test]
    fn failure_details_are_capped_with_reasoning() {
        let mut failed = result(TestStatus::Failed);
        for i in 0..5 {
            failed.checks.push(ValidationCheck {
                kind: CheckKind::ContentIncludes,
                name: format!("content:{i}"),
                passed: false,
                expected: None,
                actual: None,
                error: None,
                reasoning: format!("searched body for '{i}': not found"),
            });
        }
        let r = run(
            "run-2025-01-01-001",
            BTreeMap::from([("a".to_string(), failed)]),
        );
        let report = TestReport {
            run_id: r.run_id.clone(),
            generated_at: Utc::now(),
            summary: r.summary,
            diff: None,
            run: r,
        };
        let md = render_markdown(&report);
        assert!(md.contains("searched body for '0': not found"));
        assert!(md.contains("and 2 more failing check(s)"));
    }

    #[test]
    fn write_produces_all_three_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let r = run(
            "run-2025-01-01-001",
            BTreeMap::from([("a".to_string(), result(TestStatus::Passed))]),
        );
        store.save_run(&r).unwrap();
        let generator = ReportGenerator::new(&store);
        let report = generator.build(&r).unwrap();
        let paths = generator.write(&report).unwrap();
        assert!(paths.json.exists());
        assert!(paths.markdown.exists());
        assert!(paths.latest.exists());

        let reloaded: TestReport =
            serde_json::from_str(&fs::read_to_string(&paths.json).unwrap()).unwrap();
        assert_eq!(reloaded.run_id, r.run_id);
    }
}
