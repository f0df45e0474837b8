//! Run tracker: the run/test state machine
//!
//! A [`RunTracker`] exclusively owns the mutable [`TestRun`] for its
//! lifetime (single writer). Every mutation recomputes the summary from the
//! full results map, never incremented in place, and persists the whole
//! run document, so a crash between computing a result and the write can
//! lose that one result but never corrupts the rest of the file.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::history::{HistoryEntry, RunLogEntry, TestHistory};
use crate::judge::SemanticResult;
use crate::snapshot::ActualSnapshot;
use crate::spec::TestSpec;
use crate::store::RunStore;
use crate::validation::ValidationCheck;

/// Per-test status. Terminal once executed; `Skipped` can be assigned at
/// creation time without execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Passed,
    Failed,
    Skipped,
    Timeout,
    Error,
}

impl TestStatus {
    pub fn is_executed(self) -> bool {
        !matches!(self, TestStatus::Pending | TestStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Suite,
    Group,
    Single,
}

/// What subset of specs this run covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilters {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub test_id: Option<String>,
}

/// Derived projection over the results map. `failed` also counts timeout
/// and error outcomes, so passed + failed + skipped + pending == total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub executed: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub semantic_required: usize,
    pub semantic_completed: usize,
}

/// One test's outcome within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub checks: Vec<ValidationCheck>,
    #[serde(default)]
    pub actual: Option<ActualSnapshot>,
    #[serde(default)]
    pub semantic_required: bool,
    #[serde(default)]
    pub semantic: Option<SemanticResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TestResult {
    pub fn pending() -> Self {
        Self {
            status: TestStatus::Pending,
            executed_at: None,
            duration_ms: 0,
            checks: Vec::new(),
            actual: None,
            semantic_required: false,
            semantic: None,
            error: None,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            status: TestStatus::Skipped,
            error: Some(reason.to_string()),
            ..Self::pending()
        }
    }

    /// Failing checks, for printing capped diagnostics.
    pub fn failing_checks(&self) -> Vec<&ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

/// One persisted run document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub mode: RunMode,
    #[serde(default)]
    pub filters: Option<RunFilters>,
    pub summary: RunSummary,
    pub results: BTreeMap<String, TestResult>,
}

impl TestRun {
    pub fn failing_test_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r.status,
                    TestStatus::Failed | TestStatus::Timeout | TestStatus::Error
                )
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Pure recomputation of the summary from the results map.
pub fn compute_summary(results: &BTreeMap<String, TestResult>) -> RunSummary {
    let mut summary = RunSummary {
        total: results.len(),
        ..Default::default()
    };
    for result in results.values() {
        match result.status {
            TestStatus::Pending => summary.pending += 1,
            TestStatus::Passed => summary.passed += 1,
            TestStatus::Skipped => summary.skipped += 1,
            TestStatus::Failed | TestStatus::Timeout | TestStatus::Error => summary.failed += 1,
        }
        if result.semantic_required {
            summary.semantic_required += 1;
            if result.semantic.is_some() {
                summary.semantic_completed += 1;
            }
        }
    }
    summary.executed = summary.passed + summary.failed;
    summary
}

/// Per-group rollup status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Every executed test passed or was skipped.
    Clean,
    /// At least one test failed (including timeout/error).
    Failing,
    /// Some executed, some still pending, nothing failed.
    Partial,
    /// Nothing in the group has executed yet.
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupRollup {
    pub status: GroupStatus,
    pub total: usize,
    pub executed: usize,
    pub failed: usize,
}

/// Owns the active run and drives its state machine. Injected explicitly
/// into each layer runner, with no global instance, so parallel CI shards can
/// hold independent trackers in one process, keyed by run id on disk.
pub struct RunTracker {
    store: RunStore,
    active: Option<TestRun>,
}

impl RunTracker {
    pub fn new(store: RunStore) -> Self {
        Self {
            store,
            active: None,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn active_run(&self) -> Option<&TestRun> {
        self.active.as_ref()
    }

    /// Create a new run: every non-skipped spec seeded as pending, skipped
    /// specs seeded as skipped with their reason, persisted immediately.
    pub fn create_run(
        &mut self,
        specs: &[TestSpec],
        mode: RunMode,
        filters: Option<RunFilters>,
    ) -> Result<String> {
        let now = Utc::now();
        let run_id = self.store.next_run_id(now.date_naive())?;

        let mut results = BTreeMap::new();
        for spec in specs {
            let result = match &spec.meta.skip {
                Some(reason) => TestResult::skipped(reason),
                None => TestResult::pending(),
            };
            results.insert(spec.id.clone(), result);
        }

        let run = TestRun {
            run_id: run_id.clone(),
            status: RunStatus::InProgress,
            created_at: now,
            updated_at: now,
            completed_at: None,
            mode,
            filters,
            summary: compute_summary(&results),
            results,
        };

        self.store.save_run(&run)?;
        info!(run_id = %run.run_id, total = run.summary.total, "created run");
        self.active = Some(run);
        Ok(run_id)
    }

    /// Resume a specific persisted run. Continuing writes into the same run
    /// document; terminal runs are never revived.
    pub fn resume_run(&mut self, run_id: &str) -> Result<()> {
        let run = self
            .store
            .load_run(run_id)?
            .with_context(|| format!("run '{run_id}' not found"))?;
        if run.status != RunStatus::InProgress {
            bail!(
                "run '{}' is {:?} and cannot be resumed",
                run_id,
                run.status
            );
        }
        info!(run_id = %run.run_id, pending = run.summary.pending, "resumed run");
        self.active = Some(run);
        Ok(())
    }

    /// Scan persisted runs newest-first and adopt the first in-progress one.
    /// This is what lets a crashed or interrupted run continue rather than
    /// restart from zero.
    pub fn resume_latest_in_progress(&mut self) -> Result<Option<String>> {
        match self.store.latest_in_progress()? {
            Some(run) => {
                let id = run.run_id.clone();
                self.active = Some(run);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Upsert a test result, stamp `executed_at` if absent, recompute the
    /// summary, persist the whole run document, and append to the test's
    /// rolling history.
    pub fn record_result(&mut self, test_id: &str, mut result: TestResult) -> Result<()> {
        let run = self.active.as_mut().ok_or(HarnessError::NoActiveRun)?;

        if result.executed_at.is_none() && result.status.is_executed() {
            result.executed_at = Some(Utc::now());
        }
        // Once required, never cleared, even if the new result was built
        // without the flag.
        if let Some(existing) = run.results.get(test_id) {
            if existing.semantic_required {
                result.semantic_required = true;
            }
        }

        let entry = HistoryEntry {
            run_id: run.run_id.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
            executed_at: result.executed_at.unwrap_or_else(Utc::now),
        };

        run.results.insert(test_id.to_string(), result);
        run.summary = compute_summary(&run.results);
        run.updated_at = Utc::now();

        self.persist_active()?;

        let mut book = self.store.load_history()?;
        book.append_test_entry(test_id, entry);
        self.store.save_history(&book)?;
        Ok(())
    }

    /// Declare mid-execution that a test needs a follow-up judge pass,
    /// before its deterministic result exists.
    pub fn mark_semantic_required(&mut self, test_id: &str) -> Result<()> {
        let run = self.active.as_mut().ok_or(HarnessError::NoActiveRun)?;
        let result = run
            .results
            .get_mut(test_id)
            .ok_or_else(|| HarnessError::UnknownTest(test_id.to_string()))?;
        if result.semantic_required {
            return Ok(());
        }
        result.semantic_required = true;
        run.summary = compute_summary(&run.results);
        run.updated_at = Utc::now();
        self.persist_active()
    }

    /// Attach a semantic verdict to an already-executed test. Idempotently
    /// sets `semantic_required` so `semantic_completed` reflects it.
    pub fn record_semantic_result(
        &mut self,
        test_id: &str,
        semantic: SemanticResult,
    ) -> Result<()> {
        let run = self.active.as_mut().ok_or(HarnessError::NoActiveRun)?;
        let result = run
            .results
            .get_mut(test_id)
            .ok_or_else(|| HarnessError::UnknownTest(test_id.to_string()))?;
        if result.status == TestStatus::Pending {
            bail!(
                "cannot attach semantic verdict to pending test '{}'",
                test_id
            );
        }
        result.semantic_required = true;
        result.semantic = Some(semantic);
        run.summary = compute_summary(&run.results);
        run.updated_at = Utc::now();
        self.persist_active()
    }

    /// Terminal transition. Idempotent no-op when no run is active.
    pub fn complete_run(&mut self) -> Result<Option<TestRun>> {
        self.finish_run(RunStatus::Completed)
    }

    /// Terminal transition. Idempotent no-op when no run is active.
    pub fn abandon_run(&mut self) -> Result<Option<TestRun>> {
        self.finish_run(RunStatus::Abandoned)
    }

    fn finish_run(&mut self, status: RunStatus) -> Result<Option<TestRun>> {
        let Some(mut run) = self.active.take() else {
            return Ok(None);
        };
        let now = Utc::now();
        run.status = status;
        run.completed_at = Some(now);
        run.updated_at = now;
        run.summary = compute_summary(&run.results);
        self.store.save_run(&run)?;

        let mut book = self.store.load_history()?;
        book.append_run_entry(RunLogEntry {
            run_id: run.run_id.clone(),
            status,
            mode: run.mode,
            total: run.summary.total,
            passed: run.summary.passed,
            failed: run.summary.failed,
            skipped: run.summary.skipped,
            completed_at: now,
        });
        self.store.save_history(&book)?;

        info!(run_id = %run.run_id, ?status, "run finished");
        Ok(Some(run))
    }

    pub fn pending_tests(&self) -> Vec<String> {
        self.tests_with(|r| r.status == TestStatus::Pending)
    }

    pub fn failed_tests(&self) -> Vec<String> {
        self.tests_with(|r| {
            matches!(
                r.status,
                TestStatus::Failed | TestStatus::Timeout | TestStatus::Error
            )
        })
    }

    pub fn tests_needing_semantic_review(&self) -> Vec<String> {
        self.tests_with(|r| r.semantic_required && r.semantic.is_none() && r.status.is_executed())
    }

    fn tests_with(&self, predicate: impl Fn(&TestResult) -> bool) -> Vec<String> {
        self.active
            .as_ref()
            .map(|run| {
                run.results
                    .iter()
                    .filter(|(_, r)| predicate(r))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Per-logical-group rollup over the active run.
    pub fn group_status(&self, specs: &[TestSpec]) -> BTreeMap<String, GroupRollup> {
        match &self.active {
            Some(run) => group_rollups(run, specs),
            None => BTreeMap::new(),
        }
    }

    fn persist_active(&mut self) -> Result<()> {
        let run = self.active.as_ref().ok_or(HarnessError::NoActiveRun)?;
        if let Err(e) = self.store.save_run(run) {
            // A run-level persistence failure is the one case that aborts a
            // whole run; try to leave it abandoned rather than silently
            // in-progress forever.
            warn!(run_id = %run.run_id, error = %e, "run persistence failed, abandoning");
            if let Some(mut run) = self.active.take() {
                run.status = RunStatus::Abandoned;
                run.updated_at = Utc::now();
                let _ = self.store.save_run(&run);
            }
            return Err(e).context("failed to persist run document");
        }
        Ok(())
    }

    /// Per-test history, read back from the store.
    pub fn test_history(&self, test_id: &str) -> Result<Option<TestHistory>> {
        Ok(self.store.load_history()?.tests.get(test_id).cloned())
    }
}

/// Per-logical-group rollup of one run's results. Specs without a group
/// roll up under their category.
pub fn group_rollups(run: &TestRun, specs: &[TestSpec]) -> BTreeMap<String, GroupRollup> {
    let mut rollups: BTreeMap<String, GroupRollup> = BTreeMap::new();
    let mut pending_counts: BTreeMap<String, usize> = BTreeMap::new();

    for spec in specs {
        let group = spec.group.clone().unwrap_or_else(|| spec.category.clone());
        let Some(result) = run.results.get(&spec.id) else {
            continue;
        };
        let rollup = rollups.entry(group.clone()).or_insert(GroupRollup {
            status: GroupStatus::Pending,
            total: 0,
            executed: 0,
            failed: 0,
        });
        rollup.total += 1;
        if result.status.is_executed() {
            rollup.executed += 1;
        }
        if result.status == TestStatus::Pending {
            *pending_counts.entry(group).or_default() += 1;
        }
        if matches!(
            result.status,
            TestStatus::Failed | TestStatus::Timeout | TestStatus::Error
        ) {
            rollup.failed += 1;
        }
    }

    for (group, rollup) in rollups.iter_mut() {
        let pending = pending_counts.get(group).copied().unwrap_or(0);
        rollup.status = if rollup.executed == 0 {
            GroupStatus::Pending
        } else if rollup.failed > 0 {
            GroupStatus::Failing
        } else if pending == 0 {
            // Skipped tests never execute; passed + skipped only is clean.
            GroupStatus::Clean
        } else {
            GroupStatus::Partial
        };
    }

    rollups
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn spec(id: &str, group: &str) -> TestSpec {
        serde_yaml::from_str(&format!(
            "id: {id}\nname: {id}\ncategory: unit\ngroup: {group}\ninput:\n  text: hi\n"
        ))
        .unwrap()
    }

    fn skipped_spec(id: &str) -> TestSpec {
        serde_yaml::from_str(&format!(
            "id: {id}\nname: {id}\ncategory: unit\ninput:\n  text: hi\nmeta:\n  skip: broken fixture\n"
        ))
        .unwrap()
    }

    fn passed() -> TestResult {
        TestResult {
            status: TestStatus::Passed,
            ..TestResult::pending()
        }
    }

    fn failed() -> TestResult {
        TestResult {
            status: TestStatus::Failed,
            ..TestResult::pending()
        }
    }

    fn tracker(dir: &TempDir) -> RunTracker {
        RunTracker::new(RunStore::new(dir.path()))
    }

    #[test]
    fn create_run_seeds_pending_and_skipped() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        let specs = vec![spec("a", "g"), spec("b", "g"), skipped_spec("c")];
        t.create_run(&specs, RunMode::Full, None).unwrap();

        let run = t.active_run().unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.results["a"].status, TestStatus::Pending);
        assert_eq!(run.results["c"].status, TestStatus::Skipped);
        assert_eq!(run.results["c"].error.as_deref(), Some("broken fixture"));
        assert_eq!(run.summary.total, 3);
        assert_eq!(run.summary.pending, 2);
        assert_eq!(run.summary.skipped, 1);
    }

    #[test]
    fn record_result_stamps_executed_at_and_recomputes() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        t.create_run(&[spec("a", "g")], RunMode::Single, None).unwrap();

        t.record_result("a", passed()).unwrap();
        let run = t.active_run().unwrap();
        assert!(run.results["a"].executed_at.is_some());
        assert_eq!(run.summary.passed, 1);
        assert_eq!(run.summary.pending, 0);
        assert_eq!(run.summary.executed, 1);
    }

    #[test]
    fn timeout_and_error_count_in_the_failed_bucket() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        let specs = vec![spec("a", "g"), spec("b", "g"), spec("c", "g")];
        t.create_run(&specs, RunMode::Full, None).unwrap();

        t.record_result(
            "a",
            TestResult {
                status: TestStatus::Timeout,
                ..TestResult::pending()
            },
        )
        .unwrap();
        t.record_result(
            "b",
            TestResult {
                status: TestStatus::Error,
                ..TestResult::pending()
            },
        )
        .unwrap();
        t.record_result("c", failed()).unwrap();

        let s = t.active_run().unwrap().summary;
        assert_eq!(s.failed, 3);
        assert_eq!(s.passed + s.failed + s.skipped + s.pending, s.total);
    }

    #[test]
    fn semantic_required_survives_a_plain_rerecord() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        t.create_run(&[spec("a", "g")], RunMode::Single, None).unwrap();

        t.mark_semantic_required("a").unwrap();
        t.record_result("a", passed()).unwrap();

        let run = t.active_run().unwrap();
        assert!(run.results["a"].semantic_required);
        assert_eq!(run.summary.semantic_required, 1);
        assert_eq!(run.summary.semantic_completed, 0);
    }

    #[test]
    fn semantic_verdict_rejected_on_pending_test() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        t.create_run(&[spec("a", "g")], RunMode::Single, None).unwrap();

        let verdict = SemanticResult {
            passed: true,
            confidence: 90,
            reasoning: "fine".into(),
            checkpoints: Vec::new(),
        };
        assert!(t.record_semantic_result("a", verdict.clone()).is_err());

        t.record_result("a", passed()).unwrap();
        t.record_semantic_result("a", verdict).unwrap();
        let s = t.active_run().unwrap().summary;
        assert_eq!(s.semantic_required, 1);
        assert_eq!(s.semantic_completed, 1);
    }

    #[test]
    fn completed_run_cannot_be_resumed() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        let id = t.create_run(&[spec("a", "g")], RunMode::Single, None).unwrap();
        t.record_result("a", passed()).unwrap();
        t.complete_run().unwrap().unwrap();

        let mut t2 = tracker(&dir);
        assert!(t2.resume_run(&id).is_err());
        assert!(t2.resume_latest_in_progress().unwrap().is_none());
    }

    #[test]
    fn terminal_transitions_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        t.create_run(&[spec("a", "g")], RunMode::Single, None).unwrap();
        assert!(t.abandon_run().unwrap().is_some());
        assert!(t.abandon_run().unwrap().is_none());
        assert!(t.complete_run().unwrap().is_none());
    }

    #[test]
    fn unknown_test_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        t.create_run(&[spec("a", "g")], RunMode::Single, None).unwrap();
        let err = t.mark_semantic_required("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::UnknownTest(id)) if id == "nope"
        ));
    }

    #[test]
    fn recording_without_an_active_run_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        let err = t.record_result("a", passed()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::NoActiveRun)
        ));
    }

    #[test]
    fn group_rollup_transitions() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        let specs = vec![spec("a", "g1"), spec("b", "g1"), spec("c", "g2")];
        t.create_run(&specs, RunMode::Full, None).unwrap();

        let rollups = t.group_status(&specs);
        assert_eq!(rollups["g1"].status, GroupStatus::Pending);
        assert_eq!(rollups["g2"].status, GroupStatus::Pending);

        t.record_result("a", passed()).unwrap();
        let rollups = t.group_status(&specs);
        assert_eq!(rollups["g1"].status, GroupStatus::Partial);

        t.record_result("b", failed()).unwrap();
        let rollups = t.group_status(&specs);
        assert_eq!(rollups["g1"].status, GroupStatus::Failing);

        t.record_result("c", passed()).unwrap();
        let rollups = t.group_status(&specs);
        assert_eq!(rollups["g2"].status, GroupStatus::Clean);
    }

    #[test]
    fn skipped_only_execution_rolls_up_clean_once_something_ran() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        let specs = vec![spec("a", "g"), skipped_spec("b")];
        t.create_run(&specs, RunMode::Full, None).unwrap();
        t.record_result("a", passed()).unwrap();

        // note: skipped_spec has no group, so it rolls up under "unit".
        let rollups = t.group_status(&specs);
        assert_eq!(rollups["g"].status, GroupStatus::Clean);
        assert_eq!(rollups["unit"].status, GroupStatus::Pending);
    }

    fn arb_status() -> impl Strategy<Value = TestStatus> {
        prop_oneof![
            Just(TestStatus::Pending),
            Just(TestStatus::Passed),
            Just(TestStatus::Failed),
            Just(TestStatus::Skipped),
            Just(TestStatus::Timeout),
            Just(TestStatus::Error),
        ]
    }

    proptest! {
        #[test]
        fn summary_buckets_always_partition_the_results(statuses in proptest::collection::vec(arb_status(), 0..40)) {
            let mut results = BTreeMap::new();
            for (i, status) in statuses.into_iter().enumerate() {
                results.insert(
                    format!("t{i}"),
                    TestResult { status, ..TestResult::pending() },
                );
            }
            let s = compute_summary(&results);
            prop_assert_eq!(s.total, results.len());
            prop_assert_eq!(s.passed + s.failed + s.skipped + s.pending, s.total);
            prop_assert_eq!(s.executed, s.passed + s.failed);
        }
    }
}
