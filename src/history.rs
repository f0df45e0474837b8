//! History aggregation and trend classification
//!
//! Two append-only logs, both bounded: a per-test rolling window of the
//! last 20 outcomes, and a cross-run log of the last 100 run summaries.
//! Eviction is strictly FIFO; history for a past run is never rewritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::{RunMode, RunStatus, TestStatus};

/// Per-test window cap.
pub const TEST_HISTORY_CAP: usize = 20;
/// Cross-run log cap.
pub const RUN_LOG_CAP: usize = 100;
/// Trend classification only looks at the most recent outcomes.
const TREND_WINDOW: usize = 5;

/// Four-way classification of a test's recent outcome history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    #[default]
    Stable,
    Improving,
    Degrading,
    Flaky,
}

/// One recorded outcome of one test in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

/// Rolling window plus derived statistics for one test id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestHistory {
    pub entries: Vec<HistoryEntry>,
    #[serde(default)]
    pub trend: Trend,
    #[serde(default)]
    pub last_status: Option<TestStatus>,
    /// Pass rate over executed (non-pending, non-skipped) outcomes.
    #[serde(default)]
    pub pass_rate: f64,
    #[serde(default)]
    pub avg_duration_ms: f64,
}

impl TestHistory {
    /// Append an outcome, evict the oldest past the cap, and recompute the
    /// derived statistics.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        while self.entries.len() > TEST_HISTORY_CAP {
            self.entries.remove(0);
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        self.last_status = self.entries.last().map(|e| e.status);
        self.trend = classify_trend(&statuses(&self.entries));

        let executed: Vec<&HistoryEntry> = self
            .entries
            .iter()
            .filter(|e| is_executed(e.status))
            .collect();
        if executed.is_empty() {
            self.pass_rate = 0.0;
            self.avg_duration_ms = 0.0;
            return;
        }
        let passed = executed
            .iter()
            .filter(|e| e.status == TestStatus::Passed)
            .count();
        self.pass_rate = passed as f64 / executed.len() as f64;
        self.avg_duration_ms =
            executed.iter().map(|e| e.duration_ms as f64).sum::<f64>() / executed.len() as f64;
    }
}

fn statuses(entries: &[HistoryEntry]) -> Vec<TestStatus> {
    entries.iter().map(|e| e.status).collect()
}

fn is_executed(status: TestStatus) -> bool {
    !matches!(status, TestStatus::Pending | TestStatus::Skipped)
}

/// Classify the trend of an outcome sequence, oldest first.
///
/// Flakiness is checked before direction on purpose: an oscillating series
/// must never be reported as a clean improve/degrade.
pub fn classify_trend(outcomes: &[TestStatus]) -> Trend {
    let executed: Vec<bool> = outcomes
        .iter()
        .filter(|s| is_executed(**s))
        .map(|s| *s == TestStatus::Passed)
        .collect();

    let window: &[bool] = if executed.len() > TREND_WINDOW {
        &executed[executed.len() - TREND_WINDOW..]
    } else {
        &executed
    };

    if window.len() < 2 {
        return Trend::Stable;
    }

    let alternations = window.windows(2).filter(|p| p[0] != p[1]).count();
    if window.len() >= 3 && alternations >= 2 {
        return Trend::Flaky;
    }

    let last = window[window.len() - 1];
    let prev = window[window.len() - 2];
    match (prev, last) {
        (false, true) => Trend::Improving,
        (true, false) => Trend::Degrading,
        _ => Trend::Stable,
    }
}

/// One entry in the cross-run log, summarizing a whole run (optionally an
/// aggregate across layers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub completed_at: DateTime<Utc>,
}

/// In-memory shape of the two history documents. Persistence lives in the
/// store; this type only appends and evicts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryBook {
    #[serde(default)]
    pub tests: BTreeMap<String, TestHistory>,
    #[serde(default)]
    pub runs: Vec<RunLogEntry>,
}

impl HistoryBook {
    pub fn append_test_entry(&mut self, test_id: &str, entry: HistoryEntry) {
        self.tests.entry(test_id.to_string()).or_default().push(entry);
    }

    pub fn append_run_entry(&mut self, entry: RunLogEntry) {
        self.runs.push(entry);
        while self.runs.len() > RUN_LOG_CAP {
            self.runs.remove(0);
        }
    }

    pub fn test_history(&self, test_id: &str) -> Option<&TestHistory> {
        self.tests.get(test_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(run: &str, status: TestStatus) -> HistoryEntry {
        HistoryEntry {
            run_id: run.to_string(),
            status,
            duration_ms: 100,
            executed_at: Utc::now(),
        }
    }

    use TestStatus::{Failed, Passed};

    #[test]
    fn trend_table() {
        assert_eq!(classify_trend(&[]), Trend::Stable);
        assert_eq!(classify_trend(&[Passed]), Trend::Stable);
        assert_eq!(classify_trend(&[Failed, Failed]), Trend::Stable);
        assert_eq!(classify_trend(&[Failed, Passed]), Trend::Improving);
        assert_eq!(classify_trend(&[Passed, Failed]), Trend::Degrading);
        assert_eq!(classify_trend(&[Passed, Failed, Passed, Failed]), Trend::Flaky);
    }

    #[test]
    fn flakiness_wins_over_direction() {
        // Ends on fail->pass but oscillates, so it must be flaky, not improving.
        assert_eq!(classify_trend(&[Passed, Failed, Passed, Failed, Passed]), Trend::Flaky);
    }

    #[test]
    fn trend_ignores_pending_and_skipped() {
        assert_eq!(
            classify_trend(&[TestStatus::Skipped, Failed, TestStatus::Pending, Passed]),
            Trend::Improving
        );
    }

    #[test]
    fn trend_only_looks_at_recent_window() {
        // Old oscillation beyond the 5-sample window must not leak in.
        let outcomes = [Passed, Failed, Passed, Passed, Passed, Passed, Passed];
        assert_eq!(classify_trend(&outcomes), Trend::Stable);
    }

    #[test]
    fn eviction_keeps_most_recent_twenty() {
        let mut history = TestHistory::default();
        for i in 0..21 {
            history.push(entry(&format!("run-{i:03}"), Passed));
        }
        assert_eq!(history.entries.len(), TEST_HISTORY_CAP);
        assert_eq!(history.entries[0].run_id, "run-001");
        assert_eq!(history.entries.last().unwrap().run_id, "run-020");
    }

    #[test]
    fn pass_rate_excludes_pending_and_skipped() {
        let mut history = TestHistory::default();
        history.push(entry("r1", Passed));
        history.push(entry("r2", TestStatus::Skipped));
        history.push(entry("r3", Failed));
        history.push(entry("r4", TestStatus::Pending));
        assert!((history.pass_rate - 0.5).abs() < f64::EPSILON);

        let mut unexecuted = TestHistory::default();
        unexecuted.push(entry("r1", TestStatus::Skipped));
        assert_eq!(unexecuted.pass_rate, 0.0);
    }

    #[test]
    fn timeout_counts_against_pass_rate() {
        let mut history = TestHistory::default();
        history.push(entry("r1", Passed));
        history.push(entry("r2", TestStatus::Timeout));
        assert!((history.pass_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn run_log_capped_at_hundred() {
        let mut book = HistoryBook::default();
        for i in 0..105 {
            book.append_run_entry(RunLogEntry {
                run_id: format!("run-{i}"),
                status: RunStatus::Completed,
                mode: RunMode::Full,
                total: 1,
                passed: 1,
                failed: 0,
                skipped: 0,
                completed_at: Utc::now(),
            });
        }
        assert_eq!(book.runs.len(), RUN_LOG_CAP);
        assert_eq!(book.runs[0].run_id, "run-5");
    }

    proptest! {
        #[test]
        fn window_never_exceeds_cap(count in 0usize..60) {
            let mut history = TestHistory::default();
            for i in 0..count {
                history.push(entry(&format!("r{i}"), if i % 2 == 0 { Passed } else { Failed }));
            }
            prop_assert!(history.entries.len() <= TEST_HISTORY_CAP);
            if count > TEST_HISTORY_CAP {
                prop_assert_eq!(history.entries.len(), TEST_HISTORY_CAP);
                // Oldest entries were the ones dropped.
                prop_assert_eq!(
                    history.entries[0].run_id.clone(),
                    format!("r{}", count - TEST_HISTORY_CAP)
                );
            }
        }

        #[test]
        fn pass_rate_is_a_rate(statuses in proptest::collection::vec(0u8..6, 0..40)) {
            let mut history = TestHistory::default();
            for (i, s) in statuses.iter().enumerate() {
                let status = match s {
                    0 => TestStatus::Pending,
                    1 => TestStatus::Passed,
                    2 => TestStatus::Failed,
                    3 => TestStatus::Skipped,
                    4 => TestStatus::Timeout,
                    _ => TestStatus::Error,
                };
                history.push(entry(&format!("r{i}"), status));
            }
            prop_assert!((0.0..=1.0).contains(&history.pass_rate));
        }
    }
}
