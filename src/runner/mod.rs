//! Layer runners
//!
//! Drivers that push specs through the collaborator pipeline and feed the
//! core components: validation scores the output, the tracker records it,
//! the judge reviews qualitative expectations afterwards. Execution is
//! sequential by default; the integration layer fans out in bounded
//! batches. All waiting is deadline-bounded; a hung collaborator becomes
//! a recorded `timeout` result, never a stuck runner.

pub mod acceptance;
pub mod cli;
pub mod daemon;
pub mod integration;
pub mod poll;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::judge::JudgeAdapter;
use crate::pipeline::ContentPipeline;
use crate::snapshot::{ActualSnapshot, OutputSnapshot};
use crate::spec::TestSpec;
use crate::store::CreatedFile;
use crate::tracker::{RunTracker, TestResult, TestStatus};
use crate::validation::validate;

/// Test execution style. Layers share the core components and differ only
/// in how they drive the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Unit,
    Integration,
    Cli,
    Acceptance,
    Daemon,
}

impl std::str::FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unit" => Ok(Layer::Unit),
            "integration" => Ok(Layer::Integration),
            "cli" => Ok(Layer::Cli),
            "acceptance" => Ok(Layer::Acceptance),
            "daemon" => Ok(Layer::Daemon),
            other => Err(format!("unknown layer '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub test_timeout: Duration,
    pub retain_scratch: bool,
}

impl From<&HarnessConfig> for RunnerOptions {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            test_timeout: config.test_timeout,
            retain_scratch: config.retain_scratch,
        }
    }
}

/// Everything a layer needs to execute one spec.
pub struct ExecutionEnv {
    pub pipeline: Arc<dyn ContentPipeline>,
    pub options: RunnerOptions,
}

/// Outcome of one execution, before recording.
pub struct ExecutedTest {
    pub result: TestResult,
    pub snapshot: Option<OutputSnapshot>,
    pub created: Vec<CreatedFile>,
}

impl ExecutedTest {
    fn bare(result: TestResult) -> Self {
        Self {
            result,
            snapshot: None,
            created: Vec::new(),
        }
    }
}

/// Resolve the spec's input to the message text fed to the pipeline.
fn resolve_input(spec: &TestSpec) -> Result<String, HarnessError> {
    if let Some(text) = &spec.input.text {
        return Ok(text.clone());
    }
    if let Some(fixture) = &spec.input.fixture {
        if !fixture.is_file() {
            return Err(HarnessError::MissingFixture(fixture.clone()));
        }
        return fs::read_to_string(fixture).map_err(HarnessError::Io);
    }
    Err(HarnessError::Spec(format!(
        "'{}' has neither inline text nor a fixture",
        spec.id
    )))
}

/// Execute one spec against the pipeline: setup, processing under a hard
/// timeout, snapshot capture, deterministic validation.
///
/// Spec errors (missing fixture) and collaborator failures become failed or
/// errored results; nothing here propagates as an `Err` that could crash
/// the run.
pub async fn execute_spec(spec: &TestSpec, env: &ExecutionEnv) -> ExecutedTest {
    if let Some(reason) = &spec.meta.skip {
        return ExecutedTest::bare(TestResult::skipped(reason));
    }

    let message = match resolve_input(spec) {
        Ok(message) => message,
        Err(error) => {
            warn!(test_id = %spec.id, %error, "spec setup failed");
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Failed,
                error: Some(error.to_string()),
                ..TestResult::pending()
            });
        }
    };

    let profile = spec.input.profile.as_deref().unwrap_or("default");
    let started = Instant::now();

    let processed = tokio::time::timeout(
        env.options.test_timeout,
        env.pipeline.process_message(&message, &spec.input.kind, profile),
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;

    let process_result = match processed {
        Err(_) => {
            // Timeout always wins over a hung collaborator; the test is
            // failed loudly, never left pending.
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Timeout,
                duration_ms,
                error: Some(format!(
                    "pipeline did not finish within {}s",
                    env.options.test_timeout.as_secs()
                )),
                ..TestResult::pending()
            });
        }
        Ok(Err(e)) => {
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Error,
                duration_ms,
                error: Some(e.to_string()),
                ..TestResult::pending()
            });
        }
        Ok(Ok(result)) => result,
    };

    if !process_result.success {
        return ExecutedTest::bare(TestResult {
            status: TestStatus::Error,
            duration_ms,
            error: Some(
                process_result
                    .error
                    .unwrap_or_else(|| "pipeline reported failure without a message".into()),
            ),
            ..TestResult::pending()
        });
    }

    // If the pipeline returned content without writing the vault itself,
    // drive the save step explicitly.
    let mut vault_path = process_result.vault_path.clone();
    let mut dropbox_path = process_result.dropbox_path.clone();
    if vault_path.is_none() {
        if let Some(content) = &process_result.content {
            match env.pipeline.save_to_vault(content, profile, false).await {
                Ok(paths) => {
                    vault_path = Some(paths.vault_path);
                    dropbox_path = dropbox_path.or(paths.dropbox_path);
                }
                Err(e) => {
                    return ExecutedTest::bare(TestResult {
                        status: TestStatus::Error,
                        duration_ms,
                        error: Some(format!("vault save failed: {e}")),
                        ..TestResult::pending()
                    });
                }
            }
        }
    }

    let artifact_paths: Vec<_> = vault_path.iter().cloned().collect();
    let mut snapshot =
        OutputSnapshot::from_files(&artifact_paths, process_result.trace.unwrap_or_default());
    snapshot.archive_path = process_result.archive_path;
    snapshot.dropbox_path = dropbox_path.clone();

    let outcome = validate(spec, &snapshot);
    debug!(
        test_id = %spec.id,
        passed = outcome.passed,
        checks = outcome.checks.len(),
        "validated output"
    );

    let created = vault_path
        .as_ref()
        .map(|path| {
            vec![CreatedFile {
                test_id: spec.id.clone(),
                vault_path: Some(path.clone()),
                dropbox_path: dropbox_path.clone(),
                created_at: Utc::now(),
            }]
        })
        .unwrap_or_default();

    ExecutedTest {
        result: TestResult {
            status: if outcome.passed {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            },
            executed_at: Some(Utc::now()),
            duration_ms,
            checks: outcome.checks,
            actual: Some(ActualSnapshot::capture(&snapshot)),
            semantic_required: spec.expected.semantic.is_some(),
            semantic: None,
            error: None,
        },
        snapshot: Some(snapshot),
        created,
    }
}

/// Record one executed test and, when the spec asks for it, run the
/// follow-up judge pass. Shared by all layer drivers.
pub async fn record_execution(
    tracker: &mut RunTracker,
    spec: &TestSpec,
    executed: ExecutedTest,
    judge: Option<&JudgeAdapter>,
) -> Result<()> {
    let run_id = tracker
        .active_run()
        .map(|r| r.run_id.clone())
        .unwrap_or_default();

    let status = executed.result.status;
    tracker.record_result(&spec.id, executed.result)?;
    if !executed.created.is_empty() {
        tracker.store().register_files(&run_id, executed.created)?;
    }

    if spec.expected.semantic.is_none() || !status.is_executed() {
        return Ok(());
    }
    let Some(judge) = judge else {
        debug!(test_id = %spec.id, "semantic review required but no judge configured");
        return Ok(());
    };
    let Some(snapshot) = &executed.snapshot else {
        return Ok(());
    };

    let verdict = judge
        .review(spec, &snapshot.combined_body(), &snapshot.trace)
        .await;
    tracker.record_semantic_result(&spec.id, verdict)?;
    Ok(())
}

/// Default sequential driver (unit layer and single-test runs): each test's
/// setup, execution, validation, and recording complete before the next
/// test starts, so result and history ordering are deterministic.
pub async fn run_sequential(
    specs: &[TestSpec],
    env: &ExecutionEnv,
    tracker: &mut RunTracker,
    judge: Option<&JudgeAdapter>,
) -> Result<()> {
    for spec in specs {
        if spec.meta.skip.is_some() {
            // Seeded as skipped at run creation; nothing to execute.
            continue;
        }
        if spec.expected.semantic.is_some() {
            tracker.mark_semantic_required(&spec.id)?;
        }
        info!(test_id = %spec.id, name = %spec.name, "running test");
        let executed = execute_spec(spec, env).await;
        record_execution(tracker, spec, executed, judge).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fixture_is_a_typed_setup_error() {
        let spec: TestSpec = serde_yaml::from_str(
            "id: fx\nname: fx\ncategory: unit\ninput:\n  fixture: /nonexistent/input.txt\n",
        )
        .unwrap();
        let err = resolve_input(&spec).unwrap_err();
        assert!(matches!(err, HarnessError::MissingFixture(_)));
        assert!(err.to_string().contains("/nonexistent/input.txt"));
    }

    #[test]
    fn inputless_spec_is_a_typed_setup_error() {
        let spec: TestSpec =
            serde_yaml::from_str("id: empty\nname: empty\ncategory: unit\ninput: {}\n").unwrap();
        let err = resolve_input(&spec).unwrap_err();
        assert!(matches!(err, HarnessError::Spec(_)));
    }
}
