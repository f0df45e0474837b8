//! CLI layer: subprocess execution with a hard timeout race
//!
//! Each spec drives an external command end to end: input on stdin,
//! console output captured as the trace. The command gets a fresh scratch
//! directory under the vault root (exported as `HARNESS_VAULT_DIR`) and
//! only that directory is scanned for produced artifacts, so one test
//! never validates another test's leftovers. The scratch directory is
//! removed after validation unless `retain_scratch` is set. The subprocess
//! is raced against a hard timeout and the timeout always wins over a hung
//! process (`kill_on_drop` tears the child down when the race is lost).

use std::fs;
use std::path::Path;
use std::process::Stdio;

use anyhow::Result;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::judge::JudgeAdapter;
use crate::snapshot::{ActualSnapshot, OutputSnapshot};
use crate::spec::TestSpec;
use crate::tracker::{RunTracker, TestResult, TestStatus};
use crate::validation::validate;

use super::{record_execution, ExecutedTest, RunnerOptions};

pub async fn run_cli_layer(
    specs: &[TestSpec],
    command: &str,
    vault_dir: &Path,
    options: &RunnerOptions,
    tracker: &mut RunTracker,
    judge: Option<&JudgeAdapter>,
) -> Result<()> {
    for spec in specs {
        if spec.meta.skip.is_some() {
            continue;
        }
        if spec.expected.semantic.is_some() {
            tracker.mark_semantic_required(&spec.id)?;
        }
        info!(test_id = %spec.id, %command, "running CLI test");
        let executed = execute_cli_spec(spec, command, vault_dir, options).await;
        record_execution(tracker, spec, executed, judge).await?;
    }
    Ok(())
}

/// Per-test scratch directory under the vault root, named after the spec
/// so a retained dir is recognizable.
fn make_scratch_dir(spec: &TestSpec, vault_dir: &Path) -> std::io::Result<tempfile::TempDir> {
    fs::create_dir_all(vault_dir)?;
    tempfile::Builder::new()
        .prefix(&format!("{}-", spec.id))
        .tempdir_in(vault_dir)
}

async fn execute_cli_spec(
    spec: &TestSpec,
    command: &str,
    vault_dir: &Path,
    options: &RunnerOptions,
) -> ExecutedTest {
    let input = match super::resolve_input(spec) {
        Ok(input) => input,
        Err(error) => {
            return ExecutedTest {
                result: TestResult {
                    status: TestStatus::Failed,
                    error: Some(error.to_string()),
                    ..TestResult::pending()
                },
                snapshot: None,
                created: Vec::new(),
            };
        }
    };

    let scratch = match make_scratch_dir(spec, vault_dir) {
        Ok(scratch) => scratch,
        Err(e) => {
            return ExecutedTest {
                result: TestResult {
                    status: TestStatus::Error,
                    error: Some(format!("failed to create scratch dir: {e}")),
                    ..TestResult::pending()
                },
                snapshot: None,
                created: Vec::new(),
            };
        }
    };

    let started = Instant::now();
    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("HARNESS_VAULT_DIR", scratch.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return ExecutedTest {
                result: TestResult {
                    status: TestStatus::Error,
                    error: Some(format!("failed to spawn '{command}': {e}")),
                    ..TestResult::pending()
                },
                snapshot: None,
                created: Vec::new(),
            };
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(input.as_bytes()).await;
        drop(stdin);
    }

    let raced = tokio::time::timeout(options.test_timeout, child.wait_with_output()).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let output = match raced {
        Err(_) => {
            warn!(test_id = %spec.id, "CLI command timed out");
            return ExecutedTest {
                result: TestResult {
                    status: TestStatus::Timeout,
                    duration_ms,
                    error: Some(format!(
                        "command did not exit within {}s",
                        options.test_timeout.as_secs()
                    )),
                    ..TestResult::pending()
                },
                snapshot: None,
                created: Vec::new(),
            };
        }
        Ok(Err(e)) => {
            return ExecutedTest {
                result: TestResult {
                    status: TestStatus::Error,
                    duration_ms,
                    error: Some(e.to_string()),
                    ..TestResult::pending()
                },
                snapshot: None,
                created: Vec::new(),
            };
        }
        Ok(Ok(output)) => output,
    };

    let trace = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if !output.status.success() {
        return ExecutedTest {
            result: TestResult {
                status: TestStatus::Error,
                duration_ms,
                error: Some(format!("command exited with {}", output.status)),
                ..TestResult::pending()
            },
            snapshot: None,
            created: Vec::new(),
        };
    }

    let snapshot = match OutputSnapshot::from_vault_dir(scratch.path(), trace) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            return ExecutedTest {
                result: TestResult {
                    status: TestStatus::Error,
                    duration_ms,
                    error: Some(format!("failed to read scratch dir: {e}")),
                    ..TestResult::pending()
                },
                snapshot: None,
                created: Vec::new(),
            };
        }
    };

    let outcome = validate(spec, &snapshot);

    // Scratch teardown: retained dirs survive for inspection and get their
    // artifacts registered for later `clean`; otherwise the whole dir goes
    // and there is nothing on disk left to register.
    let created = if options.retain_scratch {
        let kept = scratch.keep();
        debug!(test_id = %spec.id, path = %kept.display(), "retained scratch dir");
        snapshot
            .primary()
            .map(|a| {
                vec![crate::store::CreatedFile {
                    test_id: spec.id.clone(),
                    vault_path: Some(a.path.clone()),
                    dropbox_path: None,
                    created_at: Utc::now(),
                }]
            })
            .unwrap_or_default()
    } else {
        drop(scratch);
        Vec::new()
    };

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RunStore;
    use crate::tracker::RunMode;
    use std::time::Duration;

    /// Reads one line from stdin and writes `<line>.md` tagged with that
    /// line into the directory the harness hands it.
    const WRITE_NOTE: &str = concat!(
        r#"read tag; printf -- "---\ntags:\n  - ${tag}\n---\nnote body\n" "#,
        r#"> "$HARNESS_VAULT_DIR/${tag}.md""#
    );

    fn spec(id: &str, tag: &str) -> TestSpec {
        serde_yaml::from_str(&format!(
            "id: {id}\nname: {id}\ncategory: cli\ngroup: notes\n\
             input:\n  text: {tag}\nexpected:\n  tags: [{tag}]\n"
        ))
        .unwrap()
    }

    fn options(retain_scratch: bool) -> RunnerOptions {
        RunnerOptions {
            test_timeout: Duration::from_secs(10),
            retain_scratch,
        }
    }

    #[tokio::test]
    async fn each_test_validates_only_its_own_artifact() {
        let state = tempfile::tempdir().unwrap();
        let vault = tempfile::tempdir().unwrap();
        let specs = vec![spec("cli-alpha", "alpha"), spec("cli-beta", "beta")];
        let mut tracker = RunTracker::new(RunStore::new(state.path()));
        tracker.create_run(&specs, RunMode::Suite, None).unwrap();

        run_cli_layer(
            &specs,
            WRITE_NOTE,
            vault.path(),
            &options(false),
            &mut tracker,
            None,
        )
        .await
        .unwrap();

        let run = tracker.active_run().unwrap();
        assert_eq!(run.results["cli-alpha"].status, TestStatus::Passed);
        // The second test must be scored on its own beta.md, not on the
        // first test's leftover alpha.md.
        assert_eq!(
            run.results["cli-beta"].status,
            TestStatus::Passed,
            "checks: {:#?}",
            run.results["cli-beta"].checks
        );
        let actual = run.results["cli-beta"].actual.as_ref().unwrap();
        assert_eq!(actual.tags, vec!["beta"]);

        // Both scratch dirs were torn down.
        assert_eq!(std::fs::read_dir(vault.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn retained_scratch_survives_and_registers_the_artifact() {
        let state = tempfile::tempdir().unwrap();
        let vault = tempfile::tempdir().unwrap();
        let specs = vec![spec("cli-keep", "keep")];
        let mut tracker = RunTracker::new(RunStore::new(state.path()));
        let run_id = tracker.create_run(&specs, RunMode::Single, None).unwrap();

        run_cli_layer(
            &specs,
            WRITE_NOTE,
            vault.path(),
            &options(true),
            &mut tracker,
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            tracker.active_run().unwrap().results["cli-keep"].status,
            TestStatus::Passed
        );

        let dirs: Vec<_> = std::fs::read_dir(vault.path()).unwrap().collect();
        assert_eq!(dirs.len(), 1);
        let note = dirs[0].as_ref().unwrap().path().join("keep.md");
        assert!(note.is_file());

        let registry = tracker.store().load_registry().unwrap();
        assert_eq!(registry.runs.len(), 1);
        assert_eq!(registry.runs[0].run_id, run_id);
        assert_eq!(
            registry.runs[0].files[0].vault_path.as_deref(),
            Some(note.as_path())
        );
    }
}
