//! Daemon layer: drain-and-process against a long-running intake
//!
//! Models the deployed shape of the system: messages arrive on the
//! transport, a worker drains them and pushes each through the pipeline,
//! and only afterwards do the specs get validated against what the drain
//! newly wrote to the vault; files already present before the drain are
//! excluded via a baseline. One transport message per spec, matched by
//! spec id in the message text.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::judge::JudgeAdapter;
use crate::pipeline::{ContentPipeline, Transport, TransportMessage};
use crate::snapshot::{ActualSnapshot, VaultBaseline};
use crate::spec::TestSpec;
use crate::tracker::{RunTracker, TestResult, TestStatus};
use crate::validation::validate;

use super::{record_execution, ExecutedTest, RunnerOptions};

/// Drain every queued transport message through the pipeline. Returns the
/// drained messages so callers can correlate them with specs.
pub async fn drain_intake(
    transport: &dyn Transport,
    pipeline: &Arc<dyn ContentPipeline>,
    options: &RunnerOptions,
) -> Result<Vec<TransportMessage>> {
    let messages = transport.poll().await?;
    info!(count = messages.len(), "draining intake queue");

    for message in &messages {
        let processed = tokio::time::timeout(
            options.test_timeout,
            pipeline.process_message(&message.text, "text", "default"),
        )
        .await;
        match processed {
            Err(_) => warn!(message_id = message.id, "intake processing timed out"),
            Ok(Err(e)) => warn!(message_id = message.id, error = %e, "intake processing failed"),
            Ok(Ok(result)) if !result.success => {
                warn!(
                    message_id = message.id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "pipeline rejected intake message"
                );
            }
            Ok(Ok(_)) => debug!(message_id = message.id, "intake message processed"),
        }
    }
    Ok(messages)
}

pub async fn run_daemon_layer(
    specs: &[TestSpec],
    transport: &dyn Transport,
    pipeline: &Arc<dyn ContentPipeline>,
    vault_dir: &Path,
    options: &RunnerOptions,
    tracker: &mut RunTracker,
    judge: Option<&JudgeAdapter>,
) -> Result<()> {
    let baseline = VaultBaseline::capture(vault_dir)?;
    let drained = drain_intake(transport, pipeline, options).await?;

    for spec in specs {
        if spec.meta.skip.is_some() {
            continue;
        }
        if spec.expected.semantic.is_some() {
            tracker.mark_semantic_required(&spec.id)?;
        }
        let executed = score_spec(spec, &drained, vault_dir, &baseline);
        record_execution(tracker, spec, executed, judge).await?;
    }
    Ok(())
}

/// Validate one spec against what the drain wrote to the vault. A spec
/// with no matching intake message fails outright rather than validating
/// stale output.
fn score_spec(
    spec: &TestSpec,
    drained: &[TransportMessage],
    vault_dir: &Path,
    baseline: &VaultBaseline,
) -> ExecutedTest {
    let matched = drained.iter().find(|m| m.text.contains(&spec.id));
    let Some(matched) = matched else {
        return ExecutedTest::bare(TestResult {
            status: TestStatus::Failed,
            error: Some(format!("no intake message matched spec '{}'", spec.id)),
            ..TestResult::pending()
        });
    };

    let snapshot = match baseline.snapshot_new(vault_dir, matched.text.clone()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Error,
                error: Some(format!("failed to read vault dir: {e}")),
                ..TestResult::pending()
            });
        }
    };

    let outcome = validate(spec, &snapshot);
    let created = snapshot
        .primary()
        .map(|a| {
            vec![crate::store::CreatedFile {
                test_id: spec.id.clone(),
                vault_path: Some(a.path.clone()),
                dropbox_path: snapshot.dropbox_path.clone(),
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
            duration_ms: 0,
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
