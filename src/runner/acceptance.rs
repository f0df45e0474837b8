//! Acceptance layer: end-to-end through the messaging transport
//!
//! Sends each spec's input as a real message, waits for the pipeline's
//! confirmation reply, then validates what newly landed in the vault
//! since the message went out; the live vault is shared, so artifacts
//! left by earlier tests are excluded via a per-test baseline. The wait
//! is a bounded poll; no reply before the deadline means a recorded
//! timeout result for that test.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::judge::JudgeAdapter;
use crate::pipeline::{Transport, TransportMessage};
use crate::snapshot::{ActualSnapshot, VaultBaseline};
use crate::spec::TestSpec;
use crate::tracker::{RunTracker, TestResult, TestStatus};
use crate::validation::validate;

use super::poll::poll_until;
use super::{record_execution, ExecutedTest};

#[derive(Debug, Clone)]
pub struct AcceptanceOptions {
    pub poll_interval: Duration,
    pub poll_deadline: Duration,
}

impl From<&crate::config::HarnessConfig> for AcceptanceOptions {
    fn from(config: &crate::config::HarnessConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            poll_deadline: config.poll_deadline,
        }
    }
}

pub async fn run_acceptance_layer(
    specs: &[TestSpec],
    transport: &dyn Transport,
    vault_dir: &Path,
    options: &AcceptanceOptions,
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
        info!(test_id = %spec.id, "running acceptance test");
        let executed = execute_acceptance_spec(spec, transport, vault_dir, options).await;
        record_execution(tracker, spec, executed, judge).await?;
    }
    Ok(())
}

/// A reply correlates with a test when it quotes the spec id or references
/// the id of the message we sent.
fn correlates(message: &TransportMessage, spec_id: &str, sent_id: Option<i64>) -> bool {
    if message.text.contains(spec_id) {
        return true;
    }
    match sent_id {
        Some(id) => message.text.contains(&id.to_string()),
        None => false,
    }
}

async fn execute_acceptance_spec(
    spec: &TestSpec,
    transport: &dyn Transport,
    vault_dir: &Path,
    options: &AcceptanceOptions,
) -> ExecutedTest {
    let input = match super::resolve_input(spec) {
        Ok(input) => input,
        Err(error) => {
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Failed,
                error: Some(error.to_string()),
                ..TestResult::pending()
            });
        }
    };

    // Captured before the message goes out, so only files the pipeline
    // writes for this test are eligible for validation.
    let baseline = match VaultBaseline::capture(vault_dir) {
        Ok(baseline) => baseline,
        Err(e) => {
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Error,
                error: Some(format!("failed to read vault dir: {e}")),
                ..TestResult::pending()
            });
        }
    };

    let started = tokio::time::Instant::now();
    let ack = match transport.send(&input).await {
        Ok(ack) if ack.ok => ack,
        Ok(ack) => {
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Error,
                error: Some(format!(
                    "transport rejected the message: {}",
                    ack.description.as_deref().unwrap_or("no description")
                )),
                ..TestResult::pending()
            });
        }
        Err(e) => {
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Error,
                error: Some(format!("transport send failed: {e}")),
                ..TestResult::pending()
            });
        }
    };
    debug!(test_id = %spec.id, message_id = ?ack.message_id, "message sent, waiting for reply");

    let reply = poll_until(options.poll_interval, options.poll_deadline, || async {
        match transport.poll().await {
            Ok(messages) => messages
                .into_iter()
                .find(|m| correlates(m, &spec.id, ack.message_id)),
            Err(e) => {
                warn!(test_id = %spec.id, error = %e, "transport poll failed");
                None
            }
        }
    })
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;

    let Some(reply) = reply else {
        return ExecutedTest::bare(TestResult {
            status: TestStatus::Timeout,
            duration_ms,
            error: Some(format!(
                "no pipeline reply within {}s",
                options.poll_deadline.as_secs()
            )),
            ..TestResult::pending()
        });
    };

    let snapshot = match baseline.snapshot_new(vault_dir, reply.text.clone()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            return ExecutedTest::bare(TestResult {
                status: TestStatus::Error,
                duration_ms,
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
