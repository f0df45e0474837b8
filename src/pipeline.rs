//! Collaborator contracts
//!
//! The ingestion pipeline, the messaging transport, and the semantic
//! evaluator are external systems. The harness consumes them through the
//! narrow traits here; layer runners never talk to the outside world any
//! other way, which is also what makes them testable with canned
//! implementations.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Result of pushing one message through the ingestion pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessResult {
    pub success: bool,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub vault_path: Option<PathBuf>,
    #[serde(default)]
    pub dropbox_path: Option<PathBuf>,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    /// Captured processing log, used for trace assertions.
    #[serde(default)]
    pub trace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultPaths {
    pub vault_path: PathBuf,
    #[serde(default)]
    pub dropbox_path: Option<PathBuf>,
}

/// The content-ingestion pipeline under test.
#[async_trait]
pub trait ContentPipeline: Send + Sync {
    async fn process_message(
        &self,
        message: &str,
        content_type: &str,
        profile: &str,
    ) -> anyhow::Result<ProcessResult>;

    async fn save_to_vault(
        &self,
        content: &str,
        profile: &str,
        is_wisdom: bool,
    ) -> anyhow::Result<VaultPaths>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportAck {
    pub ok: bool,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: i64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// The messaging transport (bot API), as far as the harness needs it: send
/// a message, forward a fixture, and poll for replies to correlate against.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<TransportAck>;

    async fn forward(&self, from_chat: i64, message_id: i64) -> anyhow::Result<TransportAck>;

    async fn poll(&self) -> anyhow::Result<Vec<TransportMessage>>;
}

/// Pipeline adapter that shells out to an external command: the message on
/// stdin, a JSON [`ProcessResult`] on stdout, processing log on stderr.
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ContentPipeline for CommandPipeline {
    async fn process_message(
        &self,
        message: &str,
        content_type: &str,
        profile: &str,
    ) -> anyhow::Result<ProcessResult> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--content-type")
            .arg(content_type)
            .arg("--profile")
            .arg(profile)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(
            program = %self.program,
            exit_ok = output.status.success(),
            "pipeline command finished"
        );

        if !output.status.success() {
            return Ok(ProcessResult {
                success: false,
                error: Some(format!(
                    "pipeline command exited with {}: {}",
                    output.status,
                    stderr.trim()
                )),
                trace: Some(stderr),
                ..Default::default()
            });
        }

        let mut result: ProcessResult = serde_json::from_str(stdout.trim())?;
        // stderr is the processing log; keep it unless the pipeline already
        // reported its own trace.
        if result.trace.is_none() {
            result.trace = Some(stderr);
        }
        Ok(result)
    }

    async fn save_to_vault(
        &self,
        _content: &str,
        _profile: &str,
        _is_wisdom: bool,
    ) -> anyhow::Result<VaultPaths> {
        // The command contract writes to the vault as part of
        // process_message and reports the path in its ProcessResult.
        anyhow::bail!("CommandPipeline saves to the vault during process_message")
    }
}
