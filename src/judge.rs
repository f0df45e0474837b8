//! Semantic judge adapter
//!
//! Qualitative expectations that deterministic checks cannot express are
//! reviewed by an external, non-deterministic evaluator. The evaluator is
//! opaque, prompt in and raw text out, so the adapter's entire value is in
//! constraining it to a narrow, checkable answer shape and guaranteeing the
//! rest of the harness never crashes or hangs on a malformed or slow
//! response. The adapter always fails closed: a timeout, a non-zero exit,
//! or unparseable output becomes `passed: false, confidence: 0`, never an
//! error and never a default pass.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::spec::TestSpec;

/// Per-checkpoint verdict from the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointVerdict {
    pub checkpoint: String,
    pub passed: bool,
    #[serde(default)]
    pub reason: String,
}

/// Structured verdict. `confidence` is advisory only and clamped to
/// `0..=100`; `passed` is the evaluator's own call, never re-derived from
/// confidence here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticResult {
    pub passed: bool,
    pub confidence: u8,
    pub reasoning: String,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointVerdict>,
}

impl SemanticResult {
    fn fail_closed(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            confidence: 0,
            reasoning: diagnostic.into(),
            checkpoints: Vec::new(),
        }
    }
}

/// Raw output from one evaluator invocation. Kept split so a truncated run
/// whose stdout was cut off can still yield a verdict from stderr.
#[derive(Debug, Clone, Default)]
pub struct EvaluatorOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Narrow seam to the opaque evaluator, so the subprocess transport can be
/// swapped for a direct API call without touching adapter logic.
#[async_trait]
pub trait SemanticEvaluator: Send + Sync {
    async fn invoke(&self, prompt: &str) -> anyhow::Result<EvaluatorOutput>;
}

/// Evaluator that shells out to an external CLI, piping the prompt on stdin
/// and reading the raw response from stdout.
pub struct CliEvaluator {
    program: String,
    args: Vec<String>,
}

impl CliEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl SemanticEvaluator for CliEvaluator {
    async fn invoke(&self, prompt: &str) -> anyhow::Result<EvaluatorOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        Ok(EvaluatorOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        })
    }
}

/// Builds the evaluation prompt, invokes the evaluator under a hard
/// timeout, and parses the verdict defensively.
pub struct JudgeAdapter {
    evaluator: Box<dyn SemanticEvaluator>,
    timeout: Duration,
    max_excerpt_chars: usize,
}

const DEFAULT_JUDGE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_EXCERPT_CHARS: usize = 6_000;

impl JudgeAdapter {
    pub fn new(evaluator: Box<dyn SemanticEvaluator>) -> Self {
        Self {
            evaluator,
            timeout: Duration::from_secs(DEFAULT_JUDGE_TIMEOUT_SECS),
            max_excerpt_chars: DEFAULT_MAX_EXCERPT_CHARS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Review one test's output. Infallible by contract; all failure modes
    /// collapse into a fail-closed verdict.
    pub async fn review(&self, spec: &TestSpec, content: &str, trace: &str) -> SemanticResult {
        let Some(semantic) = &spec.expected.semantic else {
            return SemanticResult::fail_closed(format!(
                "spec '{}' carries no semantic expectation",
                spec.id
            ));
        };

        let prompt = self.build_prompt(spec, semantic, content, trace);
        debug!(test_id = %spec.id, prompt_len = prompt.len(), "invoking semantic evaluator");

        let output = match tokio::time::timeout(self.timeout, self.evaluator.invoke(&prompt)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(test_id = %spec.id, error = %e, "semantic evaluator failed");
                return SemanticResult::fail_closed(format!("evaluator invocation failed: {e}"));
            }
            Err(_) => {
                warn!(test_id = %spec.id, "semantic evaluator timed out");
                return SemanticResult::fail_closed(format!(
                    "evaluator timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        // Primary parse from stdout; truncated runs sometimes still leave a
        // valid trailing JSON object on stderr, so try that before giving up.
        if let Some(verdict) = extract_verdict(&output.stdout) {
            return finish_verdict(verdict, semantic.checkpoints.len());
        }
        if let Some(verdict) = extract_verdict(&output.stderr) {
            return finish_verdict(verdict, semantic.checkpoints.len());
        }

        let diagnostic = if output.success {
            format!(
                "no parseable verdict in evaluator response ({} chars of stdout)",
                output.stdout.len()
            )
        } else {
            format!(
                "evaluator exited non-zero and produced no parseable verdict; stderr: {}",
                truncate(&output.stderr, 200)
            )
        };
        SemanticResult::fail_closed(diagnostic)
    }

    fn build_prompt(
        &self,
        spec: &TestSpec,
        semantic: &crate::spec::SemanticSpec,
        content: &str,
        trace: &str,
    ) -> String {
        let mut prompt = format!(
            "You are reviewing the output of an automated content-ingestion test.\n\n\
             TEST: {} ({})\nCATEGORY: {}\n\nEXPECTATION:\n{}\n",
            spec.id, spec.name, spec.category, semantic.description
        );

        if !semantic.checkpoints.is_empty() {
            prompt.push_str("\nCHECKPOINTS (answer each one individually):\n");
            for (i, checkpoint) in semantic.checkpoints.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, checkpoint));
            }
        }

        prompt.push_str(&format!(
            "\nEXECUTION TRACE (excerpt):\n{}\n\nOUTPUT TO REVIEW (excerpt):\n{}\n",
            truncate(trace, self.max_excerpt_chars),
            truncate(content, self.max_excerpt_chars),
        ));

        prompt.push_str(
            "\nRespond with a single JSON object and nothing else:\n\
             {\"passed\": true|false, \"confidence\": 0-100, \"reasoning\": \"...\", \
             \"checkpoints\": [{\"checkpoint\": \"...\", \"passed\": true|false, \
             \"reason\": \"...\"}]}\n\
             No markdown, no code fences, no text outside the JSON.",
        );

        prompt
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    passed: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    checkpoints: Vec<CheckpointVerdict>,
}

fn finish_verdict(raw: RawVerdict, expected_checkpoints: usize) -> SemanticResult {
    if raw.checkpoints.len() < expected_checkpoints {
        debug!(
            got = raw.checkpoints.len(),
            expected = expected_checkpoints,
            "evaluator answered fewer checkpoints than asked"
        );
    }
    SemanticResult {
        passed: raw.passed,
        confidence: raw.confidence.clamp(0.0, 100.0).round() as u8,
        reasoning: if raw.reasoning.is_empty() {
            "evaluator gave no reasoning".to_string()
        } else {
            raw.reasoning
        },
        checkpoints: raw.checkpoints,
    }
}

/// Locate the first JSON object with a `passed` verdict shape in possibly
/// prose-or-fence-wrapped text. Scans balanced braces from each opening
/// brace and takes the first candidate that deserializes.
fn extract_verdict(text: &str) -> Option<RawVerdict> {
    let cleaned = strip_code_fences(text);

    let bytes = cleaned.as_bytes();
    for (start, _) in cleaned.char_indices().filter(|(_, c)| *c == '{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, byte) in bytes[start..].iter().enumerate() {
            match byte {
                b'"' if !escaped => in_string = !in_string,
                b'\\' if in_string && !escaped => {
                    escaped = true;
                    continue;
                }
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &cleaned[start..start + offset + 1];
                        if candidate.contains("\"passed\"") {
                            if let Ok(verdict) = serde_json::from_str::<RawVerdict>(candidate) {
                                return Some(verdict);
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
            escaped = false;
        }
    }
    None
}

fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}\n[... truncated]")
    }
}
