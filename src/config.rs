//! Harness configuration
//!
//! Env-driven, with sensible defaults for local use. The CLI loads `.env`
//! first (dotenvy), so a repo-local file can point the harness at its spec
//! and state directories.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Root of all persisted harness state (runs, history, reports).
    pub state_dir: PathBuf,
    /// Directory of YAML test specs.
    pub specs_dir: PathBuf,
    /// Vault directory acceptance/daemon layers validate against.
    pub vault_dir: PathBuf,
    /// Per-test deterministic execution timeout.
    pub test_timeout: Duration,
    /// Semantic evaluator timeout (slower, off the deterministic path).
    pub judge_timeout: Duration,
    /// Transport polling interval and overall deadline.
    pub poll_interval: Duration,
    pub poll_deadline: Duration,
    /// Batch size for the integration layer's bounded fan-out.
    pub batch_concurrency: usize,
    /// Keep per-test scratch directories for debugging.
    pub retain_scratch: bool,
    /// External judge command, when semantic review is enabled.
    pub judge_command: Option<String>,
    /// External pipeline command driving real executions from the CLI.
    pub pipeline_command: Option<String>,
}

pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".harness"),
            specs_dir: PathBuf::from("specs"),
            vault_dir: PathBuf::from("vault"),
            test_timeout: Duration::from_secs(60),
            judge_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            poll_deadline: Duration::from_secs(90),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            retain_scratch: false,
            judge_command: None,
            pipeline_command: None,
        }
    }
}

impl HarnessConfig {
    /// Build from `HARNESS_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            state_dir: env_path("HARNESS_STATE_DIR").unwrap_or(defaults.state_dir),
            specs_dir: env_path("HARNESS_SPECS_DIR").unwrap_or(defaults.specs_dir),
            vault_dir: env_path("HARNESS_VAULT_DIR").unwrap_or(defaults.vault_dir),
            test_timeout: env_secs("HARNESS_TEST_TIMEOUT_SECS")
                .unwrap_or(defaults.test_timeout),
            judge_timeout: env_secs("HARNESS_JUDGE_TIMEOUT_SECS")
                .unwrap_or(defaults.judge_timeout),
            poll_interval: env_millis("HARNESS_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            poll_deadline: env_secs("HARNESS_POLL_DEADLINE_SECS")
                .unwrap_or(defaults.poll_deadline),
            batch_concurrency: env_parse("HARNESS_BATCH_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_concurrency),
            retain_scratch: env::var("HARNESS_RETAIN_SCRATCH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            judge_command: env::var("HARNESS_JUDGE_CMD").ok().filter(|v| !v.is_empty()),
            pipeline_command: env::var("HARNESS_PIPELINE_CMD")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
