//! Ingest Harness CLI
//!
//! Drives test runs against the content-ingestion pipeline:
//! 1. Loading YAML specs from the spec registry
//! 2. Creating (or resuming) a persisted run
//! 3. Executing tests through the selected layer
//! 4. Validating output, recording results and history
//! 5. Writing a report with a diff against the previous run
//!
//! Usage:
//!   cargo run --features cli --bin ingest_harness -- run
//!   cargo run --features cli --bin ingest_harness -- run --suite integration --json
//!   cargo run --features cli --bin ingest_harness -- run --test url-bookmark --continue
//!   cargo run --features cli --bin ingest_harness -- status
//!   cargo run --features cli --bin ingest_harness -- history url-bookmark
//!   cargo run --features cli --bin ingest_harness -- clean --all --dry-run
//!
//! The pipeline under test and the judge are external commands, configured
//! via HARNESS_PIPELINE_CMD and HARNESS_JUDGE_CMD (see config.rs for the
//! full list of HARNESS_* variables).

use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use ingest_harness::config::HarnessConfig;
use ingest_harness::judge::{CliEvaluator, JudgeAdapter};
use ingest_harness::pipeline::{CommandPipeline, ContentPipeline};
use ingest_harness::report::ReportGenerator;
use ingest_harness::runner::cli::run_cli_layer;
use ingest_harness::runner::integration::run_batched;
use ingest_harness::runner::{run_sequential, ExecutionEnv, Layer, RunnerOptions};
use ingest_harness::spec::{SpecRegistry, TestSpec};
use ingest_harness::store::RunStore;
use ingest_harness::tracker::{
    group_rollups, GroupStatus, RunFilters, RunMode, RunStatus, RunTracker, TestRun, TestStatus,
};

/// Test harness for the content ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "ingest_harness")]
#[command(about = "Run, track, and report ingestion pipeline tests")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute tests and record results
    Run {
        /// Restrict to one suite (spec category), e.g. "integration"
        #[arg(long)]
        suite: Option<String>,

        /// Restrict to one logical group
        #[arg(long)]
        group: Option<String>,

        /// Run a single test by id
        #[arg(long, short = 't')]
        test: Option<String>,

        /// Execution layer: unit, integration, or cli
        #[arg(long, default_value = "unit")]
        layer: Layer,

        /// Resume the most recent in-progress run instead of starting fresh
        #[arg(long = "continue")]
        resume: bool,

        /// Output the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the latest run's summary and per-group rollup
    Status,

    /// Show one test's rolling history and trend
    History {
        /// Test id
        test_id: String,
    },

    /// List persisted runs
    Runs,

    /// Regenerate the report for a run (defaults to the latest)
    Report {
        /// Run id, e.g. run-2026-08-30-001
        run_id: Option<String>,
    },

    /// Delete files created by test runs
    Clean {
        /// Restrict cleanup to one run's files
        #[arg(long)]
        run: Option<String>,

        /// Clean files from every recorded run
        #[arg(long)]
        all: bool,

        /// List what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();
    let config = HarnessConfig::from_env();

    match args.command {
        Commands::Run {
            suite,
            group,
            test,
            layer,
            resume,
            json,
        } => cmd_run(&config, suite, group, test, layer, resume, json).await,
        Commands::Status => cmd_status(&config),
        Commands::History { test_id } => cmd_history(&config, &test_id),
        Commands::Runs => cmd_runs(&config),
        Commands::Report { run_id } => cmd_report(&config, run_id.as_deref()),
        Commands::Clean { run, all, dry_run } => cmd_clean(&config, run.as_deref(), all, dry_run),
    }
}

fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

fn build_pipeline(config: &HarnessConfig) -> Result<Arc<dyn ContentPipeline>, String> {
    let command = config
        .pipeline_command
        .as_deref()
        .ok_or("HARNESS_PIPELINE_CMD is not set")?;
    let (program, cmd_args) =
        split_command(command).ok_or("HARNESS_PIPELINE_CMD is empty")?;
    Ok(Arc::new(CommandPipeline::new(program, cmd_args)))
}

fn build_judge(config: &HarnessConfig) -> Option<JudgeAdapter> {
    let command = config.judge_command.as_deref()?;
    let (program, cmd_args) = split_command(command)?;
    Some(
        JudgeAdapter::new(Box::new(CliEvaluator::new(program, cmd_args)))
            .with_timeout(config.judge_timeout),
    )
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    config: &HarnessConfig,
    suite: Option<String>,
    group: Option<String>,
    test: Option<String>,
    layer: Layer,
    resume: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if matches!(layer, Layer::Acceptance | Layer::Daemon) {
        eprintln!(
            "{} the {layer:?} layer needs a live transport and is driven from CI scripts, not this binary",
            "ERROR:".red().bold()
        );
        std::process::exit(2);
    }

    let registry = SpecRegistry::load_from_dir(&config.specs_dir)?;

    let (mut specs, mode, filters): (Vec<TestSpec>, RunMode, Option<RunFilters>) =
        if let Some(id) = &test {
            let spec = registry
                .get(id)
                .ok_or_else(|| {
                    format!("test '{id}' not found. Available: {:?}", registry.list_ids())
                })?
                .clone();
            (
                vec![spec],
                RunMode::Single,
                Some(RunFilters {
                    test_id: Some(id.clone()),
                    ..Default::default()
                }),
            )
        } else if let Some(g) = &group {
            (
                registry.by_group(g).into_iter().cloned().collect(),
                RunMode::Group,
                Some(RunFilters {
                    group: Some(g.clone()),
                    ..Default::default()
                }),
            )
        } else if let Some(s) = &suite {
            (
                registry.by_category(s).into_iter().cloned().collect(),
                RunMode::Suite,
                Some(RunFilters {
                    category: Some(s.clone()),
                    ..Default::default()
                }),
            )
        } else {
            (registry.all().to_vec(), RunMode::Full, None)
        };

    if specs.is_empty() {
        eprintln!("{} no specs matched the selection", "ERROR:".red().bold());
        std::process::exit(2);
    }

    let store = RunStore::new(config.state_dir.clone());
    let mut tracker = RunTracker::new(store);

    let resumed = if resume {
        tracker.resume_latest_in_progress()?
    } else {
        None
    };
    let run_id = match resumed {
        Some(run_id) => {
            // Re-execute only what the interrupted run left pending.
            let pending = tracker.pending_tests();
            specs.retain(|s| pending.contains(&s.id));
            if !json {
                println!(
                    "{} {} ({} tests left)",
                    "Resuming:".cyan().bold(),
                    run_id,
                    specs.len()
                );
            }
            run_id
        }
        None => {
            let run_id = tracker.create_run(&specs, mode, filters)?;
            if !json {
                println!(
                    "{} {} ({} tests)",
                    "Created:".cyan().bold(),
                    run_id,
                    specs.len()
                );
            }
            run_id
        }
    };

    let judge = build_judge(config);

    match layer {
        Layer::Cli => {
            let command = config
                .pipeline_command
                .as_deref()
                .ok_or("HARNESS_PIPELINE_CMD is not set")?
                .to_string();
            let options = RunnerOptions::from(config);
            run_cli_layer(
                &specs,
                &command,
                &config.vault_dir,
                &options,
                &mut tracker,
                judge.as_ref(),
            )
            .await?;
        }
        Layer::Integration => {
            let env = ExecutionEnv {
                pipeline: build_pipeline(config)?,
                options: RunnerOptions::from(config),
            };
            run_batched(
                &specs,
                &env,
                &mut tracker,
                judge.as_ref(),
                config.batch_concurrency,
            )
            .await?;
        }
        _ => {
            let env = ExecutionEnv {
                pipeline: build_pipeline(config)?,
                options: RunnerOptions::from(config),
            };
            run_sequential(&specs, &env, &mut tracker, judge.as_ref()).await?;
        }
    }

    let run = tracker
        .complete_run()?
        .ok_or("run vanished before completion")?;

    let store = RunStore::new(config.state_dir.clone());
    let generator = ReportGenerator::new(&store);
    let report = generator.build(&run)?;
    let paths = generator.write(&report)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_summary(&run, &registry);
        println!("\nReport: {}", paths.markdown.display());
    }

    if run.summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_run_summary(run: &TestRun, registry: &SpecRegistry) {
    let summary = &run.summary;

    println!("\n{}", "═".repeat(60));
    println!("{}", "RUN SUMMARY".cyan().bold());
    println!("{}", "═".repeat(60));
    println!("Run:          {}", run.run_id.yellow().bold());
    println!("Total:        {}", summary.total);
    println!("Passed:       {}", summary.passed.to_string().green());
    println!("Failed:       {}", summary.failed.to_string().red());
    if summary.skipped > 0 {
        println!("Skipped:      {}", summary.skipped.to_string().yellow());
    }
    if summary.pending > 0 {
        println!("Pending:      {}", summary.pending.to_string().yellow());
    }
    if summary.semantic_required > 0 {
        println!(
            "Semantic:     {}/{} reviewed",
            summary.semantic_completed, summary.semantic_required
        );
    }

    let failing = run.failing_test_ids();
    if !failing.is_empty() {
        println!("\n{}", "FAILURES".red().bold());
        for test_id in &failing {
            let Some(result) = run.results.get(test_id) else {
                continue;
            };
            println!("  {} {} [{:?}]", "✗".red(), test_id, result.status);
            if let Some(error) = &result.error {
                println!("      {error}");
            }
            for check in result.failing_checks() {
                println!("      {}: {}", check.name, check.reasoning);
            }
        }
    }

    let rollups = group_rollups(run, registry.all());
    if !rollups.is_empty() {
        println!("\n{}", "GROUPS".cyan().bold());
        for (group, rollup) in &rollups {
            let label = match rollup.status {
                GroupStatus::Clean => "clean".green(),
                GroupStatus::Failing => "failing".red(),
                GroupStatus::Partial => "partial".yellow(),
                GroupStatus::Pending => "pending".normal(),
            };
            println!(
                "  {:<24} {} ({}/{} executed, {} failed)",
                group, label, rollup.executed, rollup.total, rollup.failed
            );
        }
    }
    println!("{}", "═".repeat(60));
}

fn cmd_status(config: &HarnessConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = RunStore::new(config.state_dir.clone());
    let run_ids = store.list_run_ids()?;
    let Some(latest) = run_ids.last() else {
        println!("No runs recorded yet");
        return Ok(());
    };
    let run = store
        .load_run(latest)?
        .ok_or_else(|| format!("run '{latest}' listed but unreadable"))?;

    let registry = SpecRegistry::load_from_dir(&config.specs_dir)?;
    let status = match run.status {
        RunStatus::InProgress => "in progress".yellow(),
        RunStatus::Completed => "completed".green(),
        RunStatus::Abandoned => "abandoned".red(),
    };
    println!("{} {} ({})", "Latest run:".cyan().bold(), run.run_id, status);
    print_run_summary(&run, &registry);
    Ok(())
}

fn cmd_history(config: &HarnessConfig, test_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = RunStore::new(config.state_dir.clone());
    let book = store.load_history()?;
    let Some(history) = book.test_history(test_id) else {
        println!("No history for '{test_id}'");
        return Ok(());
    };

    println!("{} {}", "Test:".cyan().bold(), test_id);
    println!("Trend:        {:?}", history.trend);
    println!("Pass rate:    {:.0}%", history.pass_rate * 100.0);
    println!("Avg duration: {:.0}ms", history.avg_duration_ms);
    println!();
    for entry in &history.entries {
        let status = match entry.status {
            TestStatus::Passed => format!("{:?}", entry.status).green(),
            TestStatus::Skipped | TestStatus::Pending => format!("{:?}", entry.status).yellow(),
            _ => format!("{:?}", entry.status).red(),
        };
        println!(
            "  {}  {:<8}  {}ms",
            entry.run_id, status, entry.duration_ms
        );
    }
    Ok(())
}

fn cmd_runs(config: &HarnessConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = RunStore::new(config.state_dir.clone());
    let run_ids = store.list_run_ids()?;
    if run_ids.is_empty() {
        println!("No runs recorded yet");
        return Ok(());
    }
    for run_id in &run_ids {
        let Some(run) = store.load_run(run_id)? else {
            continue;
        };
        let status = match run.status {
            RunStatus::InProgress => "in progress".yellow(),
            RunStatus::Completed => "completed".green(),
            RunStatus::Abandoned => "abandoned".red(),
        };
        println!(
            "{}  {:<12}  {} passed, {} failed, {} skipped of {}",
            run.run_id,
            status,
            run.summary.passed,
            run.summary.failed,
            run.summary.skipped,
            run.summary.total
        );
    }
    Ok(())
}

fn cmd_report(
    config: &HarnessConfig,
    run_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = RunStore::new(config.state_dir.clone());
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => store
            .list_run_ids()?
            .last()
            .cloned()
            .ok_or("no runs recorded yet")?,
    };
    let run = store
        .load_run(&run_id)?
        .ok_or_else(|| format!("run '{run_id}' not found"))?;

    let generator = ReportGenerator::new(&store);
    let report = generator.build(&run)?;
    let paths = generator.write(&report)?;
    println!("Wrote {}", paths.markdown.display());
    println!("Wrote {}", paths.json.display());
    Ok(())
}

fn cmd_clean(
    config: &HarnessConfig,
    run: Option<&str>,
    all: bool,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if run.is_none() && !all {
        eprintln!(
            "{} pass --run <id> or --all to pick what to clean",
            "ERROR:".red().bold()
        );
        std::process::exit(2);
    }

    let store = RunStore::new(config.state_dir.clone());
    let removed = store.cleanup_files(run, dry_run)?;
    let verb = if dry_run { "Would delete" } else { "Deleted" };
    for path in &removed {
        println!("{verb} {}", path.display());
    }
    println!("{} {} file(s)", verb, removed.len());
    Ok(())
}
