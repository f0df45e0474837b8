//! Ingest Harness - Test Orchestration for the Content Ingestion Pipeline
//!
//! This crate drives multi-layer test runs against the ingestion pipeline:
//! declarative YAML specs describe inputs and expected outputs, layer
//! runners execute them (in-process, subprocess, transport round-trip, or
//! daemon drain), deterministic validation scores the produced vault
//! artifacts, and an optional LLM judge reviews qualitative expectations.
//!
//! Run state is persisted as whole-document JSON snapshots, so an
//! interrupted run can be resumed and only its pending tests re-executed.
//! A rolling history book tracks per-test outcomes across runs and
//! classifies trends (stable, improving, degrading, flaky).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use ingest_harness::spec::SpecRegistry;
//! use ingest_harness::store::RunStore;
//! use ingest_harness::tracker::{RunMode, RunTracker};
//!
//! # fn main() -> anyhow::Result<()> {
//! let registry = SpecRegistry::load_from_dir(Path::new("specs"))?;
//! let store = RunStore::new(".harness");
//! let mut tracker = RunTracker::new(store);
//! let run_id = tracker.create_run(registry.all(), RunMode::Full, None)?;
//! println!("created {run_id}");
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Declarative test specs and their registry
pub mod spec;

// Captured pipeline output and frontmatter parsing
pub mod snapshot;

// Deterministic output validation
pub mod validation;

// LLM-as-judge semantic review
pub mod judge;

// Run state, summaries, and group rollups
pub mod tracker;

// Persistence: run documents, history book, created-file registry
pub mod store;

// Rolling per-test history and trend classification
pub mod history;

// Report generation with run-over-run diffs
pub mod report;

// Collaborator contracts (pipeline, transport)
pub mod pipeline;

// Layer runners
pub mod runner;

// Environment-driven configuration
pub mod config;

pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use judge::{JudgeAdapter, SemanticResult};
pub use spec::{SpecRegistry, TestSpec};
pub use store::RunStore;
pub use tracker::{RunMode, RunStatus, RunTracker, TestStatus};
pub use validation::{validate, ValidationCheck, ValidationOutcome};
