//! Error handling for the harness core
//!
//! Library-level failures use typed errors via thiserror; operational code
//! (file store, CLI) layers anyhow context on top, so a failed run document
//! write reports the full chain.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Spec error: {0}")]
    Spec(String),

    #[error("Unknown test id '{0}'")]
    UnknownTest(String),

    #[error("Missing fixture: {}", .0.display())]
    MissingFixture(PathBuf),

    #[error("No active run")]
    NoActiveRun,

    #[error("Invalid archive pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spec file error: {0}")]
    SpecFile(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
