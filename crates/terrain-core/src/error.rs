use std::fmt::Write as _;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the discovery pipeline.
///
/// Per-component failures are collected and surfaced together with the
/// partial result set; only configuration errors and root I/O failures
/// abort a run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("classification failed for {path}: {message}")]
    Classification { path: PathBuf, message: String },

    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("dependency cycle detected: {}", join_paths(.nodes))]
    Cycle { nodes: Vec<PathBuf> },

    #[error("component {path} has no discovery context")]
    MissingDiscoveryContext { path: PathBuf },

    #[error("component {path} has no working directory")]
    MissingWorkingDirectory { path: PathBuf },

    #[error("invalid filter expression `{expression}`: {cause}")]
    InvalidFilter { expression: String, cause: String },

    #[error("unsupported filter composition `{expression}`")]
    UnsupportedFilterComposition { expression: String },

    #[error("command `{command}` is not supported with a git filter")]
    UnsupportedCommandForGitFilter { command: String },

    #[error("argument `{argument}` conflicts with the git filter")]
    CommandConflict { argument: String },

    #[error("failed to walk {path}")]
    Walk {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to materialize worktree for `{ref_name}`")]
    Worktree {
        ref_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("discovery was cancelled")]
    Cancelled,

    #[error("{}", aggregate_message(.errors))]
    Aggregate { errors: Vec<DiscoveryError> },
}

impl DiscoveryError {
    /// Join a batch of non-fatal errors into a single error, or `None`
    /// when the batch is empty. A single error is returned as-is.
    pub fn join(mut errors: Vec<DiscoveryError>) -> Option<DiscoveryError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(DiscoveryError::Aggregate { errors }),
        }
    }
}

fn join_paths(nodes: &[PathBuf]) -> String {
    nodes
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn aggregate_message(errors: &[DiscoveryError]) -> String {
    let mut out = format!("{} discovery errors:", errors.len());
    for err in errors {
        let _ = write!(out, "\n  {err}");
    }
    out
}
