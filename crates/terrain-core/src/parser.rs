use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

/// Exclusion annotation extracted from a unit configuration.
///
/// A unit whose exclude block is active for the current command is dropped
/// from the emitted list (action `exclude_from_queue`) or retained but
/// flagged as no-run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExcludeBlock {
    /// Evaluated `if` condition; only literal booleans are recognised.
    pub condition: bool,
    /// Commands the exclusion applies to; `all` matches any command.
    pub actions: Vec<String>,
    pub no_run: bool,
}

impl ExcludeBlock {
    /// True when this block excludes the unit for `command`.
    pub fn excludes(&self, command: &str) -> bool {
        self.condition
            && self
                .actions
                .iter()
                .any(|a| a == "all" || a == command)
    }
}

/// Parser output for one configuration file.
///
/// The pipeline never inspects parse internals beyond these fields; the raw
/// configuration object is carried opaquely for downstream consumers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedUnit {
    /// Directories this unit depends on, as written in the config
    /// (relative paths are resolved against the unit directory by the
    /// graph phase).
    pub dependency_paths: Vec<PathBuf>,
    /// Every file the parser read to produce this result.
    pub files_read: Vec<PathBuf>,
    pub exclude: Option<ExcludeBlock>,
    /// The terraform source attribute, if present.
    pub source: Option<String>,
    /// Raw decoded configuration, for consumers that need more than the
    /// extracted fields.
    pub raw: Option<serde_json::Value>,
}

/// External configuration parser collaborator.
///
/// Implementations decode a configuration file with a minimal decode list
/// (source, dependency blocks, includes, feature flags, exclude, errors,
/// remote state) and report the files they read along the way.
pub trait ConfigParser: Send + Sync {
    fn parse(&self, config_path: &Path) -> Result<ParsedUnit>;
}
