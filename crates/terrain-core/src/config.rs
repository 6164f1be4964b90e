use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::component::{ComponentKind, STACK_CONFIG_FILE, UNIT_CONFIG_FILE};
use crate::error::DiscoveryError;
use crate::filter::{parse_query, FilterExpr};
use crate::paths;

/// Worker count per phase: the available parallelism clamped into [4, 8].
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(4, 8)
}

/// Immutable configuration for one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Canonical root of the discovery; path globs are rooted here.
    pub working_dir: PathBuf,
    pub filters: Vec<FilterExpr>,
    pub unit_filename: String,
    pub stack_filename: String,
    pub follow_symlinks: bool,
    pub include_hidden: bool,
    pub workers: usize,
    /// Log and drop components that fail to parse instead of reporting
    /// the error.
    pub suppress_parse_errors: bool,
    pub break_cycles: bool,
    /// Build bidirectional edges for execution ordering.
    pub build_relationships: bool,
    /// Parse every discovered unit so exclude blocks and reading sets are
    /// available even without a parse-requiring filter.
    pub read_exclude_blocks: bool,
    /// Target command, recorded in discovery contexts and consulted by
    /// the git filter and exclude blocks.
    pub command: String,
    pub args: Vec<String>,
}

impl DiscoveryConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: paths::canonicalize_lenient(&working_dir.into()),
            filters: Vec::new(),
            unit_filename: UNIT_CONFIG_FILE.to_string(),
            stack_filename: STACK_CONFIG_FILE.to_string(),
            follow_symlinks: false,
            include_hidden: false,
            workers: default_workers(),
            suppress_parse_errors: false,
            break_cycles: false,
            build_relationships: false,
            read_exclude_blocks: false,
            command: String::new(),
            args: Vec::new(),
        }
    }

    /// Parse and install a filter query.
    pub fn with_query(mut self, query: &str) -> Result<Self, DiscoveryError> {
        self.filters = parse_query(query)?;
        Ok(self)
    }

    pub fn with_filters(mut self, filters: Vec<FilterExpr>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_command(mut self, command: &str, args: Vec<String>) -> Self {
        self.command = command.to_string();
        self.args = args;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, 64);
        self
    }

    /// Apply the defaults a `.terrain.toml` provides.
    pub fn with_file_config(mut self, file: &FileConfig) -> Self {
        let d = &file.discovery;
        self.unit_filename = d.unit_filename.clone();
        self.stack_filename = d.stack_filename.clone();
        self.include_hidden = d.include_hidden;
        self.follow_symlinks = d.follow_symlinks;
        self.workers = d.workers.clamp(1, 64);
        self.suppress_parse_errors = d.suppress_parse_errors;
        self.break_cycles = d.break_cycles;
        self
    }

    /// Kind of a recognised configuration file basename, if any.
    pub fn kind_for(&self, basename: &str) -> Option<ComponentKind> {
        if basename == self.unit_filename {
            Some(ComponentKind::Unit)
        } else if basename == self.stack_filename {
            Some(ComponentKind::Stack)
        } else {
            None
        }
    }
}

/// Top-level configuration from `.terrain.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub discovery: DiscoverySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_unit_filename")]
    pub unit_filename: String,
    #[serde(default = "default_stack_filename")]
    pub stack_filename: String,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub suppress_parse_errors: bool,
    #[serde(default)]
    pub break_cycles: bool,
}

fn default_unit_filename() -> String {
    UNIT_CONFIG_FILE.to_string()
}

fn default_stack_filename() -> String {
    STACK_CONFIG_FILE.to_string()
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            unit_filename: default_unit_filename(),
            stack_filename: default_stack_filename(),
            include_hidden: false,
            follow_symlinks: false,
            workers: default_workers(),
            suppress_parse_errors: false,
            break_cycles: false,
        }
    }
}

const CONFIG_FILE: &str = ".terrain.toml";

impl FileConfig {
    /// Load configuration from a `.terrain.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load from `.terrain.toml` in the given directory, or return defaults.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path).unwrap_or_default()
        } else {
            Self::default()
        }
    }
}
