//! Minimal reader for terragrunt configuration files.
//!
//! Decodes just enough of a unit configuration for discovery: dependency
//! edges, include targets, the terraform source, the exclude block,
//! feature flags, and presence of errors / remote-state configuration.
//! Output resolution, locals evaluation and function calls beyond the
//! ones named here are deliberately out of scope.

mod scan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use terrain_core::parser::{ConfigParser, ExcludeBlock, ParsedUnit};

pub use scan::{as_bool, as_string, as_string_list, scan, Attr, Block};

/// Configuration parser backed by the block scanner in this crate.
pub struct HclParser {
    find_in_parent: Regex,
}

impl HclParser {
    pub fn new() -> Self {
        Self {
            find_in_parent: Regex::new(r#"^find_in_parent_folders\(\s*(?:"([^"]*)")?\s*\)$"#)
                .expect("static regex"),
        }
    }

    /// Resolve an `include` path expression to a file, when possible.
    fn resolve_include(&self, raw: &str, dir: &Path, default_name: &str) -> Option<PathBuf> {
        if let Some(literal) = as_string(raw) {
            return Some(terrain_core::paths::normalize_lexically(&dir.join(literal)));
        }
        if let Some(caps) = self.find_in_parent.captures(raw.trim()) {
            let target = caps
                .get(1)
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(default_name);
            for ancestor in dir.ancestors().skip(1) {
                let candidate = ancestor.join(target);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
            warn!(dir = %dir.display(), target, "find_in_parent_folders found nothing");
        }
        None
    }
}

impl Default for HclParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigParser for HclParser {
    fn parse(&self, config_path: &Path) -> Result<ParsedUnit> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let root = scan(&content)
            .with_context(|| format!("failed to scan {}", config_path.display()))?;
        let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let default_include = config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut unit = ParsedUnit {
            files_read: vec![config_path.to_path_buf()],
            ..ParsedUnit::default()
        };

        // dependency "name" { config_path = "..." }
        for block in root.blocks_named("dependency") {
            if let Some(path) = block.attr("config_path").and_then(as_string) {
                unit.dependency_paths.push(PathBuf::from(path));
            }
        }
        // dependencies { paths = [...] }
        for block in root.blocks_named("dependencies") {
            if let Some(paths) = block.attr("paths").and_then(as_string_list) {
                unit.dependency_paths
                    .extend(paths.into_iter().map(PathBuf::from));
            }
        }
        dedup_in_order(&mut unit.dependency_paths);

        if let Some(terraform) = root.first_block("terraform") {
            unit.source = terraform.attr("source").and_then(as_string);
        }

        for block in root.blocks_named("include") {
            if let Some(raw) = block.attr("path") {
                if let Some(file) = self.resolve_include(raw, dir, &default_include) {
                    if !unit.files_read.contains(&file) {
                        unit.files_read.push(file);
                    }
                }
            }
        }

        if let Some(block) = root.first_block("exclude") {
            unit.exclude = Some(ExcludeBlock {
                condition: block.attr("if").and_then(as_bool).unwrap_or(false),
                actions: block
                    .attr("actions")
                    .and_then(as_string_list)
                    .unwrap_or_else(|| vec!["all".to_string()]),
                no_run: block.attr("no_run").and_then(as_bool).unwrap_or(false),
            });
        }

        let mut raw = serde_json::Map::new();
        let mut features = serde_json::Map::new();
        for block in root.blocks_named("feature") {
            let Some(name) = block.labels.first() else {
                continue;
            };
            let default = block
                .attr("default")
                .map(raw_to_value)
                .unwrap_or(Value::Null);
            features.insert(name.clone(), default);
        }
        if !features.is_empty() {
            raw.insert("features".to_string(), Value::Object(features));
        }
        if let Some(errors) = root.first_block("errors") {
            let retries: Vec<Value> = errors
                .blocks_named("retry")
                .filter_map(|b| b.labels.first())
                .map(|label| Value::String(label.clone()))
                .collect();
            raw.insert("errors".to_string(), json!({ "retries": retries }));
        }
        if let Some(remote) = root.first_block("remote_state") {
            let backend = remote
                .attr("backend")
                .and_then(as_string)
                .map(Value::String)
                .unwrap_or(Value::Null);
            raw.insert("remote_state".to_string(), json!({ "backend": backend }));
        }
        if !raw.is_empty() {
            unit.raw = Some(Value::Object(raw));
        }

        Ok(unit)
    }
}

fn dedup_in_order(paths: &mut Vec<PathBuf>) {
    let mut seen = std::collections::HashSet::new();
    paths.retain(|p| seen.insert(p.clone()));
}

fn raw_to_value(raw: &str) -> Value {
    if let Some(b) = as_bool(raw) {
        return Value::Bool(b);
    }
    if let Some(s) = as_string(raw) {
        return Value::String(s);
    }
    if let Ok(n) = raw.trim().parse::<i64>() {
        return json!(n);
    }
    Value::String(raw.trim().to_string())
}
