use std::sync::Arc;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::component::{Component, ComponentKind, DiscoveryOrigin, DiscoveryResult};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::graph::resolve_dependencies;
use crate::parser::ConfigParser;
use crate::pool;
use crate::registry::{ComponentRegistry, StringSet};

/// Relationship phase: build both directions of every dependency edge.
///
/// Dependencies pointing outside the working tree are materialised as
/// external components so the graph is complete; the final phase keeps
/// their edges but drops them from the emitted list.
pub(crate) fn run(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    results: &[DiscoveryResult],
    cancel: &CancelToken,
) -> Vec<DiscoveryError> {
    let seen = StringSet::new();
    let components: Vec<Arc<Component>> = results
        .iter()
        .map(|r| Arc::clone(&r.component))
        .filter(|c| seen.insert_path(c.path()))
        .collect();

    // Forward edges first: parse units on demand and materialise every
    // dependency target.
    let resolved = pool::run_bounded(components.clone(), cfg.workers, cancel, |component| {
        if component.kind() != ComponentKind::Unit {
            return Vec::new();
        }
        let (_, errors) = resolve_dependencies(
            cfg,
            registry,
            parser,
            &component,
            DiscoveryOrigin::DependencyResolution,
        );
        errors
    });
    let mut errors: Vec<DiscoveryError> = resolved.into_iter().flatten().collect();

    if cancel.is_cancelled() {
        errors.push(DiscoveryError::Cancelled);
        return errors;
    }

    // Mirror every forward edge.
    for component in &components {
        for dep in component.dependencies() {
            dep.add_dependent(component);
        }
    }

    registry.mark_relations_built();
    debug!(components = components.len(), "relationship phase finished");
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{DiscoveryContext, PhaseTag};
    use crate::parser::ParsedUnit;
    use anyhow::Context as _;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct LineParser;

    impl ConfigParser for LineParser {
        fn parse(&self, config_path: &Path) -> anyhow::Result<ParsedUnit> {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let dependency_paths = content
                .lines()
                .filter_map(|line| line.strip_prefix("dep = "))
                .map(|rel| PathBuf::from(rel.trim()))
                .collect();
            Ok(ParsedUnit {
                dependency_paths,
                files_read: vec![config_path.to_path_buf()],
                ..ParsedUnit::default()
            })
        }
    }

    fn write_unit(root: &Path, rel: &str, deps: &[&str]) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        let mut content = String::new();
        for dep in deps {
            content.push_str(&format!("dep = {dep}\n"));
        }
        fs::write(dir.join("terragrunt.hcl"), content).unwrap();
    }

    fn result_for(registry: &ComponentRegistry, root: &Path, rel: &str) -> DiscoveryResult {
        let (component, _) = registry.ensure(
            &root.join(rel),
            ComponentKind::Unit,
            "terragrunt.hcl",
        );
        component.set_context_if_absent(DiscoveryContext::new(
            root.to_path_buf(),
            "plan",
            &[],
        ));
        DiscoveryResult::discovered(component, PhaseTag::Walker)
    }

    #[test]
    fn test_edge_symmetry() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "vpc", &[]);
        write_unit(tmp.path(), "db", &["../vpc"]);
        write_unit(tmp.path(), "app", &["../db"]);

        let cfg = DiscoveryConfig::new(tmp.path());
        let registry = ComponentRegistry::new();
        let results = vec![
            result_for(&registry, &cfg.working_dir, "vpc"),
            result_for(&registry, &cfg.working_dir, "db"),
            result_for(&registry, &cfg.working_dir, "app"),
        ];

        let errors = run(&cfg, &registry, &LineParser, &results, &CancelToken::new());
        assert!(errors.is_empty());
        assert!(registry.relations_built());

        for result in &results {
            let component = &result.component;
            for dep in component.dependencies() {
                assert!(
                    dep.dependents()
                        .iter()
                        .any(|d| d.path() == component.path()),
                    "missing reverse edge {} -> {}",
                    dep.name(),
                    component.name()
                );
            }
            for dependent in component.dependents() {
                assert!(
                    dependent
                        .dependencies()
                        .iter()
                        .any(|d| d.path() == component.path()),
                    "missing forward edge {} -> {}",
                    dependent.name(),
                    component.name()
                );
            }
        }
    }

    #[test]
    fn test_external_dependency_is_materialised() {
        let outer = TempDir::new().unwrap();
        let tree = outer.path().join("tree");
        write_unit(&tree, "app", &["../../shared/vpc"]);
        write_unit(outer.path(), "shared/vpc", &[]);

        let cfg = DiscoveryConfig::new(&tree);
        let registry = ComponentRegistry::new();
        let results = vec![result_for(&registry, &cfg.working_dir, "app")];

        let errors = run(&cfg, &registry, &LineParser, &results, &CancelToken::new());
        assert!(errors.is_empty());

        let deps = results[0].component.dependencies();
        assert_eq!(deps.len(), 1);
        assert!(deps[0].is_external());
        assert_eq!(
            deps[0].context().unwrap().origin,
            DiscoveryOrigin::DependencyResolution
        );
        assert!(
            deps[0]
                .dependents()
                .iter()
                .any(|d| d.path() == results[0].component.path()),
            "external components still carry reverse edges"
        );
    }

    #[test]
    fn test_run_twice_keeps_edges_unique() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "vpc", &[]);
        write_unit(tmp.path(), "db", &["../vpc"]);

        let cfg = DiscoveryConfig::new(tmp.path());
        let registry = ComponentRegistry::new();
        let results = vec![
            result_for(&registry, &cfg.working_dir, "vpc"),
            result_for(&registry, &cfg.working_dir, "db"),
        ];

        run(&cfg, &registry, &LineParser, &results, &CancelToken::new());
        run(&cfg, &registry, &LineParser, &results, &CancelToken::new());

        let vpc = registry.get(&cfg.working_dir.join("vpc")).unwrap();
        assert_eq!(vpc.dependents().len(), 1);
        let db = registry.get(&cfg.working_dir.join("db")).unwrap();
        assert_eq!(db.dependencies().len(), 1);
    }
}
