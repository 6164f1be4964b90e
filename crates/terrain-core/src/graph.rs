use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::classify::{Classifier, GraphExprInfo};
use crate::component::{
    CandidacyReason, Component, ComponentKind, DiscoveryResult, PhaseOutput, PhaseTag, Status,
};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::parser::ConfigParser;
use crate::paths;
use crate::pool;
use crate::registry::{ComponentRegistry, StringSet};

/// Graph traversal phase: expand every `GraphTarget` candidate into the
/// transitive closure of dependencies and/or dependents its expression
/// requests.
///
/// Targets are always recorded as `Discovered`, tagged with their
/// expression index so the final phase can honor `exclude_target`.
/// `PotentialDependent` candidates are consumed here: the ones that turn
/// out to depend on a target are re-emitted, the rest are dropped.
pub(crate) fn run(
    cfg: &DiscoveryConfig,
    classifier: &Classifier,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    discovered: &[DiscoveryResult],
    candidates: Vec<DiscoveryResult>,
    cancel: &CancelToken,
) -> PhaseOutput {
    let mut output = PhaseOutput::default();
    let exprs = classifier.graph_exprs();
    if exprs.is_empty() {
        for candidate in candidates {
            output.push(candidate);
        }
        return output;
    }

    for info in exprs {
        if cancel.is_cancelled() {
            output.errors.push(DiscoveryError::Cancelled);
            break;
        }
        expand_expression(
            cfg, registry, parser, info, discovered, &candidates, &mut output, cancel,
        );
    }
    output
}

#[allow(clippy::too_many_arguments)]
fn expand_expression(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    info: &GraphExprInfo,
    discovered: &[DiscoveryResult],
    candidates: &[DiscoveryResult],
    output: &mut PhaseOutput,
    cancel: &CancelToken,
) {
    let targets = collect_targets(cfg, info, discovered, candidates);
    if targets.is_empty() {
        return;
    }

    // The target is always recorded as discovered, even under
    // `exclude_target`: the final phase needs it as the pivot.
    for target in &targets {
        output.discovered.push(DiscoveryResult {
            component: Arc::clone(target),
            status: Status::Discovered,
            reason: CandidacyReason::GraphTarget,
            graph_index: Some(info.index),
            phase: PhaseTag::Graph,
        });
    }

    if info.expr.include_dependencies {
        walk_dependencies(
            cfg,
            registry,
            parser,
            &targets,
            info.expr.dependency_depth,
            output,
            cancel,
        );
    }
    if info.expr.include_dependents {
        walk_dependents(
            cfg,
            registry,
            parser,
            &targets,
            info.expr.dependent_depth,
            output,
            cancel,
        );
    }
    debug!(
        target = %info.expr.target,
        targets = targets.len(),
        "graph expression expanded"
    );
}

/// Every known component whose working-dir-relative path matches the
/// expression target. Candidates tagged with the expression index are
/// included even when re-matching would fail.
fn collect_targets(
    cfg: &DiscoveryConfig,
    info: &GraphExprInfo,
    discovered: &[DiscoveryResult],
    candidates: &[DiscoveryResult],
) -> Vec<Arc<Component>> {
    let seen = StringSet::new();
    let mut targets = Vec::new();

    let mut consider = |result: &DiscoveryResult, tagged: bool| {
        let component = &result.component;
        let matched = tagged || {
            let base = component
                .working_dir()
                .unwrap_or_else(|| cfg.working_dir.clone());
            paths::relative_for_match(component.path(), &base)
                .map(|rel| info.matcher.is_match(&rel))
                .unwrap_or(false)
        };
        if matched && seen.insert_path(component.path()) {
            targets.push(Arc::clone(component));
        }
    };

    for result in candidates {
        consider(result, result.graph_index == Some(info.index));
    }
    for result in discovered {
        consider(result, false);
    }
    targets
}

/// BFS along forward dependency edges, depth-limited per expression.
/// Components closer to the target are emitted before their transitive
/// descendants.
fn walk_dependencies(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    targets: &[Arc<Component>],
    depth: Option<usize>,
    output: &mut PhaseOutput,
    cancel: &CancelToken,
) {
    let visited = StringSet::new();
    for target in targets {
        visited.insert_path(target.path());
    }

    let mut frontier: Vec<Arc<Component>> = targets.to_vec();
    let mut remaining = depth;

    while !frontier.is_empty() && remaining != Some(0) {
        if cancel.is_cancelled() {
            output.errors.push(DiscoveryError::Cancelled);
            return;
        }

        let expanded = pool::run_bounded(frontier, cfg.workers, cancel, |component| {
            resolve_dependencies(
                cfg,
                registry,
                parser,
                &component,
                crate::component::DiscoveryOrigin::GraphExpansion,
            )
        });

        let mut next = Vec::new();
        for (deps, errors) in expanded {
            output.errors.extend(errors);
            for dep in deps {
                if visited.insert_path(dep.path()) {
                    output
                        .discovered
                        .push(DiscoveryResult::discovered(Arc::clone(&dep), PhaseTag::Graph));
                    next.push(dep);
                }
            }
        }
        frontier = next;
        remaining = remaining.map(|d| d.saturating_sub(1));
    }
}

/// Parse a component on demand and materialise its direct dependencies
/// through the registry. Also used by the relationship phase, which tags
/// its creations with a different origin.
pub(crate) fn resolve_dependencies(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    component: &Arc<Component>,
    origin: crate::component::DiscoveryOrigin,
) -> (Vec<Arc<Component>>, Vec<DiscoveryError>) {
    let mut errors = Vec::new();

    if component.kind() != ComponentKind::Unit {
        return (Vec::new(), errors);
    }
    if !component.has_config() {
        match parser.parse(&component.config_path()) {
            Ok(parsed) => component.attach_config(parsed),
            Err(source) => {
                if cfg.suppress_parse_errors {
                    warn!(
                        path = %component.path().display(),
                        error = %source,
                        "skipping unparseable unit during graph expansion"
                    );
                } else {
                    errors.push(DiscoveryError::Parse {
                        path: component.config_path(),
                        source,
                    });
                }
                return (Vec::new(), errors);
            }
        }
    }

    let Some(context) = component.context() else {
        errors.push(DiscoveryError::MissingDiscoveryContext {
            path: component.path().to_path_buf(),
        });
        return (Vec::new(), errors);
    };

    let config = component.config().unwrap_or_default();
    let mut deps = Vec::new();
    for dep_path in &config.dependency_paths {
        let absolute = if dep_path.is_absolute() {
            dep_path.clone()
        } else {
            component.path().join(dep_path)
        };
        let canonical = paths::canonicalize_lenient(&absolute);

        let (dep, created) = registry.ensure(&canonical, ComponentKind::Unit, &cfg.unit_filename);
        if created {
            let mut inherited = context.inherit_for_graph();
            inherited.origin = origin;
            dep.set_context(inherited);
            let inside = canonical.starts_with(&context.working_dir)
                || canonical.starts_with(&cfg.working_dir);
            dep.set_external(!inside);
        }
        component.add_dependency(&dep);
        deps.push(dep);
    }
    (deps, errors)
}

fn walk_dependents(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    targets: &[Arc<Component>],
    depth: Option<usize>,
    output: &mut PhaseOutput,
    cancel: &CancelToken,
) {
    let emitted = StringSet::new();
    for target in targets {
        emitted.insert_path(target.path());
    }

    if registry.relations_built() {
        // Reverse edges already exist; a mirror-image BFS suffices.
        let mut frontier: Vec<Arc<Component>> = targets.to_vec();
        let mut remaining = depth;
        while !frontier.is_empty() && remaining != Some(0) {
            let mut next = Vec::new();
            for component in frontier {
                for dependent in component.dependents() {
                    if emitted.insert_path(dependent.path()) {
                        output.discovered.push(DiscoveryResult::discovered(
                            Arc::clone(&dependent),
                            PhaseTag::Graph,
                        ));
                        next.push(dependent);
                    }
                }
            }
            frontier = next;
            remaining = remaining.map(|d| d.saturating_sub(1));
        }
        return;
    }

    // No reverse edges yet: upstream filesystem walk per target.
    let checked_for_target = StringSet::new();
    for target in targets {
        if cancel.is_cancelled() {
            output.errors.push(DiscoveryError::Cancelled);
            return;
        }
        upstream_walk(
            cfg,
            registry,
            parser,
            target,
            depth,
            &emitted,
            &checked_for_target,
            output,
            cancel,
        );
    }
}

/// Walk up from the target's directory toward its discovery root one
/// level at a time; at each level walk down, parse every candidate
/// lazily, and record the ones whose dependencies resolve to the target.
/// Each new dependent becomes a starting point in turn, with the depth
/// decremented and a fresh `visited` set: different starting points may
/// legitimately revisit directories.
#[allow(clippy::too_many_arguments)]
fn upstream_walk(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    target: &Arc<Component>,
    depth: Option<usize>,
    emitted: &StringSet,
    checked_for_target: &StringSet,
    output: &mut PhaseOutput,
    cancel: &CancelToken,
) {
    if depth == Some(0) {
        return;
    }
    // A worktree-scoped target walks up through the discovery tree at its
    // suffix-equivalent position; an in-tree target walks up from its own
    // directory.
    let worktree_rel = target.context().and_then(|ctx| {
        ctx.ref_name.as_ref()?;
        target
            .path()
            .strip_prefix(&ctx.working_dir)
            .ok()
            .map(Path::to_path_buf)
    });
    let (start_dir, boundary) = match &worktree_rel {
        Some(rel) => (cfg.working_dir.join(rel), cfg.working_dir.clone()),
        None => {
            let Some(working_dir) = target.working_dir() else {
                output.errors.push(DiscoveryError::MissingWorkingDirectory {
                    path: target.path().to_path_buf(),
                });
                return;
            };
            (target.path().to_path_buf(), working_dir)
        }
    };
    let visited = StringSet::new();
    let mut direct: Vec<Arc<Component>> = Vec::new();

    let mut level = start_dir;
    while let Some(parent) = level.parent().map(Path::to_path_buf) {
        if !parent.starts_with(&boundary) {
            break;
        }
        if cancel.is_cancelled() {
            output.errors.push(DiscoveryError::Cancelled);
            return;
        }

        let files = match crate::walker::collect_config_files(&parent, cfg) {
            Ok(files) => files,
            Err(err) => {
                output.errors.push(err);
                break;
            }
        };

        let candidates: Vec<PathBuf> = files
            .iter()
            .filter(|file| {
                file.file_name()
                    .is_some_and(|name| name.to_string_lossy() == cfg.unit_filename)
            })
            .filter_map(|file| file.parent().map(Path::to_path_buf))
            .filter(|dir| dir != target.path())
            .filter(|dir| visited.insert_path(dir))
            .filter(|dir| {
                checked_for_target.insert(&format!(
                    "{}\u{0}{}",
                    dir.display(),
                    target.path().display()
                ))
            })
            .collect();

        let checked: Vec<(PathBuf, Result<bool, DiscoveryError>)> = candidates
            .into_par_iter()
            .map(|dir| {
                let outcome = depends_on_target(cfg, registry, parser, &dir, target);
                (dir, outcome)
            })
            .collect();

        for (dir, outcome) in checked {
            match outcome {
                Ok(true) => {
                    let (dependent, created) =
                        registry.ensure(&dir, ComponentKind::Unit, &cfg.unit_filename);
                    if created {
                        if let Some(ctx) = target.context() {
                            dependent.set_context(ctx.inherit_for_graph());
                        }
                    }
                    dependent.add_dependency(target);
                    direct.push(dependent);
                }
                Ok(false) => {}
                Err(err) => output.errors.push(err),
            }
        }

        if parent == boundary {
            break;
        }
        level = parent;
    }

    for dependent in direct {
        if emitted.insert_path(dependent.path()) {
            output
                .discovered
                .push(DiscoveryResult::discovered(Arc::clone(&dependent), PhaseTag::Graph));
            upstream_walk(
                cfg,
                registry,
                parser,
                &dependent,
                depth.map(|d| d.saturating_sub(1)),
                emitted,
                checked_for_target,
                output,
                cancel,
            );
        }
    }
}

/// Whether the unit at `dir` lists a dependency that resolves to the
/// target: first by canonical absolute equality, then, for
/// worktree-discovered targets, by relative suffix against the target's
/// working directory.
fn depends_on_target(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    parser: &dyn ConfigParser,
    dir: &Path,
    target: &Arc<Component>,
) -> Result<bool, DiscoveryError> {
    let (candidate, created) = registry.ensure(dir, ComponentKind::Unit, &cfg.unit_filename);
    if created {
        if let Some(ctx) = target.context() {
            candidate.set_context(ctx.inherit_for_graph());
        }
    }
    if candidate.kind() != ComponentKind::Unit {
        return Ok(false);
    }
    if !candidate.has_config() {
        let config_path = candidate.config_path();
        if !config_path.is_file() {
            return Ok(false);
        }
        match parser.parse(&config_path) {
            Ok(parsed) => candidate.attach_config(parsed),
            Err(source) => {
                if cfg.suppress_parse_errors {
                    warn!(
                        path = %candidate.path().display(),
                        error = %source,
                        "skipping unparseable candidate during upstream walk"
                    );
                    return Ok(false);
                }
                return Err(DiscoveryError::Parse {
                    path: config_path,
                    source,
                });
            }
        }
    }

    let config = candidate.config().unwrap_or_default();
    let worktree_suffix = target.context().and_then(|ctx| {
        ctx.ref_name.as_ref()?;
        target
            .path()
            .strip_prefix(&ctx.working_dir)
            .ok()
            .map(Path::to_path_buf)
    });

    for dep_path in &config.dependency_paths {
        let absolute = if dep_path.is_absolute() {
            dep_path.clone()
        } else {
            candidate.path().join(dep_path)
        };
        let canonical = paths::canonicalize_lenient(&absolute);
        if canonical == target.path() {
            return Ok(true);
        }
        if let Some(suffix) = &worktree_suffix {
            if paths::has_relative_suffix(&canonical, suffix) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
