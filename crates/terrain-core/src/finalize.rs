use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use tracing::warn;

use crate::classify::Classifier;
use crate::component::{CandidacyReason, Component, DiscoveryResult, Status};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;

/// A dependency edge removed to break a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleBreak {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Final phase: deduplicate by canonical path, apply the remaining filter
/// expressions (negations, target exclusion, exclude blocks, externals),
/// handle cycles, and sort.
pub(crate) fn run(
    cfg: &DiscoveryConfig,
    classifier: &Classifier,
    results: Vec<DiscoveryResult>,
) -> (Vec<Arc<Component>>, Vec<CycleBreak>, Vec<DiscoveryError>) {
    let mut errors = Vec::new();

    // Group the routes a path arrived through. A component stays when at
    // least one route keeps it: a non-exclude-targeted discovery, or a
    // candidate that survived to this point with any other reason.
    struct Claim {
        component: Arc<Component>,
        kept: bool,
        dropped_as_target: bool,
    }
    let mut claims: BTreeMap<PathBuf, Claim> = BTreeMap::new();

    for result in results {
        let exclude_targeted = result.graph_index.is_some_and(|idx| {
            classifier
                .graph_exprs()
                .get(idx)
                .map(|info| info.expr.exclude_target)
                .unwrap_or(false)
        });
        let keeps = match result.status {
            Status::Excluded => false,
            Status::Discovered => !exclude_targeted,
            Status::Candidate => {
                !(result.reason == CandidacyReason::GraphTarget && exclude_targeted)
            }
        };
        let claim = claims
            .entry(result.component.path().to_path_buf())
            .or_insert(Claim {
                component: Arc::clone(&result.component),
                kept: false,
                dropped_as_target: false,
            });
        claim.kept |= keeps;
        claim.dropped_as_target |= exclude_targeted;
    }

    let mut retained: Vec<Arc<Component>> = claims
        .into_values()
        .filter(|claim| claim.kept && !claim.dropped_as_target)
        .map(|claim| claim.component)
        .filter(|component| !component.is_external())
        .filter(|component| !classifier.negation_excludes(component))
        .filter(|component| !excluded_by_block(cfg, component))
        .collect();

    let cycle_breaks = if cfg.break_cycles {
        break_cycles(&retained)
    } else {
        for nodes in find_cycles(&retained) {
            errors.push(DiscoveryError::Cycle { nodes });
        }
        Vec::new()
    };

    retained.sort_by(|a, b| a.path().cmp(b.path()));
    (retained, cycle_breaks, errors)
}

/// Whether a parsed exclude block takes the component out of the run for
/// the current command.
fn excluded_by_block(cfg: &DiscoveryConfig, component: &Arc<Component>) -> bool {
    if !cfg.read_exclude_blocks {
        return false;
    }
    component
        .config()
        .and_then(|config| config.exclude)
        .map(|block| block.excludes(&cfg.command))
        .unwrap_or(false)
}

fn build_graph(
    components: &[Arc<Component>],
) -> (DiGraph<usize, ()>, HashMap<PathBuf, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut index = HashMap::new();
    for (i, component) in components.iter().enumerate() {
        let node = graph.add_node(i);
        index.insert(component.path().to_path_buf(), node);
    }
    for component in components {
        let from = index[&component.path().to_path_buf()];
        for dep in component.dependencies() {
            if let Some(&to) = index.get(&dep.path().to_path_buf()) {
                graph.add_edge(from, to, ());
            }
        }
    }
    (graph, index)
}

/// Strongly-connected components of size > 1, plus self-loops, over the
/// retained dependency edges.
fn find_cycles(components: &[Arc<Component>]) -> Vec<Vec<PathBuf>> {
    let mut cycles = Vec::new();
    for component in components {
        if component
            .dependencies()
            .iter()
            .any(|d| d.path() == component.path())
        {
            cycles.push(vec![component.path().to_path_buf()]);
        }
    }

    let (graph, _) = build_graph(components);
    for scc in petgraph::algo::kosaraju_scc(&graph) {
        if scc.len() > 1 {
            let mut nodes: Vec<PathBuf> = scc
                .iter()
                .map(|&node| components[graph[node]].path().to_path_buf())
                .collect();
            nodes.sort();
            cycles.push(nodes);
        }
    }
    cycles
}

/// Remove edges until the dependency relation is acyclic. Within each
/// non-trivial SCC the edge with the lexicographically smaller tail path
/// goes first; every removal is reported.
fn break_cycles(components: &[Arc<Component>]) -> Vec<CycleBreak> {
    let mut breaks = Vec::new();

    for component in components {
        if component.remove_dependency(component.path()) {
            component.remove_dependent(component.path());
            breaks.push(CycleBreak {
                from: component.path().to_path_buf(),
                to: component.path().to_path_buf(),
            });
        }
    }

    loop {
        let (graph, _) = build_graph(components);
        let sccs: Vec<Vec<NodeIndex>> = petgraph::algo::kosaraju_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .collect();
        if sccs.is_empty() {
            break;
        }

        for scc in sccs {
            let members: Vec<&Arc<Component>> =
                scc.iter().map(|&node| &components[graph[node]]).collect();
            let mut candidate: Option<(Arc<Component>, Arc<Component>)> = None;
            for member in &members {
                for dep in member.dependencies() {
                    if !members.iter().any(|m| m.path() == dep.path()) {
                        continue;
                    }
                    let better = match &candidate {
                        None => true,
                        Some((from, to)) => {
                            (member.path(), dep.path()) < (from.path(), to.path())
                        }
                    };
                    if better {
                        candidate = Some((Arc::clone(*member), dep));
                    }
                }
            }
            if let Some((from, to)) = candidate {
                from.remove_dependency(to.path());
                to.remove_dependent(from.path());
                warn!(
                    from = %from.path().display(),
                    to = %to.path().display(),
                    "removed dependency edge to break a cycle"
                );
                breaks.push(CycleBreak {
                    from: from.path().to_path_buf(),
                    to: to.path().to_path_buf(),
                });
            }
        }
    }
    breaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentKind, DiscoveryContext, PhaseTag, UNIT_CONFIG_FILE};
    use crate::filter::parse_query;
    use crate::parser::{ExcludeBlock, ParsedUnit};
    use std::path::Path;

    fn unit(path: &str) -> Arc<Component> {
        let c = Arc::new(Component::new(
            PathBuf::from(path),
            ComponentKind::Unit,
            UNIT_CONFIG_FILE,
        ));
        c.set_context(DiscoveryContext::new(PathBuf::from("/tree"), "plan", &[]));
        c
    }

    fn classifier(query: &str) -> Classifier {
        Classifier::analyze(&parse_query(query).unwrap(), Path::new("/tree")).unwrap()
    }

    fn discovered(component: &Arc<Component>) -> DiscoveryResult {
        DiscoveryResult::discovered(Arc::clone(component), PhaseTag::Walker)
    }

    #[test]
    fn test_dedupe_by_path() {
        let cfg = DiscoveryConfig::new("/tree");
        let c = classifier("");
        let vpc = unit("/tree/vpc");
        let (components, _, errors) =
            run(&cfg, &c, vec![discovered(&vpc), discovered(&vpc)]);
        assert_eq!(components.len(), 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_externals_are_invisible() {
        let cfg = DiscoveryConfig::new("/tree");
        let c = classifier("");
        let app = unit("/tree/app");
        let external = unit("/shared/vpc");
        external.set_external(true);
        app.add_dependency(&external);

        let (components, _, _) = run(&cfg, &c, vec![discovered(&app), discovered(&external)]);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name(), "app");
        assert_eq!(
            components[0].dependencies().len(),
            1,
            "the edge to the external survives"
        );
    }

    #[test]
    fn test_exclude_target_drops_pivot() {
        let cfg = DiscoveryConfig::new("/tree");
        let c = classifier("^vpc|...");
        let vpc = unit("/tree/vpc");
        let db = unit("/tree/db");

        let pivot = DiscoveryResult {
            component: Arc::clone(&vpc),
            status: Status::Discovered,
            reason: CandidacyReason::GraphTarget,
            graph_index: Some(0),
            phase: PhaseTag::Graph,
        };
        let (components, _, _) = run(&cfg, &c, vec![pivot, discovered(&db)]);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name(), "db");
    }

    #[test]
    fn test_negation_applies_to_graph_discovered() {
        let cfg = DiscoveryConfig::new("/tree");
        let c = classifier("!name=db");
        let db = unit("/tree/db");
        let app = unit("/tree/app");
        let (components, _, _) = run(&cfg, &c, vec![discovered(&app), discovered(&db)]);
        let names: Vec<String> = components.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["app"]);
    }

    #[test]
    fn test_exclude_block_drops_unit_for_command() {
        let mut cfg = DiscoveryConfig::new("/tree");
        cfg.read_exclude_blocks = true;
        cfg.command = "plan".to_string();
        let c = classifier("");

        let skipped = unit("/tree/skipped");
        skipped.attach_config(ParsedUnit {
            exclude: Some(ExcludeBlock {
                condition: true,
                actions: vec!["plan".to_string()],
                no_run: false,
            }),
            ..ParsedUnit::default()
        });
        let kept = unit("/tree/kept");
        kept.attach_config(ParsedUnit {
            exclude: Some(ExcludeBlock {
                condition: true,
                actions: vec!["apply".to_string()],
                no_run: false,
            }),
            ..ParsedUnit::default()
        });

        let (components, _, _) = run(&cfg, &c, vec![discovered(&skipped), discovered(&kept)]);
        let names: Vec<String> = components.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[test]
    fn test_cycle_break_removes_lexicographically_smaller_tail() {
        let mut cfg = DiscoveryConfig::new("/tree");
        cfg.break_cycles = true;
        let c = classifier("");

        let foo = unit("/tree/foo");
        let bar = unit("/tree/bar");
        foo.add_dependency(&bar);
        bar.add_dependent(&foo);
        bar.add_dependency(&foo);
        foo.add_dependent(&bar);

        let (components, breaks, errors) =
            run(&cfg, &c, vec![discovered(&foo), discovered(&bar)]);
        assert_eq!(components.len(), 2);
        assert!(errors.is_empty());
        assert_eq!(
            breaks,
            vec![CycleBreak {
                from: PathBuf::from("/tree/bar"),
                to: PathBuf::from("/tree/foo"),
            }]
        );
        assert!(bar.dependencies().is_empty());
        assert_eq!(foo.dependencies().len(), 1, "foo -> bar survives");
    }

    #[test]
    fn test_cycle_without_break_reports_error() {
        let cfg = DiscoveryConfig::new("/tree");
        let c = classifier("");

        let foo = unit("/tree/foo");
        let bar = unit("/tree/bar");
        foo.add_dependency(&bar);
        bar.add_dependency(&foo);

        let (components, breaks, errors) =
            run(&cfg, &c, vec![discovered(&foo), discovered(&bar)]);
        assert_eq!(components.len(), 2, "partial results are never hidden");
        assert!(breaks.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], DiscoveryError::Cycle { .. }));
    }

    #[test]
    fn test_self_loop_break() {
        let mut cfg = DiscoveryConfig::new("/tree");
        cfg.break_cycles = true;
        let c = classifier("");

        let solo = unit("/tree/solo");
        solo.add_dependency(&solo);

        let (components, breaks, _) = run(&cfg, &c, vec![discovered(&solo)]);
        assert_eq!(components.len(), 1);
        assert_eq!(breaks.len(), 1);
        assert!(components[0].dependencies().is_empty());
    }

    #[test]
    fn test_result_is_sorted_lexicographically() {
        let cfg = DiscoveryConfig::new("/tree");
        let c = classifier("");
        let z = unit("/tree/zeta");
        let a = unit("/tree/alpha");
        let m = unit("/tree/mid");

        let (components, _, _) = run(
            &cfg,
            &c,
            vec![discovered(&z), discovered(&m), discovered(&a)],
        );
        let names: Vec<String> = components.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_surviving_candidates_are_promoted() {
        let cfg = DiscoveryConfig::new("/tree");
        let c = classifier("");
        let vpc = unit("/tree/vpc");
        let candidate = DiscoveryResult::candidate(
            Arc::clone(&vpc),
            CandidacyReason::GraphTarget,
            None,
            PhaseTag::Graph,
        );
        let (components, _, _) = run(&cfg, &c, vec![candidate]);
        assert_eq!(components.len(), 1);
    }
}
