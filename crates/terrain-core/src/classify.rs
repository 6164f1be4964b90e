use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::component::{CandidacyReason, Component, PhaseTag, Status};
use crate::error::DiscoveryError;
use crate::filter::{AttrKey, FilterExpr, GitRange, GraphExpr, PathMatcher};
use crate::paths;

/// Per-expression record for a graph filter: the compiled target matcher
/// plus the traversal shape.
pub struct GraphExprInfo {
    pub index: usize,
    pub expr: GraphExpr,
    pub matcher: PathMatcher,
}

/// Evaluation context for one classification call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyCtx {
    /// True once the parse phase has attached configuration data, which
    /// settles `reading=` / `source=` expressions one way or the other.
    pub parse_data_available: bool,
}

/// Outcome of classifying one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub status: Status,
    pub reason: CandidacyReason,
    pub graph_index: Option<usize>,
}

impl Decision {
    fn discovered() -> Self {
        Self {
            status: Status::Discovered,
            reason: CandidacyReason::None,
            graph_index: None,
        }
    }

    fn excluded() -> Self {
        Self {
            status: Status::Excluded,
            reason: CandidacyReason::None,
            graph_index: None,
        }
    }

    fn candidate(reason: CandidacyReason, graph_index: Option<usize>) -> Self {
        Self {
            status: Status::Candidate,
            reason,
            graph_index,
        }
    }
}

enum LeafOutcome {
    Match,
    NoMatch,
    NeedsParse,
}

enum CompiledMatcher {
    Path(PathMatcher),
    Attribute {
        key: AttrKey,
        matcher: Option<PathMatcher>,
        boolean: Option<bool>,
    },
}

struct CompiledLeaf {
    matcher: CompiledMatcher,
    requires_parse: bool,
}

/// Pre-analysed filter query exposing constant-time decisions per
/// component. Side-effect free; shared by reference across workers.
pub struct Classifier {
    working_dir: PathBuf,
    positives: Vec<CompiledLeaf>,
    negations: Vec<CompiledLeaf>,
    graph_exprs: Vec<GraphExprInfo>,
    git_ranges: Vec<GitRange>,
    wants_dependents: bool,
}

impl Classifier {
    /// Partition every leaf expression into its bucket and compile the
    /// matchers once. Fails fast on expressions the pipeline cannot honor.
    pub fn analyze(
        filters: &[FilterExpr],
        working_dir: &Path,
    ) -> Result<Self, DiscoveryError> {
        let mut positives = Vec::new();
        let mut negations = Vec::new();
        let mut graph_exprs = Vec::new();
        let mut git_ranges = Vec::new();

        for filter in filters {
            let (inner, negated) = filter.unwrap_negation();
            match inner {
                FilterExpr::Path(pattern) => {
                    let leaf = CompiledLeaf {
                        matcher: CompiledMatcher::Path(PathMatcher::new(pattern)?),
                        requires_parse: false,
                    };
                    if negated {
                        negations.push(leaf);
                    } else {
                        positives.push(leaf);
                    }
                }
                FilterExpr::Attribute { key, pattern } => {
                    let leaf = compile_attribute(*key, pattern)?;
                    if negated {
                        negations.push(leaf);
                    } else {
                        positives.push(leaf);
                    }
                }
                FilterExpr::Graph(expr) => {
                    if negated {
                        return Err(DiscoveryError::UnsupportedFilterComposition {
                            expression: format!("!{}", expr.target),
                        });
                    }
                    graph_exprs.push(GraphExprInfo {
                        index: graph_exprs.len(),
                        matcher: PathMatcher::new(&expr.target)?,
                        expr: expr.clone(),
                    });
                }
                FilterExpr::Git(range) => {
                    if negated {
                        return Err(DiscoveryError::UnsupportedFilterComposition {
                            expression: format!("![{}]", range.from_ref),
                        });
                    }
                    git_ranges.push(range.clone());
                }
                FilterExpr::Negation(_) => {
                    // unwrap_negation peeled one level; a second level is
                    // rejected by the parser.
                    return Err(DiscoveryError::UnsupportedFilterComposition {
                        expression: "!!".to_string(),
                    });
                }
            }
        }

        let wants_dependents = graph_exprs.iter().any(|g| g.expr.include_dependents);
        Ok(Self {
            working_dir: working_dir.to_path_buf(),
            positives,
            negations,
            graph_exprs,
            git_ranges,
            wants_dependents,
        })
    }

    /// Decide what to do with a component encountered during walking.
    pub fn classify(
        &self,
        component: &Arc<Component>,
        ctx: ClassifyCtx,
    ) -> Result<Decision, DiscoveryError> {
        if component.context().is_none() {
            return Err(DiscoveryError::Classification {
                path: component.path().to_path_buf(),
                message: "component has no discovery context".to_string(),
            });
        }
        let relative = self.relative_path(component);

        // Negations first: a definite hit excludes regardless of anything
        // else; an unsettled parse-required negation forces a parse, even
        // when a positive expression already matches, so the exclusion is
        // re-evaluated with config data instead of silently dropped.
        let mut negation_needs_parse = false;
        for leaf in &self.negations {
            match self.eval_leaf(leaf, component, relative.as_deref(), ctx) {
                LeafOutcome::Match => return Ok(Decision::excluded()),
                LeafOutcome::NeedsParse => negation_needs_parse = true,
                LeafOutcome::NoMatch => {}
            }
        }

        if !self.has_positive_exprs() {
            if negation_needs_parse {
                return Ok(Decision::candidate(CandidacyReason::RequiresParse, None));
            }
            return Ok(Decision::discovered());
        }

        let mut positive_needs_parse = false;
        for leaf in &self.positives {
            match self.eval_leaf(leaf, component, relative.as_deref(), ctx) {
                LeafOutcome::Match => {
                    if negation_needs_parse {
                        return Ok(Decision::candidate(CandidacyReason::RequiresParse, None));
                    }
                    return Ok(Decision::discovered());
                }
                LeafOutcome::NeedsParse => positive_needs_parse = true,
                LeafOutcome::NoMatch => {}
            }
        }

        if negation_needs_parse || positive_needs_parse {
            return Ok(Decision::candidate(CandidacyReason::RequiresParse, None));
        }

        if let Some(rel) = relative.as_deref() {
            for info in &self.graph_exprs {
                if info.matcher.is_match(rel) {
                    return Ok(Decision::candidate(
                        CandidacyReason::GraphTarget,
                        Some(info.index),
                    ));
                }
            }
        }

        if self.wants_dependents {
            return Ok(Decision::candidate(CandidacyReason::PotentialDependent, None));
        }

        Ok(Decision::excluded())
    }

    /// True when any negation definitely matches the component; used by
    /// the final phase on components that never went through `classify`
    /// (graph-discovered dependencies, git-changed components).
    pub fn negation_excludes(&self, component: &Arc<Component>) -> bool {
        let relative = self.relative_path(component);
        let ctx = ClassifyCtx {
            parse_data_available: component.has_config(),
        };
        self.negations.iter().any(|leaf| {
            matches!(
                self.eval_leaf(leaf, component, relative.as_deref(), ctx),
                LeafOutcome::Match
            )
        })
    }

    pub fn has_positive_exprs(&self) -> bool {
        !self.positives.is_empty()
            || !self.graph_exprs.is_empty()
            || !self.git_ranges.is_empty()
    }

    /// True when any expression needs parsed configuration to settle.
    pub fn needs_parse(&self) -> bool {
        self.positives
            .iter()
            .chain(self.negations.iter())
            .any(|leaf| leaf.requires_parse)
    }

    pub fn graph_exprs(&self) -> &[GraphExprInfo] {
        &self.graph_exprs
    }

    pub fn git_ranges(&self) -> &[GitRange] {
        &self.git_ranges
    }

    pub fn wants_dependents(&self) -> bool {
        self.wants_dependents
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Path of the component relative to its own discovery root: the
    /// worktree for git-discovered components, the working directory for
    /// everything else.
    fn relative_path(&self, component: &Arc<Component>) -> Option<String> {
        let base = component
            .working_dir()
            .unwrap_or_else(|| self.working_dir.clone());
        paths::relative_for_match(component.path(), &base)
    }

    fn eval_leaf(
        &self,
        leaf: &CompiledLeaf,
        component: &Arc<Component>,
        relative: Option<&str>,
        ctx: ClassifyCtx,
    ) -> LeafOutcome {
        match &leaf.matcher {
            CompiledMatcher::Path(matcher) => match relative {
                Some(rel) if matcher.is_match(rel) => LeafOutcome::Match,
                _ => LeafOutcome::NoMatch,
            },
            CompiledMatcher::Attribute {
                key,
                matcher,
                boolean,
            } => self.eval_attribute(*key, matcher, *boolean, component, ctx),
        }
    }

    fn eval_attribute(
        &self,
        key: AttrKey,
        matcher: &Option<PathMatcher>,
        boolean: Option<bool>,
        component: &Arc<Component>,
        ctx: ClassifyCtx,
    ) -> LeafOutcome {
        match key {
            AttrKey::Name => match matcher {
                Some(m) if m.is_match(&component.name()) => LeafOutcome::Match,
                _ => LeafOutcome::NoMatch,
            },
            AttrKey::Type => match matcher {
                Some(m) if m.is_match(&component.kind().to_string()) => LeafOutcome::Match,
                _ => LeafOutcome::NoMatch,
            },
            AttrKey::External => {
                if boolean == Some(component.is_external()) {
                    LeafOutcome::Match
                } else {
                    LeafOutcome::NoMatch
                }
            }
            AttrKey::Reading => {
                // Stacks carry no parsed configuration; a parse-requiring
                // key can never match one, so don't force a parse.
                if component.kind() == crate::component::ComponentKind::Stack {
                    return LeafOutcome::NoMatch;
                }
                if !component.has_config() && !ctx.parse_data_available {
                    return LeafOutcome::NeedsParse;
                }
                let Some(m) = matcher else {
                    return LeafOutcome::NoMatch;
                };
                let base = component
                    .working_dir()
                    .unwrap_or_else(|| self.working_dir.clone());
                let hit = component.reading().iter().any(|file| {
                    if let Some(rel) = paths::relative_for_match(file, &base) {
                        if m.is_match(&rel) {
                            return true;
                        }
                    }
                    m.is_match(&file.to_string_lossy().replace('\\', "/"))
                });
                if hit {
                    LeafOutcome::Match
                } else {
                    LeafOutcome::NoMatch
                }
            }
            AttrKey::Source => {
                if component.kind() == crate::component::ComponentKind::Stack {
                    return LeafOutcome::NoMatch;
                }
                if !component.has_config() && !ctx.parse_data_available {
                    return LeafOutcome::NeedsParse;
                }
                let source = component.config().and_then(|c| c.source);
                match (matcher, source) {
                    (Some(m), Some(src)) if m.is_match(&src) => LeafOutcome::Match,
                    _ => LeafOutcome::NoMatch,
                }
            }
        }
    }
}

fn compile_attribute(key: AttrKey, pattern: &str) -> Result<CompiledLeaf, DiscoveryError> {
    let (matcher, boolean) = if key == AttrKey::External {
        (None, Some(pattern == "true"))
    } else {
        (Some(PathMatcher::new(pattern)?), None)
    };
    Ok(CompiledLeaf {
        matcher: CompiledMatcher::Attribute {
            key,
            matcher,
            boolean,
        },
        requires_parse: key.requires_parse(),
    })
}

/// Shorthand used by the walking phases.
pub fn decision_to_result(
    component: Arc<Component>,
    decision: Decision,
    phase: PhaseTag,
) -> Option<crate::component::DiscoveryResult> {
    match decision.status {
        Status::Excluded => None,
        Status::Discovered => Some(crate::component::DiscoveryResult::discovered(
            component, phase,
        )),
        Status::Candidate => Some(crate::component::DiscoveryResult::candidate(
            component,
            decision.reason,
            decision.graph_index,
            phase,
        )),
    }
}
