use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::classify::Classifier;
use crate::component::{CandidacyReason, Component, ComponentRecord, DiscoveryResult, PhaseOutput};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::finalize::{self, CycleBreak};
use crate::graph;
use crate::parse;
use crate::parser::ConfigParser;
use crate::registry::ComponentRegistry;
use crate::relations;
use crate::walker;
use crate::worktree::{self, WorktreeProvider};

/// Everything a finished run produced: the emitted components, the cycle
/// edges removed on their behalf, and the non-fatal errors collected
/// along the way. Partial results are never hidden.
pub struct DiscoveryOutcome {
    pub components: Vec<Arc<Component>>,
    pub cycle_breaks: Vec<CycleBreak>,
    pub errors: Vec<DiscoveryError>,
}

impl DiscoveryOutcome {
    /// Serializable snapshot of the emitted components, in result order.
    pub fn records(&self) -> Vec<ComponentRecord> {
        self.components.iter().map(|c| c.to_record()).collect()
    }

    /// The collected non-fatal errors joined into one, if any.
    pub fn error(self) -> Option<DiscoveryError> {
        DiscoveryError::join(self.errors)
    }
}

/// The component discovery pipeline.
///
/// Phases run in dependency order: the classifier analyses the filter
/// query once, filesystem walking and worktree diffing run concurrently,
/// then parse, graph expansion, relationship building, and the final
/// sweep each run only when the query or configuration calls for them.
pub struct Discovery {
    config: DiscoveryConfig,
    parser: Arc<dyn ConfigParser>,
    provider: Option<Arc<dyn WorktreeProvider>>,
    cancel: CancelToken,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, parser: Arc<dyn ConfigParser>) -> Self {
        Self {
            config,
            parser,
            provider: None,
            cancel: CancelToken::new(),
        }
    }

    /// Install the version-control adapter used by git filters.
    pub fn with_provider(mut self, provider: Arc<dyn WorktreeProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Token that cancels this run from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run the pipeline to completion.
    ///
    /// Configuration errors (invalid filters, missing adapter, unreadable
    /// root) fail fast; per-component errors accumulate in the outcome.
    pub fn run(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        let classifier = Classifier::analyze(&self.config.filters, &self.config.working_dir)?;
        let registry = ComponentRegistry::new();
        let mut collected = PhaseOutput::default();

        let has_git = !classifier.git_ranges().is_empty();
        if has_git && self.provider.is_none() {
            return Err(DiscoveryError::Worktree {
                ref_name: classifier.git_ranges()[0].from_ref.clone(),
                source: anyhow::anyhow!("no worktree provider configured"),
            });
        }

        // Neither walking phase depends on the other; run them side by
        // side against the shared registry.
        let config = &self.config;
        let cancel = &self.cancel;
        let classifier_ref = &classifier;
        let registry_ref = &registry;
        let provider = if has_git { self.provider.as_deref() } else { None };
        let (walked, diffed) = thread::scope(|scope| {
            let walk = scope
                .spawn(move || walker::run(config, classifier_ref, registry_ref, cancel));
            let diff = provider.map(|provider| {
                scope.spawn(move || {
                    worktree::run(config, classifier_ref, registry_ref, provider, cancel)
                })
            });
            (
                walk.join().expect("walker thread panicked"),
                diff.map(|handle| handle.join().expect("differ thread panicked")),
            )
        });
        collected.absorb(walked?);
        if let Some(diffed) = diffed {
            collected.absorb(diffed?);
        }

        let needs_parse_phase = self.config.read_exclude_blocks
            || collected
                .candidates
                .iter()
                .any(|c| c.reason == CandidacyReason::RequiresParse);
        if needs_parse_phase {
            debug!("running parse phase");
            let candidates = std::mem::take(&mut collected.candidates);
            let parsed = parse::run(
                &self.config,
                &classifier,
                self.parser.as_ref(),
                &collected.discovered,
                candidates,
                &self.cancel,
            );
            collected.absorb(parsed);
        }

        if !classifier.graph_exprs().is_empty() {
            debug!("running graph phase");
            let candidates = std::mem::take(&mut collected.candidates);
            let expanded = graph::run(
                &self.config,
                &classifier,
                &registry,
                self.parser.as_ref(),
                &collected.discovered,
                candidates,
                &self.cancel,
            );
            collected.absorb(expanded);
        }

        let wants_relations = self.config.build_relationships
            || self.config.break_cycles
            || classifier.wants_dependents();
        if wants_relations {
            debug!("running relationship phase");
            let combined: Vec<DiscoveryResult> = collected
                .discovered
                .iter()
                .chain(collected.candidates.iter())
                .cloned()
                .collect();
            let errors = relations::run(
                &self.config,
                &registry,
                self.parser.as_ref(),
                &combined,
                &self.cancel,
            );
            collected.errors.extend(errors);
        }

        if self.cancel.is_cancelled() {
            collected.errors.push(DiscoveryError::Cancelled);
        }

        let results: Vec<DiscoveryResult> = collected
            .discovered
            .into_iter()
            .chain(collected.candidates)
            .collect();
        let (components, cycle_breaks, final_errors) =
            finalize::run(&self.config, &classifier, results);

        let mut errors = collected.errors;
        errors.extend(final_errors);
        Ok(DiscoveryOutcome {
            components,
            cycle_breaks,
            errors,
        })
    }
}
