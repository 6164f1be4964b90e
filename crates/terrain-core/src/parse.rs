use rayon::prelude::*;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::classify::{decision_to_result, Classifier, ClassifyCtx};
use crate::component::{CandidacyReason, ComponentKind, DiscoveryResult, PhaseOutput, PhaseTag};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::parser::ConfigParser;

enum Routed {
    Result(DiscoveryResult),
    Error(DiscoveryError),
    Dropped,
}

/// Parse phase: attach configuration to `RequiresParse` candidates and
/// re-classify them, and optionally parse every discovered unit so
/// exclude blocks and reading sets are available downstream.
///
/// Parses are independent; a failing candidate never aborts its siblings.
pub(crate) fn run(
    cfg: &DiscoveryConfig,
    classifier: &Classifier,
    parser: &dyn ConfigParser,
    discovered: &[DiscoveryResult],
    candidates: Vec<DiscoveryResult>,
    cancel: &CancelToken,
) -> PhaseOutput {
    let mut output = PhaseOutput::default();

    let mut to_parse = Vec::new();
    for candidate in candidates {
        if candidate.reason == CandidacyReason::RequiresParse {
            to_parse.push(candidate);
        } else {
            output.candidates.push(candidate);
        }
    }

    let routed: Vec<Routed> = to_parse
        .into_par_iter()
        .map(|candidate| parse_candidate(cfg, classifier, parser, candidate, cancel))
        .collect();
    for entry in routed {
        match entry {
            Routed::Result(result) => output.push(result),
            Routed::Error(err) => output.errors.push(err),
            Routed::Dropped => {}
        }
    }

    if cfg.read_exclude_blocks {
        // Extraction parse for units already in the result; a failure here
        // loses annotation data, not the component.
        let errors: Vec<DiscoveryError> = discovered
            .par_iter()
            .filter_map(|result| {
                let component = &result.component;
                if cancel.is_cancelled()
                    || component.kind() != ComponentKind::Unit
                    || component.has_config()
                {
                    return None;
                }
                match parser.parse(&component.config_path()) {
                    Ok(parsed) => {
                        component.attach_config(parsed);
                        None
                    }
                    Err(err) => {
                        if cfg.suppress_parse_errors {
                            warn!(
                                path = %component.path().display(),
                                error = %err,
                                "suppressed parse error during extraction"
                            );
                            None
                        } else {
                            Some(DiscoveryError::Parse {
                                path: component.config_path(),
                                source: err,
                            })
                        }
                    }
                }
            })
            .collect();
        output.errors.extend(errors);
    }

    output
}

fn parse_candidate(
    cfg: &DiscoveryConfig,
    classifier: &Classifier,
    parser: &dyn ConfigParser,
    candidate: DiscoveryResult,
    cancel: &CancelToken,
) -> Routed {
    if cancel.is_cancelled() {
        return Routed::Dropped;
    }
    let component = candidate.component;

    // Stacks carry no parsed configuration, so a parse-requiring filter
    // can never match one.
    if component.kind() == ComponentKind::Stack {
        return Routed::Dropped;
    }

    if !component.has_config() {
        match parser.parse(&component.config_path()) {
            Ok(parsed) => component.attach_config(parsed),
            Err(err) => {
                if cfg.suppress_parse_errors {
                    warn!(
                        path = %component.path().display(),
                        error = %err,
                        "dropping unit that failed to parse"
                    );
                    return Routed::Dropped;
                }
                return Routed::Error(DiscoveryError::Parse {
                    path: component.config_path(),
                    source: err,
                });
            }
        }
    }

    match classifier.classify(
        &component,
        ClassifyCtx {
            parse_data_available: true,
        },
    ) {
        Ok(decision) => match decision_to_result(component, decision, PhaseTag::Parse) {
            Some(result) => Routed::Result(result),
            None => Routed::Dropped,
        },
        Err(err) => Routed::Error(err),
    }
}
