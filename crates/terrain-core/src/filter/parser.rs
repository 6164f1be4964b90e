use crate::error::DiscoveryError;
use crate::filter::{AttrKey, FilterExpr, GitRange, GraphExpr, PathMatcher};

/// Parse a pipe-separated filter query into its expression list.
///
/// Deterministic recursive descent over the segments: each segment is a
/// selector, optionally negated, except for graph continuations (`...`,
/// `2`, `2...`), which attach to the expression before them because the
/// grammar's `target | NUMBER` and `^target | ...` spellings cross the
/// pipe separator.
pub fn parse_query(input: &str) -> Result<Vec<FilterExpr>, DiscoveryError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut exprs: Vec<FilterExpr> = Vec::new();
    for raw_segment in input.split('|') {
        let segment = raw_segment.trim();
        if segment.is_empty() {
            return Err(invalid(input, "empty expression between pipes"));
        }

        if let Some(continuation) = parse_continuation(segment, &exprs) {
            apply_continuation(continuation?, segment, &mut exprs)?;
            continue;
        }

        exprs.push(parse_expr(segment)?);
    }
    Ok(exprs)
}

/// A graph continuation segment: depth and/or a traversal direction.
struct Continuation {
    depth: Option<usize>,
    trailing_dots: bool,
    bare_dots: bool,
}

/// Recognise `N`, `...` and `N...` segments. A bare number only counts as
/// a continuation when the previous expression is already graph-shaped;
/// otherwise it is a perfectly good path glob.
fn parse_continuation(
    segment: &str,
    exprs: &[FilterExpr],
) -> Option<Result<Continuation, DiscoveryError>> {
    if segment == "..." {
        return Some(Ok(Continuation {
            depth: None,
            trailing_dots: false,
            bare_dots: true,
        }));
    }

    let (digits, rest) = split_leading_digits(segment);
    if digits.is_empty() {
        return None;
    }
    let depth = match digits.parse::<usize>() {
        Ok(d) => d,
        Err(_) => return None,
    };
    match rest {
        "" => {
            // `target|2` — only a continuation in graph position.
            if matches!(exprs.last(), Some(FilterExpr::Graph(_))) {
                Some(Ok(Continuation {
                    depth: Some(depth),
                    trailing_dots: false,
                    bare_dots: false,
                }))
            } else {
                None
            }
        }
        "..." => Some(Ok(Continuation {
            depth: Some(depth),
            trailing_dots: true,
            bare_dots: false,
        })),
        _ => None,
    }
}

fn split_leading_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn apply_continuation(
    continuation: Continuation,
    segment: &str,
    exprs: &mut [FilterExpr],
) -> Result<(), DiscoveryError> {
    // Upgrade a trailing path expression into a graph expression in place.
    if let Some(last) = exprs.last_mut() {
        if let FilterExpr::Path(path) = last {
            let target = std::mem::take(path);
            *last = FilterExpr::Graph(GraphExpr {
                target,
                ..GraphExpr::default()
            });
        }
    }
    let Some(FilterExpr::Graph(target)) = exprs.last_mut() else {
        return Err(invalid(
            segment,
            "graph continuation must follow a path or graph expression",
        ));
    };

    if continuation.bare_dots {
        // Enable the direction not yet requested; dependents first, per
        // the leading-dots reading of a bare `...`.
        if !target.include_dependents {
            target.include_dependents = true;
        } else {
            target.include_dependencies = true;
        }
    } else if continuation.trailing_dots {
        target.include_dependencies = true;
        target.dependency_depth = continuation.depth;
    } else if let Some(depth) = continuation.depth {
        if !target.include_dependencies && !target.include_dependents {
            target.include_dependencies = true;
        }
        if target.include_dependencies {
            target.dependency_depth = Some(depth);
        }
        if target.include_dependents {
            target.dependent_depth = Some(depth);
        }
    }
    Ok(())
}

fn parse_expr(segment: &str) -> Result<FilterExpr, DiscoveryError> {
    if let Some(rest) = segment.strip_prefix('!') {
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(invalid(segment, "negation requires an expression"));
        }
        let inner = parse_expr(rest)?;
        match inner {
            FilterExpr::Negation(_) => {
                return Err(invalid(segment, "double negation is not supported"))
            }
            FilterExpr::Graph(_) | FilterExpr::Git(_) => {
                return Err(DiscoveryError::UnsupportedFilterComposition {
                    expression: segment.to_string(),
                })
            }
            _ => {}
        }
        return Ok(FilterExpr::Negation(Box::new(inner)));
    }

    if segment.starts_with('[') {
        return parse_git(segment);
    }

    if let Some(attr) = parse_attribute(segment)? {
        return Ok(attr);
    }

    if has_graph_markers(segment) {
        return parse_graph(segment);
    }

    // Plain path glob; compile once for early validation.
    PathMatcher::new(segment)?;
    Ok(FilterExpr::Path(segment.to_string()))
}

fn parse_git(segment: &str) -> Result<FilterExpr, DiscoveryError> {
    let inner = segment
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| invalid(segment, "unterminated git range"))?;
    let (from_ref, to_ref) = match inner.split_once("...") {
        Some((from, to)) => (from.trim(), Some(to.trim())),
        None => (inner.trim(), None),
    };
    if from_ref.is_empty() {
        return Err(invalid(segment, "git range requires a from ref"));
    }
    if let Some(to) = to_ref {
        if to.is_empty() {
            return Err(invalid(segment, "git range has an empty to ref"));
        }
    }
    Ok(FilterExpr::Git(GitRange {
        from_ref: from_ref.to_string(),
        to_ref: to_ref.map(str::to_string),
    }))
}

fn parse_attribute(segment: &str) -> Result<Option<FilterExpr>, DiscoveryError> {
    let Some((key, pattern)) = segment.split_once('=') else {
        return Ok(None);
    };
    let Ok(key) = key.trim().parse::<AttrKey>() else {
        // Not a recognised key; let the path parser have it.
        return Ok(None);
    };
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(invalid(segment, "attribute pattern is empty"));
    }
    if key == AttrKey::External && pattern != "true" && pattern != "false" {
        return Err(invalid(segment, "external takes a boolean literal"));
    }
    if key != AttrKey::External {
        PathMatcher::new(pattern)?;
    }
    Ok(Some(FilterExpr::Attribute {
        key,
        pattern: pattern.to_string(),
    }))
}

fn has_graph_markers(segment: &str) -> bool {
    segment.starts_with("...")
        || segment.ends_with("...")
        || segment.starts_with('^')
        || (segment.starts_with('{') && segment.ends_with('}'))
}

fn parse_graph(segment: &str) -> Result<FilterExpr, DiscoveryError> {
    let mut graph = GraphExpr::default();
    let mut rest = segment;

    if let Some(stripped) = rest.strip_prefix("...") {
        graph.include_dependents = true;
        rest = stripped;
    }
    if let Some(stripped) = rest.strip_prefix('^') {
        graph.exclude_target = true;
        rest = stripped;
    }
    if let Some(stripped) = rest.strip_suffix("...") {
        graph.include_dependencies = true;
        rest = stripped;
    }

    let mut target = rest.trim();
    if let Some(braced) = target
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
    {
        target = braced.trim();
    }
    if target.starts_with('!') {
        return Err(DiscoveryError::UnsupportedFilterComposition {
            expression: segment.to_string(),
        });
    }
    if target.is_empty() {
        return Err(invalid(segment, "graph expression requires a target"));
    }
    PathMatcher::new(target)?;
    graph.target = target.to_string();
    Ok(FilterExpr::Graph(graph))
}

fn invalid(expression: &str, cause: &str) -> DiscoveryError {
    DiscoveryError::InvalidFilter {
        expression: expression.to_string(),
        cause: cause.to_string(),
    }
}
