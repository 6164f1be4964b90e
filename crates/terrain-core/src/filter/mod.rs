mod parser;

pub use parser::parse_query;

use std::fmt;
use std::str::FromStr;

use globset::GlobBuilder;

use crate::error::DiscoveryError;

/// Attribute keys accepted by `key=pattern` expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKey {
    Name,
    Type,
    External,
    Reading,
    Source,
}

impl AttrKey {
    /// Whether evaluating this key needs a parsed configuration.
    pub fn requires_parse(&self) -> bool {
        matches!(self, AttrKey::Reading | AttrKey::Source)
    }
}

impl FromStr for AttrKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(AttrKey::Name),
            "type" => Ok(AttrKey::Type),
            "external" => Ok(AttrKey::External),
            "reading" => Ok(AttrKey::Reading),
            "source" => Ok(AttrKey::Source),
            _ => Err(()),
        }
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrKey::Name => "name",
            AttrKey::Type => "type",
            AttrKey::External => "external",
            AttrKey::Reading => "reading",
            AttrKey::Source => "source",
        };
        write!(f, "{name}")
    }
}

/// A revision range selecting components changed between two refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRange {
    pub from_ref: String,
    /// Compared against the current working tree when absent.
    pub to_ref: Option<String>,
}

/// A graph expression: select components by their position in the
/// dependency graph relative to a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphExpr {
    /// Target matcher, a path glob rooted at the discovery working dir.
    pub target: String,
    pub include_dependencies: bool,
    pub include_dependents: bool,
    /// Traversal depth limits; `None` is unbounded.
    pub dependency_depth: Option<usize>,
    pub dependent_depth: Option<usize>,
    /// Keep the target as traversal pivot but drop it from the result.
    pub exclude_target: bool,
}

/// One parsed filter expression. Expressions combine with `|`, each acting
/// as a further constraint or expansion on the selection.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Filesystem glob rooted at the discovery working directory.
    Path(String),
    Attribute { key: AttrKey, pattern: String },
    Graph(GraphExpr),
    Git(GitRange),
    Negation(Box<FilterExpr>),
}

impl FilterExpr {
    /// The expression with any negation peeled off, plus whether it was
    /// negated.
    pub fn unwrap_negation(&self) -> (&FilterExpr, bool) {
        match self {
            FilterExpr::Negation(inner) => (inner.as_ref(), true),
            other => (other, false),
        }
    }
}

/// A compiled, case-sensitive path glob. `*` stops at separators, `**`
/// crosses any depth.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    pattern: String,
    matcher: globset::GlobMatcher,
}

impl PathMatcher {
    pub fn new(pattern: &str) -> Result<Self, DiscoveryError> {
        let normalized = pattern.strip_prefix("./").unwrap_or(pattern);
        let glob = GlobBuilder::new(normalized)
            .literal_separator(true)
            .build()
            .map_err(|e| DiscoveryError::InvalidFilter {
                expression: pattern.to_string(),
                cause: e.to_string(),
            })?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// Match a working-dir-relative path rendered with forward slashes.
    pub fn is_match(&self, relative: &str) -> bool {
        self.matcher.is_match(relative)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
