use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::parser::ParsedUnit;

/// Default configuration file recognised as a unit.
pub const UNIT_CONFIG_FILE: &str = "terragrunt.hcl";
/// Default configuration file recognised as a stack.
pub const STACK_CONFIG_FILE: &str = "terragrunt.stack.hcl";

/// Kind of discovered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Unit,
    Stack,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Unit => write!(f, "unit"),
            ComponentKind::Stack => write!(f, "stack"),
        }
    }
}

/// How a component entered the discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryOrigin {
    Walk,
    WorktreeDiff,
    GraphExpansion,
    DependencyResolution,
}

/// Metadata describing how a component was found.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryContext {
    pub working_dir: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub ref_name: Option<String>,
    pub origin: DiscoveryOrigin,
}

impl DiscoveryContext {
    pub fn new(working_dir: PathBuf, command: &str, args: &[String]) -> Self {
        Self {
            working_dir,
            command: command.to_string(),
            args: args.to_vec(),
            ref_name: None,
            origin: DiscoveryOrigin::Walk,
        }
    }

    pub fn with_origin(mut self, origin: DiscoveryOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_ref(mut self, ref_name: &str) -> Self {
        self.ref_name = Some(ref_name.to_string());
        self
    }

    /// Derive the context a graph-discovered component inherits: same
    /// working tree and command, but no revision ref and no `-destroy`,
    /// so graph-expanded dependencies never look git-changed.
    pub fn inherit_for_graph(&self) -> Self {
        Self {
            working_dir: self.working_dir.clone(),
            command: self.command.clone(),
            args: self
                .args
                .iter()
                .filter(|a| a.as_str() != crate::worktree::DESTROY_ARG)
                .cloned()
                .collect(),
            ref_name: None,
            origin: DiscoveryOrigin::GraphExpansion,
        }
    }
}

#[derive(Default)]
struct ComponentState {
    config: Option<ParsedUnit>,
    reading: BTreeSet<PathBuf>,
    dependencies: Vec<Arc<Component>>,
    dependents: Vec<Arc<Component>>,
    context: Option<DiscoveryContext>,
}

/// An atomic element of the discovery result: a unit or a stack.
///
/// Identity is the canonical directory path; a path maps to exactly one
/// `Component` instance per run (enforced by the registry). Mutable state
/// (parsed config, edge lists, context) sits behind a per-component lock so
/// concurrent phases can enrich the same instance.
pub struct Component {
    path: PathBuf,
    kind: ComponentKind,
    config_file: String,
    external: AtomicBool,
    state: Mutex<ComponentState>,
}

impl Component {
    pub fn new(path: PathBuf, kind: ComponentKind, config_file: &str) -> Self {
        Self {
            path,
            kind,
            config_file: config_file.to_string(),
            external: AtomicBool::new(false),
            state: Mutex::new(ComponentState::default()),
        }
    }

    /// Canonical absolute directory of the component.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path segment, used by `name=` attribute filters.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Basename of the recognised configuration file.
    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Full path of the configuration file inside the component directory.
    pub fn config_path(&self) -> PathBuf {
        self.path.join(&self.config_file)
    }

    pub fn is_external(&self) -> bool {
        self.external.load(Ordering::Acquire)
    }

    pub fn set_external(&self, external: bool) {
        self.external.store(external, Ordering::Release);
    }

    pub fn context(&self) -> Option<DiscoveryContext> {
        self.state.lock().context.clone()
    }

    pub fn set_context(&self, context: DiscoveryContext) {
        self.state.lock().context = Some(context);
    }

    /// Set the context only when none has been recorded yet. Creators use
    /// this so a concurrently-running phase with more specific knowledge
    /// (the worktree differ) is not overwritten.
    pub fn set_context_if_absent(&self, context: DiscoveryContext) {
        let mut state = self.state.lock();
        if state.context.is_none() {
            state.context = Some(context);
        }
    }

    /// Working directory recorded at discovery time, if any.
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.state.lock().context.as_ref().map(|c| c.working_dir.clone())
    }

    pub fn has_config(&self) -> bool {
        self.state.lock().config.is_some()
    }

    /// Attach a parsed configuration and fold its read files into the
    /// `reading` set. Later attachments win; the parse phase only parses a
    /// path once, so in practice this runs at most once per component.
    pub fn attach_config(&self, config: ParsedUnit) {
        let mut state = self.state.lock();
        state.reading.extend(config.files_read.iter().cloned());
        state.config = Some(config);
    }

    pub fn config(&self) -> Option<ParsedUnit> {
        self.state.lock().config.clone()
    }

    pub fn reading(&self) -> BTreeSet<PathBuf> {
        self.state.lock().reading.clone()
    }

    /// Add a forward dependency edge, keeping the list ordered-unique.
    /// Returns false when the edge was already present.
    pub fn add_dependency(self: &Arc<Self>, dep: &Arc<Component>) -> bool {
        let mut state = self.state.lock();
        if state.dependencies.iter().any(|d| d.path == dep.path) {
            return false;
        }
        state.dependencies.push(Arc::clone(dep));
        true
    }

    /// Add a reverse dependency edge, keeping the list ordered-unique.
    pub fn add_dependent(self: &Arc<Self>, dependent: &Arc<Component>) -> bool {
        let mut state = self.state.lock();
        if state.dependents.iter().any(|d| d.path == dependent.path) {
            return false;
        }
        state.dependents.push(Arc::clone(dependent));
        true
    }

    /// Remove the dependency edge to `path`, if present. Used by cycle
    /// breaking; the matching reverse edge must be removed by the caller.
    pub fn remove_dependency(&self, path: &Path) -> bool {
        let mut state = self.state.lock();
        let before = state.dependencies.len();
        state.dependencies.retain(|d| d.path != path);
        state.dependencies.len() != before
    }

    pub fn remove_dependent(&self, path: &Path) -> bool {
        let mut state = self.state.lock();
        let before = state.dependents.len();
        state.dependents.retain(|d| d.path != path);
        state.dependents.len() != before
    }

    /// Snapshot of the dependency edges, taken under the component lock.
    pub fn dependencies(&self) -> Vec<Arc<Component>> {
        self.state.lock().dependencies.clone()
    }

    /// Snapshot of the dependent edges, taken under the component lock.
    pub fn dependents(&self) -> Vec<Arc<Component>> {
        self.state.lock().dependents.clone()
    }

    /// Serializable snapshot for reporting.
    pub fn to_record(&self) -> ComponentRecord {
        let context = self.context();
        ComponentRecord {
            path: self.path.clone(),
            kind: self.kind,
            config_file: self.config_file.clone(),
            external: self.is_external(),
            dependencies: self
                .dependencies()
                .iter()
                .map(|d| d.path.clone())
                .collect(),
            command: context
                .as_ref()
                .map(|c| c.command.clone())
                .unwrap_or_default(),
            args: context
                .as_ref()
                .map(|c| c.args.clone())
                .unwrap_or_default(),
            ref_name: context.and_then(|c| c.ref_name),
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("external", &self.is_external())
            .finish()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Component {}

impl std::hash::Hash for Component {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// Flat, serializable view of a component for reports and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentRecord {
    pub path: PathBuf,
    pub kind: ComponentKind,
    pub config_file: String,
    pub external: bool,
    pub dependencies: Vec<PathBuf>,
    pub command: String,
    pub args: Vec<String>,
    pub ref_name: Option<String>,
}

/// Classification status of a discovery result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Discovered,
    Candidate,
    Excluded,
}

/// Why a candidate cannot be classified yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidacyReason {
    None,
    RequiresParse,
    GraphTarget,
    PotentialDependent,
}

/// Pipeline phase that emitted a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTag {
    Walker,
    WorktreeDiff,
    Parse,
    Graph,
    Relations,
    Final,
}

/// Envelope carrying a component plus its classification outcome.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub component: Arc<Component>,
    pub status: Status,
    pub reason: CandidacyReason,
    pub graph_index: Option<usize>,
    pub phase: PhaseTag,
}

impl DiscoveryResult {
    pub fn discovered(component: Arc<Component>, phase: PhaseTag) -> Self {
        Self {
            component,
            status: Status::Discovered,
            reason: CandidacyReason::None,
            graph_index: None,
            phase,
        }
    }

    pub fn candidate(
        component: Arc<Component>,
        reason: CandidacyReason,
        graph_index: Option<usize>,
        phase: PhaseTag,
    ) -> Self {
        Self {
            component,
            status: Status::Candidate,
            reason,
            graph_index,
            phase,
        }
    }
}

/// Collected output of one pipeline phase after its channels drain.
#[derive(Debug, Default)]
pub struct PhaseOutput {
    pub discovered: Vec<DiscoveryResult>,
    pub candidates: Vec<DiscoveryResult>,
    pub errors: Vec<crate::error::DiscoveryError>,
}

impl PhaseOutput {
    /// Route a result to the vector its status selects.
    pub fn push(&mut self, result: DiscoveryResult) {
        match result.status {
            Status::Discovered => self.discovered.push(result),
            Status::Candidate => self.candidates.push(result),
            Status::Excluded => {}
        }
    }

    pub fn absorb(&mut self, other: PhaseOutput) {
        self.discovered.extend(other.discovered);
        self.candidates.extend(other.candidates);
        self.errors.extend(other.errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(path: &str) -> Arc<Component> {
        Arc::new(Component::new(
            PathBuf::from(path),
            ComponentKind::Unit,
            UNIT_CONFIG_FILE,
        ))
    }

    #[test]
    fn test_name_is_last_segment() {
        assert_eq!(unit("/tree/apps/api").name(), "api");
    }

    #[test]
    fn test_dependency_edges_are_ordered_unique() {
        let app = unit("/tree/app");
        let db = unit("/tree/db");
        let vpc = unit("/tree/vpc");

        assert!(app.add_dependency(&db));
        assert!(app.add_dependency(&vpc));
        assert!(!app.add_dependency(&db), "duplicate edge must be rejected");

        let deps: Vec<_> = app.dependencies().iter().map(|d| d.name()).collect();
        assert_eq!(deps, vec!["db", "vpc"]);
    }

    #[test]
    fn test_remove_dependency() {
        let app = unit("/tree/app");
        let db = unit("/tree/db");
        app.add_dependency(&db);

        assert!(app.remove_dependency(Path::new("/tree/db")));
        assert!(!app.remove_dependency(Path::new("/tree/db")));
        assert!(app.dependencies().is_empty());
    }

    #[test]
    fn test_inherit_for_graph_clears_ref_and_destroy() {
        let ctx = DiscoveryContext::new(
            PathBuf::from("/tree"),
            "plan",
            &["-destroy".to_string(), "-no-color".to_string()],
        )
        .with_ref("main")
        .with_origin(DiscoveryOrigin::WorktreeDiff);

        let inherited = ctx.inherit_for_graph();
        assert_eq!(inherited.origin, DiscoveryOrigin::GraphExpansion);
        assert!(inherited.ref_name.is_none());
        assert_eq!(inherited.args, vec!["-no-color".to_string()]);
        assert_eq!(inherited.command, "plan");
    }

    #[test]
    fn test_equality_is_by_path() {
        let a = Component::new(
            PathBuf::from("/tree/app"),
            ComponentKind::Unit,
            UNIT_CONFIG_FILE,
        );
        let b = Component::new(
            PathBuf::from("/tree/app"),
            ComponentKind::Stack,
            STACK_CONFIG_FILE,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_attach_config_extends_reading() {
        let app = unit("/tree/app");
        let parsed = ParsedUnit {
            files_read: vec![PathBuf::from("/tree/app/terragrunt.hcl")],
            ..ParsedUnit::default()
        };
        app.attach_config(parsed);
        assert!(app.has_config());
        assert!(app
            .reading()
            .contains(Path::new("/tree/app/terragrunt.hcl")));
    }
}
