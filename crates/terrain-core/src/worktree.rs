use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::classify::Classifier;
use crate::component::{
    ComponentKind, DiscoveryContext, DiscoveryOrigin, DiscoveryResult, PhaseOutput, PhaseTag,
};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::filter::GitRange;
use crate::registry::ComponentRegistry;
use crate::walker;

/// Sentinel appended to the context args of removed components so
/// downstream execution tears the resources down.
pub const DESTROY_ARG: &str = "-destroy";

/// Commands the git filter may run under.
const GIT_FILTER_COMMANDS: &[&str] = &["plan", "apply", "show", ""];

/// A materialised checkout of one revision.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub root: PathBuf,
    /// Empty when the worktree is the live working tree.
    pub ref_name: String,
}

/// Version-control adapter collaborator.
///
/// The adapter owns the temporary directories it materialises; callers
/// MUST issue `cleanup` once the discovered components are no longer
/// needed.
pub trait WorktreeProvider: Send + Sync {
    fn materialize(&self, ref_name: &str) -> Result<Worktree>;
    fn cleanup(&self) -> Result<()>;
}

struct ConfigHit {
    dir: PathBuf,
    basename: String,
    kind: ComponentKind,
}

enum Change<'a> {
    Added(&'a ConfigHit),
    Removed(&'a ConfigHit),
    Modified(&'a ConfigHit),
}

/// Worktree differ phase: for each git range, walk both revisions with
/// the filesystem walker's rules and emit a `Discovered` result for every
/// component added, removed, or modified between them.
pub(crate) fn run(
    cfg: &DiscoveryConfig,
    classifier: &Classifier,
    registry: &ComponentRegistry,
    provider: &dyn WorktreeProvider,
    cancel: &CancelToken,
) -> Result<PhaseOutput, DiscoveryError> {
    let ranges = classifier.git_ranges();
    let mut output = PhaseOutput::default();
    if ranges.is_empty() {
        return Ok(output);
    }
    if !GIT_FILTER_COMMANDS.contains(&cfg.command.as_str()) {
        return Err(DiscoveryError::UnsupportedCommandForGitFilter {
            command: cfg.command.clone(),
        });
    }

    for range in ranges {
        if cancel.is_cancelled() {
            output.errors.push(DiscoveryError::Cancelled);
            break;
        }
        diff_range(cfg, registry, range, provider, &mut output)?;
    }
    Ok(output)
}

fn diff_range(
    cfg: &DiscoveryConfig,
    registry: &ComponentRegistry,
    range: &GitRange,
    provider: &dyn WorktreeProvider,
    output: &mut PhaseOutput,
) -> Result<(), DiscoveryError> {
    let from_wt = provider
        .materialize(&range.from_ref)
        .map_err(|source| DiscoveryError::Worktree {
            ref_name: range.from_ref.clone(),
            source,
        })?;
    let to_wt = match &range.to_ref {
        Some(to_ref) => {
            provider
                .materialize(to_ref)
                .map_err(|source| DiscoveryError::Worktree {
                    ref_name: to_ref.clone(),
                    source,
                })?
        }
        // An open-ended range compares against the live working tree.
        None => Worktree {
            root: cfg.working_dir.clone(),
            ref_name: String::new(),
        },
    };

    let from_map = index_by_rel(&from_wt.root, walker::collect_config_files(&from_wt.root, cfg)?, cfg);
    let to_map = index_by_rel(&to_wt.root, walker::collect_config_files(&to_wt.root, cfg)?, cfg);

    let mut changes: Vec<Change> = Vec::new();
    let mut common: Vec<(&ConfigHit, &ConfigHit)> = Vec::new();

    for (rel, to_hit) in &to_map {
        match from_map.get(rel) {
            None => changes.push(Change::Added(to_hit)),
            Some(from_hit) => common.push((from_hit, to_hit)),
        }
    }
    for (rel, from_hit) in &from_map {
        if !to_map.contains_key(rel) {
            changes.push(Change::Removed(from_hit));
        }
    }

    // Fingerprint the surviving pairs in parallel; a differing pair is a
    // modification.
    let compared: Vec<Result<Option<&ConfigHit>, DiscoveryError>> = common
        .par_iter()
        .map(|(from_hit, to_hit)| {
            let from_print =
                fingerprint_dir(&from_hit.dir).map_err(|source| DiscoveryError::Walk {
                    path: from_hit.dir.clone(),
                    source,
                })?;
            let to_print = fingerprint_dir(&to_hit.dir).map_err(|source| DiscoveryError::Walk {
                path: to_hit.dir.clone(),
                source,
            })?;
            Ok((from_print != to_print).then_some(*to_hit))
        })
        .collect();
    for outcome in compared {
        match outcome {
            Ok(Some(to_hit)) => changes.push(Change::Modified(to_hit)),
            Ok(None) => {}
            Err(err) => output.errors.push(err),
        }
    }

    debug!(
        from = %range.from_ref,
        to = range.to_ref.as_deref().unwrap_or("<worktree>"),
        changed = changes.len(),
        "worktree diff finished"
    );

    for change in changes {
        let (hit, worktree, args) = match change {
            Change::Added(hit) | Change::Modified(hit) => (hit, &to_wt, cfg.args.clone()),
            Change::Removed(hit) => {
                let mut args = cfg.args.clone();
                if cfg.command == "plan" || cfg.command == "apply" {
                    if args.iter().any(|a| a == DESTROY_ARG) {
                        return Err(DiscoveryError::CommandConflict {
                            argument: DESTROY_ARG.to_string(),
                        });
                    }
                    args.push(DESTROY_ARG.to_string());
                }
                (hit, &from_wt, args)
            }
        };

        let (component, _) = registry.ensure(&hit.dir, hit.kind, &hit.basename);
        let mut context = DiscoveryContext::new(worktree.root.clone(), &cfg.command, &args)
            .with_origin(DiscoveryOrigin::WorktreeDiff);
        if !worktree.ref_name.is_empty() {
            context = context.with_ref(&worktree.ref_name);
        }
        // The differ knows more about this path than the walker; its
        // context wins even when the walker created the component first.
        component.set_context(context);
        output.push(DiscoveryResult::discovered(component, PhaseTag::WorktreeDiff));
    }
    Ok(())
}

fn index_by_rel(
    root: &Path,
    files: Vec<PathBuf>,
    cfg: &DiscoveryConfig,
) -> BTreeMap<PathBuf, ConfigHit> {
    let mut map = BTreeMap::new();
    for file in files {
        let Some(dir) = file.parent() else { continue };
        let Ok(rel) = dir.strip_prefix(root) else { continue };
        let basename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(kind) = cfg.kind_for(&basename) else {
            continue;
        };
        map.insert(
            rel.to_path_buf(),
            ConfigHit {
                dir: dir.to_path_buf(),
                basename,
                kind,
            },
        );
    }
    map
}

/// Content fingerprint of a component directory: a sha256 over the names
/// and bytes of its directly co-located regular files, in name order.
fn fingerprint_dir(dir: &Path) -> Result<[u8; 32]> {
    let mut entries: Vec<(String, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (name, path) in entries {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(&path)?);
        hasher.update([0u8]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;

    struct StubProvider {
        worktrees: Mutex<BTreeMap<String, PathBuf>>,
    }

    impl StubProvider {
        fn new(refs: &[(&str, &Path)]) -> Self {
            let worktrees = refs
                .iter()
                .map(|(name, path)| (name.to_string(), path.to_path_buf()))
                .collect();
            Self {
                worktrees: Mutex::new(worktrees),
            }
        }
    }

    impl WorktreeProvider for StubProvider {
        fn materialize(&self, ref_name: &str) -> Result<Worktree> {
            let worktrees = self.worktrees.lock();
            let root = worktrees
                .get(ref_name)
                .ok_or_else(|| anyhow::anyhow!("unknown ref {ref_name}"))?;
            Ok(Worktree {
                root: root.clone(),
                ref_name: ref_name.to_string(),
            })
        }

        fn cleanup(&self) -> Result<()> {
            Ok(())
        }
    }

    fn write_unit(root: &Path, rel: &str, content: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("terragrunt.hcl"), content).unwrap();
    }

    fn setup(command: &str, args: &[&str]) -> (TempDir, TempDir, DiscoveryConfig) {
        let r0 = TempDir::new().unwrap();
        let r1 = TempDir::new().unwrap();
        // `cache` exists only in r0, `new` only in r1, `app` is modified.
        write_unit(r0.path(), "cache", "# v1\n");
        write_unit(r0.path(), "app", "# v1\n");
        write_unit(r1.path(), "new", "# v1\n");
        write_unit(r1.path(), "app", "# v2\n");
        write_unit(r0.path(), "same", "# same\n");
        write_unit(r1.path(), "same", "# same\n");

        let cfg = DiscoveryConfig::new(r1.path())
            .with_query("[R0...R1]")
            .unwrap()
            .with_command(command, args.iter().map(|s| s.to_string()).collect());
        (r0, r1, cfg)
    }

    fn run_diff(
        cfg: &DiscoveryConfig,
        provider: &StubProvider,
    ) -> Result<PhaseOutput, DiscoveryError> {
        let classifier = Classifier::analyze(&cfg.filters, &cfg.working_dir).unwrap();
        let registry = ComponentRegistry::new();
        run(cfg, &classifier, &registry, provider, &CancelToken::new())
    }

    #[test]
    fn test_diff_reports_added_removed_modified() {
        let (r0, r1, cfg) = setup("plan", &[]);
        let provider = StubProvider::new(&[("R0", r0.path()), ("R1", r1.path())]);

        let output = run_diff(&cfg, &provider).unwrap();
        assert!(output.errors.is_empty());
        assert_eq!(output.discovered.len(), 3, "same must not be reported");

        let mut names: Vec<String> = output
            .discovered
            .iter()
            .map(|r| r.component.name())
            .collect();
        names.sort();
        assert_eq!(names, vec!["app", "cache", "new"]);
    }

    #[test]
    fn test_removed_component_gets_destroy_arg_and_from_ref() {
        let (r0, r1, cfg) = setup("plan", &["-no-color"]);
        let provider = StubProvider::new(&[("R0", r0.path()), ("R1", r1.path())]);

        let output = run_diff(&cfg, &provider).unwrap();
        for result in &output.discovered {
            let ctx = result.component.context().unwrap();
            if result.component.name() == "cache" {
                assert!(ctx.args.iter().any(|a| a == DESTROY_ARG));
                assert_eq!(ctx.ref_name.as_deref(), Some("R0"));
            } else {
                assert!(!ctx.args.iter().any(|a| a == DESTROY_ARG));
                assert_eq!(ctx.ref_name.as_deref(), Some("R1"));
            }
            assert_eq!(ctx.origin, DiscoveryOrigin::WorktreeDiff);
        }
    }

    #[test]
    fn test_show_command_never_appends_destroy() {
        let (r0, r1, cfg) = setup("show", &[]);
        let provider = StubProvider::new(&[("R0", r0.path()), ("R1", r1.path())]);

        let output = run_diff(&cfg, &provider).unwrap();
        let removed = output
            .discovered
            .iter()
            .find(|r| r.component.name() == "cache")
            .unwrap();
        let ctx = removed.component.context().unwrap();
        assert!(!ctx.args.iter().any(|a| a == DESTROY_ARG));
    }

    #[test]
    fn test_caller_supplied_destroy_conflicts() {
        let (r0, r1, cfg) = setup("plan", &[DESTROY_ARG]);
        let provider = StubProvider::new(&[("R0", r0.path()), ("R1", r1.path())]);

        let result = run_diff(&cfg, &provider);
        assert!(matches!(result, Err(DiscoveryError::CommandConflict { .. })));
    }

    #[test]
    fn test_unsupported_command_fails() {
        let (r0, r1, cfg) = setup("destroy", &[]);
        let provider = StubProvider::new(&[("R0", r0.path()), ("R1", r1.path())]);

        let result = run_diff(&cfg, &provider);
        assert!(matches!(
            result,
            Err(DiscoveryError::UnsupportedCommandForGitFilter { .. })
        ));
    }

    #[test]
    fn test_open_range_compares_against_working_tree() {
        let r0 = TempDir::new().unwrap();
        let live = TempDir::new().unwrap();
        write_unit(r0.path(), "app", "# old\n");
        write_unit(live.path(), "app", "# new\n");

        let cfg = DiscoveryConfig::new(live.path())
            .with_query("[R0]")
            .unwrap()
            .with_command("plan", Vec::new());
        let provider = StubProvider::new(&[("R0", r0.path())]);

        let output = run_diff(&cfg, &provider).unwrap();
        assert_eq!(output.discovered.len(), 1);
        let ctx = output.discovered[0].component.context().unwrap();
        assert_eq!(ctx.ref_name, None, "live tree carries no ref");
    }

    #[test]
    fn test_fingerprint_covers_co_located_files() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("terragrunt.hcl"), "# same\n").unwrap();
        fs::write(b.path().join("terragrunt.hcl"), "# same\n").unwrap();
        assert_eq!(
            fingerprint_dir(a.path()).unwrap(),
            fingerprint_dir(b.path()).unwrap()
        );

        fs::write(b.path().join("extra.tfvars"), "x = 1\n").unwrap();
        assert_ne!(
            fingerprint_dir(a.path()).unwrap(),
            fingerprint_dir(b.path()).unwrap()
        );
    }
}
