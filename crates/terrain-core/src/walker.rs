use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{bounded, never};
use parking_lot::Mutex;
use tracing::debug;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::classify::{decision_to_result, Classifier, ClassifyCtx};
use crate::component::{DiscoveryContext, PhaseOutput, PhaseTag};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::pool::CHANNEL_CAP;
use crate::registry::ComponentRegistry;

/// Directories never descended into.
pub const IGNORABLE_DIRS: &[&str] = &[".git", ".terraform", ".terragrunt-cache"];

/// Whether a directory name is skipped during walking. `.` and `..` are
/// literal names, not hidden directories.
pub(crate) fn should_skip_dir(name: &str, include_hidden: bool) -> bool {
    if IGNORABLE_DIRS.contains(&name) {
        return true;
    }
    !include_hidden && name.starts_with('.') && name != "." && name != ".."
}

fn config_walker(root: &std::path::Path, cfg: &DiscoveryConfig) -> walkdir::IntoIter {
    WalkDir::new(root)
        .follow_links(cfg.follow_symlinks)
        .into_iter()
}

fn keep_entry(entry: &walkdir::DirEntry, cfg: &DiscoveryConfig) -> bool {
    !(entry.depth() > 0
        && entry.file_type().is_dir()
        && should_skip_dir(&entry.file_name().to_string_lossy(), cfg.include_hidden))
}

/// Sequential enumeration of recognised configuration files under `root`,
/// applying the walker's skip rules. Used by the worktree differ.
pub(crate) fn collect_config_files(
    root: &std::path::Path,
    cfg: &DiscoveryConfig,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let mut files = Vec::new();
    for entry in config_walker(root, cfg).filter_entry(|e| keep_entry(e, cfg)) {
        let entry = entry.map_err(|err| DiscoveryError::Walk {
            path: root.to_path_buf(),
            source: err.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if cfg.kind_for(entry.file_name().to_string_lossy().as_ref()).is_some() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Filesystem walking phase.
///
/// One producer thread enumerates configuration files into a bounded
/// channel; worker threads classify each match and route the result. The
/// producer closes the path channel on exit, workers close the result
/// channels, and the calling thread drains them to completion.
pub(crate) fn run(
    cfg: &DiscoveryConfig,
    classifier: &Classifier,
    registry: &ComponentRegistry,
    cancel: &CancelToken,
) -> Result<PhaseOutput, DiscoveryError> {
    if !cfg.working_dir.is_dir() {
        return Err(DiscoveryError::Walk {
            path: cfg.working_dir.clone(),
            source: anyhow::anyhow!("not a directory"),
        });
    }

    let fatal: Mutex<Option<DiscoveryError>> = Mutex::new(None);
    let mut output = PhaseOutput::default();

    thread::scope(|scope| {
        let (path_tx, path_rx) = bounded::<PathBuf>(CHANNEL_CAP);
        let (result_tx, result_rx) = bounded(CHANNEL_CAP);
        let (error_tx, error_rx) = bounded(CHANNEL_CAP);

        {
            let cancel = cancel.clone();
            let fatal = &fatal;
            scope.spawn(move || {
                for entry in config_walker(&cfg.working_dir, cfg)
                    .filter_entry(|e| keep_entry(e, cfg))
                {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match entry {
                        Ok(entry) => {
                            if !entry.file_type().is_file() {
                                continue;
                            }
                            let name = entry.file_name().to_string_lossy();
                            if cfg.kind_for(name.as_ref()).is_none() {
                                continue;
                            }
                            if path_tx.send(entry.into_path()).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            *fatal.lock() = Some(DiscoveryError::Walk {
                                path: cfg.working_dir.clone(),
                                source: err.into(),
                            });
                            break;
                        }
                    }
                }
            });
        }

        for _ in 0..cfg.workers {
            let path_rx = path_rx.clone();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                for file in path_rx.iter() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(dir) = file.parent() else {
                        continue;
                    };
                    let name = file.file_name().unwrap_or_default().to_string_lossy();
                    let Some(kind) = cfg.kind_for(name.as_ref()) else {
                        continue;
                    };
                    let (component, created) = registry.ensure(dir, kind, name.as_ref());
                    if !created {
                        // Another worker or the concurrently-running
                        // differ already owns this path.
                        continue;
                    }
                    component.set_context_if_absent(DiscoveryContext::new(
                        cfg.working_dir.clone(),
                        &cfg.command,
                        &cfg.args,
                    ));
                    match classifier.classify(&component, ClassifyCtx::default()) {
                        Ok(decision) => {
                            if let Some(result) =
                                decision_to_result(component, decision, PhaseTag::Walker)
                            {
                                if result_tx.send(result).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            if error_tx.send(err).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        drop(path_rx);
        drop(result_tx);
        drop(error_tx);

        let mut result_rx = result_rx;
        let mut error_rx = error_rx;
        let mut open = 2;
        while open > 0 {
            crossbeam_channel::select! {
                recv(result_rx) -> msg => match msg {
                    Ok(result) => output.push(result),
                    Err(_) => { result_rx = never(); open -= 1; }
                },
                recv(error_rx) -> msg => match msg {
                    Ok(err) => output.errors.push(err),
                    Err(_) => { error_rx = never(); open -= 1; }
                },
            }
        }
    });

    if let Some(err) = fatal.into_inner() {
        return Err(err);
    }
    debug!(
        discovered = output.discovered.len(),
        candidates = output.candidates.len(),
        errors = output.errors.len(),
        "filesystem walk finished"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Status;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_unit(root: &Path, rel: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("terragrunt.hcl"), "# unit\n").unwrap();
    }

    fn run_walk(root: &Path, query: &str, include_hidden: bool) -> PhaseOutput {
        let mut cfg = DiscoveryConfig::new(root).with_query(query).unwrap();
        cfg.include_hidden = include_hidden;
        let classifier = Classifier::analyze(&cfg.filters, &cfg.working_dir).unwrap();
        let registry = ComponentRegistry::new();
        run(&cfg, &classifier, &registry, &CancelToken::new()).unwrap()
    }

    #[test]
    fn test_should_skip_dir() {
        assert!(should_skip_dir(".git", true));
        assert!(should_skip_dir(".terraform", true));
        assert!(should_skip_dir(".terragrunt-cache", true));
        assert!(should_skip_dir(".hidden", false));
        assert!(!should_skip_dir(".hidden", true));
        assert!(!should_skip_dir("visible", false));
        assert!(!should_skip_dir(".", false));
        assert!(!should_skip_dir("..", false));
    }

    #[test]
    fn test_walk_finds_units_and_stacks() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "vpc");
        write_unit(tmp.path(), "apps/api");
        let stack_dir = tmp.path().join("platform");
        fs::create_dir_all(&stack_dir).unwrap();
        fs::write(stack_dir.join("terragrunt.stack.hcl"), "# stack\n").unwrap();

        let output = run_walk(tmp.path(), "", false);
        assert_eq!(output.discovered.len(), 3);
        assert!(output.candidates.is_empty());
        assert!(output.errors.is_empty());
    }

    #[test]
    fn test_walk_skips_ignorable_and_hidden_dirs() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "vpc");
        write_unit(tmp.path(), ".terragrunt-cache/cached");
        write_unit(tmp.path(), ".hidden/unit");

        let output = run_walk(tmp.path(), "", false);
        let names: Vec<String> = output
            .discovered
            .iter()
            .map(|r| r.component.name())
            .collect();
        assert_eq!(names, vec!["vpc".to_string()]);

        let output = run_walk(tmp.path(), "", true);
        assert_eq!(output.discovered.len(), 2, "hidden included, cache still skipped");
    }

    #[test]
    fn test_walk_classifies_with_filter() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "tools/lint");
        write_unit(tmp.path(), "apps/api");

        let output = run_walk(tmp.path(), "./tools/*", false);
        assert_eq!(output.discovered.len(), 1);
        assert_eq!(output.discovered[0].component.name(), "lint");
        assert_eq!(output.discovered[0].status, Status::Discovered);
    }

    #[test]
    fn test_walk_missing_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        let cfg = DiscoveryConfig::new(&missing);
        let classifier = Classifier::analyze(&[], &cfg.working_dir).unwrap();
        let registry = ComponentRegistry::new();
        let result = run(&cfg, &classifier, &registry, &CancelToken::new());
        assert!(matches!(result, Err(DiscoveryError::Walk { .. })));
    }

    #[test]
    fn test_walk_is_idempotent_against_static_tree() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "vpc");
        write_unit(tmp.path(), "db");

        let first = run_walk(tmp.path(), "", false);
        let second = run_walk(tmp.path(), "", false);
        let mut a: Vec<_> = first.discovered.iter().map(|r| r.component.path().to_path_buf()).collect();
        let mut b: Vec<_> = second.discovered.iter().map(|r| r.component.path().to_path_buf()).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }
}
