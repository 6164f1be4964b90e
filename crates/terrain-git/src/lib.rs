//! Git worktree adapter.
//!
//! Materialises revisions of a repository as detached worktrees under a
//! temporary directory owned by the adapter. The adapter caches one
//! worktree per ref within its lifetime and removes everything on
//! `cleanup`; dropping the adapter releases the directories as a
//! fallback, but callers are expected to clean up explicitly.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, warn};

use terrain_core::worktree::{Worktree, WorktreeProvider};

pub struct GitWorktrees {
    repo_dir: PathBuf,
    base: TempDir,
    materialized: Mutex<Vec<(String, PathBuf)>>,
    counter: AtomicUsize,
}

impl GitWorktrees {
    /// Create an adapter rooted at `repo_dir`, which must lie inside a
    /// git repository.
    pub fn new(repo_dir: &Path) -> Result<Self> {
        let base = TempDir::new().context("failed to create worktree directory")?;
        let adapter = Self {
            repo_dir: repo_dir.to_path_buf(),
            base,
            materialized: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        };
        // Surface "not a repository" at construction rather than on first
        // materialize.
        adapter
            .git(&["rev-parse", "--git-dir"])
            .context("not inside a git repository")?;
        Ok(adapter)
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .args(args)
            .output()
            .context("failed to spawn git")?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WorktreeProvider for GitWorktrees {
    fn materialize(&self, ref_name: &str) -> Result<Worktree> {
        {
            let materialized = self.materialized.lock();
            if let Some((_, root)) = materialized.iter().find(|(r, _)| r == ref_name) {
                return Ok(Worktree {
                    root: root.clone(),
                    ref_name: ref_name.to_string(),
                });
            }
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        let root = self.base.path().join(format!("wt-{index}"));
        let root_str = root.to_string_lossy().into_owned();
        self.git(&["worktree", "add", "--detach", &root_str, ref_name])
            .with_context(|| format!("failed to materialize worktree for `{ref_name}`"))?;
        debug!(ref_name, root = %root.display(), "materialized worktree");

        self.materialized
            .lock()
            .push((ref_name.to_string(), root.clone()));
        Ok(Worktree {
            root,
            ref_name: ref_name.to_string(),
        })
    }

    fn cleanup(&self) -> Result<()> {
        let mut failed = Vec::new();
        for (ref_name, root) in self.materialized.lock().drain(..) {
            let root_str = root.to_string_lossy().into_owned();
            if let Err(err) = self.git(&["worktree", "remove", "--force", &root_str]) {
                warn!(ref_name, error = %err, "failed to remove worktree");
                failed.push(ref_name);
            }
        }
        // Clear metadata for anything that slipped through.
        let _ = self.git(&["worktree", "prune"]);
        if failed.is_empty() {
            Ok(())
        } else {
            bail!("failed to remove worktrees for: {}", failed.join(", "))
        }
    }
}

impl Drop for GitWorktrees {
    fn drop(&mut self) {
        if !self.materialized.lock().is_empty() {
            let _ = self.cleanup();
        }
    }
}
