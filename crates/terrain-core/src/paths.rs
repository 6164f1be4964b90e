use std::path::{Component as PathSegment, Path, PathBuf};

/// Canonicalize a path, resolving symlinks when the path exists on disk.
///
/// Paths that do not exist (external dependency targets, removed worktree
/// entries) are normalized lexically instead: `.` segments dropped, `..`
/// segments folded into their parent where possible.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(_) => normalize_lexically(path),
    }
}

/// Fold `.` and `..` segments without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for segment in path.components() {
        match segment {
            PathSegment::CurDir => {}
            PathSegment::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Relative path of `path` under `base`, rendered with forward slashes for
/// glob matching. Returns `None` when `path` is not under `base`.
pub fn relative_for_match(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let rendered = rel.to_string_lossy().replace('\\', "/");
    if rendered.is_empty() {
        Some(".".to_string())
    } else {
        Some(rendered)
    }
}

/// True when `path` ends with the same trailing segments as `suffix`.
///
/// Used to correlate a worktree-scoped component with its in-tree
/// counterpart: both describe the same logical unit when their paths agree
/// relative to their respective roots.
pub fn has_relative_suffix(path: &Path, suffix: &Path) -> bool {
    let path_segments: Vec<_> = path.components().collect();
    let suffix_segments: Vec<_> = suffix.components().collect();
    if suffix_segments.is_empty() || suffix_segments.len() > path_segments.len() {
        return false;
    }
    path_segments[path_segments.len() - suffix_segments.len()..] == suffix_segments[..]
}
