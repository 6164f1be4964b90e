use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::component::Component;

/// Group components into run levels: every component's dependencies sit
/// in an earlier level, so the levels can execute in sequence with full
/// parallelism inside each one.
///
/// Edges to components outside `components` (externals, filtered-out
/// units) don't constrain ordering. The relation is expected to be
/// acyclic; any leftover cycle members are appended as a trailing level
/// so no component is silently lost.
pub fn run_levels(components: &[Arc<Component>]) -> Vec<Vec<Arc<Component>>> {
    let index: HashMap<PathBuf, usize> = components
        .iter()
        .enumerate()
        .map(|(i, c)| (c.path().to_path_buf(), i))
        .collect();

    // In-set dependency counts and reverse adjacency.
    let mut pending: Vec<usize> = vec![0; components.len()];
    let mut dependents_of: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
    for (i, component) in components.iter().enumerate() {
        for dep in component.dependencies() {
            if let Some(&j) = index.get(&dep.path().to_path_buf()) {
                pending[i] += 1;
                dependents_of[j].push(i);
            }
        }
    }

    let mut placed = vec![false; components.len()];
    let mut levels: Vec<Vec<Arc<Component>>> = Vec::new();
    let mut ready: Vec<usize> = (0..components.len())
        .filter(|&i| pending[i] == 0)
        .collect();

    while !ready.is_empty() {
        ready.sort_by(|&a, &b| components[a].path().cmp(components[b].path()));
        let mut next = Vec::new();
        let mut level = Vec::with_capacity(ready.len());
        for &i in &ready {
            placed[i] = true;
            level.push(Arc::clone(&components[i]));
            for &dependent in &dependents_of[i] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        levels.push(level);
        ready = next;
    }

    let leftovers: Vec<Arc<Component>> = components
        .iter()
        .enumerate()
        .filter(|(i, _)| !placed[*i])
        .map(|(_, c)| Arc::clone(c))
        .collect();
    if !leftovers.is_empty() {
        levels.push(leftovers);
    }
    levels
}
