//! Wave-based topological sorting.

use std::hash::Hash;

use fxhash::{FxHashMap, FxHashSet};

/// Raised when a dependency map cannot be fully ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError<T: Eq + Hash> {
    /// Nodes left with nonempty dependency sets, and those dependencies.
    pub residual: FxHashMap<T, FxHashSet<T>>,
}

/// Orders `dependencies` (node -> the nodes it depends on) into waves.
///
/// Each wave holds the nodes whose dependencies were all emitted by earlier
/// waves. Nodes that only appear as dependencies are treated as having none,
/// and self-dependencies are ignored. Wave contents are unordered; callers
/// impose their own order within a wave.
///
/// # Errors
///
/// Returns [`CycleError`] with the unresolved remainder if a cycle prevents
/// any further wave from being extracted.
pub fn toposort<T>(dependencies: &FxHashMap<T, FxHashSet<T>>) -> Result<Vec<Vec<T>>, CycleError<T>>
where
    T: Eq + Hash + Clone,
{
    let mut remaining: FxHashMap<T, FxHashSet<T>> = dependencies
        .iter()
        .map(|(node, deps)| {
            let deps = deps.iter().filter(|d| *d != node).cloned().collect();
            (node.clone(), deps)
        })
        .collect();
    for deps in dependencies.values() {
        for dep in deps {
            remaining.entry(dep.clone()).or_default();
        }
    }

    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let wave: Vec<T> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(node, _)| node.clone())
            .collect();
        if wave.is_empty() {
            return Err(CycleError {
                residual: remaining,
            });
        }
        for node in &wave {
            remaining.remove(node);
        }
        for deps in remaining.values_mut() {
            for node in &wave {
                deps.remove(node);
            }
        }
        waves.push(wave);
    }
    Ok(waves)
}
