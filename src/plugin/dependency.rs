use std::collections::{HashMap, HashSet};

use semver::Version;

use crate::error::{PluginError, Result};
use crate::plugin::manifest::{PluginDescriptor, PluginId};

/// Orders `descriptors` so every required dependency precedes its
/// dependents.
///
/// Iterative depth-first post-order over required edges; a back edge is a
/// cycle. A required dependency outside `descriptors` is an error naming
/// both plugins.
pub fn dependency_order(descriptors: &[&PluginDescriptor]) -> Result<Vec<PluginId>> {
    let index: HashMap<&PluginId, &PluginDescriptor> = descriptors
        .iter()
        .map(|&descriptor| (&descriptor.id, descriptor))
        .collect();

    let mut done: HashSet<&PluginId> = HashSet::new();
    let mut in_progress: HashSet<&PluginId> = HashSet::new();
    let mut order = Vec::with_capacity(descriptors.len());

    for &root in descriptors {
        if done.contains(&root.id) {
            continue;
        }

        in_progress.insert(&root.id);
        let mut stack: Vec<(&PluginDescriptor, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let Some(dependency) = node.dependencies.get(frame.1) else {
                in_progress.remove(&node.id);
                done.insert(&node.id);
                order.push(node.id.clone());
                stack.pop();
                continue;
            };
            frame.1 += 1;

            if dependency.optional || done.contains(&dependency.id) {
                continue;
            }
            if in_progress.contains(&dependency.id) {
                return Err(PluginError::Cycle {
                    plugin: dependency.id.clone(),
                });
            }

            let Some(&child) = index.get(&dependency.id) else {
                return Err(PluginError::dependency(
                    &node.id,
                    format!("requires {} which is not available", dependency.id),
                ));
            };
            in_progress.insert(&child.id);
            stack.push((child, 0));
        }
    }

    Ok(order)
}

/// Checks every required dependency of `descriptor` against installed
/// versions. Optional dependencies never fail, even on a version mismatch.
pub fn check_dependencies<F>(descriptor: &PluginDescriptor, installed: F) -> (bool, Vec<String>)
where
    F: Fn(&PluginId) -> Option<Version>,
{
    let mut missing = Vec::new();

    for dependency in descriptor.required_dependencies() {
        match installed(&dependency.id) {
            None => missing.push(format!(
                "{} (required by {}) is not installed",
                dependency.id, descriptor.id
            )),
            Some(version) if !dependency.version.matches(&version) => missing.push(format!(
                "{} (required by {}) requires {} but found {version}",
                dependency.id, descriptor.id, dependency.version
            )),
            Some(_) => {}
        }
    }

    (missing.is_empty(), missing)
}
