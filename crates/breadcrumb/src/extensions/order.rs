//! Dependency ordering.

use std::collections::{BTreeMap, HashSet};

use super::types::ExtensionInfo;

/// Order `extensions` so every extension comes after the dependencies it
/// declares. Depth-first post-order; dependencies that are not in the map are
/// skipped, and a cycle is broken at the first extension revisited.
pub fn dependency_order(extensions: &BTreeMap<String, ExtensionInfo>) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(extensions.len());
    for id in extensions.keys() {
        visit(id, extensions, &mut visited, &mut order);
    }
    order
}

fn visit(
    id: &str,
    extensions: &BTreeMap<String, ExtensionInfo>,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
) {
    let Some(info) = extensions.get(id) else {
        return;
    };
    if !visited.insert(id.to_string()) {
        return;
    }
    for dep in &info.manifest.dependencies {
        visit(dep, extensions, visited, order);
    }
    order.push(id.to_string());
}
