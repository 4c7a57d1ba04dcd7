use std::collections::{HashSet, VecDeque};

use petgraph::Direction;

use crate::error::{ArchiveError, Warning};
use crate::graph::{DependencyGraph, NodeSet};

/// Node classes which write deliverables and are archived by default.
pub const WRITE_CLASSES: &[&str] = &["Write", "WriteGeo", "DeepWrite"];

pub fn is_write_class(class: &str) -> bool {
    WRITE_CLASSES.contains(&class)
}

/// Picks the output nodes whose closure is archived.
///
/// Explicitly named targets win; names not present in the graph are reported
/// and dropped. Without explicit names, every enabled write node is a target.
pub fn discover_targets(nodes: &NodeSet, explicit: &[String]) -> Result<(Vec<String>, Vec<Warning>), ArchiveError> {
    let mut warnings = Vec::new();

    let targets: Vec<String> = if explicit.is_empty() {
        nodes
            .iter()
            .filter(|n| is_write_class(&n.class) && !n.is_disabled())
            .map(|n| n.name.clone())
            .collect()
    } else {
        let mut seen = HashSet::new();
        explicit
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .filter(|name| {
                let known = nodes.contains(name);
                if !known {
                    tracing::warn!(node = %name, "unknown target node");
                    warnings.push(Warning::UnknownTarget(name.to_string()));
                }
                known
            })
            .cloned()
            .collect()
    };

    if targets.is_empty() {
        return Err(ArchiveError::NoTargetsFound);
    }

    tracing::info!(targets = ?targets, "archiving targets");
    Ok((targets, warnings))
}

/// Computes the minimal node set needed to produce `targets`.
///
/// Every node feeding a kept node (through an input or a knob reference) is
/// kept, followed by every backdrop overlapping a kept node. The result keeps
/// the declaration order of `nodes`.
pub fn prune(nodes: &NodeSet, targets: &[String]) -> Result<NodeSet, ArchiveError> {
    let deps = DependencyGraph::build(nodes);

    let mut queue: VecDeque<_> = targets.iter().filter_map(|t| deps.index_of(t)).collect();
    if queue.is_empty() {
        return Err(ArchiveError::NoTargetsFound);
    }

    // each node is visited once, so cycles terminate
    let mut kept: HashSet<usize> = HashSet::with_capacity(nodes.len());
    let mut visited: HashSet<_> = queue.iter().copied().collect();

    while let Some(index) = queue.pop_front() {
        kept.insert(deps.position(index));
        for producer in deps.graph.neighbors_directed(index, Direction::Incoming) {
            if visited.insert(producer) {
                queue.push_back(producer);
            }
        }
    }

    let all: Vec<_> = nodes.iter().collect();
    let regions: Vec<_> = kept
        .iter()
        .map(|&i| all[i])
        .filter(|n| !n.is_backdrop())
        .map(|n| n.region)
        .collect();

    let backdrops: Vec<usize> = all
        .iter()
        .enumerate()
        .filter(|(i, n)| n.is_backdrop() && !kept.contains(i))
        .filter(|(_, n)| regions.iter().any(|r| n.region.intersects(r)))
        .map(|(i, _)| i)
        .collect();
    kept.extend(backdrops);

    tracing::info!(kept = kept.len(), total = nodes.len(), "pruned graph");

    Ok(all
        .into_iter()
        .enumerate()
        .filter(|(i, _)| kept.contains(i))
        .map(|(_, n)| n.clone())
        .collect())
}
