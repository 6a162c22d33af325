//! # routing
//!
//! why: let nodes that are not direct neighbors still reach each other
//! relations: owned by network.rs, fed by routing announcements, read by peer.rs
//! what: symmetric edge-cost graph with all-pairs shortest paths (bellman-ford)

use std::collections::{BTreeMap, BTreeSet};

use crate::NodeId;

/// Best known way from one node to another
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPath {
    pub cost: f64,
    /// Nodes directly before the destination on some cheapest path
    pub predecessors: BTreeSet<NodeId>,
}

/// Mesh topology and the shortest paths derived from it.
///
/// Paths are recomputed from scratch after every change, so the result
/// depends only on the current edge set and never on update order.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    table: BTreeMap<NodeId, BTreeMap<NodeId, f64>>,
    shortest_paths: BTreeMap<NodeId, BTreeMap<NodeId, RoutingPath>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `node`'s edges (both directions) and recompute
    pub fn update(&mut self, node: NodeId, neighbor_costs: &BTreeMap<NodeId, f64>) {
        self.table.entry(node).or_default();
        for (&neighbor, &cost) in neighbor_costs {
            if neighbor == node {
                continue;
            }
            self.table.entry(node).or_default().insert(neighbor, cost);
            self.table.entry(neighbor).or_default().insert(node, cost);
        }
        self.recompute();
    }

    /// Make `node`'s row exactly `neighbor_costs`, dropping edges it no longer reports
    pub fn replace_row(&mut self, node: NodeId, neighbor_costs: &BTreeMap<NodeId, f64>) {
        let stale: Vec<NodeId> = self
            .table
            .get(&node)
            .map(|row| row.keys().filter(|n| !neighbor_costs.contains_key(n)).copied().collect())
            .unwrap_or_default();
        for neighbor in stale {
            self.unlink(node, neighbor);
        }
        self.update(node, neighbor_costs);
    }

    pub fn remove_edge(&mut self, a: NodeId, b: NodeId) {
        self.unlink(a, b);
        self.recompute();
    }

    /// Drop the edge and any node left without edges
    fn unlink(&mut self, a: NodeId, b: NodeId) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(row) = self.table.get_mut(&from) {
                row.remove(&to);
                if row.is_empty() {
                    self.table.remove(&from);
                }
            }
        }
    }

    fn recompute(&mut self) {
        let size = self.table.len();
        self.shortest_paths.clear();

        for &source in self.table.keys() {
            let mut distances: BTreeMap<NodeId, f64> = self.table.keys().map(|n| (*n, f64::INFINITY)).collect();
            let mut predecessors: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
            distances.insert(source, 0.0);

            for _ in 1..size {
                for (&from, row) in &self.table {
                    let base = distances[&from];
                    if base.is_infinite() {
                        continue;
                    }
                    for (&to, &cost) in row {
                        let candidate = base + cost;
                        let current = distances[&to];
                        if candidate < current {
                            distances.insert(to, candidate);
                            predecessors.insert(to, BTreeSet::from([from]));
                        } else if candidate == current && to != source {
                            predecessors.entry(to).or_default().insert(from);
                        }
                    }
                }
            }

            let paths = distances
                .into_iter()
                .map(|(to, cost)| {
                    let path = RoutingPath {
                        cost,
                        predecessors: predecessors.remove(&to).unwrap_or_default(),
                    };
                    (to, path)
                })
                .collect();
            self.shortest_paths.insert(source, paths);
        }
    }

    /// Cheapest path, absent when either end is unknown or unreachable
    pub fn get_shortest_path(&self, from: NodeId, to: NodeId) -> Option<&RoutingPath> {
        self.shortest_paths
            .get(&from)?
            .get(&to)
            .filter(|path| path.cost.is_finite())
    }

    /// First node after `from` on a cheapest path to `to` (lowest id on ties)
    pub fn next_hop(&self, from: NodeId, to: NodeId) -> Option<NodeId> {
        if from == to {
            return None;
        }
        let mut current = to;
        // a simple path never has more hops than there are nodes
        for _ in 0..self.table.len() {
            let path = self.get_shortest_path(from, current)?;
            if path.predecessors.contains(&from) {
                return Some(current);
            }
            current = *path.predecessors.iter().next()?;
        }
        None
    }

    /// Edges reported for `node`
    pub fn neighbor_costs(&self, node: NodeId) -> BTreeMap<NodeId, f64> {
        self.table.get(&node).cloned().unwrap_or_default()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.table.keys().copied().collect()
    }

    pub fn topology(&self) -> &BTreeMap<NodeId, BTreeMap<NodeId, f64>> {
        &self.table
    }
}
