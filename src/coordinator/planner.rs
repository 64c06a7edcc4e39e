//! Rebalance planning
//!
//! Turns the listings collected from responding dstores into a target
//! placement and one combined push/evict instruction per affected dstore.
//!
//! Precedence is fixed: files unknown to the index (or stuck in `Removing`)
//! are evicted everywhere, then every file is brought to exactly `r` replicas,
//! then per-dstore load is moved into `[floor(f·r/d), ceil(f·r/d)]`.
//! Instructions are derived by diffing the collected view against the target,
//! so a dstore's pushes only ever name files it already holds.

use crate::common::protocol::{FilePush, RebalanceInstruction};
use crate::common::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Files each responding dstore reported
pub type View = BTreeMap<NodeId, BTreeSet<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    /// Placement the index adopts once every instruction completed
    pub target: View,
    /// Instructions for dstores whose holdings change
    pub instructions: BTreeMap<NodeId, RebalanceInstruction>,
    /// Reported files that are evicted everywhere
    pub orphans: BTreeSet<String>,
    /// Load bounds the plan satisfies
    pub bounds: (usize, usize),
}

impl RebalancePlan {
    pub fn is_noop(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Plan a rebalance of `view` for replication factor `r`.
///
/// `sizes` holds every `Stored` file known to the index. Callers guarantee
/// `view.len() >= r`.
pub fn plan(view: &View, sizes: &BTreeMap<String, u64>, r: usize) -> RebalancePlan {
    let nodes: Vec<NodeId> = view.keys().copied().collect();

    // Reconcile: only stored files seen on some dstore survive.
    let mut orphans = BTreeSet::new();
    let mut holders: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
    for (node, files) in view {
        for name in files {
            if sizes.contains_key(name) {
                holders.entry(name.clone()).or_default().insert(*node);
            } else {
                orphans.insert(name.clone());
            }
        }
    }

    let mut load: BTreeMap<NodeId, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    for set in holders.values() {
        for node in set {
            *load.entry(*node).or_default() += 1;
        }
    }

    correct_replication(&mut holders, &mut load, &nodes, r);

    let files = holders.len();
    let d = nodes.len().max(1);
    let lower = files * r / d;
    let upper = (files * r).div_ceil(d);
    correct_load(&mut holders, &mut load, lower, upper);

    let mut target: View = nodes.iter().map(|n| (*n, BTreeSet::new())).collect();
    for (name, set) in &holders {
        for node in set {
            target.entry(*node).or_default().insert(name.clone());
        }
    }

    let instructions = derive_instructions(view, &target, &holders, sizes);

    RebalancePlan {
        target,
        instructions,
        orphans,
        bounds: (lower, upper),
    }
}

fn correct_replication(
    holders: &mut BTreeMap<String, BTreeSet<NodeId>>,
    load: &mut BTreeMap<NodeId, usize>,
    nodes: &[NodeId],
    r: usize,
) {
    for set in holders.values_mut() {
        while set.len() > r {
            let Some(busiest) = set
                .iter()
                .copied()
                .max_by_key(|n| (load.get(n).copied().unwrap_or(0), std::cmp::Reverse(*n)))
            else {
                break;
            };
            set.remove(&busiest);
            decrement(load, busiest);
        }

        while set.len() < r {
            let Some(idlest) = nodes
                .iter()
                .copied()
                .filter(|n| !set.contains(n))
                .min_by_key(|n| (load.get(n).copied().unwrap_or(0), *n))
            else {
                break;
            };
            set.insert(idlest);
            *load.entry(idlest).or_default() += 1;
        }
    }
}

fn correct_load(
    holders: &mut BTreeMap<String, BTreeSet<NodeId>>,
    load: &mut BTreeMap<NodeId, usize>,
    lower: usize,
    upper: usize,
) {
    loop {
        let busiest = load
            .iter()
            .max_by_key(|(n, l)| (**l, std::cmp::Reverse(**n)))
            .map(|(n, l)| (*n, *l));
        let idlest = load
            .iter()
            .min_by_key(|(n, l)| (**l, **n))
            .map(|(n, l)| (*n, *l));
        let (Some((from, from_load)), Some((to, to_load))) = (busiest, idlest) else {
            return;
        };

        if from_load <= upper && to_load >= lower {
            return;
        }
        if from_load < to_load + 2 {
            return;
        }

        // Most-replicated file first, then by name.
        let candidate = holders
            .iter()
            .filter(|(_, set)| set.contains(&from) && !set.contains(&to))
            .max_by_key(|(name, set)| (set.len(), std::cmp::Reverse((*name).clone())))
            .map(|(name, _)| name.clone());
        let Some(name) = candidate else {
            return;
        };

        if let Some(set) = holders.get_mut(&name) {
            set.remove(&from);
            set.insert(to);
        }
        decrement(load, from);
        *load.entry(to).or_default() += 1;
    }
}

fn decrement(load: &mut BTreeMap<NodeId, usize>, node: NodeId) {
    if let Some(l) = load.get_mut(&node) {
        *l = l.saturating_sub(1);
    }
}

fn derive_instructions(
    view: &View,
    target: &View,
    holders: &BTreeMap<String, BTreeSet<NodeId>>,
    sizes: &BTreeMap<String, u64>,
) -> BTreeMap<NodeId, RebalanceInstruction> {
    let mut instructions: BTreeMap<NodeId, RebalanceInstruction> = BTreeMap::new();
    let mut pushes_assigned: BTreeMap<NodeId, usize> = BTreeMap::new();

    for (name, set) in holders {
        let sources: Vec<NodeId> = view
            .iter()
            .filter(|(_, files)| files.contains(name))
            .map(|(n, _)| *n)
            .collect();
        let mut per_source: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for dest in set.iter().filter(|n| !sources.contains(n)) {
            let Some(source) = sources
                .iter()
                .copied()
                .min_by_key(|s| (pushes_assigned.get(s).copied().unwrap_or(0), *s))
            else {
                continue;
            };
            *pushes_assigned.entry(source).or_default() += 1;
            per_source.entry(source).or_default().push(*dest);
        }

        for (source, destinations) in per_source {
            instructions.entry(source).or_default().pushes.push(FilePush {
                name: name.clone(),
                size: sizes.get(name).copied().unwrap_or(0),
                destinations,
            });
        }
    }

    for (node, files) in view {
        let keep = target.get(node);
        let removals: Vec<String> = files
            .iter()
            .filter(|name| !keep.is_some_and(|k| k.contains(*name)))
            .cloned()
            .collect();
        if !removals.is_empty() {
            instructions.entry(*node).or_default().removals = removals;
        }
    }

    instructions
}
