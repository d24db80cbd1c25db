//! Small dependency graph with deterministic topological ordering.
//!
//! Nodes are kept in insertion order; edges point from a node to the nodes it
//! depends on. `toposort` is Kahn's algorithm where, among ready nodes, the one
//! inserted first always goes next, so ties follow declaration order.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Dag<T: Clone + Eq + Hash + Display> {
    nodes: Vec<T>,
    index: FxHashMap<T, usize>,
    /// `deps[i]` holds the indices node `i` depends on.
    deps: Vec<Vec<usize>>,
}

impl<T: Clone + Eq + Hash + Display> Default for Dag<T> {
    fn default() -> Self { Self { nodes: Vec::new(), index: FxHashMap::default(), deps: Vec::new() } }
}

impl<T: Clone + Eq + Hash + Display> Dag<T> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn contains(&self, node: &T) -> bool { self.index.contains_key(node) }

    /// Insert a node; no-op when already present.
    pub fn add_node(&mut self, node: T) -> usize {
        if let Some(&i) = self.index.get(&node) { return i; }
        let i = self.nodes.len();
        self.index.insert(node.clone(), i);
        self.nodes.push(node);
        self.deps.push(Vec::new());
        i
    }

    /// Record that `node` depends on `dependency`, inserting either when missing.
    pub fn add_dependency(&mut self, node: T, dependency: T) {
        let n = self.add_node(node);
        let d = self.add_node(dependency);
        if !self.deps[n].contains(&d) { self.deps[n].push(d); }
    }

    pub fn dependencies_of(&self, node: &T) -> Vec<T> {
        match self.index.get(node) {
            Some(&i) => self.deps[i].iter().map(|&d| self.nodes[d].clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Dependencies first; fails with `CyclicDependency` naming one cycle.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let n = self.nodes.len();
        let mut pending: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, ds) in self.deps.iter().enumerate() {
            for &d in ds { dependents[d].push(i); }
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut out = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            out.push(self.nodes[i].clone());
            for &j in &dependents[i] {
                pending[j] -= 1;
                if pending[j] == 0 { ready.insert(j); }
            }
        }
        if out.len() == n { return Ok(out); }
        Err(Error::CyclicDependency(self.find_cycle(&pending)))
    }

    fn find_cycle(&self, pending: &[usize]) -> Vec<String> {
        let Some(start) = (0..self.nodes.len()).find(|&i| pending[i] > 0) else { return Vec::new() };
        // Every node left over waits on another left-over node, so walking
        // unresolved dependencies must revisit a node.
        let mut path = vec![start];
        let mut cur = start;
        loop {
            let Some(&next) = self.deps[cur].iter().find(|&&d| pending[d] > 0) else { break };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|&i| self.nodes[i].to_string()).collect();
                cycle.push(self.nodes[next].to_string());
                return cycle;
            }
            path.push(next);
            cur = next;
        }
        path.iter().map(|&i| self.nodes[i].to_string()).collect()
    }
}
