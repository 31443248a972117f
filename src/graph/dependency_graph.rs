//! Arena-backed dependency graph.
//!
//! Nodes live in a `Vec` and are addressed by [`NodeIndex`]. Edges are kept
//! twice, as a dependency list and a dependent list per node, and every
//! mutation updates both sides.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut graph = DependencyGraph::new(root);
//! let script = graph.add_node(script_node)?;
//! graph.add_dependency(script, graph.root())?;
//! assert!(graph.is_dependent_on(script, graph.root()));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::GraphError;
use crate::graph::node::{CpuNode, NetworkNode, Node, NodeKind};
use crate::types::NodeIndex;

/// A rooted DAG of network and CPU nodes.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    dependencies: Vec<Vec<NodeIndex>>,
    dependents: Vec<Vec<NodeIndex>>,
    by_id: HashMap<String, NodeIndex>,
    root: NodeIndex,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Creates a graph holding only its root.
    pub fn new(root: Node) -> Self {
        let mut by_id = HashMap::new();
        by_id.insert(root.id.clone(), NodeIndex(0));
        Self {
            nodes: vec![root],
            dependencies: vec![Vec::new()],
            dependents: vec![Vec::new()],
            by_id,
            root: NodeIndex(0),
        }
    }

    /// Adds a detached node.
    pub fn add_node(&mut self, node: Node) -> Result<NodeIndex, GraphError> {
        if self.by_id.contains_key(&node.id) {
            return Err(GraphError::DuplicateNodeId(node.id));
        }
        let index = NodeIndex(self.nodes.len());
        self.by_id.insert(node.id.clone(), index);
        self.nodes.push(node);
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        Ok(index)
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a graph holds at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the node at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not belong to this graph.
    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.0]
    }

    pub fn get(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.0)
    }

    pub(crate) fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index.0]
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.nodes.len()).map(NodeIndex)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeIndex(i), n))
    }

    pub fn network_nodes(&self) -> impl Iterator<Item = (NodeIndex, &NetworkNode)> {
        self.nodes().filter_map(|(i, n)| n.as_network().map(|net| (i, net)))
    }

    pub fn cpu_nodes(&self) -> impl Iterator<Item = (NodeIndex, &CpuNode)> {
        self.nodes().filter_map(|(i, n)| n.as_cpu().map(|cpu| (i, cpu)))
    }

    /// The node flagged as main document.
    pub fn main_document(&self) -> Option<NodeIndex> {
        self.nodes().find(|(_, n)| n.is_main_document).map(|(i, _)| i)
    }

    pub(crate) fn set_main_document(&mut self, index: NodeIndex) {
        for node in &mut self.nodes {
            node.is_main_document = false;
        }
        self.nodes[index.0].is_main_document = true;
    }

    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        &self.dependencies[index.0]
    }

    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        &self.dependents[index.0]
    }

    fn check(&self, index: NodeIndex) -> Result<(), GraphError> {
        if index.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(GraphError::InvalidIndex(index.0))
        }
    }

    /// Makes `node` depend on `dependency`. Adding an existing edge is a no-op.
    pub fn add_dependency(&mut self, node: NodeIndex, dependency: NodeIndex) -> Result<(), GraphError> {
        self.check(node)?;
        self.check(dependency)?;
        if node == dependency {
            return Err(GraphError::SelfDependency(self.nodes[node.0].id.clone()));
        }
        if self.dependencies[node.0].contains(&dependency) {
            return Ok(());
        }
        if self.is_dependent_on(dependency, node) {
            return Err(GraphError::WouldCreateCycle {
                dependent: self.nodes[node.0].id.clone(),
                dependency: self.nodes[dependency.0].id.clone(),
            });
        }
        self.dependencies[node.0].push(dependency);
        self.dependents[dependency.0].push(node);
        Ok(())
    }

    /// Makes `dependent` depend on `node`.
    pub fn add_dependent(&mut self, node: NodeIndex, dependent: NodeIndex) -> Result<(), GraphError> {
        self.add_dependency(dependent, node)
    }

    pub fn remove_dependency(&mut self, node: NodeIndex, dependency: NodeIndex) {
        self.dependencies[node.0].retain(|&d| d != dependency);
        self.dependents[dependency.0].retain(|&d| d != node);
    }

    pub fn remove_dependent(&mut self, node: NodeIndex, dependent: NodeIndex) {
        self.remove_dependency(dependent, node);
    }

    pub fn remove_all_dependencies(&mut self, node: NodeIndex) {
        for dependency in std::mem::take(&mut self.dependencies[node.0]) {
            self.dependents[dependency.0].retain(|&d| d != node);
        }
    }

    /// Whether `node` transitively depends on `other` (a node depends on itself).
    pub fn is_dependent_on(&self, node: NodeIndex, other: NodeIndex) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if current == other {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.dependencies[current.0].iter().copied());
            }
        }
        false
    }

    /// Breadth-first traversal from `start` following dependents.
    pub fn traverse(&self, start: NodeIndex) -> Vec<NodeIndex> {
        self.traverse_with(start, |i| self.dependents(i).to_vec())
    }

    /// Breadth-first traversal from `start` with a custom next-nodes selector.
    ///
    /// Each node is visited once.
    pub fn traverse_with<F, I>(&self, start: NodeIndex, mut next: F) -> Vec<NodeIndex>
    where
        F: FnMut(NodeIndex) -> I,
        I: IntoIterator<Item = NodeIndex>,
    {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start]);
        visited[start.0] = true;
        while let Some(current) = queue.pop_front() {
            order.push(current);
            for n in next(current) {
                if !visited[n.0] {
                    visited[n.0] = true;
                    queue.push_back(n);
                }
            }
        }
        order
    }

    /// All nodes ordered so that every node follows its dependencies.
    ///
    /// Ties are broken by arena index.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, GraphError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<NodeIndex> = self.indices().filter(|i| in_degree[i.0] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(current) = queue.pop_front() {
            order.push(current);
            for &next in &self.dependents[current.0] {
                in_degree[next.0] -= 1;
                if in_degree[next.0] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            self.assert_acyclic()?;
        }
        Ok(order)
    }

    /// Whether any dependency cycle exists.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Fails with the offending path if a dependency cycle exists.
    pub fn assert_acyclic(&self) -> Result<(), GraphError> {
        match self.find_cycle() {
            Some(path) => Err(GraphError::Cycle {
                path: path.into_iter().map(|i| self.nodes[i.0].id.clone()).collect(),
            }),
            None => Ok(()),
        }
    }

    /// Three-colour DFS over dependency edges.
    fn find_cycle(&self) -> Option<Vec<NodeIndex>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        for start in self.indices() {
            if marks[start.0] != Mark::Unvisited {
                continue;
            }
            // (node, next child position)
            let mut stack: Vec<(NodeIndex, usize)> = vec![(start, 0)];
            marks[start.0] = Mark::InProgress;
            while let Some((current, pos)) = stack.last().copied() {
                let deps = &self.dependencies[current.0];
                if pos >= deps.len() {
                    marks[current.0] = Mark::Done;
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = deps[pos];
                match marks[next.0] {
                    Mark::InProgress => {
                        let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<NodeIndex> = stack[from..].iter().map(|(n, _)| *n).collect();
                        path.push(next);
                        return Some(path);
                    }
                    Mark::Unvisited => {
                        marks[next.0] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    /// Removes `index` from the edge structure, connecting each of its
    /// dependents directly to each of its dependencies.
    ///
    /// The node stays in the arena detached until the graph is compacted.
    pub fn prune_node(&mut self, index: NodeIndex) -> Result<(), GraphError> {
        self.check(index)?;
        let dependencies = self.dependencies[index.0].clone();
        let dependents = self.dependents[index.0].clone();
        for &dependent in &dependents {
            self.remove_dependency(dependent, index);
        }
        self.remove_all_dependencies(index);
        for &dependent in &dependents {
            for &dependency in &dependencies {
                self.add_dependency(dependent, dependency)?;
            }
        }
        Ok(())
    }

    /// Drops every node not reachable from the root through dependents.
    ///
    /// Surviving nodes keep their relative order; indices are renumbered.
    pub fn retain_reachable_from_root(&mut self) {
        let reachable: HashSet<NodeIndex> = self.traverse(self.root).into_iter().collect();
        if reachable.len() == self.nodes.len() {
            return;
        }
        let compacted = self.rebuild(|i, _| reachable.contains(&i), |i| self.dependencies[i.0].clone());
        *self = compacted;
    }

    /// Builds a new graph from the kept nodes and a dependency resolver
    /// returning old indices.
    fn rebuild<K, D>(&self, keep: K, mut deps_of: D) -> Self
    where
        K: Fn(NodeIndex, &Node) -> bool,
        D: FnMut(NodeIndex) -> Vec<NodeIndex>,
    {
        let mut remap: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut nodes = Vec::new();
        for (i, node) in self.nodes() {
            if keep(i, node) {
                remap.insert(i, NodeIndex(nodes.len()));
                nodes.push(node.clone());
            }
        }
        let mut dependencies = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (&old, &new) in &remap {
            for dep in deps_of(old) {
                if let Some(&mapped) = remap.get(&dep) {
                    if !dependencies[new.0].contains(&mapped) {
                        dependencies[new.0].push(mapped);
                    }
                }
            }
        }
        // Dependent lists are rebuilt in arena order for deterministic traversal.
        for (i, deps) in dependencies.iter_mut().enumerate() {
            deps.sort();
            for &d in deps.iter() {
                dependents[d.0].push(NodeIndex(i));
            }
        }
        let by_id = nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), NodeIndex(i))).collect();
        let root = remap.get(&self.root).copied().unwrap_or(NodeIndex(0));
        Self {
            nodes,
            dependencies,
            dependents,
            by_id,
            root,
        }
    }

    /// Copies the graph keeping exactly the accepted nodes reachable from the root.
    ///
    /// Rejected nodes are bypassed: each kept node depends on the nearest kept
    /// ancestors along every dependency path. The root must be accepted.
    pub fn clone_with_relationships<F>(&self, filter: F) -> Result<Self, GraphError>
    where
        F: Fn(NodeIndex, &Node) -> bool,
    {
        if !filter(self.root, self.node(self.root)) {
            return Err(GraphError::RootExcluded(self.node(self.root).id.clone()));
        }
        let reachable: HashSet<NodeIndex> = self.traverse(self.root).into_iter().collect();
        let accepted: Vec<bool> = self
            .nodes()
            .map(|(i, n)| reachable.contains(&i) && filter(i, n))
            .collect();

        // Nearest kept ancestors seen through each node, itself if kept.
        let mut frontier: Vec<Vec<NodeIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut kept_deps: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for index in self.topological_order()? {
            if !reachable.contains(&index) {
                continue;
            }
            let mut inherited = Vec::new();
            for dep in &self.dependencies[index.0] {
                for &f in &frontier[dep.0] {
                    if !inherited.contains(&f) {
                        inherited.push(f);
                    }
                }
            }
            if accepted[index.0] {
                kept_deps.insert(index, inherited);
                frontier[index.0] = vec![index];
            } else {
                frontier[index.0] = inherited;
            }
        }

        Ok(self.rebuild(
            |i, _| accepted[i.0],
            |i| kept_deps.remove(&i).unwrap_or_default(),
        ))
    }

    /// Graph keeping only nodes whose kind matches, plus the root.
    pub fn filter_kind(&self, keep_network: bool, keep_cpu: bool) -> Result<Self, GraphError> {
        let root = self.root;
        self.clone_with_relationships(|i, n| {
            i == root
                || match n.kind {
                    NodeKind::Network(_) => keep_network,
                    NodeKind::Cpu(_) => keep_cpu,
                }
        })
    }
}
