//! Page dependency graph: node model, arena graph and the builder that links
//! a recorded page load into a DAG.

pub mod builder;
pub mod dependency_graph;
pub mod node;

pub use builder::PageDependencyGraph;
pub use dependency_graph::DependencyGraph;
pub use node::{CpuNode, NetworkNode, Node, NodeKind, NodeType};
