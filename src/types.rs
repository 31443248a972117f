//! Core type definitions for the simulation framework.
//!
//! Trace and graph timestamps are kept in microseconds, simulated timings in
//! milliseconds relative to the start of the simulation.

use serde::{Deserialize, Serialize};

/// A timestamp or duration in microseconds (trace timebase).
pub type Microseconds = f64;

/// A timestamp or duration in milliseconds (simulation timebase).
pub type Milliseconds = f64;

/// Handle to a node stored in a [`DependencyGraph`](crate::graph::DependencyGraph).
///
/// Indices are only meaningful for the graph that produced them; a graph
/// obtained through `clone_with_relationships` has its own numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub(crate) usize);

impl NodeIndex {
    /// Creates a handle from a raw arena position.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw arena position.
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
