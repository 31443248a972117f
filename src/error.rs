//! Error types for graph construction, simulation and metric estimation.
//!
//! - [`GraphError`]: invariant violations on the dependency graph itself
//! - [`BuildError`]: fatal problems building a graph from a recorded page load
//! - [`SimulationError`]: invalid options or simulator invariant violations
//! - [`NetworkAnalysisError`]: not enough timing data to analyze the network
//! - [`MetricError`]: missing anchors or inputs for a metric estimate
//!
//! All of them convert into the top-level [`Error`].

use thiserror::Error;

/// Result type alias using the crate's top-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Dependency graph invariant violation
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Graph construction failure
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Simulation failure
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    /// Network analysis failure
    #[error("Network analysis error: {0}")]
    NetworkAnalysis(#[from] NetworkAnalysisError),

    /// Metric estimation failure
    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),
}

/// Errors raised by [`DependencyGraph`](crate::graph::DependencyGraph) operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("node {0} cannot depend on itself")]
    SelfDependency(String),

    #[error("making {dependent} depend on {dependency} would create a cycle")]
    WouldCreateCycle { dependent: String, dependency: String },

    #[error("cycle detected in dependency graph: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("node index {0} is out of bounds")]
    InvalidIndex(usize),

    #[error("filter excluded the root node {0}")]
    RootExcluded(String),
}

/// Fatal errors while building a dependency graph from a page load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("requested URL is required to find the root request")]
    MissingRequestedUrl,

    #[error("main document URL is required to find the main resource")]
    MissingMainDocumentUrl,

    #[error("root request not found for {0}")]
    RootRequestNotFound(String),

    #[error("main document request not found for {0}")]
    MainDocumentNotFound(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors raised while simulating a graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("invalid simulator option {name}: {value}")]
    InvalidOption { name: &'static str, value: f64 },

    #[error("could not find a connection for origin: {0}")]
    NoConnectionForOrigin(String),

    #[error("request {0} already has a connection")]
    ConnectionAlreadyAcquired(String),

    #[error("could not find an active connection for request {0}")]
    NoActiveConnection(String),

    #[error("node {node_id} is not yet {expected}")]
    InvalidTimingState { node_id: String, expected: &'static str },

    #[error("request {0} was planned on a connection that is still in use")]
    ConnectionBusy(String),

    #[error("simulation failed, depth exceeded")]
    DepthExceeded,

    #[error("cycle detected: {0} unused nodes")]
    UnusedNodes(usize),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors raised while estimating network characteristics.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkAnalysisError {
    #[error("no timing information available")]
    NoTimingInformation,
}

/// Errors raised while computing a metric estimate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("no {0} timestamp found in the navigation")]
    MissingTimestamp(&'static str),

    #[error("{0} result is required to compute {1}")]
    MissingDependency(&'static str, &'static str),

    #[error("{0} was requested while it was being computed")]
    CircularDependency(&'static str),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),
}
