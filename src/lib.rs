//! # Lantern
//!
//! Page-load simulation over dependency graphs. A recorded page load (main
//! thread trace events plus completed network requests) becomes a graph of
//! network and CPU nodes, which is then replayed under arbitrary network and
//! CPU throttling to estimate performance metrics.
//!
//! ## Design
//!
//! - **Graph-Driven**: [`PageDependencyGraph`] links requests to their
//!   initiators and tasks to the scripts, timers and resources they touch.
//!   The resulting [`DependencyGraph`] is an arena indexed by [`NodeIndex`].
//! - **Connection Model**: requests are scheduled on simulated TCP/TLS
//!   connections with slow start, H2 multiplexing and per-origin RTT.
//! - **Discrete Events**: the [`Simulator`] jumps from one node completion to
//!   the next; CPU tasks run one at a time.
//! - **Optimistic and Pessimistic**: each metric simulates two subgraphs and
//!   blends the estimates.
//!
//! ## Features
//!
//! - `parallel` - simulate independent graphs on the rayon thread pool
//!
//! ## Quick Start
//!
//! ```rust
//! use lantern::{
//!     Initiator, NetworkRequest, PageDependencyGraph, PageUrls, ResourceType, SimulateOptions, Simulator,
//!     SimulatorOptions,
//! };
//!
//! let requests = vec![
//!     NetworkRequest::new("1", "https://example.com/", 0.0, 120.0).with_resource_type(ResourceType::Document),
//!     NetworkRequest::new("2", "https://example.com/app.js", 130.0, 200.0)
//!         .with_resource_type(ResourceType::Script)
//!         .with_initiator(Initiator::parser("https://example.com/")),
//! ];
//! let urls = PageUrls::new("https://example.com/", "https://example.com/");
//! let graph = PageDependencyGraph::create_graph(&[], &requests, &urls)?;
//!
//! let simulator = Simulator::new(SimulatorOptions::default())?;
//! let result = simulator.simulate(&graph, &SimulateOptions::default())?;
//! println!("loaded in {:.0}ms", result.time_in_ms);
//! # Ok::<(), lantern::Error>(())
//! ```
//!
//! ## Metrics
//!
//! ```rust,ignore
//! use lantern::metrics::{compute_all, MetricInput};
//!
//! let settings = LanternSettings::from_yaml_file("lantern.yaml")?;
//! let analysis = NetworkAnalyzer::analyze(&requests)?;
//! let simulator = Simulator::from_settings(&settings, &analysis)?;
//! let metrics = compute_all(MetricInput { simulator: &simulator, graph: &graph, navigation: &navigation });
//! println!("{}", metrics.to_json());
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod network;
pub mod parallel;
pub mod simulator;
pub mod stats;
pub mod trace;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigError, LanternSettings, LanternSettingsBuilder, ThrottlingMethod, ThrottlingSettings};
pub use error::{BuildError, Error, GraphError, MetricError, NetworkAnalysisError, Result, SimulationError};
pub use graph::{CpuNode, DependencyGraph, NetworkNode, Node, NodeKind, NodeType, PageDependencyGraph};
pub use metrics::{LanternMetric, LanternMetrics, MetricComputer, MetricInput, MetricKind, MetricResult};
pub use network::{
    Initiator, LanternData, NetworkAnalysis, NetworkAnalyzer, NetworkRequest, Priority, ResourceTiming, ResourceType,
};
pub use simulator::{NodeTiming, SimulateOptions, SimulationResult, Simulator, SimulatorOptions};
pub use stats::SimulationStats;
pub use trace::{PageUrls, ProcessedNavigation, TraceEvent};
pub use types::{Microseconds, Milliseconds, NodeIndex};

/// Initialize the tracing subscriber for logging.
///
/// Call this at the start of your program to enable logging. `RUST_LOG`
/// overrides `level` when set. Closing `simulate` spans report how long each
/// simulation took at debug level.
///
/// # Example
///
/// ```rust,ignore
/// lantern::init_logging("lantern=debug");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
