//! Statistics collection and export for simulation runs.
//!
//! Every simulation returns a [`SimulationStats`] that can be exported as
//! JSON, CSV or a text summary. Simulated node timings can also be exported
//! as trace events for viewing in a trace viewer.
//!
//! Statistics only describe the simulated run, so equal inputs give equal
//! statistics. Wall-clock cost of a run is reported by the `simulate` tracing
//! span instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::graph::{DependencyGraph, NodeKind};
use crate::simulator::SimulationResult;
use crate::trace::{TraceEvent, TraceEventData};

/// Thread id given to simulated network nodes in exported traces.
pub const NETWORK_TRACK_TID: i64 = 1;
/// Thread id given to simulated CPU nodes in exported traces.
pub const CPU_TRACK_TID: i64 = 2;

/// Aggregate statistics for a simulation run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationStats {
    /// Run metadata
    pub metadata: SimulationMetadata,

    /// Engine-level statistics
    pub engine: EngineStats,

    /// Per-origin statistics
    pub origins: BTreeMap<String, OriginStats>,
}

/// Metadata about the simulation run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationMetadata {
    /// Run label, such as the metric and graph being simulated
    pub label: String,

    /// Crate version
    pub version: String,
}

/// Engine-level statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Simulated page load time in milliseconds
    pub time_in_ms: f64,

    /// Simulation steps executed
    pub iterations: u64,

    /// Nodes reachable from the root
    pub nodes_simulated: usize,

    pub network_nodes: usize,

    pub cpu_nodes: usize,

    /// Effective in-flight request limit
    pub maximum_concurrent_requests: usize,

    /// Most requests in flight at once
    pub peak_network_in_flight: usize,

    /// Whether requests ignored observed connection reuse
    pub flexible_ordering: bool,
}

/// Statistics for a single origin.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginStats {
    /// Simulated requests to the origin
    pub requests: usize,

    /// Connections in the pool for the origin
    pub connections: usize,

    /// Most of the origin's connections checked out at once
    pub peak_connections_in_use: usize,

    /// Bytes transferred from the origin
    pub transfer_bytes: f64,
}

impl SimulationStats {
    /// Creates a new empty statistics container.
    pub fn new() -> Self {
        Self {
            metadata: SimulationMetadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Sets the run label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.metadata.label = label.into();
        self
    }

    /// Exports statistics to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Exports summary statistics to CSV.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();

        // Header
        csv.push_str("metric,value\n");

        // Engine stats
        csv.push_str(&format!("time_in_ms,{}\n", self.engine.time_in_ms));
        csv.push_str(&format!("iterations,{}\n", self.engine.iterations));
        csv.push_str(&format!("nodes_simulated,{}\n", self.engine.nodes_simulated));
        csv.push_str(&format!("network_nodes,{}\n", self.engine.network_nodes));
        csv.push_str(&format!("cpu_nodes,{}\n", self.engine.cpu_nodes));
        csv.push_str(&format!("maximum_concurrent_requests,{}\n", self.engine.maximum_concurrent_requests));
        csv.push_str(&format!("peak_network_in_flight,{}\n", self.engine.peak_network_in_flight));
        csv.push_str(&format!("flexible_ordering,{}\n", self.engine.flexible_ordering));

        csv
    }

    /// Exports per-origin statistics to CSV.
    pub fn origins_to_csv(&self) -> String {
        let mut csv = String::new();
        csv.push_str("origin,requests,connections,peak_connections_in_use,transfer_bytes\n");
        for (origin, stats) in &self.origins {
            csv.push_str(&format!(
                "{},{},{},{},{}\n",
                origin, stats.requests, stats.connections, stats.peak_connections_in_use, stats.transfer_bytes
            ));
        }
        csv
    }

    /// Writes a human-readable summary to a writer.
    pub fn write_summary<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        writeln!(w, "=== Simulation Statistics ===")?;
        writeln!(w)?;

        if !self.metadata.label.is_empty() {
            writeln!(w, "Label: {}", self.metadata.label)?;
            writeln!(w)?;
        }

        writeln!(w, "--- Engine ---")?;
        writeln!(w, "Simulated time: {} ms", self.engine.time_in_ms)?;
        writeln!(w, "Iterations: {}", self.engine.iterations)?;
        writeln!(
            w,
            "Nodes: {} ({} network, {} cpu)",
            self.engine.nodes_simulated, self.engine.network_nodes, self.engine.cpu_nodes
        )?;
        writeln!(
            w,
            "Peak in-flight requests: {} of {}",
            self.engine.peak_network_in_flight, self.engine.maximum_concurrent_requests
        )?;
        if self.engine.flexible_ordering {
            writeln!(w, "Flexible ordering")?;
        }
        writeln!(w)?;

        writeln!(w, "--- Origins ---")?;
        for (origin, stats) in &self.origins {
            writeln!(w, "{}:", origin)?;
            writeln!(
                w,
                "  Requests: {}, Connections: {} (peak {} in use)",
                stats.requests, stats.connections, stats.peak_connections_in_use
            )?;
            writeln!(w, "  Transferred: {} bytes", stats.transfer_bytes)?;
        }

        Ok(())
    }

    /// Returns a summary string.
    pub fn summary(&self) -> String {
        let mut buf = Vec::new();
        // writing to a Vec cannot fail
        let _ = self.write_summary(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Converts simulated node timings into complete trace events.
///
/// Network nodes land on [`NETWORK_TRACK_TID`] with their URL attached, CPU
/// nodes on [`CPU_TRACK_TID`]. Timestamps are in microseconds.
pub fn timings_to_trace_events(graph: &DependencyGraph, result: &SimulationResult) -> Vec<TraceEvent> {
    result
        .timings_by_start()
        .into_iter()
        .filter_map(|(index, timing)| {
            let node = graph.get(index)?;
            let event = TraceEvent::complete(node.id.clone(), timing.start_time * 1000.0, timing.duration * 1000.0);
            Some(match &node.kind {
                NodeKind::Network(network) => event
                    .with_tid(NETWORK_TRACK_TID)
                    .with_data(TraceEventData::with_url(network.request.url.clone())),
                NodeKind::Cpu(_) => event.with_tid(CPU_TRACK_TID),
            })
        })
        .collect()
}

/// Writes simulated node timings as a JSON trace file.
pub fn write_trace_file<P: AsRef<Path>>(
    graph: &DependencyGraph,
    result: &SimulationResult,
    path: P,
) -> std::io::Result<()> {
    let trace = serde_json::json!({ "traceEvents": timings_to_trace_events(graph, result) });
    let json = serde_json::to_string_pretty(&trace)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::network::request::NetworkRequest;
    use crate::simulator::{SimulateOptions, Simulator, SimulatorOptions};
    use std::sync::Arc;

    #[test]
    fn test_stats_creation() {
        let stats = SimulationStats::new().with_label("fcp optimistic");

        assert_eq!(stats.metadata.label, "fcp optimistic");
        assert_eq!(stats.metadata.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_stats_json_export() {
        let mut stats = SimulationStats::new();
        stats.engine.time_in_ms = 1234.0;
        stats.engine.iterations = 17;

        let json = stats.to_json().unwrap();
        assert!(json.contains("1234"));
        assert!(json.contains("17"));
    }

    #[test]
    fn test_stats_csv_export() {
        let mut stats = SimulationStats::new();
        stats.engine.time_in_ms = 1000.0;
        stats.engine.network_nodes = 5;

        let csv = stats.to_csv();
        assert!(csv.contains("time_in_ms,1000\n"));
        assert!(csv.contains("network_nodes,5\n"));
    }

    #[test]
    fn test_origin_stats_csv() {
        let mut stats = SimulationStats::new();
        stats.origins.insert(
            "https://a.test".into(),
            OriginStats {
                requests: 3,
                connections: 6,
                peak_connections_in_use: 2,
                transfer_bytes: 1500.0,
            },
        );

        let csv = stats.origins_to_csv();
        assert!(csv.contains("https://a.test,3,6,2,1500"));
    }

    #[test]
    fn test_repeated_runs_have_equal_stats() {
        let graph = DependencyGraph::new(Node::network(Arc::new(
            NetworkRequest::new("doc", "https://a.test/", 0.0, 100.0).with_size(1000.0),
        )));
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let options = SimulateOptions::labeled("fcp optimistic");
        let first = simulator.simulate(&graph, &options).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = simulator.simulate(&graph, &options).unwrap();
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.stats.to_json().unwrap(), second.stats.to_json().unwrap());
    }

    #[test]
    fn test_summary_output() {
        let mut stats = SimulationStats::new().with_label("Summary Test");
        stats.engine.time_in_ms = 1000.0;
        stats.engine.flexible_ordering = true;

        let summary = stats.summary();
        assert!(summary.contains("Summary Test"));
        assert!(summary.contains("1000"));
        assert!(summary.contains("Flexible ordering"));
    }

    #[test]
    fn test_trace_export() {
        let mut graph = DependencyGraph::new(Node::network(Arc::new(
            NetworkRequest::new("doc", "https://a.test/", 0.0, 100.0).with_size(1000.0),
        )));
        let task = graph
            .add_node(Node::cpu(
                Arc::new(TraceEvent::complete("RunTask", 150_000.0, 20_000.0)),
                vec![],
                None,
            ))
            .unwrap();
        graph.add_dependency(task, graph.root()).unwrap();

        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        let events = timings_to_trace_events(&graph, &result);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "doc");
        assert_eq!(events[0].tid, NETWORK_TRACK_TID);
        assert_eq!(events[0].data().and_then(|d| d.url.as_deref()), Some("https://a.test/"));
        assert_eq!(events[1].tid, CPU_TRACK_TID);
        assert_eq!(events[1].duration(), 80_000.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simulated.json");
        write_trace_file(&graph, &result, &path).unwrap();
        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["traceEvents"].as_array().unwrap().len(), 2);
    }
}
