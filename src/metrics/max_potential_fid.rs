//! Max Potential First Input Delay.

use crate::error::MetricError;
use crate::graph::DependencyGraph;
use crate::metrics::{cpu_timings, Coefficients, Estimate, LanternMetric, MetricExtras, MetricInput, MetricResult};
use crate::simulator::SimulationResult;
use crate::trace::ProcessedNavigation;
use crate::types::Milliseconds;

/// Floor of the estimate: one frame.
const MINIMUM_INPUT_DELAY: Milliseconds = 16.0;

pub struct MaxPotentialFid;

impl MaxPotentialFid {
    pub fn compute(input: MetricInput<'_>, fcp: &MetricResult) -> Result<MetricResult, MetricError> {
        Self::compute_with_graphs(
            input,
            MetricExtras {
                fcp: Some(fcp),
                ..Default::default()
            },
        )
    }
}

impl LanternMetric for MaxPotentialFid {
    const NAME: &'static str = "MaxPotentialFID";
    const COEFFICIENTS: Coefficients = Coefficients {
        intercept: 0.0,
        optimistic: 0.5,
        pessimistic: 0.5,
    };

    fn optimistic_graph(
        graph: &DependencyGraph,
        _navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        Ok(graph.clone())
    }

    fn pessimistic_graph(
        graph: &DependencyGraph,
        _navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        Ok(graph.clone())
    }

    /// Longest task ending after FCP, measured against the opposite side's FCP.
    fn estimate_from_simulation(
        graph: &DependencyGraph,
        simulation: &SimulationResult,
        extras: &MetricExtras<'_>,
    ) -> Result<Estimate, MetricError> {
        let fcp = MetricExtras::require(extras.fcp, "FCP", Self::NAME)?;
        let fcp_time = extras.opposite_side(fcp);
        let time_in_ms = cpu_timings(graph, &simulation.node_timings)
            .filter(|t| t.end_time > fcp_time)
            .map(|t| t.duration)
            .fold(MINIMUM_INPUT_DELAY, f64::max);
        Ok(Estimate {
            time_in_ms,
            node_timings: simulation.node_timings.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::network::request::NetworkRequest;
    use crate::simulator::{Simulator, SimulatorOptions};
    use crate::trace::TraceEvent;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn fcp_at(time_in_ms: f64) -> MetricResult {
        let graph = DependencyGraph::new(Node::network(Arc::new(NetworkRequest::new("x", "https://a.test/", 0.0, 1.0))));
        let estimate = Estimate {
            time_in_ms,
            node_timings: BTreeMap::new(),
        };
        MetricResult {
            timing: time_in_ms,
            optimistic_estimate: estimate.clone(),
            pessimistic_estimate: estimate,
            optimistic_graph: graph.clone(),
            pessimistic_graph: graph,
        }
    }

    fn simulate(task_ms: f64) -> (DependencyGraph, SimulationResult) {
        let mut doc = Node::network(Arc::new(NetworkRequest::new("doc", "https://a.test/", 0.0, 10.0)));
        doc.is_main_document = true;
        let mut graph = DependencyGraph::new(doc);
        let task = graph
            .add_node(Node::cpu(Arc::new(TraceEvent::complete("RunTask", 20_000.0, task_ms * 1000.0)), Vec::new(), None))
            .unwrap();
        graph.add_dependency(task, graph.root()).unwrap();
        let simulator = Simulator::new(SimulatorOptions {
            cpu_slowdown_multiplier: 1.0,
            ..Default::default()
        })
        .unwrap();
        let simulation = simulator.simulate(&graph, &Default::default()).unwrap();
        (graph, simulation)
    }

    fn estimate(graph: &DependencyGraph, simulation: &SimulationResult, fcp: &MetricResult) -> f64 {
        let extras = MetricExtras {
            fcp: Some(fcp),
            ..Default::default()
        };
        MaxPotentialFid::estimate_from_simulation(graph, simulation, &extras)
            .unwrap()
            .time_in_ms
    }

    #[test]
    fn test_longest_task_after_fcp() {
        let (graph, simulation) = simulate(120.0);
        assert!((estimate(&graph, &simulation, &fcp_at(0.0)) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_tasks_before_fcp_ignored() {
        let (graph, simulation) = simulate(120.0);
        assert_eq!(estimate(&graph, &simulation, &fcp_at(1e6)), MINIMUM_INPUT_DELAY);
    }

    #[test]
    fn test_short_tasks_floor_at_one_frame() {
        let (graph, simulation) = simulate(4.0);
        assert_eq!(estimate(&graph, &simulation, &fcp_at(0.0)), MINIMUM_INPUT_DELAY);
    }
}
