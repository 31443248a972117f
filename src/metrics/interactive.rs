//! Time to Interactive.

use crate::error::MetricError;
use crate::graph::{DependencyGraph, NodeKind};
use crate::metrics::{cpu_timings, Coefficients, Estimate, LanternMetric, MetricExtras, MetricInput, MetricResult};
use crate::network::request::{Priority, ResourceType};
use crate::simulator::SimulationResult;
use crate::trace::ProcessedNavigation;
use crate::types::{Microseconds, Milliseconds};

/// Tasks shorter than this cannot delay interactivity in the optimistic graph.
const CRITICAL_LONG_TASK_THRESHOLD: Microseconds = 20_000.0;

/// Simulated tasks longer than this mark the main thread busy.
const LONG_TASK_THRESHOLD: Milliseconds = 50.0;

pub struct Interactive;

impl Interactive {
    /// Interactivity never precedes LCP.
    pub fn compute(input: MetricInput<'_>, lcp: &MetricResult) -> Result<MetricResult, MetricError> {
        let mut result = Self::compute_with_graphs(
            input,
            MetricExtras {
                lcp: Some(lcp),
                ..Default::default()
            },
        )?;
        result.timing = result.timing.max(lcp.timing);
        Ok(result)
    }
}

impl LanternMetric for Interactive {
    const NAME: &'static str = "Interactive";
    const COEFFICIENTS: Coefficients = Coefficients {
        intercept: 0.0,
        optimistic: 0.45,
        pessimistic: 0.55,
    };

    /// Long tasks plus the scripts and important requests they may wait on.
    fn optimistic_graph(
        graph: &DependencyGraph,
        _navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        let filtered = graph.clone_with_relationships(|_, node| match &node.kind {
            NodeKind::Cpu(cpu) => cpu.duration() > CRITICAL_LONG_TASK_THRESHOLD,
            NodeKind::Network(network) => {
                let is_image = network.resource_type() == ResourceType::Image;
                let is_script = network.resource_type() == ResourceType::Script;
                let important = matches!(network.priority(), Priority::High | Priority::VeryHigh);
                !is_image && (is_script || important)
            }
        })?;
        Ok(filtered)
    }

    fn pessimistic_graph(
        graph: &DependencyGraph,
        _navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        Ok(graph.clone())
    }

    /// The later of LCP and the end of the last long task.
    fn estimate_from_simulation(
        graph: &DependencyGraph,
        simulation: &SimulationResult,
        extras: &MetricExtras<'_>,
    ) -> Result<Estimate, MetricError> {
        let lcp = MetricExtras::require(extras.lcp, "LCP", Self::NAME)?;
        let last_long_task_end = cpu_timings(graph, &simulation.node_timings)
            .filter(|t| t.duration > LONG_TASK_THRESHOLD)
            .map(|t| t.end_time)
            .fold(0.0, f64::max);
        Ok(Estimate {
            time_in_ms: extras.same_side(lcp).max(last_long_task_end),
            node_timings: simulation.node_timings.clone(),
        })
    }
}
