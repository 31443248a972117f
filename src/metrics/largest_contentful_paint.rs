//! Largest Contentful Paint.

use crate::error::MetricError;
use crate::graph::{CpuNode, DependencyGraph, NetworkNode, Node, NodeKind};
use crate::metrics::first_contentful_paint::{FirstContentfulPaint, PaintCutoff};
use crate::metrics::{Coefficients, Estimate, LanternMetric, MetricExtras, MetricInput, MetricResult};
use crate::network::request::{Priority, ResourceType};
use crate::simulator::SimulationResult;
use crate::trace::ProcessedNavigation;
use crate::types::Microseconds;

pub struct LargestContentfulPaint;

/// Low priority images are not the LCP candidate; everything else may be.
pub fn is_not_low_priority_image_node(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Cpu(_) => true,
        NodeKind::Network(network) => is_not_low_priority_image(network),
    }
}

fn is_not_low_priority_image(network: &NetworkNode) -> bool {
    let low_priority = matches!(network.priority(), Priority::Low | Priority::VeryLow);
    !(network.resource_type() == ResourceType::Image && low_priority)
}

impl LargestContentfulPaint {
    fn lcp_timestamp(navigation: &ProcessedNavigation) -> Result<Microseconds, MetricError> {
        navigation
            .timestamps
            .largest_contentful_paint
            .ok_or(MetricError::MissingTimestamp("largestContentfulPaint"))
    }

    /// LCP never precedes FCP, on either side.
    pub fn compute(input: MetricInput<'_>, fcp: &MetricResult) -> Result<MetricResult, MetricError> {
        let mut result = Self::compute_with_graphs(
            input,
            MetricExtras {
                fcp: Some(fcp),
                ..Default::default()
            },
        )?;
        result.timing = result.timing.max(fcp.timing);
        result.optimistic_estimate.time_in_ms = result
            .optimistic_estimate
            .time_in_ms
            .max(fcp.optimistic_estimate.time_in_ms);
        result.pessimistic_estimate.time_in_ms = result
            .pessimistic_estimate
            .time_in_ms
            .max(fcp.pessimistic_estimate.time_in_ms);
        Ok(result)
    }
}

impl LanternMetric for LargestContentfulPaint {
    const NAME: &'static str = "LargestContentfulPaint";
    const COEFFICIENTS: Coefficients = Coefficients {
        intercept: 0.0,
        optimistic: 0.5,
        pessimistic: 0.5,
    };

    fn optimistic_graph(
        graph: &DependencyGraph,
        navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        FirstContentfulPaint::first_paint_based_graph(
            graph,
            &PaintCutoff {
                cutoff_timestamp: Self::lcp_timestamp(navigation)?,
                treat_node_as_render_blocking: &is_not_low_priority_image,
                additional_cpu_nodes_to_treat_as_render_blocking: None,
            },
        )
    }

    /// Every request before the paint plus every layout before it.
    fn pessimistic_graph(
        graph: &DependencyGraph,
        navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        let layouts = |cpu: &CpuNode| cpu.did_perform_layout();
        FirstContentfulPaint::first_paint_based_graph(
            graph,
            &PaintCutoff {
                cutoff_timestamp: Self::lcp_timestamp(navigation)?,
                treat_node_as_render_blocking: &|_: &NetworkNode| true,
                additional_cpu_nodes_to_treat_as_render_blocking: Some(&layouts),
            },
        )
    }

    /// Ends when the last node that could hold the LCP element finishes.
    fn estimate_from_simulation(
        graph: &DependencyGraph,
        simulation: &SimulationResult,
        _extras: &MetricExtras<'_>,
    ) -> Result<Estimate, MetricError> {
        let time_in_ms = simulation
            .node_timings
            .iter()
            .filter(|(i, _)| graph.get(**i).is_some_and(is_not_low_priority_image_node))
            .map(|(_, t)| t.end_time)
            .fold(0.0, f64::max);
        Ok(Estimate {
            time_in_ms,
            node_timings: simulation.node_timings.clone(),
        })
    }
}
