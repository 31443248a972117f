//! Total Blocking Time.

use crate::error::MetricError;
use crate::graph::DependencyGraph;
use crate::metrics::blocking_time::{calculate_sum_of_blocking_time, TaskSpan, BLOCKING_TIME_THRESHOLD};
use crate::metrics::{cpu_timings, Coefficients, Estimate, LanternMetric, MetricExtras, MetricInput, MetricResult};
use crate::simulator::SimulationResult;
use crate::trace::ProcessedNavigation;

pub struct TotalBlockingTime;

impl TotalBlockingTime {
    pub fn compute(
        input: MetricInput<'_>,
        fcp: &MetricResult,
        interactive: &MetricResult,
    ) -> Result<MetricResult, MetricError> {
        Self::compute_with_graphs(
            input,
            MetricExtras {
                fcp: Some(fcp),
                interactive: Some(interactive),
                ..Default::default()
            },
        )
    }
}

impl LanternMetric for TotalBlockingTime {
    const NAME: &'static str = "TotalBlockingTime";
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

    /// Blocking time between FCP and interactivity.
    ///
    /// The window opens at the opposite side's FCP: an optimistic FCP paired
    /// with an optimistic TTI would shrink the window twice.
    fn estimate_from_simulation(
        graph: &DependencyGraph,
        simulation: &SimulationResult,
        extras: &MetricExtras<'_>,
    ) -> Result<Estimate, MetricError> {
        let fcp = MetricExtras::require(extras.fcp, "FCP", Self::NAME)?;
        let interactive = MetricExtras::require(extras.interactive, "Interactive", Self::NAME)?;
        let start = extras.opposite_side(fcp);
        let end = extras.same_side(interactive);

        let events: Vec<TaskSpan> = cpu_timings(graph, &simulation.node_timings)
            .filter(|t| t.duration >= BLOCKING_TIME_THRESHOLD)
            .map(|t| TaskSpan::from(*t))
            .collect();
        Ok(Estimate {
            time_in_ms: calculate_sum_of_blocking_time(&events, start, end),
            node_timings: simulation.node_timings.clone(),
        })
    }
}
