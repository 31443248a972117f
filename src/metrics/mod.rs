//! Page-load metric estimates from simulated graphs.
//!
//! Each metric simulates an optimistic and a pessimistic subgraph of the page
//! and blends the two estimates with fitted coefficients. Metrics that build
//! on another metric (LCP never precedes FCP, for instance) take that result
//! as an input; [`MetricComputer`] resolves those dependencies and computes
//! each metric at most once.

pub mod blocking_time;
pub mod first_contentful_paint;
pub mod interactive;
pub mod largest_contentful_paint;
pub mod max_potential_fid;
pub mod total_blocking_time;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::error::MetricError;
use crate::graph::{DependencyGraph, NetworkNode, NodeKind};
use crate::network::request::ResourceType;
use crate::parallel::{join, ComputedCache};
use crate::simulator::{NodeTiming, SimulateOptions, SimulationResult, Simulator};
use crate::trace::ProcessedNavigation;
use crate::types::{Milliseconds, NodeIndex};

pub use blocking_time::{calculate_sum_of_blocking_time, TaskSpan, BLOCKING_TIME_THRESHOLD};
pub use first_contentful_paint::FirstContentfulPaint;
pub use interactive::Interactive;
pub use largest_contentful_paint::LargestContentfulPaint;
pub use max_potential_fid::MaxPotentialFid;
pub use total_blocking_time::TotalBlockingTime;

/// Weights blending the optimistic and pessimistic estimates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Coefficients {
    pub intercept: f64,
    pub optimistic: f64,
    pub pessimistic: f64,
}

/// Everything a metric is computed from.
#[derive(Clone, Copy, Debug)]
pub struct MetricInput<'a> {
    pub simulator: &'a Simulator,
    pub graph: &'a DependencyGraph,
    pub navigation: &'a ProcessedNavigation,
}

/// One side of a metric estimate.
///
/// Node timings are keyed by indices of the graph that was simulated for
/// this side, not of the full page graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Estimate {
    pub time_in_ms: Milliseconds,
    pub node_timings: BTreeMap<NodeIndex, NodeTiming>,
}

impl Estimate {
    pub fn from_simulation(simulation: &SimulationResult) -> Self {
        Self {
            time_in_ms: simulation.time_in_ms,
            node_timings: simulation.node_timings.clone(),
        }
    }
}

/// A computed metric.
#[derive(Clone, Debug)]
pub struct MetricResult {
    /// Blended estimate in milliseconds
    pub timing: Milliseconds,
    pub optimistic_estimate: Estimate,
    pub pessimistic_estimate: Estimate,
    pub optimistic_graph: DependencyGraph,
    pub pessimistic_graph: DependencyGraph,
}

/// Results of other metrics an estimate depends on.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricExtras<'a> {
    /// Whether the estimate being made is the optimistic one
    pub optimistic: bool,
    pub fcp: Option<&'a MetricResult>,
    pub lcp: Option<&'a MetricResult>,
    pub interactive: Option<&'a MetricResult>,
}

impl<'a> MetricExtras<'a> {
    fn require(
        result: Option<&'a MetricResult>,
        needed: &'static str,
        metric: &'static str,
    ) -> Result<&'a MetricResult, MetricError> {
        result.ok_or(MetricError::MissingDependency(needed, metric))
    }

    /// The estimate of `result` on the same side as the one being made.
    fn same_side(&self, result: &MetricResult) -> Milliseconds {
        if self.optimistic {
            result.optimistic_estimate.time_in_ms
        } else {
            result.pessimistic_estimate.time_in_ms
        }
    }

    /// The estimate of `result` on the opposite side.
    fn opposite_side(&self, result: &MetricResult) -> Milliseconds {
        if self.optimistic {
            result.pessimistic_estimate.time_in_ms
        } else {
            result.optimistic_estimate.time_in_ms
        }
    }
}

/// A metric estimated by simulating optimistic and pessimistic graphs.
pub trait LanternMetric {
    const NAME: &'static str;
    const COEFFICIENTS: Coefficients;

    fn scaled_coefficients(_rtt: Milliseconds) -> Coefficients {
        Self::COEFFICIENTS
    }

    fn optimistic_graph(
        graph: &DependencyGraph,
        navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError>;

    fn pessimistic_graph(
        graph: &DependencyGraph,
        navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError>;

    /// Turns a simulation of `graph` into an estimate; defaults to its total time.
    fn estimate_from_simulation(
        _graph: &DependencyGraph,
        simulation: &SimulationResult,
        _extras: &MetricExtras<'_>,
    ) -> Result<Estimate, MetricError> {
        Ok(Estimate::from_simulation(simulation))
    }

    /// Simulates both graphs and blends the estimates.
    ///
    /// The optimistic graph is simulated twice, with strict and flexible
    /// connection ordering, and the faster of the two is kept.
    fn compute_with_graphs(input: MetricInput<'_>, extras: MetricExtras<'_>) -> Result<MetricResult, MetricError> {
        let optimistic_graph = Self::optimistic_graph(input.graph, input.navigation)?;
        let pessimistic_graph = Self::pessimistic_graph(input.graph, input.navigation)?;
        let simulator = input.simulator;

        let ((optimistic, optimistic_flex), pessimistic) = join(
            || {
                join(
                    || simulator.simulate(&optimistic_graph, &SimulateOptions::labeled(format!("optimistic{}", Self::NAME))),
                    || {
                        simulator.simulate(
                            &optimistic_graph,
                            &SimulateOptions {
                                label: Some(format!("optimisticFlex{}", Self::NAME)),
                                flexible_ordering: true,
                                ..Default::default()
                            },
                        )
                    },
                )
            },
            || simulator.simulate(&pessimistic_graph, &SimulateOptions::labeled(format!("pessimistic{}", Self::NAME))),
        );
        let (optimistic, optimistic_flex, pessimistic) = (optimistic?, optimistic_flex?, pessimistic?);
        let optimistic = if optimistic.time_in_ms < optimistic_flex.time_in_ms {
            optimistic
        } else {
            optimistic_flex
        };

        let optimistic_estimate = Self::estimate_from_simulation(
            &optimistic_graph,
            &optimistic,
            &MetricExtras {
                optimistic: true,
                ..extras
            },
        )?;
        let pessimistic_estimate = Self::estimate_from_simulation(
            &pessimistic_graph,
            &pessimistic,
            &MetricExtras {
                optimistic: false,
                ..extras
            },
        )?;

        let coefficients = Self::scaled_coefficients(simulator.rtt());
        // estimates under a second do not follow the fitted curve
        let intercept_multiplier = if coefficients.intercept > 0.0 {
            (optimistic_estimate.time_in_ms / 1000.0).min(1.0)
        } else {
            1.0
        };
        let timing = intercept_multiplier * coefficients.intercept
            + coefficients.optimistic * optimistic_estimate.time_in_ms
            + coefficients.pessimistic * pessimistic_estimate.time_in_ms;

        tracing::debug!(
            metric = Self::NAME,
            timing,
            optimistic = optimistic_estimate.time_in_ms,
            pessimistic = pessimistic_estimate.time_in_ms,
            "computed metric"
        );
        Ok(MetricResult {
            timing,
            optimistic_estimate,
            pessimistic_estimate,
            optimistic_graph,
            pessimistic_graph,
        })
    }
}

/// URLs of script requests reachable from the root that pass `filter`.
pub fn script_urls<F>(graph: &DependencyGraph, filter: F) -> BTreeSet<String>
where
    F: Fn(&NetworkNode) -> bool,
{
    graph
        .traverse(graph.root())
        .into_iter()
        .filter_map(|i| match &graph.node(i).kind {
            NodeKind::Network(network) if network.resource_type() == ResourceType::Script && filter(network) => {
                Some(network.request.url.clone())
            }
            _ => None,
        })
        .collect()
}

/// Timings of CPU nodes in a simulation of `graph`.
pub(crate) fn cpu_timings<'a>(
    graph: &'a DependencyGraph,
    node_timings: &'a BTreeMap<NodeIndex, NodeTiming>,
) -> impl Iterator<Item = &'a NodeTiming> + 'a {
    node_timings
        .iter()
        .filter(move |(i, _)| graph.get(**i).is_some_and(|n| n.is_cpu()))
        .map(|(_, t)| t)
}

/// Metrics that can be computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MetricKind {
    FirstContentfulPaint,
    LargestContentfulPaint,
    Interactive,
    TotalBlockingTime,
    MaxPotentialFid,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::FirstContentfulPaint,
        MetricKind::LargestContentfulPaint,
        MetricKind::Interactive,
        MetricKind::TotalBlockingTime,
        MetricKind::MaxPotentialFid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::FirstContentfulPaint => FirstContentfulPaint::NAME,
            MetricKind::LargestContentfulPaint => LargestContentfulPaint::NAME,
            MetricKind::Interactive => Interactive::NAME,
            MetricKind::TotalBlockingTime => TotalBlockingTime::NAME,
            MetricKind::MaxPotentialFid => MaxPotentialFid::NAME,
        }
    }
}

type CachedMetric = Result<Arc<MetricResult>, MetricError>;

/// Computes metrics for one page, each at most once.
#[derive(Debug)]
pub struct MetricComputer<'a> {
    input: MetricInput<'a>,
    cache: ComputedCache<MetricKind, CachedMetric>,
}

impl<'a> MetricComputer<'a> {
    pub fn new(input: MetricInput<'a>) -> Self {
        Self {
            input,
            cache: ComputedCache::new(),
        }
    }

    /// Computes `kind` and the metrics it depends on, reusing earlier results.
    pub fn request(&self, kind: MetricKind) -> CachedMetric {
        self.cache
            .get_or_compute(&kind, || self.compute_uncached(kind))
            .unwrap_or_else(|_| Err(MetricError::CircularDependency(kind.as_str())))
    }

    fn compute_uncached(&self, kind: MetricKind) -> CachedMetric {
        let input = self.input;
        let result = match kind {
            MetricKind::FirstContentfulPaint => FirstContentfulPaint::compute(input),
            MetricKind::LargestContentfulPaint => {
                let fcp = self.request(MetricKind::FirstContentfulPaint)?;
                LargestContentfulPaint::compute(input, &fcp)
            }
            MetricKind::Interactive => {
                let lcp = self.request(MetricKind::LargestContentfulPaint)?;
                Interactive::compute(input, &lcp)
            }
            MetricKind::TotalBlockingTime => {
                let fcp = self.request(MetricKind::FirstContentfulPaint)?;
                let interactive = self.request(MetricKind::Interactive)?;
                TotalBlockingTime::compute(input, &fcp, &interactive)
            }
            MetricKind::MaxPotentialFid => {
                let fcp = self.request(MetricKind::FirstContentfulPaint)?;
                MaxPotentialFid::compute(input, &fcp)
            }
        };
        result.map(Arc::new)
    }

    /// Computes every metric; failed metrics are absent from the result.
    pub fn compute_all(&self) -> LanternMetrics {
        // FCP first so the two branches below never wait on each other
        let fcp = self.request(MetricKind::FirstContentfulPaint);
        let ((lcp, interactive, tbt), max_potential_fid) = join(
            || {
                (
                    self.request(MetricKind::LargestContentfulPaint),
                    self.request(MetricKind::Interactive),
                    self.request(MetricKind::TotalBlockingTime),
                )
            },
            || self.request(MetricKind::MaxPotentialFid),
        );

        LanternMetrics {
            first_contentful_paint: available(MetricKind::FirstContentfulPaint, fcp),
            largest_contentful_paint: available(MetricKind::LargestContentfulPaint, lcp),
            interactive: available(MetricKind::Interactive, interactive),
            total_blocking_time: available(MetricKind::TotalBlockingTime, tbt),
            max_potential_fid: available(MetricKind::MaxPotentialFid, max_potential_fid),
        }
    }
}

fn available(kind: MetricKind, result: CachedMetric) -> Option<Arc<MetricResult>> {
    match result {
        Ok(result) => Some(result),
        Err(err) => {
            tracing::warn!(metric = kind.as_str(), error = %err, "metric unavailable");
            None
        }
    }
}

/// Every metric of a page; `None` when it could not be computed.
#[derive(Clone, Debug, Default)]
pub struct LanternMetrics {
    pub first_contentful_paint: Option<Arc<MetricResult>>,
    pub largest_contentful_paint: Option<Arc<MetricResult>>,
    pub interactive: Option<Arc<MetricResult>>,
    pub total_blocking_time: Option<Arc<MetricResult>>,
    pub max_potential_fid: Option<Arc<MetricResult>>,
}

impl LanternMetrics {
    pub fn get(&self, kind: MetricKind) -> Option<&MetricResult> {
        let result = match kind {
            MetricKind::FirstContentfulPaint => &self.first_contentful_paint,
            MetricKind::LargestContentfulPaint => &self.largest_contentful_paint,
            MetricKind::Interactive => &self.interactive,
            MetricKind::TotalBlockingTime => &self.total_blocking_time,
            MetricKind::MaxPotentialFid => &self.max_potential_fid,
        };
        result.as_deref()
    }

    /// Blended timing of every available metric.
    pub fn timings(&self) -> BTreeMap<MetricKind, Milliseconds> {
        MetricKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|r| (kind, r.timing)))
            .collect()
    }

    /// Blended timings as a JSON object keyed by metric name.
    pub fn to_json(&self) -> serde_json::Value {
        let timings: serde_json::Map<String, serde_json::Value> = self
            .timings()
            .into_iter()
            .map(|(kind, timing)| (kind.as_str().to_string(), serde_json::json!(timing)))
            .collect();
        serde_json::Value::Object(timings)
    }
}

/// Computes every metric for a page.
pub fn compute_all(input: MetricInput<'_>) -> LanternMetrics {
    MetricComputer::new(input).compute_all()
}
