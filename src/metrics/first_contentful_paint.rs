//! First Contentful Paint.
//!
//! The FCP graphs keep only what plausibly blocked the first paint: requests
//! that finished before it with a render-blocking priority, and the CPU
//! tasks that evaluated those scripts or did the first layout, paint and
//! HTML parse.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::MetricError;
use crate::graph::{CpuNode, DependencyGraph, NetworkNode, NodeKind};
use crate::metrics::{script_urls, Coefficients, LanternMetric, MetricExtras, MetricInput, MetricResult};
use crate::trace::ProcessedNavigation;
use crate::types::{Microseconds, NodeIndex};

/// How to cut a graph down to what a paint at `cutoff_timestamp` needed.
pub struct PaintCutoff<'a> {
    /// Trace timestamp of the paint
    pub cutoff_timestamp: Microseconds,
    /// Whether a request that finished before the paint blocked it
    pub treat_node_as_render_blocking: &'a dyn Fn(&NetworkNode) -> bool,
    /// Tasks before the paint that always count as blocking
    pub additional_cpu_nodes_to_treat_as_render_blocking: Option<&'a dyn Fn(&CpuNode) -> bool>,
}

/// Which scripts and tasks a paint depended on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderBlockingNodeData {
    /// Scripts loaded before the paint but evaluated after it
    pub definitely_not_render_blocking_script_urls: BTreeSet<String>,
    pub render_blocking_cpu_nodes: BTreeSet<NodeIndex>,
}

pub struct FirstContentfulPaint;

impl FirstContentfulPaint {
    /// Classifies the nodes reachable from the root against the paint.
    pub fn render_blocking_node_data(graph: &DependencyGraph, cutoff: &PaintCutoff<'_>) -> RenderBlockingNodeData {
        let mut script_url_to_node: BTreeMap<String, NodeIndex> = BTreeMap::new();
        // tasks that started before the paint; the paint may be inside one
        let mut cpu_nodes: Vec<(NodeIndex, &CpuNode)> = Vec::new();

        for index in graph.traverse(graph.root()) {
            let NodeKind::Cpu(cpu) = &graph.node(index).kind else {
                continue;
            };
            if cpu.start_time() <= cutoff.cutoff_timestamp {
                cpu_nodes.push((index, cpu));
            }
            // keep the earliest task evaluating each script
            for url in cpu.evaluate_script_urls() {
                let earliest = match script_url_to_node.get(&url) {
                    Some(&existing) if graph.node(existing).start_time() <= cpu.start_time() => existing,
                    _ => index,
                };
                script_url_to_node.insert(url, earliest);
            }
        }
        cpu_nodes.sort_by(|a, b| a.1.start_time().total_cmp(&b.1.start_time()));

        let possibly_render_blocking = script_urls(graph, |network| {
            network.end_time() <= cutoff.cutoff_timestamp && (cutoff.treat_node_as_render_blocking)(network)
        });

        let mut data = RenderBlockingNodeData::default();
        for url in possibly_render_blocking {
            let Some(&evaluated_by) = script_url_to_node.get(&url) else {
                continue;
            };
            if cpu_nodes.iter().any(|(i, _)| *i == evaluated_by) {
                data.render_blocking_cpu_nodes.insert(evaluated_by);
            } else {
                data.definitely_not_render_blocking_script_urls.insert(url);
            }
        }

        let has_child = |cpu: &CpuNode, name: &str| cpu.child_events.iter().any(|e| e.name == name);
        let firsts = [
            cpu_nodes.iter().find(|(_, c)| c.did_perform_layout()),
            cpu_nodes.iter().find(|(_, c)| has_child(c, "Paint")),
            cpu_nodes.iter().find(|(_, c)| has_child(c, "ParseHTML")),
        ];
        data.render_blocking_cpu_nodes.extend(firsts.into_iter().flatten().map(|(i, _)| *i));

        if let Some(additional) = cutoff.additional_cpu_nodes_to_treat_as_render_blocking {
            data.render_blocking_cpu_nodes
                .extend(cpu_nodes.iter().filter(|(_, c)| additional(c)).map(|(i, _)| *i));
        }
        data
    }

    /// Subgraph of the nodes the paint at the cutoff depended on.
    ///
    /// The main document is always kept.
    pub fn first_paint_based_graph(
        graph: &DependencyGraph,
        cutoff: &PaintCutoff<'_>,
    ) -> Result<DependencyGraph, MetricError> {
        let data = Self::render_blocking_node_data(graph, cutoff);
        let filtered = graph.clone_with_relationships(|index, node| match &node.kind {
            NodeKind::Network(network) => {
                // requests that never finished have a negative end
                let ended_after_paint = network.end_time() > cutoff.cutoff_timestamp
                    || network.start_time() > cutoff.cutoff_timestamp;
                if ended_after_paint && !node.is_main_document {
                    return false;
                }
                if data
                    .definitely_not_render_blocking_script_urls
                    .contains(&network.request.url)
                {
                    return false;
                }
                node.is_main_document || (cutoff.treat_node_as_render_blocking)(network)
            }
            NodeKind::Cpu(_) => data.render_blocking_cpu_nodes.contains(&index),
        })?;
        Ok(filtered)
    }

    fn fcp_timestamp(navigation: &ProcessedNavigation) -> Result<Microseconds, MetricError> {
        navigation
            .timestamps
            .first_contentful_paint
            .ok_or(MetricError::MissingTimestamp("firstContentfulPaint"))
    }

    pub fn compute(input: MetricInput<'_>) -> Result<MetricResult, MetricError> {
        Self::compute_with_graphs(input, MetricExtras::default())
    }
}

impl LanternMetric for FirstContentfulPaint {
    const NAME: &'static str = "FirstContentfulPaint";
    const COEFFICIENTS: Coefficients = Coefficients {
        intercept: 0.0,
        optimistic: 0.5,
        pessimistic: 0.5,
    };

    /// Drops render-blocking requests initiated by scripts; the script is
    /// the likelier culprit.
    fn optimistic_graph(
        graph: &DependencyGraph,
        navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        let treat = |network: &NetworkNode| network.has_render_blocking_priority() && network.initiator_type() != "script";
        Self::first_paint_based_graph(
            graph,
            &PaintCutoff {
                cutoff_timestamp: Self::fcp_timestamp(navigation)?,
                treat_node_as_render_blocking: &treat,
                additional_cpu_nodes_to_treat_as_render_blocking: None,
            },
        )
    }

    fn pessimistic_graph(
        graph: &DependencyGraph,
        navigation: &ProcessedNavigation,
    ) -> Result<DependencyGraph, MetricError> {
        let treat = |network: &NetworkNode| network.has_render_blocking_priority();
        Self::first_paint_based_graph(
            graph,
            &PaintCutoff {
                cutoff_timestamp: Self::fcp_timestamp(navigation)?,
                treat_node_as_render_blocking: &treat,
                additional_cpu_nodes_to_treat_as_render_blocking: None,
            },
        )
    }
}
