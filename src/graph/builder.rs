//! Builds a page dependency graph from main-thread trace events and network
//! requests.
//!
//! The build runs in stages: network nodes, CPU nodes, network linking, CPU
//! linking, pruning of short CPU tasks, and a final reachability and cycle
//! check. Unresolvable or unsafe links are skipped, never fatal.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::BuildError;
use crate::graph::dependency_graph::DependencyGraph;
use crate::graph::node::{Node, NodeKind};
use crate::network::analyzer::NetworkAnalyzer;
use crate::network::request::{NetworkRequest, ResourceType};
use crate::trace::{PageUrls, TraceEvent};
use crate::types::{Microseconds, NodeIndex};

/// CPU tasks shorter than this (in microseconds) may be pruned.
pub const SIGNIFICANT_DUR_THRESHOLD: Microseconds = 10_000.0;

/// Network nodes may end this long (in microseconds) after a task started and
/// still count as its cause.
const MAXIMUM_EAGER_EXECUTION: Microseconds = 100_000.0;

/// Lookup tables over the network nodes of a graph under construction.
#[derive(Debug, Default)]
struct NetworkLookup {
    by_url: HashMap<String, Vec<NodeIndex>>,
    /// Root document per frame, `None` when ambiguous
    frame_documents: HashMap<String, Option<NodeIndex>>,
}

impl NetworkLookup {
    fn record(&mut self, index: NodeIndex, request: &NetworkRequest) {
        self.by_url.entry(request.url.clone()).or_default().push(index);
        if let Some(frame_id) = &request.frame_id {
            let is_frame_root = request.is_document() && request.document_url.as_deref() == Some(request.url.as_str());
            if is_frame_root {
                let value = if self.frame_documents.contains_key(frame_id) {
                    None
                } else {
                    Some(index)
                };
                self.frame_documents.insert(frame_id.clone(), value);
            }
        }
    }

    fn frame_document(&self, frame_id: Option<&str>) -> Option<NodeIndex> {
        frame_id.and_then(|id| self.frame_documents.get(id).copied().flatten())
    }

    fn candidates(&self, url: &str) -> &[NodeIndex] {
        self.by_url.get(url).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Entry point for building dependency graphs.
pub struct PageDependencyGraph;

impl PageDependencyGraph {
    /// URLs of the resources that initiated `request`: the explicit initiator
    /// URL, or every URL on the initiating script stack including async parents.
    pub fn get_network_initiators(request: &NetworkRequest) -> Vec<String> {
        if let Some(url) = &request.initiator.url {
            return vec![url.clone()];
        }
        if request.initiator.kind != "script" {
            return Vec::new();
        }
        let mut seen = BTreeSet::new();
        let mut urls = Vec::new();
        let mut stack = request.initiator.stack.as_ref();
        while let Some(current) = stack {
            for frame in &current.call_frames {
                if !frame.url.is_empty() && seen.insert(frame.url.as_str()) {
                    urls.push(frame.url.clone());
                }
            }
            stack = current.parent.as_deref();
        }
        urls
    }

    /// Groups main-thread events into CPU nodes, one per top-level task.
    ///
    /// Events are expected in timestamp order. A task overlapping the next
    /// task is cut short just before it.
    pub fn get_cpu_nodes(main_thread_events: &[TraceEvent]) -> Vec<Node> {
        if !main_thread_events.iter().any(TraceEvent::is_schedulable_task) {
            tracing::warn!("could not find any top level events");
        }

        let mut nodes = Vec::new();
        let mut i = 0;
        while i < main_thread_events.len() {
            let event = &main_thread_events[i];
            i += 1;
            if !event.is_schedulable_task() || event.duration() == 0.0 {
                continue;
            }

            let end_time = event.ts + event.duration();
            let mut corrected_end_ts = None;
            let mut children = Vec::new();
            while i < main_thread_events.len() && main_thread_events[i].ts < end_time {
                let child = &main_thread_events[i];
                if child.is_schedulable_task() && child.duration() > 0.0 {
                    corrected_end_ts = Some(child.ts - 1.0);
                    break;
                }
                children.push(child.clone());
                i += 1;
            }
            nodes.push(Node::cpu(Arc::new(event.clone()), children, corrected_end_ts));
        }
        nodes
    }

    /// Builds the dependency graph of a page load.
    ///
    /// The root is the request for `urls.requested_url`; the last document for
    /// `urls.main_document_url` is flagged as the main document.
    pub fn create_graph(
        main_thread_events: &[TraceEvent],
        requests: &[NetworkRequest],
        urls: &PageUrls,
    ) -> Result<DependencyGraph, BuildError> {
        if urls.requested_url.is_empty() {
            return Err(BuildError::MissingRequestedUrl);
        }
        if urls.main_document_url.is_empty() {
            return Err(BuildError::MissingMainDocumentUrl);
        }

        // Network nodes, skipping video and worker traffic.
        let mut seen_ids: BTreeSet<String> = BTreeSet::new();
        let mut network_nodes: Vec<(usize, Node)> = Vec::new();
        for (position, request) in requests.iter().enumerate() {
            if request.mime_type.starts_with("video") || request.from_worker {
                continue;
            }
            let mut id = request.request_id.clone();
            while seen_ids.contains(&id) {
                id.push_str(":duplicate");
            }
            seen_ids.insert(id.clone());
            let mut request = request.clone();
            request.request_id = id;
            network_nodes.push((position, Node::network(Arc::new(request))));
        }

        let root_request = NetworkAnalyzer::find_resource_for_url(requests, &urls.requested_url)
            .ok_or_else(|| BuildError::RootRequestNotFound(urls.requested_url.clone()))?;
        let main_request = NetworkAnalyzer::find_last_document_for_url(requests, &urls.main_document_url)
            .ok_or_else(|| BuildError::MainDocumentNotFound(urls.main_document_url.clone()))?;
        let position_of = |target: &NetworkRequest| requests.iter().position(|r| std::ptr::eq(r, target));

        let root_slot = position_of(root_request)
            .and_then(|p| network_nodes.iter().position(|(pos, _)| *pos == p))
            .ok_or_else(|| BuildError::RootRequestNotFound(urls.requested_url.clone()))?;
        let main_id = position_of(main_request)
            .and_then(|p| network_nodes.iter().find(|(pos, _)| *pos == p))
            .map(|(_, node)| node.id.clone())
            .ok_or_else(|| BuildError::MainDocumentNotFound(urls.main_document_url.clone()))?;

        let (root_position, root_node) = network_nodes.remove(root_slot);
        let mut graph = DependencyGraph::new(root_node);
        let mut lookup = NetworkLookup::default();
        let mut ordered = vec![(root_position, graph.root())];
        for (position, node) in network_nodes {
            let index = graph.add_node(node)?;
            ordered.push((position, index));
        }
        // Linking follows the order of the input requests.
        ordered.sort_by_key(|(position, _)| *position);
        let network_indices: Vec<NodeIndex> = ordered.into_iter().map(|(_, index)| index).collect();
        for &index in &network_indices {
            if let Some(request) = graph.node(index).request() {
                lookup.record(index, request);
            }
        }

        let mut cpu_indices = Vec::new();
        for mut node in Self::get_cpu_nodes(main_thread_events) {
            while graph.find_by_id(&node.id).is_some() {
                node.id.push_str(":duplicate");
            }
            cpu_indices.push(graph.add_node(node)?);
        }

        Self::link_network_nodes(&mut graph, &lookup, &network_indices);
        Self::link_cpu_nodes(&mut graph, &lookup, &cpu_indices);
        Self::prune_short_tasks(&mut graph, &cpu_indices)?;

        graph.retain_reachable_from_root();
        let main_index = graph
            .find_by_id(&main_id)
            .ok_or_else(|| BuildError::MainDocumentNotFound(urls.main_document_url.clone()))?;
        graph.set_main_document(main_index);
        graph.assert_acyclic()?;

        tracing::debug!(
            nodes = graph.len(),
            network = graph.network_nodes().count(),
            cpu = graph.cpu_nodes().count(),
            "built page dependency graph"
        );
        Ok(graph)
    }

    /// Adds an edge unless it would form a cycle.
    fn link(graph: &mut DependencyGraph, node: NodeIndex, dependency: NodeIndex, reason: &str) {
        if let Err(err) = graph.add_dependency(node, dependency) {
            tracing::debug!(%err, reason, "skipped dependency");
        }
    }

    fn link_network_nodes(graph: &mut DependencyGraph, lookup: &NetworkLookup, indices: &[NodeIndex]) {
        let root = graph.root();
        for &index in indices {
            if index == root {
                continue;
            }
            let Some(request) = graph.node(index).request().cloned() else {
                continue;
            };

            let direct_initiator = request
                .initiator_request_id
                .as_deref()
                .and_then(|id| graph.find_by_id(id))
                .unwrap_or(root);
            let can_depend_on_initiator = !graph.is_dependent_on(direct_initiator, index)
                && graph.node(index).can_depend_on(graph.node(direct_initiator));

            let initiators = Self::get_network_initiators(&request);
            if initiators.is_empty() && can_depend_on_initiator {
                Self::link(graph, index, direct_initiator, "direct initiator");
            }
            for url in &initiators {
                match lookup.candidates(url) {
                    [parent]
                        if graph.node(*parent).start_time() <= graph.node(index).start_time()
                            && !graph.is_dependent_on(*parent, index) =>
                    {
                        Self::link(graph, index, *parent, "initiator url");
                    }
                    _ if can_depend_on_initiator => Self::link(graph, index, direct_initiator, "direct initiator"),
                    _ => {}
                }
            }

            if graph.dependencies(index).is_empty() && graph.node(index).can_depend_on(graph.node(root)) {
                Self::link(graph, index, root, "root fallback");
            }

            let chain: Vec<&str> = request
                .redirects
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(graph.node(index).id.as_str()))
                .collect::<Vec<_>>();
            let chain: Vec<Option<NodeIndex>> = chain.into_iter().map(|id| graph.find_by_id(id)).collect();
            for pair in chain.windows(2) {
                if let [Some(previous), Some(actual)] = pair {
                    if *actual != root {
                        Self::link(graph, *actual, *previous, "redirect");
                    }
                }
            }
        }
    }

    fn link_cpu_nodes(graph: &mut DependencyGraph, lookup: &NetworkLookup, cpu_indices: &[NodeIndex]) {
        let root = graph.root();
        let mut timers: HashMap<i64, NodeIndex> = HashMap::new();

        for &index in cpu_indices {
            let Some(cpu) = graph.node(index).as_cpu().cloned() else {
                continue;
            };
            for event in cpu.child_events.iter() {
                let Some(data) = event.data() else {
                    continue;
                };
                let stack_urls = event.stack_trace_urls();
                let frame = data.frame.as_deref();
                match event.name.as_str() {
                    "TimerInstall" => {
                        if let Some(timer_id) = data.timer_id {
                            timers.insert(timer_id, index);
                        }
                        Self::depend_on_urls(graph, lookup, index, &stack_urls);
                    }
                    "TimerFire" => {
                        let installer = data.timer_id.and_then(|id| timers.get(&id).copied());
                        if let Some(installer) = installer {
                            if graph.node(installer).end_time() <= graph.node(index).start_time() {
                                Self::link(graph, index, installer, "timer");
                            }
                        }
                    }
                    "InvalidateLayout" | "ScheduleStyleRecalculation" => {
                        Self::depend_on_frame(graph, lookup, index, frame);
                        Self::depend_on_urls(graph, lookup, index, &stack_urls);
                    }
                    "EvaluateScript" => {
                        Self::depend_on_frame(graph, lookup, index, frame);
                        Self::depend_on_url(graph, lookup, index, data.url.as_deref());
                        Self::depend_on_urls(graph, lookup, index, &stack_urls);
                    }
                    "XHRReadyStateChange" => {
                        if data.ready_state != Some(4) {
                            continue;
                        }
                        Self::depend_on_url(graph, lookup, index, data.url.as_deref());
                        Self::depend_on_urls(graph, lookup, index, &stack_urls);
                    }
                    "FunctionCall" | "v8.compile" => {
                        Self::depend_on_frame(graph, lookup, index, frame);
                        Self::depend_on_url(graph, lookup, index, data.url.as_deref());
                    }
                    "ParseAuthorStyleSheet" => {
                        Self::depend_on_frame(graph, lookup, index, frame);
                        Self::depend_on_url(graph, lookup, index, data.style_sheet_url.as_deref());
                    }
                    "ResourceSendRequest" => {
                        Self::depend_on_frame(graph, lookup, index, frame);
                        Self::add_dependent_request(graph, index, data.request_id.as_deref());
                        Self::depend_on_urls(graph, lookup, index, &stack_urls);
                    }
                    _ => {}
                }
            }

            if graph.dependencies(index).is_empty() && graph.node(index).can_depend_on(graph.node(root)) {
                Self::link(graph, index, root, "root fallback");
            }
        }
    }

    fn depend_on_urls(graph: &mut DependencyGraph, lookup: &NetworkLookup, cpu: NodeIndex, urls: &[&str]) {
        for url in urls {
            Self::depend_on_url(graph, lookup, cpu, Some(url));
        }
    }

    /// Links `cpu` to the same-URL request that finished closest before it.
    ///
    /// Gives up when any candidate started at or after the task.
    fn depend_on_url(graph: &mut DependencyGraph, lookup: &NetworkLookup, cpu: NodeIndex, url: Option<&str>) {
        let Some(url) = url else {
            return;
        };
        let cpu_start = graph.node(cpu).start_time();
        let mut best: Option<(NodeIndex, f64)> = None;
        for &candidate in lookup.candidates(url) {
            let node = graph.node(candidate);
            if cpu_start <= node.start_time() {
                return;
            }
            let distance = cpu_start - node.end_time();
            if distance >= -MAXIMUM_EAGER_EXECUTION && best.map_or(true, |(_, d)| distance < d) {
                best = Some((candidate, distance));
            }
        }
        if let Some((candidate, _)) = best {
            Self::link(graph, cpu, candidate, "url");
        }
    }

    fn depend_on_frame(graph: &mut DependencyGraph, lookup: &NetworkLookup, cpu: NodeIndex, frame: Option<&str>) {
        let Some(document) = lookup.frame_document(frame) else {
            return;
        };
        if graph.node(document).start_time() >= graph.node(cpu).start_time() {
            return;
        }
        Self::link(graph, cpu, document, "frame");
    }

    /// Makes a request issued by `cpu` depend on it.
    fn add_dependent_request(graph: &mut DependencyGraph, cpu: NodeIndex, request_id: Option<&str>) {
        let Some(network) = request_id.and_then(|id| graph.find_by_id(id)) else {
            return;
        };
        let Some(request) = graph.node(network).request().cloned() else {
            return;
        };
        if graph.node(network).start_time() <= graph.node(cpu).start_time() {
            return;
        }
        let redirect_type = request
            .redirect_destination_id
            .as_deref()
            .and_then(|id| graph.find_by_id(id))
            .and_then(|i| graph.node(i).request().map(|r| r.resource_type));
        let linkable = |t: ResourceType| matches!(t, ResourceType::XHR | ResourceType::Fetch | ResourceType::Script);
        if linkable(request.resource_type) || redirect_type.is_some_and(linkable) {
            Self::link(graph, network, cpu, "resource send request");
        }
    }

    /// Removes short CPU tasks that are cheap to rewire around.
    fn prune_short_tasks(graph: &mut DependencyGraph, cpu_indices: &[NodeIndex]) -> Result<(), BuildError> {
        let mut found_layout = false;
        let mut found_paint = false;
        let mut found_parse = false;
        let mut pruned = 0usize;

        for &index in cpu_indices {
            let NodeKind::Cpu(cpu) = &graph.node(index).kind else {
                continue;
            };
            let has_child = |name: &str| cpu.child_events.iter().any(|e| e.name == name);
            let mut is_first = false;
            if !found_layout && has_child("Layout") {
                found_layout = true;
                is_first = true;
            }
            if !found_paint && has_child("Paint") {
                found_paint = true;
                is_first = true;
            }
            if !found_parse && has_child("ParseHTML") {
                found_parse = true;
                is_first = true;
            }
            if is_first || cpu.duration() >= SIGNIFICANT_DUR_THRESHOLD {
                continue;
            }

            let dependencies = graph.dependencies(index).len();
            let dependents = graph.dependents(index).len();
            if dependencies >= 1 && (dependencies == 1 || dependents <= 1) {
                graph.prune_node(index)?;
                pruned += 1;
            }
        }
        tracing::trace!(pruned, "pruned short cpu tasks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::request::{Initiator, InitiatorStack};
    use crate::trace::{CallFrame, TraceEventData};

    fn doc(id: &str, url: &str, start: f64, end: f64) -> NetworkRequest {
        NetworkRequest::new(id, url, start, end).with_resource_type(ResourceType::Document)
    }

    #[test]
    fn test_network_initiators_from_script_stack() {
        let stack = InitiatorStack {
            call_frames: vec![CallFrame {
                url: "https://a.test/a.js".into(),
                ..Default::default()
            }],
            parent: Some(Box::new(InitiatorStack {
                call_frames: vec![
                    CallFrame {
                        url: "https://a.test/b.js".into(),
                        ..Default::default()
                    },
                    CallFrame {
                        url: "https://a.test/a.js".into(),
                        ..Default::default()
                    },
                ],
                parent: None,
            })),
        };
        let request = NetworkRequest::new("1", "https://a.test/x", 0.0, 1.0).with_initiator(Initiator::script(stack));
        assert_eq!(
            PageDependencyGraph::get_network_initiators(&request),
            vec!["https://a.test/a.js".to_string(), "https://a.test/b.js".to_string()]
        );
    }

    #[test]
    fn test_cpu_nodes_bundle_children_and_correct_overlap() {
        let events = vec![
            TraceEvent::complete("RunTask", 1000.0, 500.0),
            TraceEvent::complete("EvaluateScript", 1100.0, 50.0),
            TraceEvent::complete("RunTask", 1400.0, 100.0),
            TraceEvent::complete("Layout", 1450.0, 10.0),
            TraceEvent::complete("RunTask", 2000.0, 0.0),
        ];
        let nodes = PageDependencyGraph::get_cpu_nodes(&events);
        assert_eq!(nodes.len(), 2);
        let first = nodes[0].as_cpu().unwrap();
        assert_eq!(first.child_events.len(), 1);
        assert_eq!(first.corrected_end_ts, Some(1399.0));
        assert!(nodes[1].as_cpu().unwrap().did_perform_layout());
    }

    #[test]
    fn test_missing_urls_are_errors() {
        let requests = vec![doc("1", "https://a.test/", 0.0, 10.0)];
        let err = PageDependencyGraph::create_graph(&[], &requests, &PageUrls::new("", "https://a.test/")).unwrap_err();
        assert_eq!(err, BuildError::MissingRequestedUrl);
        let err = PageDependencyGraph::create_graph(&[], &requests, &PageUrls::new("https://b.test/", "https://b.test/"))
            .unwrap_err();
        assert!(matches!(err, BuildError::RootRequestNotFound(_)));
    }

    #[test]
    fn test_links_initiator_url_and_root_fallback() {
        let requests = vec![
            doc("1", "https://a.test/", 0.0, 10.0),
            NetworkRequest::new("2", "https://a.test/app.js", 12.0, 20.0)
                .with_resource_type(ResourceType::Script)
                .with_initiator(Initiator::parser("https://a.test/")),
            NetworkRequest::new("3", "https://a.test/img.png", 25.0, 30.0)
                .with_initiator(Initiator::parser("https://a.test/app.js")),
            NetworkRequest::new("4", "https://b.test/x", 5.0, 8.0),
        ];
        let urls = PageUrls::new("https://a.test/", "https://a.test/");
        let graph = PageDependencyGraph::create_graph(&[], &requests, &urls).unwrap();
        let id = |s: &str| graph.find_by_id(s).unwrap();
        assert_eq!(graph.dependencies(id("2")), &[id("1")]);
        assert_eq!(graph.dependencies(id("3")), &[id("2")]);
        assert_eq!(graph.dependencies(id("4")), &[id("1")]);
        assert_eq!(graph.main_document(), Some(id("1")));
    }

    #[test]
    fn test_redirect_chain_linked() {
        let mut first = doc("1", "http://a.test/", 0.0, 5.0);
        first.redirect_destination_id = Some("1:redirect".into());
        let second = doc("1:redirect", "https://a.test/", 5.0, 15.0).with_redirects(vec!["1".into()]);
        let urls = PageUrls::new("http://a.test/", "https://a.test/");
        let graph = PageDependencyGraph::create_graph(&[], &[first, second], &urls).unwrap();
        let redirected = graph.find_by_id("1:redirect").unwrap();
        assert_eq!(graph.dependencies(redirected), &[graph.root()]);
        assert_eq!(graph.main_document(), Some(redirected));
    }

    #[test]
    fn test_cpu_linked_to_evaluated_script() {
        let requests = vec![
            doc("1", "https://a.test/", 0.0, 10.0),
            NetworkRequest::new("2", "https://a.test/app.js", 12.0, 20.0).with_resource_type(ResourceType::Script),
        ];
        let events = vec![
            TraceEvent::complete("RunTask", 21_000.0, 30_000.0),
            TraceEvent::complete("EvaluateScript", 21_100.0, 20_000.0)
                .with_data(TraceEventData::with_url("https://a.test/app.js")),
        ];
        let urls = PageUrls::new("https://a.test/", "https://a.test/");
        let graph = PageDependencyGraph::create_graph(&events, &requests, &urls).unwrap();
        let cpu = graph.find_by_id("0.21000").unwrap();
        assert_eq!(graph.dependencies(cpu), &[graph.find_by_id("2").unwrap()]);
    }

    #[test]
    fn test_short_task_pruned_and_rewired() {
        let requests = vec![
            doc("1", "https://a.test/", 0.0, 10.0),
            NetworkRequest::new("2", "https://a.test/app.js", 12.0, 20.0).with_resource_type(ResourceType::Script),
            NetworkRequest::new("3", "https://a.test/data.json", 30.0, 40.0).with_resource_type(ResourceType::XHR),
        ];
        let send = TraceEventData {
            request_id: Some("3".into()),
            ..Default::default()
        };
        let events = vec![
            TraceEvent::complete("RunTask", 21_000.0, 2_000.0),
            TraceEvent::complete("EvaluateScript", 21_100.0, 1_000.0)
                .with_data(TraceEventData::with_url("https://a.test/app.js")),
            TraceEvent::complete("ResourceSendRequest", 22_500.0, 10.0).with_data(send),
        ];
        let urls = PageUrls::new("https://a.test/", "https://a.test/");
        let graph = PageDependencyGraph::create_graph(&events, &requests, &urls).unwrap();
        assert!(graph.find_by_id("0.21000").is_none());
        let xhr = graph.find_by_id("3").unwrap();
        assert!(graph.dependencies(xhr).contains(&graph.find_by_id("2").unwrap()));
    }

    #[test]
    fn test_video_and_worker_requests_skipped() {
        let mut worker = NetworkRequest::new("3", "https://a.test/w.js", 1.0, 2.0);
        worker.from_worker = true;
        let requests = vec![
            doc("1", "https://a.test/", 0.0, 10.0),
            NetworkRequest::new("2", "https://a.test/v.mp4", 1.0, 2.0).with_mime_type("video/mp4"),
            worker,
        ];
        let urls = PageUrls::new("https://a.test/", "https://a.test/");
        let graph = PageDependencyGraph::create_graph(&[], &requests, &urls).unwrap();
        assert_eq!(graph.len(), 1);
    }
}
