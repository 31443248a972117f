//! Discrete-event simulation of a page load over a dependency graph.
//!
//! Before a run, the reachable nodes are put in one simulation order: a
//! topological order that prefers earlier observed starts, with requests
//! penalized by priority. That order fixes everything that is not timing:
//! CPU tasks run one after another in it, and requests are planned onto
//! connections and request slots by replaying the observed load in it.
//!
//! A node starts once its dependencies and the nodes it queues behind (the
//! previous CPU task, the previous user of its connection and request slot)
//! completed. Each step advances time to the earliest completion among
//! in-progress nodes. Since no decision depends on simulated time, a slower
//! network never lets any node start earlier.
//!
//! # Example
//!
//! ```rust,ignore
//! let simulator = Simulator::new(SimulatorOptions::default())?;
//! let result = simulator.simulate(&graph, &SimulateOptions::default())?;
//! println!("page loaded in {}ms", result.time_in_ms);
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{
    LanternSettings, ThrottlingMethod, DEVTOOLS_RTT_ADJUSTMENT_FACTOR, DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR,
};
use crate::error::SimulationError;
use crate::graph::{CpuNode, DependencyGraph, NetworkNode, NodeKind, NodeType};
use crate::network::analyzer::NetworkAnalysis;
use crate::network::request::NetworkRequest;
use crate::simulator::connection_pool::{ConnectionId, ConnectionPool};
use crate::simulator::dns_cache::DnsCache;
use crate::simulator::tcp_connection::{ConnectionTiming, DownloadOptions, TcpConnection};
use crate::simulator::timing::{NetworkProgress, SimulatorTimingMap};
use crate::stats::{OriginStats, SimulationStats};
use crate::types::{Microseconds, Milliseconds, NodeIndex};

pub const DEFAULT_RTT: Milliseconds = 150.0;
/// Bits per second
pub const DEFAULT_THROUGHPUT: f64 = 1.6 * 1024.0 * 1024.0;
pub const DEFAULT_MAXIMUM_CONCURRENT_REQUESTS: usize = 10;
pub const DEFAULT_CPU_SLOWDOWN_MULTIPLIER: f64 = 4.0;
pub const DEFAULT_LAYOUT_TASK_MULTIPLIER: f64 = 0.5;
pub const DEFAULT_MAXIMUM_CPU_TASK_DURATION: Milliseconds = 10_000.0;

/// Network and CPU characteristics to simulate.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatorOptions {
    pub rtt: Milliseconds,
    /// Bits per second shared by concurrent requests; must be positive
    pub throughput: f64,
    /// Throughput of the recorded load, used to price wasted bytes when
    /// `throughput` is unlimited
    pub observed_throughput: f64,
    pub maximum_concurrent_requests: usize,
    pub cpu_slowdown_multiplier: f64,
    /// Applied on top of `cpu_slowdown_multiplier` for tasks that ran layout
    pub layout_task_multiplier: f64,
    pub additional_rtt_by_origin: BTreeMap<String, Milliseconds>,
    pub server_response_time_by_origin: BTreeMap<String, Milliseconds>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            rtt: DEFAULT_RTT,
            throughput: DEFAULT_THROUGHPUT,
            observed_throughput: 0.0,
            maximum_concurrent_requests: DEFAULT_MAXIMUM_CONCURRENT_REQUESTS,
            cpu_slowdown_multiplier: DEFAULT_CPU_SLOWDOWN_MULTIPLIER,
            layout_task_multiplier: DEFAULT_LAYOUT_TASK_MULTIPLIER,
            additional_rtt_by_origin: BTreeMap::new(),
            server_response_time_by_origin: BTreeMap::new(),
        }
    }
}

/// Per-run knobs.
#[derive(Clone, Debug, Default)]
pub struct SimulateOptions {
    /// Name used in logs and statistics
    pub label: Option<String>,
    /// Let requests use any free connection regardless of observed reuse
    pub flexible_ordering: bool,
    /// Keep the full timing state of every node in the result
    pub collect_debug_timings: bool,
}

impl SimulateOptions {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }
}

/// Simulated start and end of a node, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTiming {
    pub start_time: Milliseconds,
    pub end_time: Milliseconds,
    pub duration: Milliseconds,
    /// Connection setup and download breakdown of requests sent over a connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_timing: Option<ConnectionTiming>,
}

/// Full timing state of a node, kept when debug timings are requested.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugNodeTiming {
    pub index: NodeIndex,
    pub node_id: String,
    pub node_type: NodeType,
    pub url: Option<String>,
    pub queued_time: Milliseconds,
    pub start_time: Milliseconds,
    pub end_time: Milliseconds,
    pub estimated_time_elapsed: Milliseconds,
    pub bytes_downloaded: f64,
    pub connection_timing: Option<ConnectionTiming>,
}

/// Outcome of one simulation.
#[derive(Clone, Debug)]
pub struct SimulationResult {
    pub time_in_ms: Milliseconds,
    pub node_timings: BTreeMap<NodeIndex, NodeTiming>,
    pub stats: SimulationStats,
    pub debug: Option<Vec<DebugNodeTiming>>,
}

impl SimulationResult {
    pub fn timing(&self, index: NodeIndex) -> Option<&NodeTiming> {
        self.node_timings.get(&index)
    }

    /// Node timings ordered by simulated start time, ties by index.
    pub fn timings_by_start(&self) -> Vec<(NodeIndex, NodeTiming)> {
        let mut timings: Vec<_> = self.node_timings.iter().map(|(&i, &t)| (i, t)).collect();
        timings.sort_by(|a, b| a.1.start_time.total_cmp(&b.1.start_time).then(a.0.cmp(&b.0)));
        timings
    }
}

/// Simulates page loads under fixed network and CPU conditions.
#[derive(Clone, Debug)]
pub struct Simulator {
    options: SimulatorOptions,
    layout_task_multiplier: f64,
    maximum_concurrent_requests: usize,
}

impl Simulator {
    pub fn new(options: SimulatorOptions) -> Result<Self, SimulationError> {
        let invalid = |name: &'static str, value: f64| SimulationError::InvalidOption { name, value };
        if !options.rtt.is_finite() || options.rtt < 0.0 {
            return Err(invalid("rtt", options.rtt));
        }
        // unlimited throughput is allowed, none at all is not
        if options.throughput.is_nan() || options.throughput <= 0.0 {
            return Err(invalid("throughput", options.throughput));
        }
        if !options.cpu_slowdown_multiplier.is_finite() || options.cpu_slowdown_multiplier < 0.0 {
            return Err(invalid("cpu_slowdown_multiplier", options.cpu_slowdown_multiplier));
        }
        if !options.layout_task_multiplier.is_finite() || options.layout_task_multiplier < 0.0 {
            return Err(invalid("layout_task_multiplier", options.layout_task_multiplier));
        }

        Ok(Self {
            layout_task_multiplier: options.cpu_slowdown_multiplier * options.layout_task_multiplier,
            maximum_concurrent_requests: options.maximum_concurrent_requests.max(1),
            options,
        })
    }

    /// Builds a simulator from throttling settings and the observed network.
    pub fn from_settings(settings: &LanternSettings, analysis: &NetworkAnalysis) -> Result<Self, SimulationError> {
        let mut options = SimulatorOptions {
            observed_throughput: analysis.throughput,
            additional_rtt_by_origin: analysis.additional_rtt_by_origin.clone(),
            server_response_time_by_origin: analysis.server_response_time_by_origin.clone(),
            ..Default::default()
        };
        if let Some(data) = &settings.precomputed_lantern_data {
            let (additional_rtt, response_time) = data.to_maps();
            options.additional_rtt_by_origin = additional_rtt;
            options.server_response_time_by_origin = response_time;
        }
        if let Some(maximum) = settings.maximum_concurrent_requests {
            options.maximum_concurrent_requests = maximum;
        }

        let throttling = &settings.throttling;
        match settings.throttling_method {
            ThrottlingMethod::Provided => {
                options.rtt = analysis.rtt;
                // nothing measured means nothing to throttle to
                options.throughput = if analysis.throughput > 0.0 {
                    analysis.throughput
                } else {
                    f64::INFINITY
                };
                options.cpu_slowdown_multiplier = 1.0;
                options.layout_task_multiplier = 1.0;
            }
            ThrottlingMethod::Devtools => {
                options.rtt = throttling.request_latency_ms / DEVTOOLS_RTT_ADJUSTMENT_FACTOR;
                options.throughput =
                    throttling.download_throughput_kbps * 1024.0 / DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR;
                options.cpu_slowdown_multiplier = 1.0;
                options.layout_task_multiplier = 1.0;
            }
            ThrottlingMethod::Simulate => {
                options.rtt = throttling.rtt_ms;
                options.throughput = throttling.throughput_kbps * 1024.0;
                options.cpu_slowdown_multiplier = throttling.cpu_slowdown_multiplier;
            }
        }
        tracing::debug!(
            method = ?settings.throttling_method,
            rtt = options.rtt,
            throughput = options.throughput,
            cpu = options.cpu_slowdown_multiplier,
            "creating simulator"
        );
        Self::new(options)
    }

    pub fn options(&self) -> &SimulatorOptions {
        &self.options
    }

    pub fn rtt(&self) -> Milliseconds {
        self.options.rtt
    }

    pub fn throughput(&self) -> f64 {
        self.options.throughput
    }

    /// In-flight request limit, at least one.
    pub fn maximum_concurrent_requests(&self) -> usize {
        self.maximum_concurrent_requests
    }

    /// Effective multiplier for tasks that performed layout.
    pub fn layout_task_multiplier(&self) -> f64 {
        self.layout_task_multiplier
    }

    /// Time to transfer `wasted_bytes`, rounded to 10ms.
    ///
    /// Unlimited throughput prices bytes at the observed throughput, or at
    /// nothing when that is unknown too.
    pub fn compute_wasted_ms_from_wasted_bytes(&self, wasted_bytes: f64) -> Milliseconds {
        let bits_per_second = if self.options.throughput.is_finite() {
            self.options.throughput
        } else {
            self.options.observed_throughput
        };
        if !bits_per_second.is_finite() || bits_per_second <= 0.0 {
            return 0.0;
        }
        let wasted_ms = wasted_bytes * 8.0 / bits_per_second * 1000.0;
        (wasted_ms / 10.0).round() * 10.0
    }

    /// Simulates every node reachable from the graph root.
    pub fn simulate(
        &self,
        graph: &DependencyGraph,
        options: &SimulateOptions,
    ) -> Result<SimulationResult, SimulationError> {
        let label = options.label.clone().unwrap_or_default();
        let _span = tracing::debug_span!("simulate", label = %label).entered();

        let mut run = SimulationRun::new(self, graph, options.flexible_ordering)?;
        let time_in_ms = run.run()?;

        let mut node_timings = BTreeMap::new();
        let mut debug = options.collect_debug_timings.then(Vec::new);
        for index in run.timings.nodes() {
            let timing = run.timings.get_completed(index)?;
            node_timings.insert(
                index,
                NodeTiming {
                    start_time: timing.start_time,
                    end_time: timing.end_time,
                    duration: timing.end_time - timing.start_time,
                    connection_timing: timing.connection_timing,
                },
            );
            if let Some(debug) = debug.as_mut() {
                let node = graph.node(index);
                debug.push(DebugNodeTiming {
                    index,
                    node_id: node.id.clone(),
                    node_type: node.node_type(),
                    url: node.request().map(|r| r.url.clone()),
                    queued_time: timing.queued_time,
                    start_time: timing.start_time,
                    end_time: timing.end_time,
                    estimated_time_elapsed: timing.estimated_time_elapsed,
                    bytes_downloaded: timing.bytes_downloaded,
                    connection_timing: timing.connection_timing,
                });
            }
        }
        if let Some(debug) = debug.as_mut() {
            debug.sort_by(|a, b| a.start_time.total_cmp(&b.start_time).then(a.index.cmp(&b.index)));
        }

        let mut stats = SimulationStats::new().with_label(label.as_str());
        run.fill_stats(&mut stats, time_in_ms);
        tracing::debug!(
            time_in_ms,
            nodes = node_timings.len(),
            iterations = stats.engine.iterations,
            "simulation complete"
        );

        Ok(SimulationResult {
            time_in_ms,
            node_timings,
            stats,
            debug,
        })
    }
}

/// Heap entry ordering ready nodes by start position, ties by index.
#[derive(Clone, Copy, Debug)]
struct OrderKey {
    position: Microseconds,
    index: NodeIndex,
}

impl PartialEq for OrderKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderKey {}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position.total_cmp(&other.position).then(self.index.cmp(&other.index))
    }
}

/// CPU tasks by trace start, requests by start plus a priority penalty.
fn start_position(graph: &DependencyGraph, index: NodeIndex) -> Microseconds {
    match &graph.node(index).kind {
        NodeKind::Cpu(cpu) => cpu.start_time(),
        NodeKind::Network(network) => network.start_time() + network.priority().start_time_penalty_ms() * 1000.0,
    }
}

/// Topological order of the nodes reachable from the root, preferring the
/// earliest start position among the nodes whose dependencies are placed.
///
/// Nodes waiting on an unreachable dependency are left out.
fn simulation_order(graph: &DependencyGraph, reachable: &[bool]) -> Vec<NodeIndex> {
    let mut waiting: Vec<usize> = (0..graph.len())
        .map(|i| graph.dependencies(NodeIndex::new(i)).len())
        .collect();
    let mut ready = BinaryHeap::new();
    let root = graph.root();
    if waiting[root.index()] == 0 {
        ready.push(Reverse(OrderKey {
            position: start_position(graph, root),
            index: root,
        }));
    }

    let mut order = Vec::with_capacity(reachable.iter().filter(|&&r| r).count());
    while let Some(Reverse(OrderKey { index, .. })) = ready.pop() {
        order.push(index);
        for &dependent in graph.dependents(index) {
            if !reachable[dependent.index()] {
                continue;
            }
            waiting[dependent.index()] -= 1;
            if waiting[dependent.index()] == 0 {
                ready.push(Reverse(OrderKey {
                    position: start_position(graph, dependent),
                    index: dependent,
                }));
            }
        }
    }
    order
}

/// Position of the previous holder of the request slot each request takes.
///
/// Replays the observed load: a slot frees up once its request's observed
/// end is no later than the next request's observed start, otherwise the
/// slot whose request ended first is handed over.
fn plan_request_slots(requests: &[Arc<NetworkRequest>], slots: usize) -> Vec<Option<usize>> {
    let slots = slots.max(1);
    let mut holders: Vec<Option<usize>> = vec![None; slots];
    let mut last_holder: Vec<Option<usize>> = vec![None; slots];
    let mut previous = Vec::with_capacity(requests.len());

    for (position, request) in requests.iter().enumerate() {
        for holder in holders.iter_mut() {
            if holder.is_some_and(|h| requests[h].network_end_time <= request.network_request_time) {
                *holder = None;
            }
        }
        let free = holders.iter().position(Option::is_none);
        let slot = free.unwrap_or_else(|| {
            let observed_end = |slot: usize| holders[slot].map_or(f64::NEG_INFINITY, |h| requests[h].network_end_time);
            (0..slots)
                .min_by(|&a, &b| observed_end(a).total_cmp(&observed_end(b)).then(holders[a].cmp(&holders[b])))
                .unwrap_or(0)
        });
        holders[slot] = Some(position);
        previous.push(last_holder[slot].replace(position));
    }
    previous
}

/// A request sent over a connection.
#[derive(Clone, Debug)]
struct PlannedRequest {
    connection: ConnectionId,
    /// Connection state at the start, throughput set to the request's share
    state: TcpConnection,
    dns_resolution_time: Milliseconds,
    connection_timing: Option<ConnectionTiming>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    /// Not reachable from the root
    Untracked,
    NotReadyToStart,
    InProgress,
    Complete,
}

/// Mutable state of a single simulation.
struct SimulationRun<'a> {
    simulator: &'a Simulator,
    graph: &'a DependencyGraph,
    flexible_ordering: bool,
    states: Vec<NodeState>,
    order: Vec<NodeIndex>,
    /// By node index; unordered nodes map to `usize::MAX`
    position_of: Vec<usize>,
    /// By order position: positions waiting on it
    successors: Vec<Vec<usize>>,
    /// By order position: predecessors not yet complete
    waiting: Vec<usize>,
    /// By order position
    requests: Vec<Option<PlannedRequest>>,
    /// By order position
    end_times: Vec<Milliseconds>,
    /// Order positions
    in_progress: Vec<usize>,
    timings: SimulatorTimingMap,
    pool: ConnectionPool,
    dns: DnsCache,
    iterations: u64,
    network_in_progress: usize,
    peak_network_in_progress: usize,
    peak_connections_in_use: BTreeMap<String, usize>,
}

impl<'a> SimulationRun<'a> {
    fn new(simulator: &'a Simulator, graph: &'a DependencyGraph, flexible_ordering: bool) -> Result<Self, SimulationError> {
        let mut states = vec![NodeState::Untracked; graph.len()];
        let mut records = Vec::new();
        for index in graph.traverse(graph.root()) {
            states[index.index()] = NodeState::NotReadyToStart;
            if let Some(request) = graph.node(index).request() {
                records.push(Arc::clone(request));
            }
        }
        let reachable: Vec<bool> = states.iter().map(|&s| s != NodeState::Untracked).collect();
        let reachable_count = reachable.iter().filter(|&&r| r).count();

        let order = simulation_order(graph, &reachable);
        if order.len() < reachable_count {
            return Err(SimulationError::UnusedNodes(reachable_count - order.len()));
        }
        let mut position_of = vec![usize::MAX; graph.len()];
        for (position, index) in order.iter().enumerate() {
            position_of[index.index()] = position;
        }

        let mut predecessors: Vec<Vec<usize>> = order
            .iter()
            .map(|&index| graph.dependencies(index).iter().map(|d| position_of[d.index()]).collect())
            .collect();

        let mut previous_cpu = None;
        let mut connection_bound = Vec::new();
        for (position, &index) in order.iter().enumerate() {
            match &graph.node(index).kind {
                NodeKind::Cpu(_) => {
                    if let Some(previous) = previous_cpu.replace(position) {
                        predecessors[position].push(previous);
                    }
                }
                NodeKind::Network(network) if !network.is_connectionless() => connection_bound.push(position),
                NodeKind::Network(_) => {}
            }
        }

        let pool = ConnectionPool::new(&records, &simulator.options)?;
        let bound_requests: Vec<Arc<NetworkRequest>> = connection_bound
            .iter()
            .filter_map(|&position| graph.node(order[position]).request().cloned())
            .collect();
        let plan = pool.plan(&bound_requests, flexible_ordering)?;
        let slots = plan_request_slots(&bound_requests, simulator.maximum_concurrent_requests);

        // every request gets an equal share of the throughput whatever the load
        let sharing = simulator
            .maximum_concurrent_requests
            .min(connection_bound.len())
            .max(1);
        let share = simulator.options.throughput / sharing as f64;

        let mut requests: Vec<Option<PlannedRequest>> = vec![None; order.len()];
        for ((&position, planned), previous_slot) in connection_bound.iter().zip(plan).zip(slots) {
            for previous in [planned.previous, previous_slot].into_iter().flatten() {
                predecessors[position].push(connection_bound[previous]);
            }
            let mut state = planned.state;
            state.set_throughput(share);
            requests[position] = Some(PlannedRequest {
                connection: planned.connection,
                state,
                dns_resolution_time: 0.0,
                connection_timing: None,
            });
        }

        let mut successors = vec![Vec::new(); order.len()];
        for (position, before) in predecessors.iter_mut().enumerate() {
            before.sort_unstable();
            before.dedup();
            for &predecessor in before.iter() {
                successors[predecessor].push(position);
            }
        }
        let waiting = predecessors.iter().map(Vec::len).collect();

        tracing::trace!(
            nodes = order.len(),
            requests = connection_bound.len(),
            flexible_ordering,
            "planned simulation order"
        );

        Ok(Self {
            simulator,
            graph,
            flexible_ordering,
            states,
            end_times: vec![0.0; order.len()],
            order,
            position_of,
            successors,
            waiting,
            requests,
            in_progress: Vec::new(),
            timings: SimulatorTimingMap::new(graph),
            pool,
            dns: DnsCache::new(simulator.options.rtt),
            iterations: 0,
            network_in_progress: 0,
            peak_network_in_progress: 0,
            peak_connections_in_use: BTreeMap::new(),
        })
    }

    /// Runs to completion and returns the total simulated time.
    fn run(&mut self) -> Result<Milliseconds, SimulationError> {
        let mut total_elapsed_time = 0.0;
        let first: Vec<usize> = (0..self.order.len()).filter(|&p| self.waiting[p] == 0).collect();
        for position in first {
            self.start(position, total_elapsed_time)?;
        }

        while !self.in_progress.is_empty() {
            self.iterations += 1;
            let next = self
                .in_progress
                .iter()
                .map(|&p| self.end_times[p])
                .fold(f64::INFINITY, f64::min);
            if !next.is_finite() {
                return Err(SimulationError::DepthExceeded);
            }

            for position in self.in_progress.clone() {
                self.update_progress(position, total_elapsed_time, next)?;
            }
            total_elapsed_time = next;

            let mut finished: Vec<usize> = self
                .in_progress
                .iter()
                .copied()
                .filter(|&p| self.end_times[p] == next)
                .collect();
            finished.sort_unstable();
            let mut ready = Vec::new();
            for position in finished {
                self.complete(position, &mut ready)?;
            }
            ready.sort_unstable();
            for position in ready {
                self.start(position, total_elapsed_time)?;
            }
        }

        let unused = self
            .states
            .iter()
            .filter(|&&state| state == NodeState::NotReadyToStart)
            .count();
        if unused > 0 {
            return Err(SimulationError::UnusedNodes(unused));
        }
        Ok(total_elapsed_time)
    }

    fn start(&mut self, position: usize, start_time: Milliseconds) -> Result<(), SimulationError> {
        let index = self.order[position];
        let graph = self.graph;
        let queued_time = graph
            .dependencies(index)
            .iter()
            .map(|d| self.end_times[self.position_of[d.index()]])
            .fold(0.0, f64::max);
        self.timings.set_ready_to_start(index, queued_time);
        self.timings.set_in_progress(index, start_time)?;
        self.states[index.index()] = NodeState::InProgress;
        self.in_progress.push(position);

        let duration = match &graph.node(index).kind {
            NodeKind::Cpu(cpu) => {
                let duration = self.cpu_duration(cpu);
                self.timings.set_cpu_estimated(index, duration)?;
                duration
            }
            NodeKind::Network(network) => {
                let duration = self.start_request(position, network, start_time)?;
                self.timings.set_network_estimated(index, duration)?;
                duration
            }
        };
        self.end_times[position] = start_time + duration;
        Ok(())
    }

    fn cpu_duration(&self, cpu: &CpuNode) -> Milliseconds {
        let multiplier = if cpu.did_perform_layout() {
            self.simulator.layout_task_multiplier
        } else {
            self.simulator.options.cpu_slowdown_multiplier
        };
        (cpu.duration() / 1000.0 * multiplier)
            .round()
            .min(DEFAULT_MAXIMUM_CPU_TASK_DURATION)
    }

    fn start_request(
        &mut self,
        position: usize,
        network: &NetworkNode,
        start_time: Milliseconds,
    ) -> Result<Milliseconds, SimulationError> {
        let request = &network.request;
        let size_in_mb = request.resource_size / 1024.0 / 1024.0;
        if request.from_disk_cache {
            return Ok(8.0 + 20.0 * size_in_mb);
        }
        if request.is_non_network_protocol() {
            return Ok(2.0 + 10.0 * size_in_mb);
        }

        let Some(planned) = self.requests[position].as_mut() else {
            return Err(SimulationError::NoActiveConnection(request.request_id.clone()));
        };
        self.pool.check_out(request, planned.connection)?;
        planned.dns_resolution_time = self.dns.time_until_resolution(request, start_time, true);
        let download = planned.state.simulate_download_until(
            request.transfer_size,
            DownloadOptions {
                dns_resolution_time: planned.dns_resolution_time,
                ..Default::default()
            },
        );
        planned.connection_timing = Some(download.connection_timing);

        let origin = self.pool.origin(planned.connection).to_string();
        let in_use = self.pool.in_use_count(&origin);
        let peak = self.peak_connections_in_use.entry(origin).or_insert(0);
        *peak = (*peak).max(in_use);
        self.network_in_progress += 1;
        self.peak_network_in_progress = self.peak_network_in_progress.max(self.network_in_progress);
        Ok(download.time_elapsed)
    }

    /// Records progress of a node from `from` up to `to`.
    fn update_progress(&mut self, position: usize, from: Milliseconds, to: Milliseconds) -> Result<(), SimulationError> {
        let index = self.order[position];
        let timing = self.timings.get_in_progress(index)?;
        let time_elapsed = timing.time_elapsed;
        let bytes_downloaded = timing.bytes_downloaded;

        let graph = self.graph;
        match (&graph.node(index).kind, &self.requests[position]) {
            (NodeKind::Cpu(_), _) => self.timings.set_cpu(index, time_elapsed + to - from),
            (NodeKind::Network(network), Some(planned)) => {
                let download = planned.state.simulate_download_until(
                    network.request.transfer_size,
                    DownloadOptions {
                        time_already_elapsed: time_elapsed,
                        maximum_time_to_elapse: to - from,
                        dns_resolution_time: planned.dns_resolution_time,
                    },
                );
                self.timings.set_network(
                    index,
                    NetworkProgress {
                        time_elapsed: time_elapsed + download.time_elapsed,
                        bytes_downloaded: bytes_downloaded + download.bytes_downloaded,
                    },
                )
            }
            (NodeKind::Network(_), None) => self.timings.set_network(
                index,
                NetworkProgress {
                    time_elapsed: time_elapsed + to - from,
                    bytes_downloaded,
                },
            ),
        }
    }

    fn complete(&mut self, position: usize, ready: &mut Vec<usize>) -> Result<(), SimulationError> {
        let index = self.order[position];
        let end_time = self.end_times[position];
        let connection_timing = self.requests[position].as_ref().and_then(|r| r.connection_timing);
        self.timings.set_completed(index, end_time, connection_timing)?;
        self.in_progress.retain(|&p| p != position);
        self.states[index.index()] = NodeState::Complete;

        if self.requests[position].is_some() {
            if let Some(request) = self.graph.node(index).request() {
                self.pool.release(request);
            }
            self.network_in_progress -= 1;
        }

        for successor in self.successors[position].clone() {
            self.waiting[successor] -= 1;
            if self.waiting[successor] == 0 {
                ready.push(successor);
            }
        }
        Ok(())
    }

    fn fill_stats(&self, stats: &mut SimulationStats, time_in_ms: Milliseconds) {
        let engine = &mut stats.engine;
        engine.time_in_ms = time_in_ms;
        engine.iterations = self.iterations;
        engine.maximum_concurrent_requests = self.simulator.maximum_concurrent_requests;
        engine.peak_network_in_flight = self.peak_network_in_progress;
        engine.flexible_ordering = self.flexible_ordering;

        for (index, state) in self.states.iter().enumerate() {
            if *state == NodeState::Untracked {
                continue;
            }
            engine.nodes_simulated += 1;
            match &self.graph.node(NodeIndex::new(index)).kind {
                NodeKind::Cpu(_) => engine.cpu_nodes += 1,
                NodeKind::Network(network) => {
                    engine.network_nodes += 1;
                    let origin = network.origin();
                    let entry = stats
                        .origins
                        .entry(origin.to_string())
                        .or_insert_with(|| OriginStats {
                            connections: self.pool.connection_count(origin),
                            peak_connections_in_use: self.peak_connections_in_use.get(origin).copied().unwrap_or(0),
                            ..Default::default()
                        });
                    entry.requests += 1;
                    entry.transfer_bytes += network.request.transfer_size;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::network::request::Priority;
    use crate::trace::TraceEvent;

    fn request(id: &str, url: &str, start: f64, end: f64) -> NetworkRequest {
        NetworkRequest::new(id, url, start, end).with_size(10_000.0)
    }

    fn network(req: NetworkRequest) -> Node {
        Node::network(Arc::new(req))
    }

    fn cpu(ts_ms: f64, dur_ms: f64) -> Node {
        Node::cpu(
            Arc::new(TraceEvent::complete("RunTask", ts_ms * 1000.0, dur_ms * 1000.0)),
            vec![],
            None,
        )
    }

    fn unthrottled() -> SimulatorOptions {
        SimulatorOptions {
            rtt: 0.0,
            throughput: f64::INFINITY,
            cpu_slowdown_multiplier: 1.0,
            ..Default::default()
        }
    }

    fn document_then_task() -> (DependencyGraph, NodeIndex) {
        let mut graph = DependencyGraph::new(network(
            NetworkRequest::new("root", "https://a.test/", 0.0, 100.0).with_size(50.0 * 1024.0),
        ));
        let task = graph.add_node(cpu(120.0, 30.0)).unwrap();
        graph.add_dependency(task, graph.root()).unwrap();
        (graph, task)
    }

    #[test]
    fn test_download_then_cpu() {
        let (graph, task) = document_then_task();
        let mut options = unthrottled();
        options
            .server_response_time_by_origin
            .insert("https://a.test".into(), 100.0);
        let simulator = Simulator::new(options).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();

        assert_eq!(result.time_in_ms, 130.0);
        let root = result.timing(graph.root()).unwrap();
        assert_eq!((root.start_time, root.end_time), (0.0, 100.0));
        let task_timing = result.timing(task).unwrap();
        assert_eq!((task_timing.start_time, task_timing.end_time), (100.0, 130.0));
        assert!(result.debug.is_none());
    }

    #[test]
    fn test_download_then_cpu_with_default_options() {
        let (graph, task) = document_then_task();
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();

        // dns 2 rtt, tcp 1.5 rtt, tls 1 rtt, 30ms server response, 0.5 rtt back
        let time_to_first_byte = 300.0 + 225.0 + 150.0 + 30.0 + 75.0;
        // 10 segments ride with the first byte; the 20 segment round is window
        // bound and the last 7400 bytes go at the full throughput
        let bytes_per_ms = DEFAULT_THROUGHPUT / 8.0 / 1000.0;
        let download = 150.0 + (51_200.0 - 14_600.0 - 29_200.0) / bytes_per_ms;

        let root = result.timing(graph.root()).unwrap();
        let timing = root.connection_timing.unwrap();
        assert_eq!(timing.time_to_first_byte, time_to_first_byte);
        assert_eq!(timing.dns_resolution_time, Some(300.0));
        assert_eq!(timing.ssl_time, Some(150.0));
        assert!((root.end_time - (time_to_first_byte + download)).abs() < 1e-9);

        let task_timing = result.timing(task).unwrap();
        assert_eq!(task_timing.start_time, root.end_time);
        assert_eq!(task_timing.duration, 120.0);
        assert!((result.time_in_ms - (time_to_first_byte + download + 120.0)).abs() < 1e-9);
    }

    fn two_requests_after_document() -> (DependencyGraph, NodeIndex, NodeIndex) {
        let mut graph = DependencyGraph::new(network(request("doc", "https://a.test/", 0.0, 100.0)));
        let a = graph
            .add_node(network(request("a", "https://a.test/a.js", 150.0, 300.0)))
            .unwrap();
        let b = graph
            .add_node(network(request("b", "https://a.test/b.js", 150.0, 300.0)))
            .unwrap();
        graph.add_dependency(a, graph.root()).unwrap();
        graph.add_dependency(b, graph.root()).unwrap();
        (graph, a, b)
    }

    #[test]
    fn test_single_warm_connection_serializes_requests() {
        // both requests were observed on a reused connection, and only the
        // document's connection is warm
        let (graph, a, b) = two_requests_after_document();
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();

        let root = result.timing(graph.root()).unwrap();
        let a = result.timing(a).unwrap();
        let b = result.timing(b).unwrap();
        assert_eq!(a.start_time, root.end_time);
        assert_eq!(b.start_time, a.end_time);
        assert_eq!(result.time_in_ms, b.end_time);
        assert_eq!(result.stats.origins["https://a.test"].peak_connections_in_use, 1);
    }

    #[test]
    fn test_flexible_ordering_runs_requests_in_parallel() {
        let (graph, a, b) = two_requests_after_document();
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let options = SimulateOptions {
            flexible_ordering: true,
            ..Default::default()
        };
        let result = simulator.simulate(&graph, &options).unwrap();
        assert_eq!(result.timing(a).unwrap().start_time, result.timing(b).unwrap().start_time);
        assert_eq!(result.stats.origins["https://a.test"].peak_connections_in_use, 2);
        assert!(result.stats.engine.flexible_ordering);
    }

    #[test]
    fn test_concurrency_limit_of_one() {
        let (graph, a, b) = two_requests_after_document();
        let simulator = Simulator::new(SimulatorOptions {
            maximum_concurrent_requests: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(simulator.maximum_concurrent_requests(), 1);
        let options = SimulateOptions {
            flexible_ordering: true,
            ..Default::default()
        };
        let result = simulator.simulate(&graph, &options).unwrap();
        let a = result.timing(a).unwrap();
        let b = result.timing(b).unwrap();
        assert!(b.start_time >= a.end_time);
        assert_eq!(result.stats.engine.peak_network_in_flight, 1);
    }

    #[test]
    fn test_concurrency_limit_does_not_depend_on_rtt() {
        for rtt in [0.0, 150.0, 5_000.0] {
            let simulator = Simulator::new(SimulatorOptions {
                rtt,
                throughput: 100_000.0,
                ..Default::default()
            })
            .unwrap();
            assert_eq!(simulator.maximum_concurrent_requests(), DEFAULT_MAXIMUM_CONCURRENT_REQUESTS);
        }
    }

    #[test]
    fn test_cpu_tasks_never_overlap() {
        let mut graph = DependencyGraph::new(network(request("doc", "https://a.test/", 0.0, 100.0)));
        let first = graph.add_node(cpu(110.0, 40.0)).unwrap();
        let second = graph.add_node(cpu(115.0, 20.0)).unwrap();
        graph.add_dependency(first, graph.root()).unwrap();
        graph.add_dependency(second, graph.root()).unwrap();

        let simulator = Simulator::new(unthrottled()).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        let first = result.timing(first).unwrap();
        let second = result.timing(second).unwrap();
        assert_eq!(first.duration, 40.0);
        assert_eq!(second.start_time, first.end_time);
        assert_eq!(second.duration, 20.0);
        assert_eq!(first.connection_timing, None);
    }

    #[test]
    fn test_cpu_multipliers() {
        let mut graph = DependencyGraph::new(network(request("doc", "https://a.test/", 0.0, 100.0)));
        let script = graph.add_node(cpu(110.0, 10.0)).unwrap();
        let layout = graph
            .add_node(Node::cpu(
                Arc::new(TraceEvent::complete("RunTask", 200_000.0, 10_000.0)),
                vec![TraceEvent::complete("Layout", 201_000.0, 5_000.0)],
                None,
            ))
            .unwrap();
        let long = graph.add_node(cpu(300.0, 5_000.0)).unwrap();
        for task in [script, layout, long] {
            graph.add_dependency(task, graph.root()).unwrap();
        }

        let simulator = Simulator::new(SimulatorOptions {
            cpu_slowdown_multiplier: 4.0,
            ..unthrottled()
        })
        .unwrap();
        assert_eq!(simulator.layout_task_multiplier(), 2.0);
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        assert_eq!(result.timing(script).unwrap().duration, 40.0);
        assert_eq!(result.timing(layout).unwrap().duration, 20.0);
        assert_eq!(result.timing(long).unwrap().duration, DEFAULT_MAXIMUM_CPU_TASK_DURATION);
    }

    #[test]
    fn test_connectionless_requests() {
        let mut graph = DependencyGraph::new(network(request("doc", "https://a.test/", 0.0, 100.0)));
        let cached = graph
            .add_node(network(
                NetworkRequest::new("cached", "https://a.test/logo.png", 110.0, 111.0)
                    .with_size(1024.0 * 1024.0)
                    .from_disk_cache(),
            ))
            .unwrap();
        let inline = graph
            .add_node(network(NetworkRequest::new("inline", "data:image/png;base64,AAAA", 110.0, 110.0)))
            .unwrap();
        graph.add_dependency(cached, graph.root()).unwrap();
        graph.add_dependency(inline, graph.root()).unwrap();

        let simulator = Simulator::new(unthrottled()).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        assert_eq!(result.timing(cached).unwrap().duration, 28.0);
        assert_eq!(result.timing(inline).unwrap().duration, 2.0);
        assert_eq!(result.timing(cached).unwrap().connection_timing, None);
        assert_eq!(result.stats.engine.peak_network_in_flight, 1);
    }

    #[test]
    fn test_connection_timing_for_every_request() {
        let (graph, a, _) = two_requests_after_document();
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();

        let cold = result.timing(graph.root()).unwrap().connection_timing.unwrap();
        assert_eq!(cold.dns_resolution_time, Some(300.0));
        assert_eq!(cold.connection_time, Some(375.0));
        assert_eq!(cold.ssl_time, Some(150.0));
        assert_eq!(cold.time_to_first_byte, 780.0);
        assert_eq!(cold.download_time, 0.0);

        // warm h1 pays half a round trip each way plus the server response
        let warm = result.timing(a).unwrap().connection_timing.unwrap();
        assert_eq!(warm.dns_resolution_time, None);
        assert_eq!(warm.connection_time, Some(75.0));
        assert_eq!(warm.time_to_first_byte, 180.0);

        let json = serde_json::to_value(result.timing(a).unwrap()).unwrap();
        assert_eq!(json["connectionTiming"]["timeToFirstByte"], 180.0);
    }

    #[test]
    fn test_priority_orders_ready_requests() {
        let mut graph = DependencyGraph::new(network(request("doc", "https://a.test/", 0.0, 100.0)));
        let low = graph
            .add_node(network(request("low", "https://a.test/low", 110.0, 200.0).with_priority(Priority::Low)))
            .unwrap();
        let high = graph
            .add_node(network(request("high", "https://a.test/high", 120.0, 200.0).with_priority(Priority::VeryHigh)))
            .unwrap();
        graph.add_dependency(low, graph.root()).unwrap();
        graph.add_dependency(high, graph.root()).unwrap();

        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let result = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        // a single warm connection serializes them, so the order is visible
        assert!(result.timing(high).unwrap().end_time <= result.timing(low).unwrap().start_time);
    }

    #[test]
    fn test_deterministic() {
        let (graph, _, _) = two_requests_after_document();
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let first = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        let second = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        assert_eq!(first.time_in_ms, second.time_in_ms);
        assert_eq!(first.node_timings, second.node_timings);
        assert_eq!(first.stats, second.stats);
    }

    /// A document, a stylesheet, three scripts on two origins, an image and
    /// the script evaluation tasks.
    fn small_page() -> DependencyGraph {
        let mut graph = DependencyGraph::new(network(
            NetworkRequest::new("doc", "https://a.test/", 0.0, 300.0).with_size(30_000.0),
        ));
        let root = graph.root();
        let css = graph
            .add_node(network(request("css", "https://a.test/s.css", 310.0, 400.0).with_priority(Priority::VeryHigh)))
            .unwrap();
        let lib = graph
            .add_node(network(
                NetworkRequest::new("lib", "https://cdn.test/lib.js", 320.0, 700.0)
                    .with_size(120_000.0)
                    .with_priority(Priority::High),
            ))
            .unwrap();
        let app = graph
            .add_node(network(request("app", "https://a.test/app.js", 330.0, 500.0).with_priority(Priority::High)))
            .unwrap();
        let img = graph
            .add_node(network(
                NetworkRequest::new("img", "https://cdn.test/hero.png", 340.0, 900.0)
                    .with_size(80_000.0)
                    .with_priority(Priority::Low),
            ))
            .unwrap();
        for node in [css, lib, app, img] {
            graph.add_dependency(node, root).unwrap();
        }
        let eval_lib = graph.add_node(cpu(710.0, 60.0)).unwrap();
        graph.add_dependency(eval_lib, lib).unwrap();
        let eval_app = graph.add_node(cpu(780.0, 40.0)).unwrap();
        graph.add_dependency(eval_app, app).unwrap();
        graph.add_dependency(eval_app, eval_lib).unwrap();
        let late = graph
            .add_node(network(request("late", "https://cdn.test/late.js", 830.0, 950.0)))
            .unwrap();
        graph.add_dependency(late, eval_app).unwrap();
        graph
    }

    #[test]
    fn test_slower_network_never_finishes_sooner() {
        let graph = small_page();
        for flexible_ordering in [false, true] {
            let options = SimulateOptions {
                flexible_ordering,
                ..Default::default()
            };
            let time = |rtt: f64, throughput: f64| {
                let simulator = Simulator::new(SimulatorOptions {
                    rtt,
                    throughput,
                    ..Default::default()
                })
                .unwrap();
                simulator.simulate(&graph, &options).unwrap().time_in_ms
            };

            let mut previous = 0.0;
            for rtt in [0.0, 5.0, 28.0, 63.5, 100.0, 144.8, 300.0] {
                let current = time(rtt, 1_014_664.0);
                assert!(current + 1e-6 >= previous, "rtt {rtt}: {current} < {previous}");
                previous = current;
            }
            let mut previous = 0.0;
            for throughput in [f64::INFINITY, 1e8, 1e7, 2_000_000.0, 1_014_664.0, 300_000.0] {
                let current = time(150.0, throughput);
                assert!(current + 1e-6 >= previous, "throughput {throughput}: {current} < {previous}");
                previous = current;
            }
        }
    }

    #[test]
    fn test_unreachable_dependency_leaves_unused_nodes() {
        let mut graph = DependencyGraph::new(network(request("doc", "https://a.test/", 0.0, 100.0)));
        let orphan = graph.add_node(cpu(50.0, 20.0)).unwrap();
        let blocked = graph.add_node(cpu(150.0, 20.0)).unwrap();
        graph.add_dependency(blocked, graph.root()).unwrap();
        graph.add_dependency(blocked, orphan).unwrap();

        let simulator = Simulator::new(unthrottled()).unwrap();
        let err = simulator.simulate(&graph, &SimulateOptions::default()).unwrap_err();
        assert_eq!(err, SimulationError::UnusedNodes(1));
    }

    #[test]
    fn test_debug_timings_and_stats() {
        let (graph, a, _) = two_requests_after_document();
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let options = SimulateOptions {
            label: Some("optimistic".into()),
            collect_debug_timings: true,
            ..Default::default()
        };
        let result = simulator.simulate(&graph, &options).unwrap();

        let debug = result.debug.as_ref().unwrap();
        assert_eq!(debug.len(), 3);
        assert_eq!(debug[0].node_id, "doc");
        let cold = debug[0].connection_timing.as_ref().unwrap();
        assert!(cold.dns_resolution_time.is_some());
        assert_eq!(debug[0].bytes_downloaded, 10_000.0);
        assert_eq!(debug[1].index, a);
        assert_eq!(debug[1].url.as_deref(), Some("https://a.test/a.js"));

        assert_eq!(result.stats.metadata.label, "optimistic");
        assert_eq!(result.stats.engine.network_nodes, 3);
        assert_eq!(result.stats.origins["https://a.test"].requests, 3);
        assert_eq!(result.stats.origins["https://a.test"].connections, 6);
        let order: Vec<_> = result.timings_by_start().into_iter().map(|(i, _)| i).collect();
        assert_eq!(order[0], graph.root());
    }

    #[test]
    fn test_invalid_options() {
        let rtt = Simulator::new(SimulatorOptions {
            rtt: f64::NAN,
            ..Default::default()
        });
        assert!(matches!(rtt, Err(SimulationError::InvalidOption { name: "rtt", .. })));
        for throughput in [-1.0, 0.0, f64::NAN] {
            let result = Simulator::new(SimulatorOptions {
                throughput,
                ..Default::default()
            });
            assert!(matches!(result, Err(SimulationError::InvalidOption { name: "throughput", .. })));
        }
        assert!(Simulator::new(SimulatorOptions {
            throughput: f64::INFINITY,
            ..Default::default()
        })
        .is_ok());
    }

    #[test]
    fn test_wasted_ms_from_wasted_bytes() {
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        assert_eq!(simulator.compute_wasted_ms_from_wasted_bytes(10_000.0), 50.0);

        let observed = Simulator::new(SimulatorOptions {
            throughput: f64::INFINITY,
            observed_throughput: 8_000.0,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(observed.compute_wasted_ms_from_wasted_bytes(1_000.0), 1000.0);

        let unknown = Simulator::new(SimulatorOptions {
            throughput: f64::INFINITY,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(unknown.compute_wasted_ms_from_wasted_bytes(1_000.0), 0.0);
    }

    #[test]
    fn test_from_settings() {
        let analysis = NetworkAnalysis {
            rtt: 30.0,
            throughput: 5_000_000.0,
            ..Default::default()
        };

        let simulate = Simulator::from_settings(&LanternSettings::default(), &analysis).unwrap();
        assert_eq!(simulate.rtt(), 150.0);
        assert_eq!(simulate.throughput(), 1.6 * 1024.0 * 1024.0);
        assert_eq!(simulate.options().observed_throughput, 5_000_000.0);
        assert_eq!(simulate.layout_task_multiplier(), 2.0);

        let mut settings = LanternSettings::default();
        settings.throttling_method = ThrottlingMethod::Provided;
        let provided = Simulator::from_settings(&settings, &analysis).unwrap();
        assert_eq!(provided.rtt(), 30.0);
        assert_eq!(provided.options().cpu_slowdown_multiplier, 1.0);
        assert_eq!(provided.layout_task_multiplier(), 1.0);

        let unmeasured = Simulator::from_settings(&settings, &NetworkAnalysis::default()).unwrap();
        assert!(unmeasured.throughput().is_infinite());

        settings.throttling_method = ThrottlingMethod::Devtools;
        settings.throttling.request_latency_ms = 562.5;
        settings.throttling.download_throughput_kbps = 900.0;
        let devtools = Simulator::from_settings(&settings, &analysis).unwrap();
        assert_eq!(devtools.rtt(), 150.0);
        assert!((devtools.throughput() - 1_024_000.0).abs() < 1e-6);
    }
}
