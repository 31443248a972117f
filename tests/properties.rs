//! Property tests over randomly shaped page graphs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use proptest::sample::Index;

use lantern::{
    DependencyGraph, LanternData, NetworkRequest, Node, ResourceType, SimulateOptions, Simulator, SimulatorOptions,
    TraceEvent,
};

const ORIGINS: [&str; 3] = ["a", "b", "c"];

#[derive(Clone, Debug)]
struct NodeShape {
    cpu: bool,
    origin: usize,
    size_kb: f64,
    duration_ms: f64,
    dependencies: Vec<Index>,
}

fn node_shape() -> impl Strategy<Value = NodeShape> {
    (
        any::<bool>(),
        0..ORIGINS.len(),
        0.0..200.0f64,
        1.0..80.0f64,
        prop::collection::vec(any::<Index>(), 1..3),
    )
        .prop_map(|(cpu, origin, size_kb, duration_ms, dependencies)| NodeShape {
            cpu,
            origin,
            size_kb,
            duration_ms,
            dependencies,
        })
}

/// A document root followed by nodes that depend only on earlier nodes.
fn build(shapes: &[NodeShape]) -> DependencyGraph {
    let mut doc = Node::network(Arc::new(
        NetworkRequest::new("doc", "https://a.test/", 0.0, 50.0)
            .with_resource_type(ResourceType::Document)
            .with_size(30_000.0),
    ));
    doc.is_main_document = true;
    let mut graph = DependencyGraph::new(doc);
    let mut indices = vec![graph.root()];

    for (i, shape) in shapes.iter().enumerate() {
        let start_ms = 60.0 + 10.0 * i as f64;
        let node = if shape.cpu {
            Node::cpu(
                Arc::new(TraceEvent::complete("RunTask", start_ms * 1000.0, shape.duration_ms * 1000.0)),
                Vec::new(),
                None,
            )
        } else {
            let url = format!("https://{}.test/{i}", ORIGINS[shape.origin]);
            Node::network(Arc::new(
                NetworkRequest::new(format!("n{i}"), url, start_ms, start_ms + 5.0).with_size(shape.size_kb * 1024.0),
            ))
        };
        let index = graph.add_node(node).unwrap();
        for dependency in &shape.dependencies {
            graph.add_dependency(index, indices[dependency.index(indices.len())]).unwrap();
        }
        indices.push(index);
    }
    graph
}

fn page() -> impl Strategy<Value = DependencyGraph> {
    prop::collection::vec(node_shape(), 0..12).prop_map(|shapes| build(&shapes))
}

fn simulator_options() -> impl Strategy<Value = SimulatorOptions> {
    (0.0..300.0f64, 100_000.0..20_000_000.0f64, 1usize..10, 1.0..6.0f64).prop_map(
        |(rtt, throughput, maximum_concurrent_requests, cpu_slowdown_multiplier)| SimulatorOptions {
            rtt,
            throughput,
            maximum_concurrent_requests,
            cpu_slowdown_multiplier,
            ..Default::default()
        },
    )
}

fn time_of(options: SimulatorOptions, graph: &DependencyGraph, flexible_ordering: bool) -> f64 {
    let simulate = SimulateOptions {
        flexible_ordering,
        ..Default::default()
    };
    Simulator::new(options)
        .unwrap()
        .simulate(graph, &simulate)
        .unwrap()
        .time_in_ms
}

proptest! {
    #[test]
    fn prop_simulation_is_deterministic(graph in page(), options in simulator_options()) {
        let simulator = Simulator::new(options).unwrap();
        let first = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        let second = simulator.simulate(&graph, &SimulateOptions::default()).unwrap();
        prop_assert_eq!(first.time_in_ms, second.time_in_ms);
        prop_assert_eq!(first.node_timings, second.node_timings);
    }

    #[test]
    fn prop_dependencies_finish_first(graph in page(), options in simulator_options(), flexible in any::<bool>()) {
        let simulator = Simulator::new(options).unwrap();
        let options = SimulateOptions { flexible_ordering: flexible, ..Default::default() };
        let result = simulator.simulate(&graph, &options).unwrap();

        prop_assert_eq!(result.node_timings.len(), graph.len());
        for index in graph.indices() {
            let timing = result.timing(index).unwrap();
            prop_assert!(timing.end_time >= timing.start_time);
            for &dependency in graph.dependencies(index) {
                prop_assert!(timing.start_time >= result.timing(dependency).unwrap().end_time);
            }
        }
    }

    #[test]
    fn prop_cpu_tasks_never_overlap(graph in page(), options in simulator_options()) {
        let result = Simulator::new(options).unwrap().simulate(&graph, &SimulateOptions::default()).unwrap();
        let mut cpu: Vec<_> = graph.cpu_nodes().map(|(i, _)| *result.timing(i).unwrap()).collect();
        cpu.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        for pair in cpu.windows(2) {
            prop_assert!(pair[1].start_time >= pair[0].end_time);
        }
    }

    #[test]
    fn prop_in_flight_requests_bounded(graph in page(), options in simulator_options()) {
        let simulator = Simulator::new(options).unwrap();
        let options = SimulateOptions { flexible_ordering: true, ..Default::default() };
        let result = simulator.simulate(&graph, &options).unwrap();
        prop_assert!(result.stats.engine.peak_network_in_flight <= simulator.maximum_concurrent_requests());
    }

    #[test]
    fn prop_connections_in_use_bounded_by_pool(graph in page(), options in simulator_options(), flexible in any::<bool>()) {
        let simulator = Simulator::new(options).unwrap();
        let options = SimulateOptions { flexible_ordering: flexible, ..Default::default() };
        let result = simulator.simulate(&graph, &options).unwrap();
        for (origin, stats) in &result.stats.origins {
            prop_assert!(stats.peak_connections_in_use >= 1, "{origin} never held a connection");
            prop_assert!(stats.peak_connections_in_use <= stats.connections, "{origin} overcommitted");
        }
    }

    #[test]
    fn prop_slower_rtt_never_faster(
        graph in page(),
        rtt in 0.0..300.0f64,
        extra in 0.0..300.0f64,
        throughput in prop_oneof![Just(f64::INFINITY), 100_000.0..20_000_000.0f64],
        flexible in any::<bool>(),
    ) {
        let options = |rtt| SimulatorOptions { rtt, throughput, ..Default::default() };
        let faster = time_of(options(rtt), &graph, flexible);
        let slower = time_of(options(rtt + extra), &graph, flexible);
        prop_assert!(slower + 1e-6 >= faster, "rtt {} -> {}: {} < {}", rtt, rtt + extra, slower, faster);
    }

    #[test]
    fn prop_more_throughput_never_slower(
        graph in page(),
        rtt in 0.0..300.0f64,
        throughput in 100_000.0..10_000_000.0f64,
        factor in 1.0..10.0f64,
        flexible in any::<bool>(),
    ) {
        let options = |throughput| SimulatorOptions { rtt, throughput, ..Default::default() };
        let slower = time_of(options(throughput), &graph, flexible);
        let faster = time_of(options(throughput * factor), &graph, flexible);
        let unlimited = time_of(options(f64::INFINITY), &graph, flexible);
        prop_assert!(slower + 1e-6 >= faster, "{} < {}", slower, faster);
        prop_assert!(faster + 1e-6 >= unlimited, "{} < {}", faster, unlimited);
    }

    #[test]
    fn prop_cloning_preserves_reachability(graph in page(), mask in prop::collection::vec(any::<bool>(), 1..16)) {
        let root = graph.root();
        let keep = |i: lantern::NodeIndex| i == root || mask[i.index() % mask.len()];
        let cloned = graph.clone_with_relationships(|i, _| keep(i)).unwrap();

        prop_assert_eq!(cloned.traverse(cloned.root()).len(), cloned.len());
        let kept: Vec<_> = graph.indices().filter(|&i| keep(i)).collect();
        prop_assert_eq!(kept.len(), cloned.len());
        // kept ancestry survives the removed nodes in between
        for &a in &kept {
            for &b in &kept {
                if a != b && graph.is_dependent_on(b, a) {
                    let a = cloned.find_by_id(&graph.node(a).id).unwrap();
                    let b = cloned.find_by_id(&graph.node(b).id).unwrap();
                    prop_assert!(cloned.is_dependent_on(b, a));
                }
            }
        }
    }

    #[test]
    fn prop_pruning_keeps_others_reachable(shapes in prop::collection::vec(node_shape(), 1..12), pick in any::<Index>()) {
        let original = build(&shapes);
        let mut graph = original.clone();
        let pruned = graph.indices().nth(1 + pick.index(graph.len() - 1)).unwrap();
        graph.prune_node(pruned).unwrap();

        let retained: Vec<_> = graph.indices().filter(|&i| i != pruned).collect();
        for &a in &retained {
            for &b in &retained {
                prop_assert_eq!(graph.is_dependent_on(b, a), original.is_dependent_on(b, a));
            }
        }

        let reachable: HashSet<_> = graph.traverse(graph.root()).into_iter().collect();
        for index in graph.indices() {
            prop_assert_eq!(reachable.contains(&index), index != pruned);
        }
        prop_assert!(!graph.has_cycle());
    }

    #[test]
    fn prop_lantern_data_round_trip(
        rtt in prop::collection::btree_map("[a-z]{1,8}", 0u32..10_000, 0..6),
        response in prop::collection::btree_map("[a-z]{1,8}", 0u32..10_000, 0..6),
    ) {
        let to_origins = |values: BTreeMap<String, u32>| -> BTreeMap<String, f64> {
            values.into_iter().map(|(host, ms)| (format!("https://{host}.test"), f64::from(ms))).collect()
        };
        let data = LanternData {
            additional_rtt_by_origin: to_origins(rtt),
            server_response_time_by_origin: to_origins(response),
        };
        let parsed = LanternData::from_json(&data.to_json().unwrap()).unwrap();
        prop_assert_eq!(parsed, data);
    }
}
