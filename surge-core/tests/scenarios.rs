//! End-to-end behavior of the tick engine on small topologies.
//!
//! Every test drives a `Simulator` synchronously through `step()`, so results
//! are deterministic and independent of the background driver.

use std::path::PathBuf;

use surge_core::{
    EngineConfig, Graph, HealthStatus, NodeConfig, NodeDefaults, NodeMetrics, NodePatch,
    Simulator, TickResult, TopologyConfig,
};

fn simulator(topology: &TopologyConfig) -> Simulator {
    let graph = Graph::build(topology, &NodeDefaults::default()).unwrap();
    let (simulator, _stream) = Simulator::new(graph, &EngineConfig::default());
    simulator
}

fn node<'a>(result: &'a TickResult, id: &str) -> &'a NodeMetrics {
    result
        .node(id)
        .unwrap_or_else(|| panic!("missing node {id}"))
}

fn arrival(metrics: &NodeMetrics) -> f64 {
    metrics.arrival_read + metrics.arrival_write
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../demos")
        .join(name)
}

#[test]
fn test_overloaded_server_queues_then_drains() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("app", "appserver").with_max_rps(50.0))
        .with_traffic(200.0);
    let sim = simulator(&topology);

    let first = sim.step().unwrap();
    let app = node(&first, "app");
    assert_close(app.throughput, 50.0);
    assert_close(app.queue_depth, 150.0);
    assert_eq!(app.drop_rate, 0.0);
    assert!(first.is_bottleneck("app"));

    sim.set_traffic_rate(0.0);
    let second = sim.step().unwrap();
    let app = node(&second, "app");
    assert_close(app.throughput, 50.0);
    assert_close(app.queue_depth, 100.0);
}

#[test]
fn test_weighted_balancer_splits_by_capacity() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("lb", "loadbalancer").with_max_rps(500.0))
        .with_node(NodeConfig::new("app-1", "appserver").with_max_rps(60.0))
        .with_node(NodeConfig::new("app-2", "appserver").with_max_rps(50.0))
        .with_edge("lb", "app-1")
        .with_edge("lb", "app-2")
        .with_traffic(100.0);
    let sim = simulator(&topology);

    for _ in 0..5 {
        let result = sim.step().unwrap();
        let lb = node(&result, "lb");
        assert_eq!(lb.drop_rate, 0.0);
        assert_close(lb.throughput, 100.0);
        assert_close(arrival(node(&result, "app-1")), 100.0 * 60.0 / 110.0);
        assert_close(arrival(node(&result, "app-2")), 100.0 * 50.0 / 110.0);
    }
}

#[test]
fn test_router_redirects_reads_when_replicas_go_down() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("router", "dbrouter"))
        .with_node(NodeConfig::new("primary", "database").with_max_rps(500.0))
        .with_node(
            NodeConfig::new("replica-1", "database")
                .with_max_rps(500.0)
                .with_replica(true),
        )
        .with_node(
            NodeConfig::new("replica-2", "database")
                .with_max_rps(500.0)
                .with_replica(true),
        )
        .with_edge("router", "primary")
        .with_edge("router", "replica-1")
        .with_edge("router", "replica-2")
        .with_traffic(100.0);
    let sim = simulator(&topology);

    let result = sim.step().unwrap();
    assert_close(node(&result, "replica-1").arrival_read, 35.0);
    assert_close(node(&result, "replica-2").arrival_read, 35.0);
    assert_close(node(&result, "primary").arrival_write, 30.0);
    assert_close(node(&result, "primary").arrival_read, 0.0);

    sim.set_node_down("replica-1", true).unwrap();
    let result = sim.step().unwrap();
    assert_eq!(node(&result, "replica-1").status, HealthStatus::Down);
    assert_eq!(node(&result, "replica-1").throughput, 0.0);
    assert_close(node(&result, "replica-2").arrival_read, 70.0);
    assert_close(node(&result, "primary").arrival_read, 0.0);

    sim.set_node_down("replica-2", true).unwrap();
    let result = sim.step().unwrap();
    assert_close(node(&result, "primary").arrival_read, 70.0);
    assert_close(node(&result, "primary").arrival_write, 30.0);
    assert_eq!(node(&result, "router").drop_rate, 0.0);
}

#[test]
fn test_round_robin_rotates_whole_ticks() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("lb", "loadbalancer").with_algorithm("round-robin"))
        .with_node(NodeConfig::new("a", "appserver").with_max_rps(1000.0))
        .with_node(NodeConfig::new("b", "appserver").with_max_rps(1000.0))
        .with_node(NodeConfig::new("c", "appserver").with_max_rps(1000.0))
        .with_edge("lb", "a")
        .with_edge("lb", "b")
        .with_edge("lb", "c")
        .with_traffic(90.0);
    let sim = simulator(&topology);

    let mut full_ticks = [0u32; 3];
    for _ in 0..9 {
        let result = sim.step().unwrap();
        let arrivals: Vec<f64> = ["a", "b", "c"]
            .iter()
            .map(|id| arrival(node(&result, id)))
            .collect();

        // The whole tick lands on one server, never an even split.
        assert_eq!(arrivals.iter().filter(|a| **a > 0.0).count(), 1);
        for (slot, value) in arrivals.iter().enumerate() {
            if *value > 0.0 {
                assert_close(*value, 90.0);
                full_ticks[slot] += 1;
            }
        }
    }
    assert_eq!(full_ticks, [3, 3, 3]);
}

#[test]
fn test_down_node_discards_instead_of_queueing() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("app", "appserver").with_max_rps(100.0))
        .with_traffic(40.0);
    let sim = simulator(&topology);

    sim.set_node_down("app", true).unwrap();
    for _ in 0..3 {
        let result = sim.step().unwrap();
        let app = node(&result, "app");
        assert_eq!(app.throughput, 0.0);
        assert_eq!(app.utilization, 0.0);
        assert_eq!(app.queue_depth, 0.0);
        assert_eq!(app.status, HealthStatus::Down);
    }

    sim.set_node_down("app", false).unwrap();
    let result = sim.step().unwrap();
    assert_close(node(&result, "app").throughput, 40.0);
}

#[test]
fn test_balancer_excludes_down_targets() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("users", "client"))
        .with_node(NodeConfig::new("lb", "loadbalancer"))
        .with_node(NodeConfig::new("app-1", "appserver"))
        .with_node(NodeConfig::new("app-2", "appserver"))
        .with_edge("users", "lb")
        .with_edge("lb", "app-1")
        .with_edge("lb", "app-2")
        .with_traffic(80.0);
    let sim = simulator(&topology);

    sim.set_node_down("app-2", true).unwrap();
    let result = sim.step().unwrap();
    assert_close(arrival(node(&result, "app-1")), 80.0);
    assert_eq!(arrival(node(&result, "app-2")), 0.0);
}

#[test]
fn test_backpressure_rejects_above_pool_share() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("lb", "loadbalancer").with_backpressure(0.5))
        .with_node(NodeConfig::new("app", "appserver").with_max_rps(100.0))
        .with_edge("lb", "app")
        .with_traffic(120.0);
    let sim = simulator(&topology);

    let result = sim.step().unwrap();
    let lb = node(&result, "lb");
    assert_close(lb.drop_rate, 70.0);
    assert_close(lb.throughput, 50.0);
    assert_eq!(lb.status, HealthStatus::Rejecting);
    assert!(!result.is_bottleneck("lb"));
    assert_close(arrival(node(&result, "app")), 50.0);
}

#[test]
fn test_live_patch_changes_capacity() {
    let topology = TopologyConfig::default()
        .with_node(NodeConfig::new("app", "appserver").with_max_rps(50.0))
        .with_traffic(80.0);
    let sim = simulator(&topology);

    let result = sim.step().unwrap();
    assert_close(node(&result, "app").throughput, 50.0);

    let patch = NodePatch {
        max_rps: Some(200.0),
        ..Default::default()
    };
    assert!(sim.patch_node("app", &patch).unwrap());
    sim.reset_queues();

    let result = sim.step().unwrap();
    let app = node(&result, "app");
    assert_close(app.throughput, 80.0);
    assert_eq!(app.queue_depth, 0.0);
    assert_close(app.effective_capacity, 200.0);
}

#[test]
fn test_replace_graph_swaps_nodes() {
    let sim = simulator(
        &TopologyConfig::default()
            .with_node(NodeConfig::new("old", "appserver"))
            .with_traffic(10.0),
    );
    sim.step().unwrap();

    let replacement = TopologyConfig::default()
        .with_node(NodeConfig::new("new-lb", "loadbalancer"))
        .with_node(NodeConfig::new("new-app", "appserver"))
        .with_edge("new-lb", "new-app");
    sim.replace_graph(Graph::build(&replacement, &NodeDefaults::default()).unwrap());

    let result = sim.step().unwrap();
    assert_eq!(result.tick, 2);
    assert!(result.node("old").is_none());
    assert_close(arrival(node(&result, "new-app")), 10.0);
}

#[test]
fn test_demo_topologies_respect_edge_order() {
    for name in ["three_tier.json", "read_replicas.json", "round_robin.json"] {
        let topology = TopologyConfig::from_path(&demo(name)).unwrap();
        let graph = Graph::build(&topology, &NodeDefaults::default()).unwrap();
        let order = graph.topological_order();
        let position = |id: &str| order.iter().position(|o| *o == id).unwrap();

        for edge in &topology.edges {
            assert!(
                position(&edge.source) < position(&edge.target),
                "{name}: {} must precede {}",
                edge.source,
                edge.target
            );
        }
    }
}

#[test]
fn test_demo_replicas_protect_primary() {
    let topology = TopologyConfig::from_path(&demo("read_replicas.json")).unwrap();
    let sim = simulator(&topology);

    for _ in 0..5 {
        let result = sim.step().unwrap();
        assert_eq!(node(&result, "replica-1").arrival_write, 0.0);
        assert_eq!(node(&result, "replica-2").arrival_write, 0.0);
        assert_eq!(node(&result, "primary").arrival_read, 0.0);
    }
}
