//! Integration tests for session lifecycle and the background driver.
//!
//! These run real tokio timers with the short testing tick interval, so every
//! wait is bounded by a timeout.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use surge_core::{
    MetricsStream, NodeConfig, NodePatch, SessionError, SessionId, SessionManager, SurgeConfig,
    TickResult, TopologyConfig, TopologyError,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn topology() -> TopologyConfig {
    TopologyConfig::default()
        .with_node(NodeConfig::new("users", "client"))
        .with_node(NodeConfig::new("lb", "loadbalancer"))
        .with_node(NodeConfig::new("app", "appserver").with_max_rps(200.0))
        .with_node(NodeConfig::new("db", "database").with_max_rps(200.0))
        .with_edge("users", "lb")
        .with_edge("lb", "app")
        .with_edge("app", "db")
        .with_traffic(60.0)
}

fn manager() -> SessionManager {
    SessionManager::new(SurgeConfig::for_testing())
}

async fn next(stream: &mut MetricsStream) -> TickResult {
    timeout(WAIT, stream.recv())
        .await
        .expect("timed out waiting for a tick")
        .expect("stream closed early")
}

/// Reads until the stream ends, returning everything still buffered.
async fn drain(stream: &mut MetricsStream) -> Vec<TickResult> {
    let mut rest = Vec::new();
    while let Some(result) = timeout(WAIT, stream.recv())
        .await
        .expect("stream did not close")
    {
        rest.push(result);
    }
    rest
}

#[tokio::test]
async fn test_session_streams_ordered_ticks() {
    let manager = manager();
    let (id, mut stream) = manager.create(&topology()).await.unwrap();
    assert_eq!(manager.active_sessions().await, vec![id.clone()]);

    let mut previous = 0;
    for _ in 0..3 {
        let result = next(&mut stream).await;
        assert_eq!(result.tick, previous + 1);
        assert_eq!(result.nodes.len(), 4);
        assert!((result.total_rps - 60.0).abs() < 1e-9);
        previous = result.tick;
    }

    manager.stop(&id).await.unwrap();
    assert!(manager.is_empty().await);
    drain(&mut stream).await;
}

#[tokio::test]
async fn test_stop_closes_stream() {
    let manager = manager();
    let (id, mut stream) = manager.create(&topology()).await.unwrap();
    next(&mut stream).await;

    manager.stop(&id).await.unwrap();
    let leftover = drain(&mut stream).await;
    assert!(leftover.windows(2).all(|w| w[1].tick == w[0].tick + 1));

    assert!(matches!(
        manager.stop(&id).await,
        Err(SessionError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_same_id_replaces_previous_session() {
    let manager = manager();
    let id = SessionId::from("shared");

    let mut first = manager.create_with_id(id.clone(), &topology()).await.unwrap();
    next(&mut first).await;

    let mut second = manager.create_with_id(id.clone(), &topology()).await.unwrap();
    assert_eq!(manager.len().await, 1);

    // The first stream is closed by the time the replacement returns and
    // holds only the first simulator's contiguous ticks.
    let leftover = drain(&mut first).await;
    assert!(leftover.first().is_none_or(|r| r.tick == 2));
    assert!(leftover.windows(2).all(|w| w[1].tick == w[0].tick + 1));

    let result = next(&mut second).await;
    assert_eq!(result.tick, 1);
    let result = next(&mut second).await;
    assert_eq!(result.tick, 2);

    manager.shutdown_all().await;
    drain(&mut second).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_racing_create_never_overlaps_simulators() {
    for round in 0..20 {
        let manager = Arc::new(manager());
        let id = SessionId::new(format!("race-{round}"));
        let mut old = manager.create_with_id(id.clone(), &topology()).await.unwrap();
        next(&mut old).await;

        let stopper = {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            tokio::spawn(async move { manager.stop(&id).await })
        };
        let creator = {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            tokio::spawn(async move {
                let created = manager.create_with_id(id, &topology()).await;
                // Whichever call won the lock, the old driver is gone by now.
                let old_closed = old.is_closed();
                (created, old, old_closed)
            })
        };

        let (stopped, created) = tokio::join!(stopper, creator);
        assert!(stopped.unwrap().is_ok());
        let (created, mut old, old_closed) = created.unwrap();
        let mut new = created.unwrap();
        assert!(old_closed, "round {round}: old simulator outlived its replacement");

        let leftover = drain(&mut old).await;
        assert!(leftover.windows(2).all(|w| w[1].tick == w[0].tick + 1));

        // If the replacement survived the stop it starts from tick 1.
        if manager.len().await == 1 {
            assert_eq!(next(&mut new).await.tick, 1);
        }
        manager.shutdown_all().await;
        drain(&mut new).await;
    }
}

#[tokio::test]
async fn test_invalid_replacement_keeps_existing_session() {
    let manager = manager();
    let id = SessionId::from("keep");
    let mut stream = manager.create_with_id(id.clone(), &topology()).await.unwrap();

    let cyclic = topology().with_edge("db", "lb");
    let err = manager.create_with_id(id.clone(), &cyclic).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Topology(TopologyError::CycleDetected { .. })
    ));

    let err = manager.replace_graph(&id, &cyclic).await.unwrap_err();
    assert!(matches!(err, SessionError::Topology(_)));

    // Still ticking under the original simulator.
    let first = next(&mut stream).await;
    let second = next(&mut stream).await;
    assert_eq!(second.tick, first.tick + 1);

    manager.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_live_mutations_reach_running_session() {
    let manager = manager();
    let (id, mut stream) = manager.create(&topology()).await.unwrap();
    next(&mut stream).await;

    manager.set_traffic(&id, Some(30.0), Some(true)).await.unwrap();
    manager.toggle_node(&id, "db", true).await.unwrap();
    let patched = manager
        .patch_node_config(
            &id,
            "app",
            &NodePatch {
                max_rps: Some(10.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(patched);

    // Results buffered before the changes are skipped.
    let applied_after = manager.get(&id).await.unwrap().simulator.tick_count();
    let mut result = next(&mut stream).await;
    while result.tick <= applied_after {
        result = next(&mut stream).await;
    }
    assert!((result.total_rps - 60.0).abs() < 1e-9);
    let db = result.node("db").unwrap();
    assert_eq!(db.throughput, 0.0);
    assert_eq!(db.status, surge_core::HealthStatus::Down);
    assert!(result.node("app").unwrap().throughput <= 10.0 + 1e-9);

    manager.reset_queues(&id).await.unwrap();
    manager.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_replace_graph_keeps_stream_open() {
    let manager = manager();
    let (id, mut stream) = manager.create(&topology()).await.unwrap();
    next(&mut stream).await;

    let replacement = TopologyConfig::default()
        .with_node(NodeConfig::new("edge", "loadbalancer"))
        .with_node(NodeConfig::new("worker", "appserver"))
        .with_edge("edge", "worker");
    manager.replace_graph(&id, &replacement).await.unwrap();

    let mut saw_new_graph = false;
    for _ in 0..3 {
        let result = next(&mut stream).await;
        if result.node("worker").is_some() {
            saw_new_graph = true;
            assert!(result.node("app").is_none());
        }
    }
    assert!(saw_new_graph);
    manager.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_stream_adapter_yields_results() {
    let manager = manager();
    let (id, stream) = manager.create(&topology()).await.unwrap();

    let ticks: Vec<u64> = timeout(WAIT, stream.take(3).map(|r| r.tick).collect::<Vec<u64>>())
        .await
        .unwrap();
    assert_eq!(ticks, vec![1, 2, 3]);
    manager.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_create_from_topology_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let json = serde_json::to_string(&topology()).unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let loaded = TopologyConfig::from_path(file.path()).unwrap();
    assert_eq!(loaded, topology());

    let manager = manager();
    let (id, mut stream) = manager.create(&loaded).await.unwrap();
    let result = next(&mut stream).await;
    assert!(result.node("db").is_some());
    manager.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_missing_topology_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = TopologyConfig::from_path(&dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, TopologyError::Io(_)));
}
