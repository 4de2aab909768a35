//! Single-tick execution: inject, process, snapshot, score.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::graph::Graph;
use crate::nodes::{Client, FlowClass, NodeKind, NodeMetrics};

/// Multiplier applied to every injection while spike mode is on.
pub const SPIKE_MULTIPLIER: f64 = 2.0;

/// Output of one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickResult {
    pub tick: u64,
    /// Wall clock, Unix milliseconds
    pub timestamp: i64,
    pub nodes: Vec<NodeMetrics>,
    pub bottleneck_ids: Vec<String>,
    #[serde(rename = "totalRPS")]
    pub total_rps: f64,
}

impl TickResult {
    pub fn node(&self, id: &str) -> Option<&NodeMetrics> {
        self.nodes.iter().find(|m| m.id == id)
    }

    pub fn is_bottleneck(&self, id: &str) -> bool {
        self.bottleneck_ids.iter().any(|b| b == id)
    }
}

/// Mutable simulation state shared between the driver and live mutations.
#[derive(Debug)]
pub struct TickEngine {
    graph: Graph,
    traffic_rps: f64,
    spike: bool,
    tick: u64,
    previous_queue: HashMap<String, f64>,
    config: EngineConfig,
}

impl TickEngine {
    pub fn new(graph: Graph, config: EngineConfig) -> Self {
        Self {
            traffic_rps: graph.traffic_rps(),
            graph,
            spike: false,
            tick: 0,
            previous_queue: HashMap::new(),
            config,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn traffic_rps(&self) -> f64 {
        self.traffic_rps
    }

    pub fn set_traffic_rps(&mut self, rps: f64) {
        if rps.is_finite() && rps >= 0.0 {
            self.traffic_rps = rps;
        }
    }

    pub fn spike(&self) -> bool {
        self.spike
    }

    pub fn set_spike(&mut self, on: bool) {
        self.spike = on;
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Swaps in a new graph. Queue state and bottleneck history of the old
    /// graph are discarded; the target traffic rate is kept.
    pub fn replace_graph(&mut self, graph: Graph) {
        self.graph = graph;
        self.previous_queue.clear();
    }

    /// Runs one full tick and returns its result.
    pub fn step(&mut self) -> TickResult {
        self.tick += 1;
        let total_rps = self.inject();
        self.graph.process_all();

        let nodes = self.graph.snapshot();
        let bottleneck_ids = self.score_bottlenecks(&nodes);

        TickResult {
            tick: self.tick,
            timestamp: Utc::now().timestamp_millis(),
            nodes,
            bottleneck_ids,
            total_rps,
        }
    }

    /// Pushes this tick's traffic into the graph and returns the total injected.
    ///
    /// Graphs with client nodes inject at every client: clients with their
    /// own rate use it, the rest share the target rate evenly. Graphs without
    /// clients inject the target rate at the entry node.
    fn inject(&mut self) -> f64 {
        let multiplier = if self.spike { SPIKE_MULTIPLIER } else { 1.0 };
        let clients = self.graph.client_indices();

        if clients.is_empty() {
            let rate = self.traffic_rps * multiplier;
            let entry = self.graph.entry_index();
            self.graph.inject(entry, FlowClass::Generic, rate);
            return rate;
        }

        let rates: Vec<Option<f64>> = clients
            .iter()
            .map(|&i| self.graph.nodes()[i].as_client().and_then(Client::rate))
            .collect();
        let sharing = rates.iter().filter(|r| r.is_none()).count();
        let share = if sharing > 0 {
            self.traffic_rps / sharing as f64
        } else {
            0.0
        };

        let mut total = 0.0;
        for (&index, rate) in clients.iter().zip(rates) {
            let amount = rate.unwrap_or(share) * multiplier;
            self.graph.inject(index, FlowClass::Generic, amount);
            total += amount;
        }
        total
    }

    /// Flags nodes under building stress.
    ///
    /// Score is utilization plus a weighted queue growth rate. Clients and
    /// load balancers are never flagged.
    fn score_bottlenecks(&mut self, nodes: &[NodeMetrics]) -> Vec<String> {
        let mut flagged = Vec::new();
        for metrics in nodes {
            let growth = self
                .previous_queue
                .get(&metrics.id)
                .map_or(0.0, |previous| metrics.queue_depth - previous);
            let score = metrics.utilization
                + self.config.queue_growth_weight * (growth / metrics.throughput.max(1.0)).max(0.0);

            let eligible = !matches!(metrics.node_type, NodeKind::Client | NodeKind::LoadBalancer);
            if eligible && score > self.config.bottleneck_threshold {
                flagged.push(metrics.id.clone());
            }
            self.previous_queue
                .insert(metrics.id.clone(), metrics.queue_depth);
        }
        flagged
    }
}
