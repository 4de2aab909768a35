//! Validated, topologically ordered node graph.
//!
//! Nodes live in an arena indexed by declaration order. Adjacency is stored
//! as index lists on each node and never changes after build. Every tick the
//! graph processes nodes in topological order so that all upstream producers
//! have pushed their flow before a node drains its accumulators.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::config::NodeDefaults;
use crate::nodes::{
    AppServer, Client, Database, DbRouter, Distribution, FlowClass, LoadBalancer, Neighbor,
    NodeKind, NodeMetrics, NodeModel, SimNode,
};
use crate::topology::{NodeConfig, TopologyConfig, TopologyError};

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<SimNode>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    entry: usize,
    traffic_rps: f64,
}

impl Graph {
    /// Builds a graph from a topology document.
    ///
    /// Missing or zero numeric parameters are filled from `defaults`. The
    /// entry node is the first declared node with no incoming edges.
    ///
    /// # Errors
    /// - `TopologyError::EmptyTopology` - No nodes declared
    /// - `TopologyError::DuplicateNodeId` - Two nodes share an id
    /// - `TopologyError::UnknownNodeType` - A node's type is not recognized
    /// - `TopologyError::UnresolvedEdge` - An edge names an undeclared node
    /// - `TopologyError::CycleDetected` - Edges form a directed cycle
    pub fn build(config: &TopologyConfig, defaults: &NodeDefaults) -> Result<Self, TopologyError> {
        if config.nodes.is_empty() {
            return Err(TopologyError::EmptyTopology);
        }

        let mut index = HashMap::with_capacity(config.nodes.len());
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (position, node_config) in config.nodes.iter().enumerate() {
            if index.insert(node_config.id.clone(), position).is_some() {
                return Err(TopologyError::DuplicateNodeId {
                    id: node_config.id.clone(),
                });
            }
            nodes.push(instantiate(node_config, defaults)?);
        }

        let mut in_degree = vec![0usize; nodes.len()];
        for edge in &config.edges {
            let resolve = |id: &str| {
                index
                    .get(id)
                    .copied()
                    .ok_or_else(|| TopologyError::UnresolvedEdge {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                        missing: id.to_string(),
                    })
            };
            let from = resolve(&edge.source)?;
            let to = resolve(&edge.target)?;

            let downstream = &mut nodes[from].base_mut().downstream;
            if !downstream.contains(&to) {
                downstream.push(to);
                in_degree[to] += 1;
            }
        }

        let order = topological_order(&nodes, in_degree)?;
        // Kahn's algorithm seeds its queue in declaration order, so the first
        // emitted node is the first zero in-degree node declared.
        let entry = order[0];

        let traffic_rps = if config.traffic_rps.is_finite() && config.traffic_rps > 0.0 {
            config.traffic_rps
        } else {
            defaults.traffic_rps
        };

        debug!(
            "Built graph: {} nodes, {} edges, entry {}",
            nodes.len(),
            config.edges.len(),
            nodes[entry].id()
        );

        Ok(Self {
            nodes,
            index,
            order,
            entry,
            traffic_rps,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn traffic_rps(&self) -> f64 {
        self.traffic_rps
    }

    pub fn entry(&self) -> &SimNode {
        &self.nodes[self.entry]
    }

    pub(crate) fn entry_index(&self) -> usize {
        self.entry
    }

    /// Node ids in processing order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].id()).collect()
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&SimNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut SimNode> {
        self.index.get(id).map(|&i| &mut self.nodes[i])
    }

    /// Ids of the nodes directly downstream of `id`.
    pub fn downstream_of(&self, id: &str) -> Option<Vec<&str>> {
        let node = self.node(id)?;
        Some(
            node.base()
                .downstream
                .iter()
                .map(|&i| self.nodes[i].id())
                .collect(),
        )
    }

    pub(crate) fn client_indices(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind() == NodeKind::Client)
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn inject(&mut self, index: usize, class: FlowClass, amount: f64) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.add_incoming(class, amount);
        }
    }

    /// Runs one tick of every node in topological order.
    ///
    /// Downstream latencies are taken from the state before this tick, so a
    /// node sees the same latencies no matter where it sits in the order.
    pub fn process_all(&mut self) {
        let latencies = self.latencies();
        let mut out = Vec::new();
        for position in 0..self.order.len() {
            let index = self.order[position];
            let neighbors = self.neighbors(index, &latencies);
            self.nodes[index].process_tick(&neighbors, &mut out);
            for emission in out.drain(..) {
                self.nodes[emission.target].add_incoming(emission.class, emission.amount);
            }
        }
    }

    /// Metrics for every node, in topological order.
    pub fn snapshot(&self) -> Vec<NodeMetrics> {
        let latencies = self.latencies();
        self.order
            .iter()
            .map(|&index| {
                let neighbors = self.neighbors(index, &latencies);
                self.nodes[index].metrics(&neighbors)
            })
            .collect()
    }

    /// Current end-to-end latency of the node with `id`.
    pub fn latency_of(&self, id: &str) -> Option<f64> {
        let index = *self.index.get(id)?;
        Some(self.latencies()[index])
    }

    pub fn reset_queues(&mut self) {
        for node in &mut self.nodes {
            node.reset_queues();
        }
    }

    /// Latency of every node, resolved leaves first.
    fn latencies(&self) -> Vec<f64> {
        let mut latencies = vec![0.0; self.nodes.len()];
        for &index in self.order.iter().rev() {
            let neighbors = self.neighbors(index, &latencies);
            latencies[index] = self.nodes[index].latency(&neighbors);
        }
        latencies
    }

    fn neighbors(&self, index: usize, latencies: &[f64]) -> Vec<Neighbor> {
        self.nodes[index]
            .base()
            .downstream
            .iter()
            .map(|&target| {
                let node = &self.nodes[target];
                Neighbor {
                    index: target,
                    kind: node.kind(),
                    is_down: node.is_down(),
                    max_rps: node.max_rps(),
                    is_replica: node.is_replica(),
                    latency: latencies[target],
                }
            })
            .collect()
    }
}

/// Kahn's algorithm. Fails with the ids left unconsumed when a cycle exists.
fn topological_order(
    nodes: &[SimNode],
    mut in_degree: Vec<usize>,
) -> Result<Vec<usize>, TopologyError> {
    let mut ready: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &next in &nodes[index].base().downstream {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() < nodes.len() {
        let unresolved = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(i, _)| nodes[i].id().to_string())
            .collect();
        return Err(TopologyError::CycleDetected { unresolved });
    }
    Ok(order)
}

fn or_default(value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        default
    }
}

fn instantiate(config: &NodeConfig, defaults: &NodeDefaults) -> Result<SimNode, TopologyError> {
    let kind: NodeKind =
        config
            .node_type
            .parse()
            .map_err(|_| TopologyError::UnknownNodeType {
                id: config.id.clone(),
                node_type: config.node_type.clone(),
            })?;

    let id = config.id.clone();
    let label = if config.label.is_empty() {
        config.id.clone()
    } else {
        config.label.clone()
    };
    let read_ratio = or_default(config.read_ratio, defaults.read_ratio);

    let node = match kind {
        NodeKind::Client => {
            let client = Client::new(id, label, read_ratio);
            if config.rps.is_finite() && config.rps > 0.0 {
                SimNode::Client(client.with_rate(config.rps))
            } else {
                SimNode::Client(client)
            }
        }
        NodeKind::LoadBalancer => {
            let balancer = LoadBalancer::new(
                id,
                label,
                or_default(config.max_rps, defaults.load_balancer_capacity),
                read_ratio,
                or_default(config.base_latency, defaults.load_balancer_overhead_ms),
            )
            .with_algorithm(Distribution::parse_lenient(&config.algorithm))
            .with_backpressure(
                config.backpressure_enabled,
                or_default(config.backpressure_threshold, defaults.backpressure_threshold),
            );
            SimNode::LoadBalancer(balancer)
        }
        NodeKind::AppServer => {
            let server = AppServer::new(
                id,
                label,
                or_default(config.max_rps, defaults.app_server_capacity),
                or_default(config.base_latency, defaults.app_server_latency_ms),
                read_ratio,
            );
            SimNode::AppServer(if config.concurrency_throttle {
                server.with_concurrency_throttle(config.concurrency_limit)
            } else {
                server.with_concurrency_limit(config.concurrency_limit)
            })
        }
        NodeKind::Database => {
            let database = Database::new(
                id,
                label,
                or_default(config.max_rps, defaults.database_capacity),
                or_default(config.base_latency, defaults.database_latency_ms),
                read_ratio,
            )
            .with_replica(config.is_replica);
            SimNode::Database(if config.concurrency_throttle {
                database.with_concurrency_throttle(config.concurrency_limit)
            } else {
                database.with_concurrency_limit(config.concurrency_limit)
            })
        }
        NodeKind::DbRouter => SimNode::DbRouter(DbRouter::new(
            id,
            label,
            read_ratio,
            or_default(config.base_latency, defaults.router_overhead_ms),
        )),
    };
    Ok(node)
}
