//! Node behavior models.
//!
//! Every node in a graph is one of five closed variants wrapped by [`SimNode`].
//! Each variant implements [`NodeModel`]: drain the incoming accumulators once
//! per tick, update derived state, and emit flow to downstream neighbors that
//! are currently up. Nodes never touch each other directly; the graph hands
//! them a [`Neighbor`] snapshot and applies the [`Emission`]s they return.

pub mod app_server;
pub mod client;
pub mod database;
pub mod db_router;
pub mod load_balancer;
pub mod queue;
pub mod routing;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use app_server::AppServer;
pub use client::Client;
pub use database::Database;
pub use db_router::DbRouter;
pub use load_balancer::{Distribution, LoadBalancer};
pub use queue::{Allocation, ServiceQueue};

use crate::topology::NodePatch;

/// Maximum backlog a queued node holds, as a multiple of its capacity.
pub const MAX_QUEUE_MULTIPLIER: f64 = 5.0;

/// Type tag of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Client,
    LoadBalancer,
    AppServer,
    Database,
    DbRouter,
}

impl NodeKind {
    /// Wire name used in topology documents and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Client => "client",
            NodeKind::LoadBalancer => "loadbalancer",
            NodeKind::AppServer => "appserver",
            NodeKind::Database => "database",
            NodeKind::DbRouter => "dbrouter",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(NodeKind::Client),
            "loadbalancer" => Ok(NodeKind::LoadBalancer),
            "appserver" => Ok(NodeKind::AppServer),
            "database" => Ok(NodeKind::Database),
            "dbrouter" => Ok(NodeKind::DbRouter),
            _ => Err(format!("Unknown node type: {s}")),
        }
    }
}

/// Health classification reported with every metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Stressed,
    Overloaded,
    /// Load balancer dropped flow this tick
    Rejecting,
    Down,
}

impl HealthStatus {
    /// Derives status from utilization and backlog.
    ///
    /// A backlog only counts as overload once utilization is also high, so a
    /// node draining an old queue at moderate load reads as stressed.
    pub fn from_load(utilization: f64, queue_depth: f64, is_down: bool) -> Self {
        if is_down {
            return HealthStatus::Down;
        }
        if queue_depth > 0.0 && utilization >= 0.85 {
            HealthStatus::Overloaded
        } else if utilization >= 0.70 {
            HealthStatus::Stressed
        } else {
            HealthStatus::Healthy
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Stressed => "stressed",
            HealthStatus::Overloaded => "overloaded",
            HealthStatus::Rejecting => "rejecting",
            HealthStatus::Down => "down",
        };
        f.write_str(name)
    }
}

/// Read/write tag carried by flow between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowClass {
    /// Not yet split into reads and writes
    Generic,
    Read,
    Write,
}

/// Incoming flow accumulated since the node last processed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Inflow {
    pub generic: f64,
    pub read: f64,
    pub write: f64,
}

impl Inflow {
    pub fn total(&self) -> f64 {
        self.generic + self.read + self.write
    }

    /// Splits into (read, write), applying `read_ratio` to the untagged part only.
    pub fn split(&self, read_ratio: f64) -> (f64, f64) {
        let ratio = clamp_ratio(read_ratio);
        (
            self.read + self.generic * ratio,
            self.write + self.generic * (1.0 - ratio),
        )
    }
}

/// Flow pushed from a node to one of its downstream neighbors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Emission {
    pub target: usize,
    pub class: FlowClass,
    pub amount: f64,
}

/// Read-only view of a downstream neighbor at the moment a node processes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub kind: NodeKind,
    pub is_down: bool,
    pub max_rps: f64,
    pub is_replica: bool,
    pub latency: f64,
}

impl Neighbor {
    pub fn is_up(&self) -> bool {
        !self.is_down
    }
}

/// Identity, adjacency and accumulators shared by every node variant.
#[derive(Debug, Clone)]
pub struct BaseNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    /// Graph indices of downstream neighbors, fixed after build
    pub downstream: Vec<usize>,
    incoming: Inflow,
    down: bool,
}

impl BaseNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            downstream: Vec::new(),
            incoming: Inflow::default(),
            down: false,
        }
    }

    /// Adds flow to the matching accumulator. Negative or non-finite amounts are ignored.
    pub fn add_incoming(&mut self, class: FlowClass, amount: f64) {
        if !amount.is_finite() || amount <= 0.0 {
            return;
        }
        match class {
            FlowClass::Generic => self.incoming.generic += amount,
            FlowClass::Read => self.incoming.read += amount,
            FlowClass::Write => self.incoming.write += amount,
        }
    }

    /// Reads and resets all accumulators.
    pub fn take_incoming(&mut self) -> Inflow {
        std::mem::take(&mut self.incoming)
    }

    pub fn pending_incoming(&self) -> Inflow {
        self.incoming
    }

    pub fn is_down(&self) -> bool {
        self.down
    }

    pub fn set_down(&mut self, down: bool) {
        self.down = down;
    }
}

/// Immutable per-tick snapshot of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeKind,
    pub label: String,
    pub utilization: f64,
    /// Milliseconds
    pub latency: f64,
    pub queue_depth: f64,
    pub throughput: f64,
    pub read_throughput: f64,
    pub write_throughput: f64,
    /// Flow dropped during this tick
    pub drop_rate: f64,
    /// Flow dropped since the node was built
    pub dropped: f64,
    pub arrival_read: f64,
    pub arrival_write: f64,
    pub effective_capacity: f64,
    pub status: HealthStatus,
}

impl NodeMetrics {
    /// Blank snapshot for a node; variants fill in what they track.
    pub fn for_node(base: &BaseNode) -> Self {
        Self {
            id: base.id.clone(),
            node_type: base.kind,
            label: base.label.clone(),
            utilization: 0.0,
            latency: 0.0,
            queue_depth: 0.0,
            throughput: 0.0,
            read_throughput: 0.0,
            write_throughput: 0.0,
            drop_rate: 0.0,
            dropped: 0.0,
            arrival_read: 0.0,
            arrival_write: 0.0,
            effective_capacity: 0.0,
            status: if base.is_down() {
                HealthStatus::Down
            } else {
                HealthStatus::Healthy
            },
        }
    }
}

/// Behavior every node variant provides.
pub trait NodeModel {
    fn base(&self) -> &BaseNode;

    fn base_mut(&mut self) -> &mut BaseNode;

    /// Drains incoming flow and pushes this tick's output into `out`.
    fn process_tick(&mut self, neighbors: &[Neighbor], out: &mut Vec<Emission>);

    /// Current end-to-end latency in milliseconds, given downstream latencies.
    fn latency(&self, neighbors: &[Neighbor]) -> f64;

    fn metrics(&self, neighbors: &[Neighbor]) -> NodeMetrics;

    /// Capacity ceiling in requests per second, 0 for uncapped nodes.
    fn max_rps(&self) -> f64;

    fn is_replica(&self) -> bool {
        false
    }

    fn reset_queues(&mut self) {}

    /// Applies the fields of `patch` that exist on this node type.
    ///
    /// Returns whether any field was applied.
    fn apply_patch(&mut self, patch: &NodePatch) -> bool;
}

/// Closed set of node variants with flat dispatch.
#[derive(Debug, Clone)]
pub enum SimNode {
    Client(Client),
    LoadBalancer(LoadBalancer),
    AppServer(AppServer),
    Database(Database),
    DbRouter(DbRouter),
}

macro_rules! dispatch {
    ($node:expr, $inner:ident => $body:expr) => {
        match $node {
            SimNode::Client($inner) => $body,
            SimNode::LoadBalancer($inner) => $body,
            SimNode::AppServer($inner) => $body,
            SimNode::Database($inner) => $body,
            SimNode::DbRouter($inner) => $body,
        }
    };
}

impl SimNode {
    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn kind(&self) -> NodeKind {
        self.base().kind
    }

    pub fn is_down(&self) -> bool {
        self.base().is_down()
    }

    pub fn set_down(&mut self, down: bool) {
        self.base_mut().set_down(down);
    }

    pub fn add_incoming(&mut self, class: FlowClass, amount: f64) {
        self.base_mut().add_incoming(class, amount);
    }

    pub fn as_client(&self) -> Option<&Client> {
        match self {
            SimNode::Client(client) => Some(client),
            _ => None,
        }
    }
}

impl NodeModel for SimNode {
    fn base(&self) -> &BaseNode {
        dispatch!(self, node => node.base())
    }

    fn base_mut(&mut self) -> &mut BaseNode {
        dispatch!(self, node => node.base_mut())
    }

    fn process_tick(&mut self, neighbors: &[Neighbor], out: &mut Vec<Emission>) {
        dispatch!(self, node => node.process_tick(neighbors, out))
    }

    fn latency(&self, neighbors: &[Neighbor]) -> f64 {
        dispatch!(self, node => node.latency(neighbors))
    }

    fn metrics(&self, neighbors: &[Neighbor]) -> NodeMetrics {
        dispatch!(self, node => node.metrics(neighbors))
    }

    fn max_rps(&self) -> f64 {
        dispatch!(self, node => node.max_rps())
    }

    fn is_replica(&self) -> bool {
        dispatch!(self, node => node.is_replica())
    }

    fn reset_queues(&mut self) {
        dispatch!(self, node => node.reset_queues())
    }

    fn apply_patch(&mut self, patch: &NodePatch) -> bool {
        dispatch!(self, node => node.apply_patch(patch))
    }
}

/// Clamps a ratio into [0, 1], mapping NaN to 0.
pub(crate) fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) }
}

/// Clamps a rate or capacity to a finite non-negative value.
pub(crate) fn clamp_rate(value: f64) -> f64 {
    if value.is_finite() { value.max(0.0) } else { 0.0 }
}

/// Accepts a patched positive parameter, rejecting zero, negative and non-finite input.
pub(crate) fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}
