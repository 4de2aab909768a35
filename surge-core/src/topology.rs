//! Topology documents describing a system to simulate.
//!
//! A topology is a list of typed nodes with their capacity and latency
//! parameters, a list of directed edges, and the aggregate traffic rate. The
//! JSON field names match the wire format used by the editor front end.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors raised while reading or building a topology.
///
/// Any of these is fatal to session creation and leaves no partial session
/// behind.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Topology must declare at least one node")]
    EmptyTopology,

    #[error("Duplicate node id: {id}")]
    DuplicateNodeId { id: String },

    #[error("Unknown node type '{node_type}' for node {id}")]
    UnknownNodeType { id: String, node_type: String },

    #[error("Edge {from} -> {to} references undeclared node {missing}")]
    UnresolvedEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Topology contains a cycle through: {}", unresolved.join(", "))]
    CycleDetected { unresolved: Vec<String> },

    #[error("Invalid topology document: {reason}")]
    InvalidDocument { reason: String },

    #[error("Failed to read topology file: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters of a single node as declared in a topology document.
///
/// Zero or missing numeric fields fall back to per-type defaults when the
/// graph is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub label: String,
    #[serde(rename = "maxRPS")]
    pub max_rps: f64,
    pub base_latency: f64,
    pub is_replica: bool,
    pub backpressure_enabled: bool,
    pub backpressure_threshold: f64,
    pub algorithm: String,
    pub read_ratio: f64,
    /// Injection rate of a client node
    pub rps: f64,
    pub concurrency_limit: f64,
    /// Enables the Little's Law capacity bound derived from `concurrency_limit`
    pub concurrency_throttle: bool,
}

impl NodeConfig {
    /// Creates a node declaration with only identity fields set.
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            node_type: node_type.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_max_rps(mut self, max_rps: f64) -> Self {
        self.max_rps = max_rps;
        self
    }

    pub fn with_base_latency(mut self, base_latency: f64) -> Self {
        self.base_latency = base_latency;
        self
    }

    pub fn with_replica(mut self, is_replica: bool) -> Self {
        self.is_replica = is_replica;
        self
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    pub fn with_backpressure(mut self, threshold: f64) -> Self {
        self.backpressure_enabled = true;
        self.backpressure_threshold = threshold;
        self
    }

    pub fn with_read_ratio(mut self, read_ratio: f64) -> Self {
        self.read_ratio = read_ratio;
        self
    }

    pub fn with_rps(mut self, rps: f64) -> Self {
        self.rps = rps;
        self
    }

    pub fn with_concurrency_throttle(mut self, limit: f64) -> Self {
        self.concurrency_limit = limit;
        self.concurrency_throttle = true;
        self
    }
}

/// A directed connection from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub source: String,
    pub target: String,
}

impl EdgeConfig {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Complete topology: nodes, edges and the aggregate traffic rate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub nodes: Vec<NodeConfig>,
    pub edges: Vec<EdgeConfig>,
    #[serde(rename = "trafficRPS")]
    pub traffic_rps: f64,
}

impl TopologyConfig {
    /// Parses a topology from its JSON representation.
    ///
    /// # Errors
    /// - `TopologyError::InvalidDocument` - JSON is malformed or mistyped
    pub fn from_json(json: &str) -> Result<Self, TopologyError> {
        serde_json::from_str(json).map_err(|e| TopologyError::InvalidDocument {
            reason: e.to_string(),
        })
    }

    /// Reads and parses a topology JSON file.
    ///
    /// # Errors
    /// - `TopologyError::Io` - File could not be read
    /// - `TopologyError::InvalidDocument` - File contents are not a topology
    pub fn from_path(path: &Path) -> Result<Self, TopologyError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(EdgeConfig::new(source, target));
        self
    }

    pub fn with_traffic(mut self, traffic_rps: f64) -> Self {
        self.traffic_rps = traffic_rps;
        self
    }
}

/// Partial parameter update applied to a live node.
///
/// Every field is optional; fields that do not apply to the node's type are
/// ignored. Unknown JSON fields are ignored as well.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePatch {
    #[serde(rename = "maxRPS")]
    pub max_rps: Option<f64>,
    pub base_latency: Option<f64>,
    pub concurrency_limit: Option<f64>,
    pub concurrency_throttle: Option<bool>,
    pub is_replica: Option<bool>,
    pub read_ratio: Option<f64>,
    pub algorithm: Option<String>,
    pub rps: Option<f64>,
    pub backpressure_enabled: Option<bool>,
    pub backpressure_threshold: Option<f64>,
}
