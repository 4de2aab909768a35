//! Load balancer node with admission control and pluggable distribution.
//!
//! Each tick the balancer admits at most its own capacity, then optionally
//! shields the pool behind it by admitting no more than a fraction of the
//! pool's summed capacity. Admitted writes go to non-replica targets, reads
//! to every up target.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::routing::{average_latency, split_weighted, up_targets, write_targets};
use super::{
    BaseNode, Emission, FlowClass, HealthStatus, Neighbor, NodeKind, NodeMetrics, NodeModel,
    clamp_rate, clamp_ratio, positive,
};
use crate::topology::NodePatch;

/// Forwarding shortfall below this is floating-point noise, not rounding loss.
const ROUNDING_TOLERANCE: f64 = 1e-9;

/// How admitted flow is spread over targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distribution {
    /// The whole tick's flow goes to a single target, rotating every tick
    RoundRobin,
    /// Shares proportional to target capacity
    #[default]
    Weighted,
    /// No connection counts exist in a rate model; behaves as `Weighted`
    LeastConnections,
}

impl Distribution {
    /// Parses an algorithm name, falling back to weighted for unknown names.
    pub fn parse_lenient(name: &str) -> Self {
        if name.is_empty() {
            return Distribution::default();
        }
        name.parse().unwrap_or_else(|_| {
            warn!("Unknown distribution algorithm '{}', using weighted", name);
            Distribution::Weighted
        })
    }
}

impl FromStr for Distribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(Distribution::RoundRobin),
            "weighted" => Ok(Distribution::Weighted),
            "least-connections" | "leastconnections" => Ok(Distribution::LeastConnections),
            _ => Err(format!("Invalid distribution algorithm: {s}")),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::RoundRobin => write!(f, "round-robin"),
            Distribution::Weighted => write!(f, "weighted"),
            Distribution::LeastConnections => write!(f, "least-connections"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    base: BaseNode,
    capacity: f64,
    backpressure_enabled: bool,
    backpressure_threshold: f64,
    algorithm: Distribution,
    read_ratio: f64,
    overhead_ms: f64,
    rr_cursor: usize,
    arrival_read: f64,
    arrival_write: f64,
    read_throughput: f64,
    write_throughput: f64,
    capacity_dropped: f64,
    backpressure_dropped: f64,
    rounding_dropped: f64,
    dropped: f64,
    total_dropped: f64,
    utilization: f64,
}

impl LoadBalancer {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        capacity: f64,
        read_ratio: f64,
        overhead_ms: f64,
    ) -> Self {
        Self {
            base: BaseNode::new(id, NodeKind::LoadBalancer, label),
            capacity: clamp_rate(capacity),
            backpressure_enabled: false,
            backpressure_threshold: 0.9,
            algorithm: Distribution::default(),
            read_ratio: clamp_ratio(read_ratio),
            overhead_ms: clamp_rate(overhead_ms),
            rr_cursor: 0,
            arrival_read: 0.0,
            arrival_write: 0.0,
            read_throughput: 0.0,
            write_throughput: 0.0,
            capacity_dropped: 0.0,
            backpressure_dropped: 0.0,
            rounding_dropped: 0.0,
            dropped: 0.0,
            total_dropped: 0.0,
            utilization: 0.0,
        }
    }

    pub fn with_algorithm(mut self, algorithm: Distribution) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_backpressure(mut self, enabled: bool, threshold: f64) -> Self {
        self.backpressure_enabled = enabled;
        self.backpressure_threshold = clamp_ratio(threshold);
        self
    }

    pub fn algorithm(&self) -> Distribution {
        self.algorithm
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Flow rejected this tick because it exceeded the balancer's own capacity.
    pub fn capacity_dropped(&self) -> f64 {
        self.capacity_dropped
    }

    /// Flow rejected this tick by the backpressure shield.
    pub fn backpressure_dropped(&self) -> f64 {
        self.backpressure_dropped
    }

    /// Fractional flow lost this tick to whole-request rounding.
    pub fn rounding_dropped(&self) -> f64 {
        self.rounding_dropped
    }

    fn route_round_robin(
        &mut self,
        read: f64,
        write: f64,
        up: &[Neighbor],
        out: &mut Vec<Emission>,
    ) {
        let slot = self.rr_cursor;
        let read_target = up[slot % up.len()];
        let writers = write_targets(up);
        let write_target = writers[slot % writers.len()];

        if read > 0.0 {
            out.push(Emission {
                target: read_target.index,
                class: FlowClass::Read,
                amount: read,
            });
        }
        if write > 0.0 {
            out.push(Emission {
                target: write_target.index,
                class: FlowClass::Write,
                amount: write,
            });
        }
        self.rr_cursor = (slot + 1) % up.len();
    }
}

impl NodeModel for LoadBalancer {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    fn process_tick(&mut self, neighbors: &[Neighbor], out: &mut Vec<Emission>) {
        let inflow = self.base.take_incoming();
        self.capacity_dropped = 0.0;
        self.backpressure_dropped = 0.0;
        self.rounding_dropped = 0.0;
        self.dropped = 0.0;

        if self.base.is_down() {
            self.arrival_read = 0.0;
            self.arrival_write = 0.0;
            self.read_throughput = 0.0;
            self.write_throughput = 0.0;
            self.utilization = 0.0;
            return;
        }

        let (read, write) = inflow.split(self.read_ratio);
        let incoming = read + write;
        self.arrival_read = read;
        self.arrival_write = write;

        let mut admitted = incoming.min(self.capacity);
        self.capacity_dropped = incoming - admitted;

        let up = up_targets(neighbors);
        if self.backpressure_enabled {
            let pool: f64 = up.iter().map(|n| n.max_rps).sum();
            if pool > 0.0 {
                let limit = self.backpressure_threshold * pool;
                if admitted > limit {
                    self.backpressure_dropped = admitted - limit;
                    admitted = limit;
                }
            }
        }

        let mut unroutable = 0.0;
        if up.is_empty() {
            unroutable = admitted;
            admitted = 0.0;
        }

        let scale = if incoming > 0.0 { admitted / incoming } else { 0.0 };
        let (read, write) = (read * scale, write * scale);

        self.utilization = if self.capacity > 0.0 {
            (incoming / self.capacity).min(1.0)
        } else if incoming > 0.0 {
            1.0
        } else {
            0.0
        };

        let first = out.len();
        if admitted > 0.0 {
            match self.algorithm {
                Distribution::RoundRobin => self.route_round_robin(read, write, &up, out),
                Distribution::Weighted | Distribution::LeastConnections => {
                    split_weighted(write, &write_targets(&up), FlowClass::Write, out);
                    split_weighted(read, &up, FlowClass::Read, out);
                }
            }
        }

        // Throughput is what actually left; whole-request rounding can lose a fraction.
        let forwarded = |class: FlowClass| -> f64 {
            out[first..]
                .iter()
                .filter(|e| e.class == class)
                .map(|e| e.amount)
                .sum()
        };
        self.read_throughput = forwarded(FlowClass::Read);
        self.write_throughput = forwarded(FlowClass::Write);
        let residue = admitted - self.read_throughput - self.write_throughput;
        self.rounding_dropped = if residue > ROUNDING_TOLERANCE {
            residue
        } else {
            0.0
        };

        self.dropped = self.capacity_dropped
            + self.backpressure_dropped
            + unroutable
            + self.rounding_dropped;
        self.total_dropped += self.dropped;
    }

    fn latency(&self, neighbors: &[Neighbor]) -> f64 {
        self.overhead_ms + average_latency(&up_targets(neighbors))
    }

    fn metrics(&self, neighbors: &[Neighbor]) -> NodeMetrics {
        let mut metrics = NodeMetrics::for_node(&self.base);
        metrics.utilization = self.utilization;
        metrics.latency = self.latency(neighbors);
        metrics.read_throughput = self.read_throughput;
        metrics.write_throughput = self.write_throughput;
        metrics.throughput = self.read_throughput + self.write_throughput;
        metrics.arrival_read = self.arrival_read;
        metrics.arrival_write = self.arrival_write;
        metrics.drop_rate = self.dropped;
        metrics.dropped = self.total_dropped;
        metrics.effective_capacity = self.capacity;
        metrics.status = if self.base.is_down() {
            HealthStatus::Down
        } else if self.dropped - self.rounding_dropped > 0.0 {
            HealthStatus::Rejecting
        } else {
            HealthStatus::from_load(self.utilization, 0.0, false)
        };
        metrics
    }

    fn max_rps(&self) -> f64 {
        self.capacity
    }

    fn apply_patch(&mut self, patch: &NodePatch) -> bool {
        let mut applied = false;
        if let Some(capacity) = positive(patch.max_rps) {
            self.capacity = capacity;
            applied = true;
        }
        if let Some(algorithm) = patch.algorithm.as_deref() {
            self.algorithm = Distribution::parse_lenient(algorithm);
            applied = true;
        }
        if let Some(enabled) = patch.backpressure_enabled {
            self.backpressure_enabled = enabled;
            applied = true;
        }
        if let Some(threshold) = positive(patch.backpressure_threshold) {
            self.backpressure_threshold = clamp_ratio(threshold);
            applied = true;
        }
        applied
    }
}
