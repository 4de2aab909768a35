//! Read/write router in front of a database tier.
//!
//! Writes only ever reach primaries. Reads prefer replicas so primary
//! capacity stays free for writes, and fall back to primaries when no
//! replica is up. The router itself has no capacity cap.

use super::routing::{average_latency, split_even, up_targets};
use super::{
    BaseNode, Emission, FlowClass, Neighbor, NodeKind, NodeMetrics, NodeModel, clamp_rate,
    clamp_ratio, positive,
};
use crate::topology::NodePatch;

/// Utilization reported while the router carries flow.
const ROUTER_ACTIVE_UTILIZATION: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct DbRouter {
    base: BaseNode,
    read_ratio: f64,
    overhead_ms: f64,
    arrival_read: f64,
    arrival_write: f64,
    read_throughput: f64,
    write_throughput: f64,
    dropped: f64,
    total_dropped: f64,
}

impl DbRouter {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        read_ratio: f64,
        overhead_ms: f64,
    ) -> Self {
        Self {
            base: BaseNode::new(id, NodeKind::DbRouter, label),
            read_ratio: clamp_ratio(read_ratio),
            overhead_ms: clamp_rate(overhead_ms),
            arrival_read: 0.0,
            arrival_write: 0.0,
            read_throughput: 0.0,
            write_throughput: 0.0,
            dropped: 0.0,
            total_dropped: 0.0,
        }
    }

    pub fn read_ratio(&self) -> f64 {
        self.read_ratio
    }
}

/// Splits up neighbors into (replicas, primaries).
fn partition(up: &[Neighbor]) -> (Vec<Neighbor>, Vec<Neighbor>) {
    up.iter().copied().partition(|n| n.is_replica)
}

impl NodeModel for DbRouter {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    fn process_tick(&mut self, neighbors: &[Neighbor], out: &mut Vec<Emission>) {
        let inflow = self.base.take_incoming();
        self.dropped = 0.0;
        if self.base.is_down() {
            self.arrival_read = 0.0;
            self.arrival_write = 0.0;
            self.read_throughput = 0.0;
            self.write_throughput = 0.0;
            return;
        }

        let (read, write) = inflow.split(self.read_ratio);
        self.arrival_read = read;
        self.arrival_write = write;

        let (replicas, primaries) = partition(&up_targets(neighbors));

        self.write_throughput = if primaries.is_empty() {
            self.dropped += write;
            0.0
        } else {
            split_even(write, &primaries, FlowClass::Write, out);
            write
        };

        let readers = if replicas.is_empty() {
            &primaries
        } else {
            &replicas
        };
        self.read_throughput = if readers.is_empty() {
            self.dropped += read;
            0.0
        } else {
            split_even(read, readers, FlowClass::Read, out);
            read
        };

        self.total_dropped += self.dropped;
    }

    fn latency(&self, neighbors: &[Neighbor]) -> f64 {
        let (replicas, primaries) = partition(&up_targets(neighbors));
        let primary_latency = average_latency(&primaries);
        let read_latency = if replicas.is_empty() {
            primary_latency
        } else {
            average_latency(&replicas)
        };
        self.overhead_ms
            + self.read_ratio * read_latency
            + (1.0 - self.read_ratio) * primary_latency
    }

    fn metrics(&self, neighbors: &[Neighbor]) -> NodeMetrics {
        let mut metrics = NodeMetrics::for_node(&self.base);
        metrics.dropped = self.total_dropped;
        if self.base.is_down() {
            return metrics;
        }

        let throughput = self.read_throughput + self.write_throughput;
        metrics.latency = self.latency(neighbors);
        metrics.read_throughput = self.read_throughput;
        metrics.write_throughput = self.write_throughput;
        metrics.throughput = throughput;
        metrics.arrival_read = self.arrival_read;
        metrics.arrival_write = self.arrival_write;
        metrics.drop_rate = self.dropped;
        metrics.utilization = if self.arrival_read + self.arrival_write > 0.0 {
            ROUTER_ACTIVE_UTILIZATION
        } else {
            0.0
        };
        metrics
    }

    fn max_rps(&self) -> f64 {
        0.0
    }

    fn apply_patch(&mut self, patch: &NodePatch) -> bool {
        let mut applied = false;
        if let Some(ratio) = patch.read_ratio.filter(|v| v.is_finite()) {
            self.read_ratio = clamp_ratio(ratio);
            applied = true;
        }
        if let Some(overhead) = positive(patch.base_latency) {
            self.overhead_ms = overhead;
            applied = true;
        }
        applied
    }
}
