//! Application tier node.

use super::queue::{Allocation, ServiceQueue};
use super::routing::{average_latency, split_even, up_targets, write_targets};
use super::{
    BaseNode, Emission, FlowClass, HealthStatus, Neighbor, NodeKind, NodeMetrics, NodeModel,
    clamp_rate, clamp_ratio, positive,
};
use crate::topology::NodePatch;

/// Queued service node that forwards what it processes.
///
/// Total latency is its own base latency, plus the average latency of the up
/// nodes behind it, plus the time needed to drain its backlog.
#[derive(Debug, Clone)]
pub struct AppServer {
    base: BaseNode,
    queue: ServiceQueue,
    read_ratio: f64,
}

impl AppServer {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        capacity: f64,
        base_latency: f64,
        read_ratio: f64,
    ) -> Self {
        Self {
            base: BaseNode::new(id, NodeKind::AppServer, label),
            queue: ServiceQueue::new(capacity, base_latency),
            read_ratio: clamp_ratio(read_ratio),
        }
    }

    /// Enables the Little's Law throttle with `limit` concurrent workers.
    pub fn with_concurrency_throttle(mut self, limit: f64) -> Self {
        self.queue.concurrency_limit = clamp_rate(limit);
        self.queue.throttle_enabled = true;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: f64) -> Self {
        self.queue.concurrency_limit = clamp_rate(limit);
        self
    }

    pub fn queue(&self) -> &ServiceQueue {
        &self.queue
    }

    fn total_latency(&self, up: &[Neighbor]) -> f64 {
        self.queue.base_latency + average_latency(up) + self.queue.queue_delay_ms()
    }
}

impl NodeModel for AppServer {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    fn process_tick(&mut self, neighbors: &[Neighbor], out: &mut Vec<Emission>) {
        let inflow = self.base.take_incoming();
        if self.base.is_down() {
            self.queue.idle();
            return;
        }

        let (read, write) = inflow.split(self.read_ratio);
        let up = up_targets(neighbors);
        let latency = self.total_latency(&up);
        let served = self.queue.serve(read, write, latency, Allocation::Proportional);

        split_even(served.write, &write_targets(&up), FlowClass::Write, out);
        split_even(served.read, &up, FlowClass::Read, out);
    }

    fn latency(&self, neighbors: &[Neighbor]) -> f64 {
        self.total_latency(&up_targets(neighbors))
    }

    fn metrics(&self, neighbors: &[Neighbor]) -> NodeMetrics {
        let mut metrics = NodeMetrics::for_node(&self.base);
        if self.base.is_down() {
            metrics.queue_depth = self.queue.queue_depth();
            metrics.dropped = self.queue.total_dropped();
            return metrics;
        }

        let served = self.queue.served();
        let (arrival_read, arrival_write) = self.queue.arrivals();
        metrics.utilization = self.queue.utilization();
        metrics.latency = self.latency(neighbors);
        metrics.queue_depth = self.queue.queue_depth();
        metrics.read_throughput = served.read;
        metrics.write_throughput = served.write;
        metrics.throughput = served.total();
        metrics.drop_rate = self.queue.dropped();
        metrics.dropped = self.queue.total_dropped();
        metrics.arrival_read = arrival_read;
        metrics.arrival_write = arrival_write;
        metrics.effective_capacity = self.queue.effective_capacity();
        metrics.status = HealthStatus::from_load(metrics.utilization, metrics.queue_depth, false);
        metrics
    }

    fn max_rps(&self) -> f64 {
        self.queue.capacity
    }

    fn reset_queues(&mut self) {
        self.queue.reset();
    }

    fn apply_patch(&mut self, patch: &NodePatch) -> bool {
        let mut applied = false;
        if let Some(capacity) = positive(patch.max_rps) {
            self.queue.set_capacity(capacity);
            applied = true;
        }
        if let Some(latency) = positive(patch.base_latency) {
            self.queue.base_latency = latency;
            applied = true;
        }
        if let Some(limit) = patch.concurrency_limit.filter(|v| v.is_finite() && *v >= 0.0) {
            self.queue.concurrency_limit = limit;
            applied = true;
        }
        if let Some(enabled) = patch.concurrency_throttle {
            self.queue.throttle_enabled = enabled;
            applied = true;
        }
        if let Some(ratio) = patch.read_ratio.filter(|v| v.is_finite()) {
            self.read_ratio = clamp_ratio(ratio);
            applied = true;
        }
        applied
    }
}
