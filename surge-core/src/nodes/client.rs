//! Traffic source node.

use super::routing::{average_latency, split_even, up_targets};
use super::{
    BaseNode, Emission, FlowClass, Neighbor, NodeKind, NodeMetrics, NodeModel, clamp_rate,
    clamp_ratio,
};
use crate::topology::NodePatch;

/// Traffic source. Splits injected flow into reads and writes and fans it
/// out evenly to every up downstream neighbor. No queue and no capacity cap.
#[derive(Debug, Clone)]
pub struct Client {
    base: BaseNode,
    /// Own injection rate; `None` shares the simulator's target rate
    rate: Option<f64>,
    read_ratio: f64,
    read_throughput: f64,
    write_throughput: f64,
}

impl Client {
    pub fn new(id: impl Into<String>, label: impl Into<String>, read_ratio: f64) -> Self {
        Self {
            base: BaseNode::new(id, NodeKind::Client, label),
            rate: None,
            read_ratio: clamp_ratio(read_ratio),
            read_throughput: 0.0,
            write_throughput: 0.0,
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = Some(clamp_rate(rate));
        self
    }

    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    pub fn read_ratio(&self) -> f64 {
        self.read_ratio
    }
}

impl NodeModel for Client {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    fn process_tick(&mut self, neighbors: &[Neighbor], out: &mut Vec<Emission>) {
        let inflow = self.base.take_incoming();
        if self.base.is_down() {
            self.read_throughput = 0.0;
            self.write_throughput = 0.0;
            return;
        }

        let (read, write) = inflow.split(self.read_ratio);
        self.read_throughput = read;
        self.write_throughput = write;

        let targets = up_targets(neighbors);
        split_even(read, &targets, FlowClass::Read, out);
        split_even(write, &targets, FlowClass::Write, out);
    }

    fn latency(&self, neighbors: &[Neighbor]) -> f64 {
        average_latency(&up_targets(neighbors))
    }

    fn metrics(&self, neighbors: &[Neighbor]) -> NodeMetrics {
        let mut metrics = NodeMetrics::for_node(&self.base);
        metrics.latency = self.latency(neighbors);
        metrics.read_throughput = self.read_throughput;
        metrics.write_throughput = self.write_throughput;
        metrics.throughput = self.read_throughput + self.write_throughput;
        metrics.arrival_read = self.read_throughput;
        metrics.arrival_write = self.write_throughput;
        metrics
    }

    fn max_rps(&self) -> f64 {
        0.0
    }

    fn apply_patch(&mut self, patch: &NodePatch) -> bool {
        let mut applied = false;
        if let Some(rps) = patch.rps.filter(|v| v.is_finite() && *v >= 0.0) {
            self.rate = Some(rps);
            applied = true;
        }
        if let Some(ratio) = patch.read_ratio.filter(|v| v.is_finite()) {
            self.read_ratio = clamp_ratio(ratio);
            applied = true;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(index: usize, is_down: bool) -> Neighbor {
        Neighbor {
            index,
            kind: NodeKind::LoadBalancer,
            is_down,
            max_rps: 500.0,
            is_replica: false,
            latency: 40.0,
        }
    }

    #[test]
    fn test_splits_and_fans_out_to_up_neighbors() {
        let mut client = Client::new("c", "Users", 0.7);
        client.base_mut().add_incoming(FlowClass::Generic, 100.0);

        let mut out = Vec::new();
        let neighbors = [neighbor(1, false), neighbor(2, true), neighbor(3, false)];
        client.process_tick(&neighbors, &mut out);

        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|e| e.target != 2));
        let reads: f64 = out
            .iter()
            .filter(|e| e.class == FlowClass::Read)
            .map(|e| e.amount)
            .sum();
        let writes: f64 = out
            .iter()
            .filter(|e| e.class == FlowClass::Write)
            .map(|e| e.amount)
            .sum();
        assert!((reads - 70.0).abs() < 1e-9);
        assert!((writes - 30.0).abs() < 1e-9);

        let metrics = client.metrics(&neighbors);
        assert!((metrics.throughput - 100.0).abs() < 1e-9);
        assert_eq!(metrics.latency, 40.0);
    }

    #[test]
    fn test_pre_tagged_flow_is_not_resplit() {
        let mut client = Client::new("c", "Users", 0.7);
        client.base_mut().add_incoming(FlowClass::Write, 50.0);

        let mut out = Vec::new();
        client.process_tick(&[neighbor(1, false)], &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class, FlowClass::Write);
        assert_eq!(out[0].amount, 50.0);
    }

    #[test]
    fn test_down_client_discards_flow() {
        let mut client = Client::new("c", "Users", 0.7);
        client.base_mut().set_down(true);
        client.base_mut().add_incoming(FlowClass::Generic, 100.0);

        let mut out = Vec::new();
        client.process_tick(&[neighbor(1, false)], &mut out);

        assert!(out.is_empty());
        let metrics = client.metrics(&[]);
        assert_eq!(metrics.throughput, 0.0);
        assert_eq!(metrics.status, crate::nodes::HealthStatus::Down);

        client.base_mut().set_down(false);
        client.process_tick(&[neighbor(1, false)], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_patch_rate_and_ratio() {
        let mut client = Client::new("c", "Users", 0.7).with_rate(10.0);
        let patch = NodePatch {
            rps: Some(250.0),
            read_ratio: Some(1.4),
            max_rps: Some(5.0),
            ..Default::default()
        };
        assert!(client.apply_patch(&patch));
        assert_eq!(client.rate(), Some(250.0));
        assert_eq!(client.read_ratio(), 1.0);
        assert!(!client.apply_patch(&NodePatch::default()));
    }
}
