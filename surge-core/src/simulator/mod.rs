//! Live simulation driver.
//!
//! A [`Simulator`] owns one [`TickEngine`] behind a single mutex and, once
//! started, one background task that ticks it at a fixed interval. Results
//! are pushed into a bounded channel without waiting; when the consumer falls
//! behind the newest result is dropped. Live mutations lock the same mutex, so
//! they land between ticks, never inside one.

pub mod tick;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use tick::{SPIKE_MULTIPLIER, TickEngine, TickResult};

use crate::config::EngineConfig;
use crate::graph::Graph;
use crate::nodes::{NodeMetrics, NodeModel};
use crate::topology::NodePatch;

/// Errors from simulator lifecycle and live mutation calls.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("Simulator is already running")]
    AlreadyStarted,

    #[error("Simulator has been stopped")]
    Stopped,
}

/// Lifecycle of a simulator. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    Created,
    Running,
    Stopped,
}

/// Handle to the background tick task.
struct Driver {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

enum Lifecycle {
    /// Output sender waits here until the driver takes ownership of it
    Created { output: mpsc::Sender<TickResult> },
    Running { driver: Driver },
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> SimulatorState {
        match self {
            Lifecycle::Created { .. } => SimulatorState::Created,
            Lifecycle::Running { .. } => SimulatorState::Running,
            Lifecycle::Stopped => SimulatorState::Stopped,
        }
    }
}

/// One running simulation over one graph.
pub struct Simulator {
    engine: Arc<Mutex<TickEngine>>,
    lifecycle: Mutex<Lifecycle>,
    /// Set once the output sender is gone for good
    finished: Arc<watch::Sender<bool>>,
    tick_interval: Duration,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("state", &self.state())
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

impl Simulator {
    /// Creates a stopped simulator and the stream its results will arrive on.
    ///
    /// The stream ends once the simulator is stopped or dropped.
    pub fn new(graph: Graph, config: &EngineConfig) -> (Self, MetricsStream) {
        let (output, receiver) = mpsc::channel(config.output_buffer.max(1));
        let simulator = Self {
            engine: Arc::new(Mutex::new(TickEngine::new(graph, config.clone()))),
            lifecycle: Mutex::new(Lifecycle::Created { output }),
            finished: Arc::new(watch::channel(false).0),
            tick_interval: config.tick_interval,
        };
        (simulator, MetricsStream { receiver })
    }

    pub fn state(&self) -> SimulatorState {
        self.lifecycle.lock().state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SimulatorState::Running
    }

    /// Spawns the background driver. Must be called within a tokio runtime.
    ///
    /// # Errors
    /// - `SimulationError::AlreadyStarted` - Driver is already running
    /// - `SimulationError::Stopped` - Simulator was stopped and cannot restart
    pub fn start(&self) -> Result<(), SimulationError> {
        let mut lifecycle = self.lifecycle.lock();
        let output = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Created { output } => output,
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                return Err(SimulationError::AlreadyStarted);
            }
            Lifecycle::Stopped => return Err(SimulationError::Stopped),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let finished = Arc::clone(&self.finished);
        let interval = self.tick_interval;
        let handle = tokio::spawn(async move {
            Self::run_driver(engine, output, interval, shutdown_rx).await;
            finished.send_replace(true);
        });

        *lifecycle = Lifecycle::Running {
            driver: Driver {
                shutdown_tx,
                handle,
            },
        };
        info!("Simulator started, ticking every {:?}", interval);
        Ok(())
    }

    /// Stops the driver and closes the output stream.
    ///
    /// Waits for an in-flight tick to finish and for the driver task to exit,
    /// so no result is published after this returns. Concurrent callers all
    /// wait for the same exit; stopping an already stopped simulator returns
    /// at once.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running { driver } => {
                let _ = driver.shutdown_tx.send(());
                if let Err(e) = driver.handle.await {
                    warn!("Simulator driver exited abnormally: {}", e);
                }
                self.finished.send_replace(true);
                info!(
                    "Simulator stopped after {} ticks",
                    self.engine.lock().tick_count()
                );
            }
            Lifecycle::Created { output } => {
                drop(output);
                self.finished.send_replace(true);
                info!("Simulator stopped before starting");
            }
            Lifecycle::Stopped => {
                // Another caller may still be waiting on the driver.
                let mut finished = self.finished.subscribe();
                let _ = finished.wait_for(|done| *done).await;
            }
        }
    }

    async fn run_driver(
        engine: Arc<Mutex<TickEngine>>,
        output: mpsc::Sender<TickResult>,
        interval: Duration,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dropped_results = 0u64;
        let mut consumer_gone = false;

        loop {
            tokio::select! {
                biased;

                // Also fires when the simulator is dropped without stop().
                _ = &mut shutdown_rx => break,

                _ = ticker.tick() => {
                    let result = engine.lock().step();
                    match output.try_send(result) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(result)) => {
                            dropped_results += 1;
                            debug!(
                                "Metrics consumer is behind, dropped tick {} ({} dropped so far)",
                                result.tick, dropped_results
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            if !consumer_gone {
                                debug!("Metrics stream receiver dropped, results discarded");
                                consumer_gone = true;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Runs one tick immediately on the caller's thread.
    ///
    /// The result is returned rather than published to the stream.
    ///
    /// # Errors
    /// - `SimulationError::Stopped` - Simulator was stopped
    pub fn step(&self) -> Result<TickResult, SimulationError> {
        if self.state() == SimulatorState::Stopped {
            return Err(SimulationError::Stopped);
        }
        Ok(self.engine.lock().step())
    }

    pub fn tick_count(&self) -> u64 {
        self.engine.lock().tick_count()
    }

    pub fn traffic_rate(&self) -> f64 {
        self.engine.lock().traffic_rps()
    }

    /// Sets the target aggregate injection rate. Negative or non-finite rates are ignored.
    pub fn set_traffic_rate(&self, rps: f64) {
        self.engine.lock().set_traffic_rps(rps);
        debug!("Traffic rate set to {}", rps);
    }

    pub fn spike(&self) -> bool {
        self.engine.lock().spike()
    }

    pub fn set_spike(&self, on: bool) {
        self.engine.lock().set_spike(on);
        debug!("Spike mode {}", if on { "on" } else { "off" });
    }

    /// Marks a node up or down, effective from the next tick.
    ///
    /// # Errors
    /// - `SimulationError::NodeNotFound` - No node with this id
    pub fn set_node_down(&self, node_id: &str, down: bool) -> Result<(), SimulationError> {
        let mut engine = self.engine.lock();
        let node = engine
            .graph_mut()
            .node_mut(node_id)
            .ok_or_else(|| SimulationError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        node.set_down(down);
        debug!("Node {} marked {}", node_id, if down { "down" } else { "up" });
        Ok(())
    }

    /// Applies a partial parameter update to a live node.
    ///
    /// Returns whether any field applied to the node's type.
    ///
    /// # Errors
    /// - `SimulationError::NodeNotFound` - No node with this id
    pub fn patch_node(&self, node_id: &str, patch: &NodePatch) -> Result<bool, SimulationError> {
        let mut engine = self.engine.lock();
        let node = engine
            .graph_mut()
            .node_mut(node_id)
            .ok_or_else(|| SimulationError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        let applied = node.apply_patch(patch);
        debug!("Patched node {}: applied={}", node_id, applied);
        Ok(applied)
    }

    /// Swaps in a new graph from the next tick on.
    pub fn replace_graph(&self, graph: Graph) {
        let nodes = graph.len();
        self.engine.lock().replace_graph(graph);
        debug!("Graph replaced, {} nodes", nodes);
    }

    /// Clears every backlog without stopping.
    pub fn reset_queues(&self) {
        self.engine.lock().graph_mut().reset_queues();
        debug!("All queues reset");
    }

    /// Current metrics without advancing the simulation.
    pub fn snapshot(&self) -> Vec<NodeMetrics> {
        self.engine.lock().graph().snapshot()
    }

    /// Runs `f` with read access to the current graph.
    pub fn with_graph<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        f(self.engine.lock().graph())
    }

    /// Whether the node currently exists and is up.
    pub fn node_is_up(&self, node_id: &str) -> Option<bool> {
        self.with_graph(|graph| graph.node(node_id).map(|n| !n.base().is_down()))
    }
}

/// Ordered per-tick results of one simulator.
///
/// Ends (yields `None`) once the simulator has stopped and every buffered
/// result has been read.
#[derive(Debug)]
pub struct MetricsStream {
    receiver: mpsc::Receiver<TickResult>,
}

impl MetricsStream {
    pub async fn recv(&mut self) -> Option<TickResult> {
        self.receiver.recv().await
    }

    /// Returns a buffered result without waiting.
    pub fn try_recv(&mut self) -> Option<TickResult> {
        self.receiver.try_recv().ok()
    }

    /// Whether the simulator has released the stream. Buffered results may remain.
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}

impl Stream for MetricsStream {
    type Item = TickResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
