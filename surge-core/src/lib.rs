//! Surge Core - Rate-based simulation of distributed-system topologies
//!
//! A topology of clients, load balancers, application servers, databases
//! and database routers is built into a validated graph, then driven tick by
//! tick: traffic is injected as a continuous rate, each node applies its
//! capacity, queueing and routing model, and every tick yields a metrics
//! snapshot with bottleneck flags. Sessions run many simulations side by
//! side and accept live changes while they tick.

pub mod config;
pub mod graph;
pub mod nodes;
pub mod session;
pub mod simulator;
pub mod topology;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{EngineConfig, NodeDefaults, SurgeConfig};
pub use graph::Graph;
pub use nodes::{HealthStatus, NodeKind, NodeMetrics, NodeModel};
pub use session::{Session, SessionError, SessionId, SessionManager};
pub use simulator::{MetricsStream, SimulationError, Simulator, SimulatorState, TickResult};
pub use topology::{EdgeConfig, NodeConfig, NodePatch, TopologyConfig, TopologyError};

/// Errors that can bubble up from any Surge subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SurgeError {
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl SurgeError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SurgeError::Topology(e) | SurgeError::Session(SessionError::Topology(e)) => match e {
                TopologyError::EmptyTopology => "The topology has no nodes".to_string(),
                TopologyError::CycleDetected { unresolved } => {
                    format!("The topology loops back on itself through {}", unresolved.join(", "))
                }
                TopologyError::Io(_) => "Could not read the topology file".to_string(),
                other => other.to_string(),
            },
            SurgeError::Simulation(SimulationError::NodeNotFound { node_id })
            | SurgeError::Session(SessionError::Simulation(SimulationError::NodeNotFound {
                node_id,
            })) => format!("Node {node_id} not found"),
            SurgeError::Simulation(_) | SurgeError::Session(SessionError::Simulation(_)) => {
                "Simulation is not running".to_string()
            }
            SurgeError::Session(SessionError::SessionNotFound { session_id }) => {
                format!("Session {session_id} not found")
            }
            SurgeError::Configuration { reason } => format!("Configuration error: {reason}"),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        match self {
            SurgeError::Topology(e) | SurgeError::Session(SessionError::Topology(e)) => {
                !matches!(e, TopologyError::Io(_))
            }
            SurgeError::Configuration { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SurgeError>;
