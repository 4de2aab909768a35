//! Registry of independent running simulations.
//!
//! Each session binds one id to one [`Simulator`]. The registry is guarded
//! by a single reader/writer lock; creating a session under an id that is
//! already in use stops the old simulator before the new one is installed, so
//! at most one simulator ever runs per id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::SurgeConfig;
use crate::graph::Graph;
use crate::simulator::{MetricsStream, SimulationError, Simulator};
use crate::topology::{NodePatch, TopologyConfig, TopologyError};

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

/// Identifier of a simulation session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Length of generated ids.
    pub const GENERATED_LEN: usize = 8;

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a short random id from a v4 UUID.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid[..Self::GENERATED_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One registered simulation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub simulator: Arc<Simulator>,
    pub created_at: DateTime<Utc>,
}

/// Concurrency-safe registry of sessions.
///
/// Constructed once at process start and handed to whatever transport layer
/// exposes the operations.
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Session>>,
    config: SurgeConfig,
}

impl SessionManager {
    pub fn new(config: SurgeConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SurgeConfig {
        &self.config
    }

    /// Builds and starts a simulation under a freshly generated id.
    ///
    /// # Errors
    /// - `SessionError::Topology` - Topology failed validation; nothing is registered
    pub async fn create(
        &self,
        topology: &TopologyConfig,
    ) -> Result<(SessionId, MetricsStream), SessionError> {
        let id = SessionId::generate();
        let stream = self.create_with_id(id.clone(), topology).await?;
        Ok((id, stream))
    }

    /// Builds and starts a simulation under `id`, replacing any existing one.
    ///
    /// The topology is validated before the registry is touched. A previous
    /// simulator under the same id is stopped (its stream closed) before the
    /// new one starts ticking.
    ///
    /// # Errors
    /// - `SessionError::Topology` - Topology failed validation; nothing is registered
    pub async fn create_with_id(
        &self,
        id: SessionId,
        topology: &TopologyConfig,
    ) -> Result<MetricsStream, SessionError> {
        let graph = Graph::build(topology, &self.config.defaults)?;
        let (simulator, stream) = Simulator::new(graph, &self.config.engine);
        let simulator = Arc::new(simulator);

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.remove(&id) {
            info!("Replacing session {}", id);
            existing.simulator.stop().await;
        }

        simulator.start()?;
        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                simulator,
                created_at: Utc::now(),
            },
        );
        info!("Created session {} ({} active)", id, sessions.len());
        Ok(stream)
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Stops a session and removes it from the registry.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - No session with this id
    pub async fn stop(&self, id: &SessionId) -> Result<(), SessionError> {
        // The write guard is held until the driver exits so a replacement
        // created under the same id cannot start ticking alongside it.
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.remove(id) else {
            warn!("Stop requested for unknown session {}", id);
            return Err(SessionError::SessionNotFound {
                session_id: id.clone(),
            });
        };

        session.simulator.stop().await;
        drop(sessions);
        info!("Stopped session {}", id);
        Ok(())
    }

    /// Stops every session.
    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.write().await;
        let drained: Vec<Session> = sessions.drain().map(|(_, session)| session).collect();
        let count = drained.len();
        for session in drained {
            session.simulator.stop().await;
        }
        drop(sessions);
        info!("Shut down {} sessions", count);
    }

    /// Updates the target rate and/or spike mode of a session.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - No session with this id
    pub async fn set_traffic(
        &self,
        id: &SessionId,
        rps: Option<f64>,
        spike: Option<bool>,
    ) -> Result<(), SessionError> {
        let simulator = self.simulator(id).await?;
        if let Some(rps) = rps {
            simulator.set_traffic_rate(rps);
        }
        if let Some(spike) = spike {
            simulator.set_spike(spike);
        }
        Ok(())
    }

    /// Marks a node up or down.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - No session with this id
    /// - `SessionError::Simulation` - No node with this id
    pub async fn toggle_node(
        &self,
        id: &SessionId,
        node_id: &str,
        down: bool,
    ) -> Result<(), SessionError> {
        let simulator = self.simulator(id).await?;
        simulator.set_node_down(node_id, down).inspect_err(|e| {
            warn!("Toggle failed in session {}: {}", id, e);
        })?;
        Ok(())
    }

    /// Applies a live parameter patch to a node. Returns whether any field applied.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - No session with this id
    /// - `SessionError::Simulation` - No node with this id
    pub async fn patch_node_config(
        &self,
        id: &SessionId,
        node_id: &str,
        patch: &NodePatch,
    ) -> Result<bool, SessionError> {
        let simulator = self.simulator(id).await?;
        let applied = simulator.patch_node(node_id, patch).inspect_err(|e| {
            warn!("Patch failed in session {}: {}", id, e);
        })?;
        Ok(applied)
    }

    /// Swaps the graph of a running session. The stream stays open.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - No session with this id
    /// - `SessionError::Topology` - New topology failed validation; the old graph keeps running
    pub async fn replace_graph(
        &self,
        id: &SessionId,
        topology: &TopologyConfig,
    ) -> Result<(), SessionError> {
        let simulator = self.simulator(id).await?;
        let graph = Graph::build(topology, &self.config.defaults)?;
        simulator.replace_graph(graph);
        info!("Replaced graph of session {}", id);
        Ok(())
    }

    /// Clears every queue in a session.
    ///
    /// # Errors
    /// - `SessionError::SessionNotFound` - No session with this id
    pub async fn reset_queues(&self, id: &SessionId) -> Result<(), SessionError> {
        self.simulator(id).await?.reset_queues();
        Ok(())
    }

    async fn simulator(&self, id: &SessionId) -> Result<Arc<Simulator>, SessionError> {
        match self.sessions.read().await.get(id) {
            Some(session) => Ok(Arc::clone(&session.simulator)),
            None => {
                warn!("No session {}", id);
                Err(SessionError::SessionNotFound {
                    session_id: id.clone(),
                })
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SurgeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeConfig;

    fn topology() -> TopologyConfig {
        TopologyConfig::default()
            .with_node(NodeConfig::new("lb", "loadbalancer"))
            .with_node(NodeConfig::new("app", "appserver"))
            .with_edge("lb", "app")
            .with_traffic(50.0)
    }

    #[test]
    fn test_generated_ids_are_short_and_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_eq!(a.as_str().len(), SessionId::GENERATED_LEN);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_invalid_topology_registers_nothing() {
        let manager = SessionManager::new(SurgeConfig::for_testing());
        let bad = topology().with_edge("app", "missing");

        let err = manager.create(&bad).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Topology(TopologyError::UnresolvedEdge { .. })
        ));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_ids_report_not_found() {
        let manager = SessionManager::new(SurgeConfig::for_testing());
        let ghost = SessionId::from("ghost");

        assert!(matches!(
            manager.stop(&ghost).await,
            Err(SessionError::SessionNotFound { .. })
        ));
        assert!(matches!(
            manager.set_traffic(&ghost, Some(10.0), None).await,
            Err(SessionError::SessionNotFound { .. })
        ));

        let (id, _stream) = manager.create(&topology()).await.unwrap();
        assert!(matches!(
            manager.toggle_node(&id, "ghost", true).await,
            Err(SessionError::Simulation(SimulationError::NodeNotFound { .. }))
        ));
        manager.shutdown_all().await;
        assert!(manager.is_empty().await);
    }
}
