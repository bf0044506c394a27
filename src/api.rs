//! Exploration API
//!
//! Transport-free surface for external callers: seeding, graph and
//! conversation queries, focus zones, live settings, the event stream and
//! status. Every method goes through the same [`Engine`] the worker uses, so
//! nothing here bypasses the store or frontier contracts.

use crate::conversation::ConversationView;
use crate::engine::Engine;
use crate::error::ExploreError;
use crate::events::{EventReceiver, GraphUpdate};
use crate::focus::{self, FocusMode, FocusOutcome};
use crate::geometry::Polygon;
use crate::heartbeat::StatusSnapshot;
use crate::settings::{RunConfiguration, SettingsUpdate};
use crate::types::NodeId;
use tracing::debug;

/// Exploration API service
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct ExplorationApi {
    engine: Engine,
}

impl ExplorationApi {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Seed a new exploration tree
    ///
    /// Creates a depth-0 node for `prompt`, admits it to the frontier and
    /// publishes it. The root's embedding and position are filled in
    /// afterwards; an embedder failure leaves them absent.
    ///
    /// # Returns
    /// The id of the new root
    pub async fn seed(&self, prompt: impl Into<String>) -> Result<NodeId, ExploreError> {
        focus::seed(&self.engine, prompt).await
    }

    /// Point-in-time snapshot of every node, oldest first.
    pub fn graph(&self) -> Result<Vec<GraphUpdate>, ExploreError> {
        let mut nodes = self.engine.store().list_all()?;
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!(nodes = nodes.len(), "Graph snapshot");
        Ok(nodes.iter().map(GraphUpdate::from).collect())
    }

    /// Reconstructed dialogue for `node_id`
    ///
    /// # Arguments
    /// * `node_id` - Any node in the tree; the dialogue runs from its root
    ///
    /// # Errors
    /// `NodeNotFound` for unknown ids, `CycleOrTooDeep` if the ancestry walk
    /// exceeds the configured bound
    pub fn conversation(&self, node_id: &NodeId) -> Result<ConversationView, ExploreError> {
        self.engine.reconstructor().view(node_id)
    }

    pub async fn focus_zone(
        &self,
        polygon: &Polygon,
        mode: FocusMode,
    ) -> Result<FocusOutcome, ExploreError> {
        focus::focus_zone(&self.engine, polygon, mode).await
    }

    pub fn settings(&self) -> RunConfiguration {
        self.engine.settings().snapshot()
    }

    /// Apply a partial settings update. Applies to priorities computed from
    /// now on; pending frontier entries keep their priority.
    pub fn update_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<RunConfiguration, ExploreError> {
        self.engine.settings().update(update)
    }

    /// Subscribe to node and heartbeat events. Only events published after
    /// this call are delivered; use [`ExplorationApi::graph`] for history.
    pub fn subscribe(&self) -> EventReceiver {
        self.engine.events().subscribe()
    }

    pub fn status(&self) -> Result<StatusSnapshot, ExploreError> {
        self.engine.status(0.0)
    }

    /// Rebuild the frontier and ledger from the store after a restart.
    pub fn recover(&self) -> Result<usize, ExploreError> {
        self.engine.recover()
    }
}
