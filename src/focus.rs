//! Focus zones
//!
//! A focus zone is a polygon in the projected plane. `Explore` seeds one
//! node into an empty zone; `Extend` boosts the pending frontier entries of
//! nodes already inside it.

use crate::engine::Engine;
use crate::error::ExploreError;
use crate::events::{GraphEvent, GraphUpdate};
use crate::geometry::Polygon;
use crate::store::{NodePatch, NodeRecord};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FocusMode {
    Explore { prompt: String },
    Extend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FocusOutcome {
    /// A new depth-1 node was created inside the empty zone.
    Seeded(NodeId),
    /// The zone already holds nodes; nothing was created.
    Occupied { nodes: Vec<NodeId> },
    /// `matched` nodes lie in the zone, `boosted` of them had pending entries.
    Boosted { matched: usize, boosted: usize },
}

/// Ids of every positioned node inside `polygon`.
pub fn nodes_in_zone(engine: &Engine, polygon: &Polygon) -> Result<Vec<NodeId>, ExploreError> {
    Ok(engine
        .store()
        .list_all()?
        .into_iter()
        .filter(|n| n.position.is_some_and(|p| polygon.contains(&p)))
        .map(|n| n.id)
        .collect())
}

pub async fn focus_zone(
    engine: &Engine,
    polygon: &Polygon,
    mode: FocusMode,
) -> Result<FocusOutcome, ExploreError> {
    match mode {
        FocusMode::Explore { prompt } => explore(engine, polygon, prompt).await,
        FocusMode::Extend => extend(engine, polygon),
    }
}

async fn explore(
    engine: &Engine,
    polygon: &Polygon,
    prompt: String,
) -> Result<FocusOutcome, ExploreError> {
    // Held across the emptiness check and the commit so two concurrent
    // requests on the same zone seed at most one node.
    let _guard = engine.focus_guard().lock().await;

    let occupants = nodes_in_zone(engine, polygon)?;
    if !occupants.is_empty() {
        debug!(occupants = occupants.len(), "Focus zone occupied, not seeding");
        return Ok(FocusOutcome::Occupied { nodes: occupants });
    }

    let position = polygon.interior_point();
    if !polygon.contains(&position) {
        return Err(ExploreError::InvalidPolygon(
            "no interior point to place a seed at".to_string(),
        ));
    }

    let root = engine
        .store()
        .roots()?
        .into_iter()
        .next()
        .ok_or(ExploreError::NoRoot)?;

    let embedding = match engine.embed(&prompt).await {
        Ok((metered, _)) => Some(metered),
        Err(err) => {
            warn!(error = %err, "Could not embed focus seed, committing without embedding");
            None
        }
    };

    let priority = engine.settings().snapshot().seed_priority;
    let mut node = NodeRecord::child_of(&root, prompt);
    node.position = Some(position);
    node.priority = Some(priority);
    if let Some(metered) = embedding {
        node.cost_usd = Some(metered.cost_usd);
        node.usage = metered.usage;
        node.embedding = Some(metered.value);
    }

    let node_id = engine.commit(node, priority)?;
    info!(node_id = %node_id, parent_id = %root.id, "Seeded focus zone");
    Ok(FocusOutcome::Seeded(node_id))
}

fn extend(engine: &Engine, polygon: &Polygon) -> Result<FocusOutcome, ExploreError> {
    let matched = nodes_in_zone(engine, polygon)?;
    let delta = engine.settings().snapshot().focus_boost;
    let boosted = engine.frontier().boost(&matched, delta);
    info!(matched = matched.len(), boosted, delta, "Boosted focus zone");
    Ok(FocusOutcome::Boosted {
        matched: matched.len(),
        boosted,
    })
}

/// Create a root for `prompt`, admit it and fill in its embedding.
pub async fn seed(engine: &Engine, prompt: impl Into<String>) -> Result<NodeId, ExploreError> {
    let priority = engine.settings().snapshot().seed_priority;
    let mut root = NodeRecord::root(prompt);
    root.priority = Some(priority);
    let text = root.prompt.clone();
    let node_id = engine.commit(root, priority)?;
    info!(node_id = %node_id, "Seeded root");

    match engine.embed(&text).await {
        Ok((metered, position)) => {
            let patch = NodePatch {
                embedding: Some(metered.value),
                position: Some(position),
                cost_usd: Some(metered.cost_usd),
                ..Default::default()
            };
            let updated = engine.store().update(&node_id, &patch)?;
            engine
                .events()
                .publish(GraphEvent::NodeUpdated(GraphUpdate::from(&updated)));
        }
        Err(err) => warn!(node_id = %node_id, error = %err, "Root left without a position"),
    }
    Ok(node_id)
}
