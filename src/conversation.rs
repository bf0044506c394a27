//! Conversation Reconstructor
//!
//! Walks parent links from a node up to its root and replays the path as an
//! ordered dialogue, root first.

use crate::error::ExploreError;
use crate::store::{NodeRecord, NodeStore};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};

/// Default bound on ancestor hops before giving up.
pub const DEFAULT_MAX_TRAVERSAL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Author of the eliciting prompt
    Human,
    /// Author of the reply
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn human(text: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            text: text.into(),
        }
    }
}

/// Reconstructed dialogue plus the node it ends at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationView {
    pub node_id: NodeId,
    pub depth: u32,
    pub score: Option<f64>,
    pub analysis: Option<String>,
    pub turns: Vec<Turn>,
}

pub struct ConversationReconstructor<'a> {
    store: &'a dyn NodeStore,
    max_depth: usize,
}

impl<'a> ConversationReconstructor<'a> {
    pub fn new(store: &'a dyn NodeStore, max_depth: usize) -> Self {
        Self { store, max_depth }
    }

    /// Nodes from the root down to `node_id`.
    pub fn path(&self, node_id: &NodeId) -> Result<Vec<NodeRecord>, ExploreError> {
        let mut path = vec![self.store.require(node_id)?];
        loop {
            let Some(parent_id) = path.last().and_then(|n| n.parent_id) else {
                break;
            };
            if path.len() > self.max_depth {
                return Err(ExploreError::CycleOrTooDeep {
                    node: *node_id,
                    limit: self.max_depth,
                });
            }
            let parent = self.store.get(&parent_id)?.ok_or_else(|| {
                ExploreError::StoreInvariantViolation(format!(
                    "ancestor {} of node {} is missing",
                    parent_id, node_id
                ))
            })?;
            path.push(parent);
        }
        path.reverse();
        Ok(path)
    }

    /// Alternating human/agent turns, root first. A node without a reply
    /// contributes only its prompt.
    pub fn reconstruct(&self, node_id: &NodeId) -> Result<Vec<Turn>, ExploreError> {
        Ok(dialogue(&self.path(node_id)?))
    }

    pub fn view(&self, node_id: &NodeId) -> Result<ConversationView, ExploreError> {
        let path = self.path(node_id)?;
        let turns = dialogue(&path);
        // path is never empty: it starts with the requested node
        let last = &path[path.len() - 1];
        Ok(ConversationView {
            node_id: last.id,
            depth: last.depth,
            score: last.score,
            analysis: last.analysis.clone(),
            turns,
        })
    }
}

/// Flatten a root-first path into turns.
pub fn dialogue(path: &[NodeRecord]) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(path.len() * 2);
    for node in path {
        turns.push(Turn::human(node.prompt.clone()));
        if let Some(reply) = &node.reply {
            turns.push(Turn::agent(reply.clone()));
        }
    }
    turns
}

/// Plain-text transcript used in generation prompts.
pub fn render_transcript(turns: &[Turn], human_label: &str, agent_label: &str) -> String {
    turns
        .iter()
        .map(|turn| {
            let label = match turn.role {
                Role::Human => human_label,
                Role::Agent => agent_label,
            };
            format!("{}: {}", label, turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
