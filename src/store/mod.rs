//! Node Store
//!
//! Append-only map of node identifier to node record. Nodes are created once and
//! never deleted; only the fill-once fields in [`NodePatch`] may change afterwards.
//! The parent of a node must already exist when the node is created, so the
//! graph is a tree by construction.

pub mod memory;
pub mod persistence;

pub use memory::MemoryNodeStore;
pub use persistence::SledNodeStore;

use crate::error::StorageError;
use crate::types::{Embedding, NodeId, Position, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One turn (prompt/reply pair) in the exploration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub depth: u32,
    /// Eliciting message for this turn
    pub prompt: String,
    pub reply: Option<String>,
    /// Trajectory score in [0,1]
    pub score: Option<f64>,
    /// Critic rationale for the score
    pub analysis: Option<String>,
    pub embedding: Option<Embedding>,
    /// Display-only projection of the embedding
    pub position: Option<Position>,
    pub cost_usd: Option<f64>,
    pub usage: TokenUsage,
    /// Admission priority computed when the node was committed
    pub priority: Option<f64>,
    pub created_at: DateTime<Utc>,
    /// Set when the worker selects the node for expansion
    pub expanded_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    /// A depth-0 node with no parent.
    pub fn root(prompt: impl Into<String>) -> Self {
        Self::bare(NodeId::new(), None, 0, prompt.into())
    }

    /// A node one level below `parent`.
    pub fn child_of(parent: &NodeRecord, prompt: impl Into<String>) -> Self {
        Self::bare(NodeId::new(), Some(parent.id), parent.depth + 1, prompt.into())
    }

    fn bare(id: NodeId, parent_id: Option<NodeId>, depth: u32, prompt: String) -> Self {
        Self {
            id,
            parent_id,
            depth,
            prompt,
            reply: None,
            score: None,
            analysis: None,
            embedding: None,
            position: None,
            cost_usd: None,
            usage: TokenUsage::default(),
            priority: None,
            created_at: Utc::now(),
            expanded_at: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded_at.is_some()
    }
}

/// Partial update restricted to fill-once fields.
///
/// Every field set in the patch must be absent on the stored record, otherwise
/// the whole patch is rejected with [`StorageError::AlreadySet`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub reply: Option<String>,
    pub score: Option<f64>,
    pub embedding: Option<Embedding>,
    pub position: Option<Position>,
    pub cost_usd: Option<f64>,
    pub expanded_at: Option<DateTime<Utc>>,
}

impl NodePatch {
    pub fn expanded_now() -> Self {
        Self {
            expanded_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reply.is_none()
            && self.score.is_none()
            && self.embedding.is_none()
            && self.position.is_none()
            && self.cost_usd.is_none()
            && self.expanded_at.is_none()
    }

    /// Apply to `record` in place, all-or-nothing.
    pub fn apply_to(&self, record: &mut NodeRecord) -> Result<(), StorageError> {
        let id = record.id;
        let conflict = |field: &'static str| StorageError::AlreadySet { id, field };

        if self.reply.is_some() && record.reply.is_some() {
            return Err(conflict("reply"));
        }
        if self.score.is_some() && record.score.is_some() {
            return Err(conflict("score"));
        }
        if self.embedding.is_some() && record.embedding.is_some() {
            return Err(conflict("embedding"));
        }
        if self.position.is_some() && record.position.is_some() {
            return Err(conflict("position"));
        }
        if self.cost_usd.is_some() && record.cost_usd.is_some() {
            return Err(conflict("cost_usd"));
        }
        if self.expanded_at.is_some() && record.expanded_at.is_some() {
            return Err(conflict("expanded_at"));
        }

        if let Some(reply) = &self.reply {
            record.reply = Some(reply.clone());
        }
        if let Some(score) = self.score {
            record.score = Some(score);
        }
        if let Some(embedding) = &self.embedding {
            record.embedding = Some(embedding.clone());
        }
        if let Some(position) = self.position {
            record.position = Some(position);
        }
        if let Some(cost) = self.cost_usd {
            record.cost_usd = Some(cost);
        }
        if let Some(at) = self.expanded_at {
            record.expanded_at = Some(at);
        }
        Ok(())
    }
}

/// Check the tree invariant for a node about to be inserted.
///
/// `parent` is the stored record for `node.parent_id`, if one was found.
pub fn validate_placement(
    node: &NodeRecord,
    parent: Option<&NodeRecord>,
) -> Result<(), StorageError> {
    match (node.parent_id, parent) {
        (None, _) => {
            if node.depth != 0 {
                return Err(StorageError::DepthMismatch {
                    id: node.id,
                    expected: 0,
                    actual: node.depth,
                });
            }
        }
        (Some(parent_id), None) => {
            return Err(StorageError::ParentMissing {
                child: node.id,
                parent: parent_id,
            });
        }
        (Some(_), Some(parent)) => {
            if node.depth != parent.depth + 1 {
                return Err(StorageError::DepthMismatch {
                    id: node.id,
                    expected: parent.depth + 1,
                    actual: node.depth,
                });
            }
        }
    }
    Ok(())
}

/// Node store interface
pub trait NodeStore: Send + Sync {
    /// Insert a new node. Fails with `DuplicateId` if the id exists and with
    /// `ParentMissing` / `DepthMismatch` if the tree invariant would break.
    fn create(&self, node: NodeRecord) -> Result<NodeId, StorageError>;

    fn get(&self, id: &NodeId) -> Result<Option<NodeRecord>, StorageError>;

    /// Direct children of `id`, in no particular order.
    fn get_children(&self, id: &NodeId) -> Result<Vec<NodeRecord>, StorageError>;

    /// Fill absent fields; returns the updated record.
    fn update(&self, id: &NodeId, patch: &NodePatch) -> Result<NodeRecord, StorageError>;

    fn list_all(&self) -> Result<Vec<NodeRecord>, StorageError>;

    fn count(&self) -> Result<usize, StorageError>;

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Like [`NodeStore::get`] but a missing node is an error.
    fn require(&self, id: &NodeId) -> Result<NodeRecord, StorageError> {
        self.get(id)?.ok_or(StorageError::NodeNotFound(*id))
    }

    /// The `k` highest-scoring nodes, best first. Unscored nodes are skipped.
    fn top_scored(&self, k: usize) -> Result<Vec<NodeRecord>, StorageError> {
        let mut scored: Vec<NodeRecord> = self
            .list_all()?
            .into_iter()
            .filter(|n| n.score.is_some())
            .collect();
        scored.sort_by(|a, b| {
            let (sa, sb) = (a.score.unwrap_or(0.0), b.score.unwrap_or(0.0));
            sb.total_cmp(&sa).then(a.created_at.cmp(&b.created_at))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// All depth-0 nodes, oldest first.
    fn roots(&self) -> Result<Vec<NodeRecord>, StorageError> {
        let mut roots: Vec<NodeRecord> = self
            .list_all()?
            .into_iter()
            .filter(NodeRecord::is_root)
            .collect();
        roots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(roots)
    }
}
