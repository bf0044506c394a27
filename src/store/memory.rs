//! In-process node store, used for ephemeral runs and tests.

use crate::error::StorageError;
use crate::store::{validate_placement, NodePatch, NodeRecord, NodeStore};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, NodeRecord>,
    children: HashMap<NodeId, Vec<NodeId>>,
}

/// `HashMap`-backed implementation of [`NodeStore`].
#[derive(Default)]
pub struct MemoryNodeStore {
    inner: RwLock<Inner>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for MemoryNodeStore {
    fn create(&self, node: NodeRecord) -> Result<NodeId, StorageError> {
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(&node.id) {
            return Err(StorageError::DuplicateId(node.id));
        }
        let parent = node.parent_id.and_then(|p| inner.nodes.get(&p));
        validate_placement(&node, parent)?;

        let id = node.id;
        if let Some(parent_id) = node.parent_id {
            inner.children.entry(parent_id).or_default().push(id);
        }
        inner.nodes.insert(id, node);
        Ok(id)
    }

    fn get(&self, id: &NodeId) -> Result<Option<NodeRecord>, StorageError> {
        Ok(self.inner.read().nodes.get(id).cloned())
    }

    fn get_children(&self, id: &NodeId) -> Result<Vec<NodeRecord>, StorageError> {
        let inner = self.inner.read();
        Ok(inner
            .children
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|child| inner.nodes.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn update(&self, id: &NodeId, patch: &NodePatch) -> Result<NodeRecord, StorageError> {
        let mut inner = self.inner.write();
        let record = inner
            .nodes
            .get_mut(id)
            .ok_or(StorageError::NodeNotFound(*id))?;
        patch.apply_to(record)?;
        Ok(record.clone())
    }

    fn list_all(&self) -> Result<Vec<NodeRecord>, StorageError> {
        Ok(self.inner.read().nodes.values().cloned().collect())
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(self.inner.read().nodes.len())
    }
}
