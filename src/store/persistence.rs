//! Persistence layer for the node store

use crate::error::StorageError;
use crate::store::{validate_placement, NodePatch, NodeRecord, NodeStore};
use crate::types::NodeId;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use tracing::debug;

const NODES_TREE: &str = "nodes";
const CHILDREN_TREE: &str = "children";

/// Sled-based implementation of [`NodeStore`]
///
/// Records live in the `nodes` tree keyed by the 16 id bytes. The `children`
/// tree indexes parent/child pairs with a 32-byte key (parent ++ child) and an
/// empty value, so children are a prefix scan away.
pub struct SledNodeStore {
    db: sled::Db,
    nodes: sled::Tree,
    children: sled::Tree,
}

impl SledNodeStore {
    /// Open (or create) a store at the given directory
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to open sled database: {}", e),
            ))
        })?;
        Self::from_db(db)
    }

    /// A store that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let nodes = db.open_tree(NODES_TREE)?;
        let children = db.open_tree(CHILDREN_TREE)?;
        Ok(Self {
            db,
            nodes,
            children,
        })
    }

    /// Get the underlying sled database (for advanced operations)
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn contains(&self, id: &NodeId) -> Result<bool, StorageError> {
        Ok(self.nodes.contains_key(id.as_bytes())?)
    }

    fn child_key(parent: &NodeId, child: &NodeId) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(parent.as_bytes());
        key[16..].copy_from_slice(child.as_bytes());
        key
    }

    fn decode(bytes: &[u8]) -> Result<NodeRecord, StorageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn abort<E: Into<StorageError>>(err: E) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err.into())
}

impl NodeStore for SledNodeStore {
    fn create(&self, node: NodeRecord) -> Result<NodeId, StorageError> {
        let id = node.id;
        let value = bincode::serialize(&node)?;
        let child_key = node.parent_id.map(|parent| Self::child_key(&parent, &id));

        // Existence, parent check and both inserts commit together.
        let result = (&self.nodes, &self.children).transaction(|(nodes, children)| {
            if nodes.get(id.as_bytes())?.is_some() {
                return Err(abort(StorageError::DuplicateId(id)));
            }
            let parent = match node.parent_id {
                Some(parent_id) => match nodes.get(parent_id.as_bytes())? {
                    Some(bytes) => Some(Self::decode(&bytes).map_err(abort)?),
                    None => None,
                },
                None => None,
            };
            validate_placement(&node, parent.as_ref()).map_err(abort)?;

            nodes.insert(&id.as_bytes()[..], value.clone())?;
            if let Some(key) = child_key {
                children.insert(&key[..], &[] as &[u8])?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!(node_id = %id, depth = node.depth, "Node record created");
                Ok(id)
            }
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn get(&self, id: &NodeId) -> Result<Option<NodeRecord>, StorageError> {
        match self.nodes.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_children(&self, id: &NodeId) -> Result<Vec<NodeRecord>, StorageError> {
        let mut records = Vec::new();
        for item in self.children.scan_prefix(id.as_bytes()) {
            let (key, _) = item?;
            if key.len() != 32 {
                continue;
            }
            let mut child = [0u8; 16];
            child.copy_from_slice(&key[16..]);
            let child_id = NodeId::from_bytes(child);
            if let Some(record) = self.get(&child_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn update(&self, id: &NodeId, patch: &NodePatch) -> Result<NodeRecord, StorageError> {
        loop {
            let current = self
                .nodes
                .get(id.as_bytes())?
                .ok_or(StorageError::NodeNotFound(*id))?;
            let mut record = Self::decode(&current)?;
            patch.apply_to(&mut record)?;
            let encoded = bincode::serialize(&record)?;

            match self
                .nodes
                .compare_and_swap(id.as_bytes(), Some(&current), Some(encoded))?
            {
                Ok(()) => return Ok(record),
                // Another writer got in between; re-read so fill-once is checked again.
                Err(_) => continue,
            }
        }
    }

    fn list_all(&self) -> Result<Vec<NodeRecord>, StorageError> {
        let mut records = Vec::new();
        for item in self.nodes.iter() {
            let (_, value) = item?;
            records.push(Self::decode(&value)?);
        }
        Ok(records)
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(self.nodes.len())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to flush database: {}", e),
            ))
        })?;
        Ok(())
    }
}
