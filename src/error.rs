//! Error types for the canopy exploration scheduler.

use crate::types::NodeId;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node already exists: {0}")]
    DuplicateId(NodeId),

    #[error("Field '{field}' already set on node {id}")]
    AlreadySet { id: NodeId, field: &'static str },

    #[error("Parent {parent} of node {child} does not exist")]
    ParentMissing { child: NodeId, parent: NodeId },

    #[error("Node {id} has depth {actual}, expected {expected}")]
    DepthMismatch {
        id: NodeId,
        expected: u32,
        actual: u32,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Backend(format!("Failed to (de)serialize node record: {}", err))
    }
}

/// Errors reported by generation capabilities (mutator, persona, critic, moderator, embedder)
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("Capability request failed: {0}")]
    Request(String),

    #[error("Capability request timed out: {0}")]
    Timeout(String),

    #[error("Capability rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Capability authentication failed: {0}")]
    Auth(String),

    #[error("Capability returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Capability not configured: {0}")]
    NotConfigured(String),
}

impl CapabilityError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CapabilityError::Request(_) => true,
            CapabilityError::Timeout(_) => true,
            CapabilityError::RateLimited(_) => true,
            CapabilityError::Auth(_) => false,
            CapabilityError::InvalidResponse(_) => false,
            CapabilityError::NotConfigured(_) => false,
        }
    }
}

/// Exploration-level errors
#[derive(Debug, Error)]
pub enum ExploreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{capability} failed: {source}")]
    Capability {
        capability: &'static str,
        #[source]
        source: CapabilityError,
    },

    #[error("Critic output is not a score in [0,1]: {0}")]
    MalformedScore(String),

    #[error("Store invariant violated: {0}")]
    StoreInvariantViolation(String),

    #[error("Ancestry of node {node} exceeds {limit} steps (cycle or corrupted store)")]
    CycleOrTooDeep { node: NodeId, limit: usize },

    #[error("Budget exhausted: spent ${spent:.4} of ${limit:.4}")]
    BudgetExhausted { spent: f64, limit: f64 },

    #[error("Invalid polygon: {0}")]
    InvalidPolygon(String),

    #[error("No root node exists to anchor the request")]
    NoRoot,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Explorer is shutting down")]
    ShuttingDown,
}

impl ExploreError {
    pub fn capability(capability: &'static str, source: CapabilityError) -> Self {
        ExploreError::Capability { capability, source }
    }
}

impl From<config::ConfigError> for ExploreError {
    fn from(err: config::ConfigError) -> Self {
        ExploreError::ConfigError(err.to_string())
    }
}
