//! Event fan-out
//!
//! Each subscriber gets its own unbounded channel, so a slow consumer never
//! loses events and never blocks the publisher. There is no replay: a new
//! subscriber sees only what is published after it subscribed.

use crate::heartbeat::StatusSnapshot;
use crate::store::NodeRecord;
use crate::types::{NodeId, Position};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Graph-visible fields of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphUpdate {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub depth: u32,
    pub position: Option<Position>,
    pub score: Option<f64>,
}

impl From<&NodeRecord> for GraphUpdate {
    fn from(node: &NodeRecord) -> Self {
        Self {
            id: node.id,
            parent_id: node.parent_id,
            depth: node.depth,
            position: node.position,
            score: node.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    NodeCreated(GraphUpdate),
    NodeUpdated(GraphUpdate),
    Heartbeat(StatusSnapshot),
}

impl GraphEvent {
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            GraphEvent::NodeCreated(update) | GraphEvent::NodeUpdated(update) => Some(update.id),
            GraphEvent::Heartbeat(_) => None,
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<GraphEvent>;

#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<GraphEvent>>>,
    published: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber. Never blocks.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: GraphEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        let delivered = subscribers.len();
        debug!(node_id = ?event.node_id(), delivered, "Event published");
        delivered
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Subscribers currently registered (closed ones are dropped lazily).
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
