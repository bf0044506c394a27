//! Frontier
//!
//! Priority-ordered set of nodes waiting to be expanded. Higher priority pops
//! first; equal priorities pop in insertion order. Every operation takes a
//! single lock, so concurrent `pop_batch` callers never see the same entry.
//!
//! A node id that has been popped is retired: later pushes for it are ignored,
//! which gives at-most-one expansion per node.

use crate::types::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A pending expansion opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub node_id: NodeId,
    /// Higher = more urgent
    pub priority: f64,
    pub inserted_at: DateTime<Utc>,
    /// Insertion sequence, breaks priority ties FIFO
    seq: u64,
}

impl FrontierEntry {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierEntry {}

impl Ord for FrontierEntry {
    /// Order by priority (higher is Greater), then by insertion (older is Greater).
    /// The set pops its greatest element first.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.total_cmp(&other.priority) {
            Ordering::Equal => self.seq.cmp(&other.seq).reverse(),
            ordering => ordering,
        }
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of [`Frontier::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    /// An entry already exists; its priority is left untouched.
    AlreadyPending,
    /// The node was popped earlier and cannot be admitted again.
    Retired,
}

#[derive(Default)]
struct Inner {
    ordered: BTreeSet<FrontierEntry>,
    index: HashMap<NodeId, FrontierEntry>,
    retired: HashSet<NodeId>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, node_id: &NodeId) -> Option<FrontierEntry> {
        let entry = self.index.remove(node_id)?;
        self.ordered.remove(&entry);
        Some(entry)
    }
}

/// Shared pending-expansion set
///
/// Every popped or retired id is remembered for the life of the frontier so it
/// can never be re-admitted. That set grows with the tree: one id per expanded
/// node, never more than the store's node count.
#[derive(Default)]
pub struct Frontier {
    inner: Mutex<Inner>,
    /// Wakes a waiting worker when entries arrive
    notify: Notify,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry unless one already exists for `node_id` (first write wins)
    /// or the node was already popped.
    pub fn push(&self, node_id: NodeId, priority: f64) -> PushOutcome {
        let priority = if priority.is_finite() {
            priority
        } else {
            warn!(node_id = %node_id, priority, "Non-finite priority admitted as -inf");
            f64::NEG_INFINITY
        };

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.retired.contains(&node_id) {
                PushOutcome::Retired
            } else if inner.index.contains_key(&node_id) {
                PushOutcome::AlreadyPending
            } else {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let entry = FrontierEntry {
                    node_id,
                    priority,
                    inserted_at: Utc::now(),
                    seq,
                };
                inner.ordered.insert(entry.clone());
                inner.index.insert(node_id, entry);
                PushOutcome::Inserted
            }
        };

        match outcome {
            PushOutcome::Inserted => self.notify.notify_one(),
            other => debug!(node_id = %node_id, outcome = ?other, "Frontier push ignored"),
        }
        outcome
    }

    /// Remove and return up to `max_count` highest-priority entries.
    pub fn pop_batch(&self, max_count: usize) -> Vec<FrontierEntry> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::with_capacity(max_count.min(inner.ordered.len()));
        while batch.len() < max_count {
            let Some(entry) = inner.ordered.pop_last() else {
                break;
            };
            inner.index.remove(&entry.node_id);
            inner.retired.insert(entry.node_id);
            batch.push(entry);
        }
        batch
    }

    /// Raise the priority of pending entries by `delta`. Ids without a pending
    /// entry (expanded, in flight, or unknown) are skipped. Returns how many
    /// entries were boosted.
    pub fn boost(&self, node_ids: &[NodeId], delta: f64) -> usize {
        let mut inner = self.inner.lock();
        let mut boosted = 0;
        for node_id in node_ids {
            if let Some(mut entry) = inner.remove(node_id) {
                entry.priority += delta;
                inner.ordered.insert(entry.clone());
                inner.index.insert(*node_id, entry);
                boosted += 1;
            }
        }
        boosted
    }

    /// Mark nodes as already expanded without them ever being pending.
    pub fn retire<I: IntoIterator<Item = NodeId>>(&self, node_ids: I) {
        let mut inner = self.inner.lock();
        for node_id in node_ids {
            inner.remove(&node_id);
            inner.retired.insert(node_id);
        }
    }

    /// Re-admit entries after a restart. Returns how many were inserted.
    pub fn recover<I: IntoIterator<Item = (NodeId, f64)>>(&self, entries: I) -> usize {
        entries
            .into_iter()
            .filter(|(node_id, priority)| self.push(*node_id, *priority) == PushOutcome::Inserted)
            .count()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.inner.lock().index.contains_key(node_id)
    }

    pub fn priority_of(&self, node_id: &NodeId) -> Option<f64> {
        self.inner.lock().index.get(node_id).map(|e| e.priority)
    }

    pub fn is_retired(&self, node_id: &NodeId) -> bool {
        self.inner.lock().retired.contains(node_id)
    }

    /// Pending entries in pop order.
    pub fn snapshot(&self) -> Vec<FrontierEntry> {
        self.inner.lock().ordered.iter().rev().cloned().collect()
    }

    /// Resolve when an entry has been pushed since the last call.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}
