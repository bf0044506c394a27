//! Property-based tests for frontier ordering and at-most-one expansion

use canopy::frontier::{Frontier, PushOutcome};
use canopy::types::NodeId;
use proptest::prelude::*;
use std::collections::HashSet;

proptest! {
    /// Entries come out highest priority first; equal priorities keep insertion order.
    #[test]
    fn pop_order_is_priority_then_fifo(
        priorities in prop::collection::vec(0u8..6, 1..80),
        batch in 1usize..10,
    ) {
        let frontier = Frontier::new();
        let entries: Vec<(NodeId, f64)> = priorities
            .iter()
            .map(|p| (NodeId::new(), *p as f64))
            .collect();
        for (id, priority) in &entries {
            prop_assert_eq!(frontier.push(*id, *priority), PushOutcome::Inserted);
        }

        let mut popped = Vec::new();
        loop {
            let next = frontier.pop_batch(batch);
            if next.is_empty() {
                break;
            }
            prop_assert!(next.len() <= batch);
            popped.extend(next);
        }
        prop_assert_eq!(popped.len(), entries.len());

        let position = |id: &NodeId| entries.iter().position(|(e, _)| e == id).unwrap();
        for pair in popped.windows(2) {
            prop_assert!(pair[0].priority >= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                prop_assert!(position(&pair[0].node_id) < position(&pair[1].node_id));
            }
        }
    }

    /// No id is ever handed out twice, whatever pushes and boosts follow.
    #[test]
    fn popped_ids_are_never_readmitted(
        ops in prop::collection::vec((0usize..20, -1.0f64..1.0, any::<bool>()), 1..200),
    ) {
        let frontier = Frontier::new();
        let ids: Vec<NodeId> = (0..20).map(|_| NodeId::new()).collect();
        let mut seen = HashSet::new();

        for (index, priority, pop) in ops {
            let id = ids[index];
            let outcome = frontier.push(id, priority);
            if seen.contains(&id) {
                prop_assert_eq!(outcome, PushOutcome::Retired);
            }
            frontier.boost(&[id], 0.1);
            if pop {
                for entry in frontier.pop_batch(3) {
                    prop_assert!(seen.insert(entry.node_id));
                }
            }
        }
        for entry in frontier.pop_batch(usize::MAX) {
            prop_assert!(seen.insert(entry.node_id));
        }
        prop_assert!(frontier.is_empty());
    }

    /// First write wins: a second push never changes a pending priority.
    #[test]
    fn push_does_not_overwrite(first in -5.0f64..5.0, second in -5.0f64..5.0) {
        let frontier = Frontier::new();
        let id = NodeId::new();
        frontier.push(id, first);
        prop_assert_eq!(frontier.push(id, second), PushOutcome::AlreadyPending);
        prop_assert_eq!(frontier.priority_of(&id), Some(first));
        prop_assert_eq!(frontier.size(), 1);
    }
}
