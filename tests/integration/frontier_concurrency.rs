//! Concurrency tests for the frontier

use canopy::frontier::{Frontier, PushOutcome};
use canopy::types::NodeId;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_concurrent_pops_never_share_entries() {
    let frontier = Arc::new(Frontier::new());
    let ids: Vec<NodeId> = (0..2_000).map(|_| NodeId::new()).collect();
    for (i, id) in ids.iter().enumerate() {
        frontier.push(*id, (i % 17) as f64);
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let frontier = frontier.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let batch = frontier.pop_batch(7);
                    if batch.is_empty() {
                        break;
                    }
                    seen.extend(batch.into_iter().map(|e| e.node_id));
                }
                seen
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let unique: HashSet<NodeId> = all.iter().copied().collect();
    assert_eq!(all.len(), ids.len());
    assert_eq!(unique.len(), ids.len());
    assert!(frontier.is_empty());
}

#[test]
fn test_boost_racing_pop_never_readmits() {
    let frontier = Arc::new(Frontier::new());
    let ids: Vec<NodeId> = (0..500).map(|_| NodeId::new()).collect();
    for id in &ids {
        frontier.push(*id, 0.5);
    }

    let booster = {
        let frontier = frontier.clone();
        let ids = ids.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                frontier.boost(&ids, 0.01);
                for id in &ids {
                    frontier.push(*id, 10.0);
                }
            }
        })
    };
    let popper = {
        let frontier = frontier.clone();
        thread::spawn(move || {
            let mut popped = Vec::new();
            while popped.len() < 500 {
                popped.extend(frontier.pop_batch(10).into_iter().map(|e| e.node_id));
            }
            popped
        })
    };

    booster.join().unwrap();
    let popped = popper.join().unwrap();
    let unique: HashSet<NodeId> = popped.iter().copied().collect();
    assert_eq!(unique.len(), popped.len());
    assert!(frontier.is_empty());
    for id in &ids {
        assert_eq!(frontier.push(*id, 1.0), PushOutcome::Retired);
    }
}
