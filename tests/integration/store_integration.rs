//! Integration tests for the node stores and restart recovery

use super::support::{approx, engine_with_store, Script};
use canopy::api::ExplorationApi;
use canopy::config::ExplorerConfig;
use canopy::error::{ExploreError, StorageError};
use canopy::explorer::Explorer;
use canopy::frontier::PushOutcome;
use canopy::settings::RunConfiguration;
use canopy::store::{MemoryNodeStore, NodePatch, NodeRecord, NodeStore, SledNodeStore};
use canopy::types::NodeId;
use std::sync::Arc;
use tempfile::TempDir;

fn stores() -> Vec<(&'static str, Arc<dyn NodeStore>, Option<TempDir>)> {
    let dir = TempDir::new().unwrap();
    let sled = SledNodeStore::new(dir.path()).unwrap();
    vec![
        ("memory", Arc::new(MemoryNodeStore::new()), None),
        ("sled", Arc::new(sled), Some(dir)),
    ]
}

#[test]
fn test_tree_invariant_enforced_by_every_store() {
    for (name, store, _dir) in stores() {
        let root = NodeRecord::root("Hello");
        store.create(root.clone()).unwrap();

        let orphan = NodeRecord::child_of(&NodeRecord::root("never stored"), "lost");
        assert!(
            matches!(store.create(orphan.clone()), Err(StorageError::ParentMissing { .. })),
            "{name}: orphan accepted"
        );
        assert!(store.get(&orphan.id).unwrap().is_none(), "{name}: orphan left behind");

        let mut skewed = NodeRecord::child_of(&root, "skewed");
        skewed.depth = 3;
        assert!(
            matches!(store.create(skewed), Err(StorageError::DepthMismatch { .. })),
            "{name}: bad depth accepted"
        );

        assert!(matches!(
            store.create(root.clone()),
            Err(StorageError::DuplicateId(_))
        ));
        assert_eq!(store.count().unwrap(), 1, "{name}");
    }
}

#[test]
fn test_fill_once_fields_in_every_store() {
    for (name, store, _dir) in stores() {
        let root = NodeRecord::root("Hello");
        let id = store.create(root).unwrap();

        store.update(&id, &NodePatch::expanded_now()).unwrap();
        let second = store.update(&id, &NodePatch::expanded_now());
        assert!(
            matches!(second, Err(StorageError::AlreadySet { field: "expanded_at", .. })),
            "{name}: second expansion mark accepted"
        );

        let patch = NodePatch {
            reply: Some("hi".to_string()),
            score: Some(0.3),
            ..Default::default()
        };
        let updated = store.update(&id, &patch).unwrap();
        assert_eq!(updated.reply.as_deref(), Some("hi"));
        assert!(store.update(&id, &patch).is_err());
        assert_eq!(store.require(&id).unwrap().score, Some(0.3));
    }
}

#[test]
fn test_top_scored_and_roots() {
    for (name, store, _dir) in stores() {
        let root = NodeRecord::root("Hello");
        store.create(root.clone()).unwrap();
        for score in [0.2, 0.9, 0.5] {
            let mut child = NodeRecord::child_of(&root, format!("score {score}"));
            child.score = Some(score);
            store.create(child).unwrap();
        }
        let top: Vec<f64> = store
            .top_scored(2)
            .unwrap()
            .into_iter()
            .filter_map(|n| n.score)
            .collect();
        assert_eq!(top, vec![0.9, 0.5], "{name}");
        let roots = store.roots().unwrap();
        assert_eq!(roots.len(), 1, "{name}");
        assert_eq!(roots[0].id, root.id);
    }
}

#[tokio::test]
async fn test_recover_after_restart() {
    let dir = TempDir::new().unwrap();
    let root_id: NodeId;
    let spent_before: f64;
    {
        let store: Arc<dyn NodeStore> = Arc::new(SledNodeStore::new(dir.path()).unwrap());
        let (_script, caps) = Script::new(&[("a", 0.5), ("b", 0.6), ("c", 0.4)]).into_capabilities();
        let engine = engine_with_store(store, caps, RunConfiguration::default());
        root_id = ExplorationApi::new(engine.clone()).seed("Hello").await.unwrap();
        Explorer::new(engine.clone(), ExplorerConfig::default())
            .run_cycle()
            .await;
        engine.store().flush().unwrap();
        spent_before = engine.ledger().spent();
    }

    let store: Arc<dyn NodeStore> = Arc::new(SledNodeStore::new(dir.path()).unwrap());
    assert_eq!(store.count().unwrap(), 4);
    let (_script, caps) = Script::new(&[]).into_capabilities();
    let engine = engine_with_store(store, caps, RunConfiguration::default());
    let api = ExplorationApi::new(engine.clone());

    assert_eq!(api.recover().unwrap(), 3);
    assert!(approx(engine.ledger().spent(), spent_before));
    assert_eq!(engine.frontier().size(), 3);
    assert_eq!(engine.frontier().push(root_id, 5.0), PushOutcome::Retired);

    for child in engine.store().get_children(&root_id).unwrap() {
        assert!(approx(
            engine.frontier().priority_of(&child.id).unwrap(),
            child.priority.unwrap()
        ));
    }
}

#[test]
fn test_corrupted_ancestry_fails_fast() {
    let store = MemoryNodeStore::new();
    let root = NodeRecord::root("Hello");
    store.create(root.clone()).unwrap();
    let mut parent = root;
    let mut last = parent.id;
    for i in 0..10 {
        let child = NodeRecord::child_of(&parent, format!("turn {i}"));
        last = store.create(child.clone()).unwrap();
        parent = child;
    }

    let shallow = canopy::conversation::ConversationReconstructor::new(&store, 4);
    assert!(matches!(
        shallow.reconstruct(&last),
        Err(ExploreError::CycleOrTooDeep { limit: 4, .. })
    ));
    let deep = canopy::conversation::ConversationReconstructor::new(&store, 64);
    assert_eq!(deep.reconstruct(&last).unwrap().len(), 11);
}
