//! Integration tests for the exploration worker pipeline

use super::support::{
    approx, drain, engine, Script, CRITIC_COST, EMBED_COST, MUTATE_COST, REPLY_COST,
};
use canopy::api::ExplorationApi;
use canopy::config::ExplorerConfig;
use canopy::conversation::Role;
use canopy::events::GraphEvent;
use canopy::explorer::{CycleOutcome, Explorer, WorkerPhase};
use canopy::frontier::PushOutcome;
use canopy::heartbeat::Heartbeat;
use canopy::settings::SettingsUpdate;
use canopy::store::NodeStore;
use canopy::types::{NodeId, TokenUsage};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn expanded(outcome: CycleOutcome) -> canopy::explorer::BatchReport {
    match outcome {
        CycleOutcome::Expanded(report) => report,
        other => panic!("expected an expanded batch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_seed_and_expand_commits_three_children() {
    let (script, caps) = Script::new(&[("a", 0.5), ("b", 0.6), ("c", 0.4)]).into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());

    let root = api.seed("Hello").await.unwrap();
    let root_record = engine.store().require(&root).unwrap();
    assert_eq!(root_record.depth, 0);
    assert!(root_record.score.is_none());
    assert!(root_record.position.is_some());

    let mut events = api.subscribe();
    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    let report = expanded(explorer.run_cycle().await);
    assert_eq!(report.popped, 1);
    assert_eq!(report.children, 3);
    assert_eq!(report.blocked, 0);
    assert_eq!(report.failed, 0);

    let children = engine.store().get_children(&root).unwrap();
    assert_eq!(children.len(), 3);
    let mut scores: Vec<f64> = children.iter().filter_map(|c| c.score).collect();
    scores.sort_by(f64::total_cmp);
    assert_eq!(scores, vec![0.4, 0.5, 0.6]);
    for child in &children {
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id, Some(root));
        assert_eq!(child.reply.as_deref(), Some(format!("reply to {}", child.prompt).as_str()));
        assert!(child.embedding.is_some());
        assert!(child.position.is_some());
        assert!(engine.frontier().contains(&child.id));
    }
    assert_eq!(engine.frontier().size(), 3);

    let created: Vec<NodeId> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            GraphEvent::NodeCreated(update) => Some(update.id),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 3);
    for child in &children {
        assert!(created.contains(&child.id));
    }

    assert_eq!(script.calls.mutate.load(Ordering::SeqCst), 1);
    // One reply for the root's own prompt, one per candidate
    assert_eq!(script.calls.reply.load(Ordering::SeqCst), 4);
    assert_eq!(script.calls.criticize.load(Ordering::SeqCst), 3);

    let root_record = engine.store().require(&root).unwrap();
    assert!(root_record.is_expanded());
    assert_eq!(root_record.reply.as_deref(), Some("reply to Hello"));
    assert_eq!(engine.frontier().push(root, 9.0), PushOutcome::Retired);
}

#[tokio::test]
async fn test_child_priority_follows_formula() {
    let (_script, caps) = Script::new(&[("b", 0.6)]).into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    let root = api.seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    expanded(explorer.run_cycle().await);

    // Root is unscored, so trend is zero; no scored nodes yet, so no
    // similarity penalty. 0.6 - 0.05 * 1
    let child = &engine.store().get_children(&root).unwrap()[0];
    assert!(approx(child.priority.unwrap(), 0.55));
    assert!(approx(engine.frontier().priority_of(&child.id).unwrap(), 0.55));
}

#[tokio::test]
async fn test_cost_attributed_per_call() {
    let (_script, caps) = Script::new(&[("a", 0.5), ("b", 0.6), ("c", 0.4)]).into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    let root = api.seed("Hello").await.unwrap();
    assert!(approx(engine.ledger().spent(), EMBED_COST));

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    expanded(explorer.run_cycle().await);

    let expected =
        EMBED_COST + REPLY_COST + MUTATE_COST + 3.0 * (REPLY_COST + CRITIC_COST + EMBED_COST);
    assert!(approx(engine.ledger().spent(), expected));

    // The mutator call and the root's answer are split across the children
    let mut attributed = engine.store().require(&root).unwrap().cost_usd.unwrap();
    for child in engine.store().get_children(&root).unwrap() {
        let cost = child.cost_usd.unwrap();
        let share = (MUTATE_COST + REPLY_COST) / 3.0;
        assert!(approx(cost, share + REPLY_COST + CRITIC_COST + EMBED_COST));
        assert_eq!(child.usage, TokenUsage::new(13 + 10 + 20 + 4, 11 + 5 + 2));
        attributed += cost;
    }
    assert!(approx(attributed, engine.ledger().spent()));
}

#[tokio::test]
async fn test_blocked_candidate_short_circuits() {
    let (script, caps) = Script::new(&[("fine", 0.7), ("rude", 0.9)])
        .block("rude")
        .into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    let root = api.seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    let report = expanded(explorer.run_cycle().await);
    assert_eq!(report.children, 1);
    assert_eq!(report.blocked, 1);

    assert_eq!(script.calls.moderate.load(Ordering::SeqCst), 2);
    assert_eq!(script.calls.reply.load(Ordering::SeqCst), 2);
    assert_eq!(script.calls.criticize.load(Ordering::SeqCst), 1);

    let children = engine.store().get_children(&root).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].prompt, "fine");

    let expected = EMBED_COST + REPLY_COST + MUTATE_COST + REPLY_COST + CRITIC_COST + EMBED_COST;
    assert!(approx(engine.ledger().spent(), expected));
    assert_eq!(engine.stats().snapshot().blocked, 1);
}

#[tokio::test]
async fn test_moderation_outage_fails_open() {
    let mut script = Script::new(&[("a", 0.5), ("b", 0.6)]);
    script.moderator_fails = true;
    let (_script, caps) = script.into_capabilities();
    let engine = engine(caps);
    ExplorationApi::new(engine.clone()).seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    let report = expanded(explorer.run_cycle().await);
    assert_eq!(report.children, 2);
    assert_eq!(report.blocked, 0);
}

#[tokio::test]
async fn test_budget_gate_leaves_frontier_untouched() {
    let (script, caps) = Script::new(&[("a", 0.5)]).into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    let root = api.seed("Hello").await.unwrap();

    api.update_settings(&SettingsUpdate {
        budget_limit_usd: Some(0.5),
        ..Default::default()
    })
    .unwrap();
    engine.ledger().charge(0.5, TokenUsage::default());

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    match explorer.run_cycle().await {
        CycleOutcome::BudgetExhausted { spent, limit } => {
            assert!(spent >= limit);
        }
        other => panic!("expected budget exhaustion, got {:?}", other),
    }
    assert!(engine.frontier().contains(&root));
    assert_eq!(engine.frontier().size(), 1);
    assert_eq!(script.calls.mutate.load(Ordering::SeqCst), 0);
    assert_eq!(engine.stats().phase(), WorkerPhase::BackingOff);

    // Raising the limit resumes expansion without a restart
    api.update_settings(&SettingsUpdate {
        budget_limit_usd: Some(2.0),
        ..Default::default()
    })
    .unwrap();
    let report = expanded(explorer.run_cycle().await);
    assert_eq!(report.children, 1);
    assert!(!engine.frontier().contains(&root));
}

#[tokio::test]
async fn test_candidate_failures_are_isolated() {
    let (script, caps) = Script::new(&[("good", 0.8), ("silent", 0.6), ("garbled", 0.4)])
        .fail_persona("silent")
        .garble("garbled")
        .into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    let root = api.seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    let report = expanded(explorer.run_cycle().await);
    assert_eq!(report.children, 1);
    assert_eq!(report.failed, 2);

    let children = engine.store().get_children(&root).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].prompt, "good");

    // The garbled candidate still paid for its persona and critic calls
    assert_eq!(script.calls.criticize.load(Ordering::SeqCst), 2);
    let expected = EMBED_COST
        + REPLY_COST
        + MUTATE_COST
        + (REPLY_COST + CRITIC_COST + EMBED_COST)
        + (REPLY_COST + CRITIC_COST);
    assert!(approx(engine.ledger().spent(), expected));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let (script, caps) = Script::new(&[("slow", 0.5)])
        .flaky_persona("slow", 2)
        .into_capabilities();
    let engine = engine(caps);
    ExplorationApi::new(engine.clone()).seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    let report = expanded(explorer.run_cycle().await);
    assert_eq!(report.children, 1);
    // Root answer plus two failed attempts and one success
    assert_eq!(script.calls.reply.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_failed_mutator_leaves_node_expanded() {
    let mut script = Script::new(&[("a", 0.5)]);
    script.mutator_fails = true;
    let (_script, caps) = script.into_capabilities();
    let engine = engine(caps);
    let root = ExplorationApi::new(engine.clone()).seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    let report = expanded(explorer.run_cycle().await);
    assert_eq!(report.popped, 1);
    assert_eq!(report.children, 0);

    assert!(engine.store().require(&root).unwrap().is_expanded());
    assert!(engine.frontier().is_empty());
    assert!(matches!(explorer.run_cycle().await, CycleOutcome::Empty));
}

#[tokio::test]
async fn test_concurrent_cycles_expand_each_node_once() {
    let (script, caps) = Script::new(&[("a", 0.5), ("b", 0.6)]).into_capabilities();
    let engine = engine(caps);
    ExplorationApi::new(engine.clone()).seed("Hello").await.unwrap();

    let first = Explorer::new(engine.clone(), ExplorerConfig::default());
    let second = Explorer::new(engine.clone(), ExplorerConfig::default());
    let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());

    let popped = [a, b]
        .into_iter()
        .map(|outcome| match outcome {
            CycleOutcome::Expanded(report) => report.popped,
            _ => 0,
        })
        .sum::<usize>();
    assert_eq!(popped, 1);
    assert_eq!(script.calls.mutate.load(Ordering::SeqCst), 1);
    assert_eq!(engine.store().count().unwrap(), 3);
}

#[tokio::test]
async fn test_grandchild_conversation_is_root_first() {
    let (_script, caps) = Script::new(&[("next", 0.7)]).into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    let root = api.seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    expanded(explorer.run_cycle().await);
    expanded(explorer.run_cycle().await);

    let child = engine.store().get_children(&root).unwrap().remove(0);
    let grandchild = engine.store().get_children(&child.id).unwrap().remove(0);
    assert_eq!(grandchild.depth, 2);

    let view = api.conversation(&grandchild.id).unwrap();
    let texts: Vec<&str> = view.turns.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["Hello", "reply to Hello", "next", "reply to next", "next", "reply to next"]
    );
    assert_eq!(view.depth, 2);
    assert_eq!(view.score, Some(0.7));
}

#[tokio::test]
async fn test_worker_grown_dialogues_alternate_roles() {
    let (script, caps) = Script::new(&[("a", 0.5), ("b", 0.6)]).into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    let root = api.seed("Hello").await.unwrap();

    let explorer = Explorer::new(engine.clone(), ExplorerConfig::default());
    expanded(explorer.run_cycle().await);
    expanded(explorer.run_cycle().await);

    let nodes = engine.store().list_all().unwrap();
    assert!(nodes.iter().any(|n| n.depth == 2));
    for node in nodes {
        let view = api.conversation(&node.id).unwrap();
        let roles: Vec<Role> = view.turns.iter().map(|t| t.role).collect();
        assert_eq!(roles.first(), Some(&Role::Human), "{:?}", roles);
        for pair in roles.windows(2) {
            assert_ne!(pair[0], pair[1], "roles repeat for {}: {:?}", node.id, roles);
        }
    }

    // The root is answered exactly once, even after later cycles
    assert_eq!(
        engine.store().require(&root).unwrap().reply.as_deref(),
        Some("reply to Hello")
    );
    assert_eq!(script.calls.reply.load(Ordering::SeqCst), 1 + 2 + 2 * 2);
}

#[tokio::test]
async fn test_heartbeat_reports_without_writing() {
    let (_script, caps) = Script::new(&[("a", 0.5)]).into_capabilities();
    let engine = engine(caps);
    let api = ExplorationApi::new(engine.clone());
    api.seed("Hello").await.unwrap();
    let mut events = api.subscribe();

    let mut heartbeat = Heartbeat::new(engine.clone(), Duration::from_secs(60));
    let snapshot = heartbeat.tick().unwrap();
    assert_eq!(snapshot.node_count, 1);
    assert_eq!(snapshot.frontier_size, 1);
    assert!(approx(snapshot.spent_usd, EMBED_COST));
    assert_eq!(snapshot.velocity_per_sec, 0.0);

    let received = drain(&mut events);
    assert!(matches!(received.as_slice(), [GraphEvent::Heartbeat(_)]));
    assert_eq!(engine.store().count().unwrap(), 1);
    assert_eq!(engine.frontier().size(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_explorer_runs_until_stopped() {
    let (_script, caps) = Script::new(&[("a", 0.5), ("b", 0.6), ("c", 0.4)]).into_capabilities();
    let engine = engine(caps);
    ExplorationApi::new(engine.clone()).seed("Hello").await.unwrap();

    let config = ExplorerConfig {
        idle_poll_ms: 10,
        heartbeat_interval_ms: 20,
        shutdown_grace_ms: 200,
        ..Default::default()
    };
    let explorer = Explorer::new(engine.clone(), config);
    explorer.start();
    assert!(explorer.is_running());

    let grown = tokio::time::timeout(Duration::from_secs(10), async {
        while engine.store().count().unwrap() < 13 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(grown.is_ok(), "explorer did not grow the tree in time");

    explorer.stop().await;
    assert!(!explorer.is_running());
    assert_eq!(engine.stats().phase(), WorkerPhase::Stopped);

    for node in engine.store().list_all().unwrap() {
        if let Some(parent_id) = node.parent_id {
            let parent = engine.store().require(&parent_id).unwrap();
            assert_eq!(node.depth, parent.depth + 1);
        } else {
            assert_eq!(node.depth, 0);
        }
    }
}
