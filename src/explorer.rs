//! Exploration Worker
//!
//! Best-first expansion loop. Each cycle checks the budget, pops a batch from
//! the frontier and expands every popped node in its own task:
//!
//! ```text
//! Idle -> CheckingBudget -> Popping -> Expanding -> Committing -> Idle
//!              \-> BackingOff -> CheckingBudget
//! ```
//!
//! A popped node that has no reply yet is answered by the persona first, so
//! every reconstructed dialogue alternates human and agent turns.
//!
//! Candidates are independent. A failing candidate is logged and dropped and
//! never takes its siblings or the batch down with it.

use crate::capability::{CriticVerdict, Verdict};
use crate::config::ExplorerConfig;
use crate::conversation::Turn;
use crate::engine::Engine;
use crate::events::{GraphEvent, GraphUpdate};
use crate::error::{ExploreError, StorageError};
use crate::frontier::FrontierEntry;
use crate::guard::{check_admission, check_moderation, Admission};
use crate::heartbeat::Heartbeat;
use crate::priority::{compute_priority, max_similarity, PriorityInputs};
use crate::settings::RunConfiguration;
use crate::store::{NodePatch, NodeRecord};
use crate::types::{Embedding, NodeId, TokenUsage};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    CheckingBudget,
    Popping,
    Expanding,
    Committing,
    BackingOff,
    Stopped,
}

impl WorkerPhase {
    fn to_u8(self) -> u8 {
        match self {
            WorkerPhase::Idle => 0,
            WorkerPhase::CheckingBudget => 1,
            WorkerPhase::Popping => 2,
            WorkerPhase::Expanding => 3,
            WorkerPhase::Committing => 4,
            WorkerPhase::BackingOff => 5,
            WorkerPhase::Stopped => 6,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerPhase::CheckingBudget,
            2 => WorkerPhase::Popping,
            3 => WorkerPhase::Expanding,
            4 => WorkerPhase::Committing,
            5 => WorkerPhase::BackingOff,
            6 => WorkerPhase::Stopped,
            _ => WorkerPhase::Idle,
        }
    }
}

/// Worker counters, shared with status readers.
#[derive(Debug, Default)]
pub struct WorkerStats {
    phase: AtomicU8,
    batches: AtomicU64,
    expanded: AtomicU64,
    children: AtomicU64,
    blocked: AtomicU64,
    failed: AtomicU64,
    backoffs: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub batches: u64,
    pub expanded: u64,
    pub children: u64,
    pub blocked: u64,
    pub failed: u64,
    pub backoffs: u64,
}

impl WorkerStats {
    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }

    fn record(&self, report: &BatchReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.expanded
            .fetch_add(report.expanded as u64, Ordering::Relaxed);
        self.children
            .fetch_add(report.children as u64, Ordering::Relaxed);
        self.blocked
            .fetch_add(report.blocked as u64, Ordering::Relaxed);
        self.failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            expanded: self.expanded.load(Ordering::Relaxed),
            children: self.children.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            backoffs: self.backoffs.load(Ordering::Relaxed),
        }
    }
}

/// Tally of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub popped: usize,
    /// Nodes whose expansion ran (mutator reached)
    pub expanded: usize,
    pub children: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl BatchReport {
    fn absorb(&mut self, expansion: &ExpansionReport) {
        self.expanded += usize::from(expansion.ran);
        self.children += expansion.children.len();
        self.blocked += expansion.blocked;
        self.failed += expansion.failed;
    }
}

/// Result of one scheduler cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Budget gate closed; the frontier was not touched.
    BudgetExhausted { spent: f64, limit: f64 },
    /// Nothing pending.
    Empty,
    Expanded(BatchReport),
    /// Stop was requested while the batch ran.
    Interrupted(BatchReport),
}

/// What happened to one popped node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpansionReport {
    pub node_id: Option<NodeId>,
    pub ran: bool,
    pub children: Vec<NodeId>,
    pub blocked: usize,
    pub failed: usize,
}

enum CandidateOutcome {
    Committed(NodeId),
    Blocked,
    Failed,
}

/// Per-entry inputs shared by all candidates of one expansion.
struct ExpansionContext {
    parent: NodeRecord,
    context: Vec<Turn>,
    reference: Vec<Embedding>,
    config: RunConfiguration,
    /// Mutator cost, plus the cost of answering the parent, attributed to
    /// each candidate
    mutator_share: f64,
    mutator_usage_share: TokenUsage,
}

/// The background expansion worker.
#[derive(Clone)]
pub struct Explorer {
    engine: Engine,
    config: ExplorerConfig,
    shutdown: Arc<watch::Sender<bool>>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Explorer {
    pub fn new(engine: Engine, config: ExplorerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            config,
            shutdown: Arc::new(shutdown),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Spawn the expansion loop and the heartbeat.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("Explorer already running");
            return;
        }
        self.shutdown.send_replace(false);

        let worker = self.clone();
        handles.push(tokio::spawn(async move { worker.run().await }));

        let heartbeat = Heartbeat::new(self.engine.clone(), self.config.heartbeat_interval());
        handles.push(heartbeat.spawn(self.shutdown.subscribe()));

        info!(
            batch_size = self.engine.settings().snapshot().batch_size,
            heartbeat_ms = self.config.heartbeat_interval_ms,
            "Explorer started"
        );
    }

    /// Request shutdown and wait for the loop and heartbeat to exit. In-flight
    /// pipelines get the configured grace period before they are abandoned.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!(error = %err, "Explorer task panicked");
                }
            }
        }
        self.engine.stats().set_phase(WorkerPhase::Stopped);
        if let Err(err) = self.engine.store().flush() {
            warn!(error = %err, "Failed to flush store on shutdown");
        }
        info!("Explorer stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        while !self.stopping() {
            match self.run_cycle().await {
                CycleOutcome::BudgetExhausted { spent, limit } => {
                    self.engine.stats().backoffs.fetch_add(1, Ordering::Relaxed);
                    info!(
                        spent_usd = spent,
                        limit_usd = limit,
                        backoff_ms = self.config.budget_backoff_ms,
                        "Budget exhausted, backing off"
                    );
                    tokio::select! {
                        _ = sleep(self.config.budget_backoff()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                CycleOutcome::Empty => {
                    tokio::select! {
                        _ = self.engine.frontier().wait_for_work() => {}
                        _ = sleep(self.config.idle_poll()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                CycleOutcome::Expanded(_) => {}
                CycleOutcome::Interrupted(_) => break,
            }
        }
        debug!("Explorer loop exited");
    }

    /// One scheduler cycle: budget check, pop, expand, commit.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let stats = self.engine.stats();

        stats.set_phase(WorkerPhase::CheckingBudget);
        if let Admission::Exhausted { spent, limit } = check_admission(self.engine.ledger()) {
            stats.set_phase(WorkerPhase::BackingOff);
            return CycleOutcome::BudgetExhausted { spent, limit };
        }

        stats.set_phase(WorkerPhase::Popping);
        let config = self.engine.settings().snapshot();
        let batch = self.engine.frontier().pop_batch(config.batch_size);
        if batch.is_empty() {
            stats.set_phase(WorkerPhase::Idle);
            return CycleOutcome::Empty;
        }

        stats.set_phase(WorkerPhase::Expanding);
        let mut report = BatchReport {
            popped: batch.len(),
            ..Default::default()
        };
        debug!(popped = batch.len(), "Batch popped");

        let mut tasks = JoinSet::new();
        for entry in batch {
            let engine = self.engine.clone();
            let config = config.clone();
            tasks.spawn(async move { expand_entry(&engine, entry, &config).await });
        }

        let interrupted = self.drain(&mut tasks, &mut report).await;

        stats.set_phase(WorkerPhase::Committing);
        if let Err(err) = self.engine.store().flush() {
            warn!(error = %err, "Failed to flush store after batch");
        }
        stats.record(&report);
        stats.set_phase(WorkerPhase::Idle);

        info!(
            popped = report.popped,
            expanded = report.expanded,
            children = report.children,
            blocked = report.blocked,
            failed = report.failed,
            spent_usd = self.engine.ledger().spent(),
            frontier = self.engine.frontier().size(),
            "Batch complete"
        );

        if interrupted {
            CycleOutcome::Interrupted(report)
        } else {
            CycleOutcome::Expanded(report)
        }
    }

    /// Collect task results. If stop is requested, keep collecting for the
    /// grace period and then abort whatever is left. Returns whether stop was
    /// requested.
    async fn drain(
        &self,
        tasks: &mut JoinSet<ExpansionReport>,
        report: &mut BatchReport,
    ) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.stopping() {
                break;
            }
            tokio::select! {
                next = tasks.join_next() => match next {
                    Some(result) => absorb(report, result),
                    None => return false,
                },
                _ = shutdown.changed() => {}
            }
        }

        let grace = self.config.shutdown_grace();
        let finished = timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                absorb(report, result);
            }
        })
        .await;
        if finished.is_err() {
            warn!(
                abandoned = tasks.len(),
                grace_ms = self.config.shutdown_grace_ms,
                "Abandoning in-flight expansions"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        true
    }
}

fn absorb(report: &mut BatchReport, result: Result<ExpansionReport, tokio::task::JoinError>) {
    match result {
        Ok(expansion) => report.absorb(&expansion),
        Err(err) if err.is_cancelled() => {}
        Err(err) => error!(error = %err, "Expansion task panicked"),
    }
}

/// Expand one popped node: mark it, build its context, ask for candidates and
/// run every candidate pipeline concurrently.
pub async fn expand_entry(
    engine: &Engine,
    entry: FrontierEntry,
    config: &RunConfiguration,
) -> ExpansionReport {
    let node_id = entry.node_id;
    let mut report = ExpansionReport {
        node_id: Some(node_id),
        ..Default::default()
    };

    match engine.store().update(&node_id, &NodePatch::expanded_now()) {
        Ok(_) => {}
        Err(StorageError::AlreadySet { .. }) => {
            debug!(node_id = %node_id, "Node already expanded elsewhere, skipping");
            return report;
        }
        Err(StorageError::NodeNotFound(_)) => {
            error!(node_id = %node_id, "Popped node is missing from the store");
            return report;
        }
        Err(err) => {
            warn!(node_id = %node_id, error = %err, "Could not mark node expanded");
            return report;
        }
    }

    let prepared = match prepare(engine, node_id, config).await {
        Ok(prepared) => prepared,
        Err(err) => {
            match &err {
                ExploreError::CycleOrTooDeep { .. } | ExploreError::StoreInvariantViolation(_) => {
                    error!(node_id = %node_id, error = %err, "Cannot expand node")
                }
                _ => warn!(node_id = %node_id, error = %err, "Expansion failed"),
            }
            return report;
        }
    };
    let Some((candidates, ctx)) = prepared else {
        return report;
    };
    report.ran = true;

    let outcomes = join_all(
        candidates
            .into_iter()
            .map(|prompt| run_candidate(engine, &ctx, prompt)),
    )
    .await;

    for outcome in outcomes {
        match outcome {
            CandidateOutcome::Committed(id) => report.children.push(id),
            CandidateOutcome::Blocked => report.blocked += 1,
            CandidateOutcome::Failed => report.failed += 1,
        }
    }
    debug!(
        node_id = %node_id,
        children = report.children.len(),
        blocked = report.blocked,
        failed = report.failed,
        "Node expanded"
    );
    report
}

/// Context reconstruction, reference embeddings and the mutator call.
/// `Ok(None)` means the mutator produced nothing to try.
async fn prepare(
    engine: &Engine,
    node_id: NodeId,
    config: &RunConfiguration,
) -> Result<Option<(Vec<String>, ExpansionContext)>, ExploreError> {
    let reconstructor = engine.reconstructor();
    let mut path = reconstructor.path(&node_id)?;
    if path.is_empty() {
        return Err(ExploreError::StoreInvariantViolation(format!("empty path for {node_id}")));
    }

    // Seeds arrive as bare prompts. The persona answers every unanswered node
    // on the path, root first, before any follow-up is proposed.
    let mut answer_cost = 0.0;
    let mut answer_usage = TokenUsage::default();
    for index in 0..path.len() {
        if path[index].reply.is_some() {
            continue;
        }
        let (cost, usage, answered) = answer_node(engine, &path[..=index]).await?;
        answer_cost += cost;
        answer_usage += usage;
        path[index] = answered;
    }
    let parent = path[path.len() - 1].clone();
    let context = crate::conversation::dialogue(&path);

    let reference: Vec<Embedding> = engine
        .store()
        .top_scored(config.top_k)?
        .into_iter()
        .filter_map(|n| n.embedding)
        .collect();

    let mutator = engine.capabilities().mutator.clone();
    let count = config.variants_per_node;
    let metered = engine
        .metered("mutator", || mutator.mutate(&context, count))
        .await?;

    let mut candidates = metered.value;
    candidates.truncate(count);
    if candidates.is_empty() {
        warn!(node_id = %node_id, "Mutator returned no candidates");
        return Ok(None);
    }

    let n = candidates.len() as u64;
    let overhead_usage = metered.usage + answer_usage;
    let ctx = ExpansionContext {
        parent,
        context,
        reference,
        config: config.clone(),
        mutator_share: (metered.cost_usd + answer_cost) / n as f64,
        mutator_usage_share: TokenUsage::new(
            overhead_usage.prompt_tokens / n,
            overhead_usage.completion_tokens / n,
        ),
    };
    Ok(Some((candidates, ctx)))
}

/// Persona reply to the prompt of the last node in `path`, written back
/// through the fill-once patch. A node answered concurrently elsewhere is
/// re-read and the new reply discarded.
async fn answer_node(
    engine: &Engine,
    path: &[NodeRecord],
) -> Result<(f64, TokenUsage, NodeRecord), ExploreError> {
    let (node, earlier) = path
        .split_last()
        .ok_or_else(|| ExploreError::StoreInvariantViolation("empty path to answer".to_string()))?;
    let context = crate::conversation::dialogue(earlier);
    let persona = engine.capabilities().persona.clone();
    let prompt = node.prompt.clone();
    let reply = engine
        .metered("persona", || persona.reply(&prompt, &context))
        .await?;

    let patch = NodePatch {
        reply: Some(reply.value),
        ..Default::default()
    };
    let updated = match engine.store().update(&node.id, &patch) {
        Ok(updated) => updated,
        Err(StorageError::AlreadySet { .. }) => {
            debug!(node_id = %node.id, "Node answered concurrently");
            return Ok((reply.cost_usd, reply.usage, engine.store().require(&node.id)?));
        }
        Err(err) => return Err(err.into()),
    };
    engine
        .events()
        .publish(GraphEvent::NodeUpdated(GraphUpdate::from(&updated)));
    debug!(node_id = %node.id, "Answered node prompt");
    Ok((reply.cost_usd, reply.usage, updated))
}

async fn run_candidate(engine: &Engine, ctx: &ExpansionContext, prompt: String) -> CandidateOutcome {
    let parent_id = ctx.parent.id;
    match candidate_pipeline(engine, ctx, prompt).await {
        Ok(Some(id)) => CandidateOutcome::Committed(id),
        Ok(None) => CandidateOutcome::Blocked,
        Err(err) => {
            match &err {
                ExploreError::StoreInvariantViolation(_) => {
                    error!(parent_id = %parent_id, error = %err, "Candidate violated store invariant")
                }
                _ => warn!(parent_id = %parent_id, error = %err, "Candidate dropped"),
            }
            CandidateOutcome::Failed
        }
    }
}

/// moderation -> persona -> critic -> embed -> priority -> commit.
/// Returns `Ok(None)` when moderation blocks the candidate.
async fn candidate_pipeline(
    engine: &Engine,
    ctx: &ExpansionContext,
    prompt: String,
) -> Result<Option<NodeId>, ExploreError> {
    let capabilities = engine.capabilities();

    let verdict = check_moderation(capabilities.moderator.as_ref(), engine.ledger(), &prompt).await;
    if let Verdict::Blocked { .. } = verdict {
        debug!(parent_id = %ctx.parent.id, "Candidate blocked by moderation");
        return Ok(None);
    }

    let persona = capabilities.persona.clone();
    let reply = engine
        .metered("persona", || persona.reply(&prompt, &ctx.context))
        .await?;

    let mut trajectory = ctx.context.clone();
    trajectory.push(Turn::human(prompt.clone()));
    trajectory.push(Turn::agent(reply.value.clone()));

    let critic = capabilities.critic.clone();
    let verdict = engine
        .metered("critic", || critic.criticize(&trajectory))
        .await?;
    let (score, analysis) = match verdict.value {
        CriticVerdict::Score { value, analysis } => (value, analysis),
        CriticVerdict::ParseFailure { raw } => {
            return Err(ExploreError::MalformedScore(raw.chars().take(200).collect()));
        }
    };

    let (embedding, position) = engine.embed(&prompt).await?;

    let depth = ctx.parent.depth + 1;
    let similarity = max_similarity(
        &embedding.value,
        ctx.reference.iter().map(|e| e.as_slice()),
    );
    let priority = compute_priority(
        &PriorityInputs {
            score,
            parent_score: ctx.parent.score,
            top_k_similarity: similarity,
            depth,
        },
        &ctx.config.weights,
    );

    let mut node = NodeRecord::child_of(&ctx.parent, prompt);
    node.reply = Some(reply.value);
    node.score = Some(score);
    node.analysis = analysis;
    node.cost_usd = Some(ctx.mutator_share + reply.cost_usd + verdict.cost_usd + embedding.cost_usd);
    node.usage = ctx.mutator_usage_share + reply.usage + verdict.usage + embedding.usage;
    node.embedding = Some(embedding.value);
    node.position = Some(position);
    node.priority = Some(priority);

    debug!(
        parent_id = %ctx.parent.id,
        score,
        similarity,
        priority,
        "Committing candidate"
    );
    engine.commit(node, priority).map(Some)
}
