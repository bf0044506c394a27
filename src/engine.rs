//! Shared exploration state
//!
//! [`Engine`] bundles the handles every component works through: node store,
//! frontier, budget ledger, live settings, event hub and capabilities. It is
//! cheap to clone and passed explicitly; nothing here is a global.

use crate::capability::{retry_capability, Capabilities, Metered, RetryPolicy};
use crate::conversation::{ConversationReconstructor, DEFAULT_MAX_TRAVERSAL_DEPTH};
use crate::error::{ExploreError, StorageError};
use crate::events::{EventHub, GraphEvent, GraphUpdate};
use crate::explorer::WorkerStats;
use crate::frontier::{Frontier, PushOutcome};
use crate::guard::BudgetLedger;
use crate::heartbeat::StatusSnapshot;
use crate::projection::Projector;
use crate::settings::{RunConfiguration, RunSettings};
use crate::store::{NodeRecord, NodeStore};
use crate::types::{Embedding, NodeId, Position};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub max_traversal_depth: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_traversal_depth: DEFAULT_MAX_TRAVERSAL_DEPTH,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn NodeStore>,
    frontier: Arc<Frontier>,
    ledger: Arc<BudgetLedger>,
    settings: Arc<RunSettings>,
    events: Arc<EventHub>,
    capabilities: Capabilities,
    projector: Arc<Projector>,
    stats: Arc<WorkerStats>,
    /// Serializes focus-zone seeding so two requests cannot both find a zone empty
    focus_guard: Arc<tokio::sync::Mutex<()>>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(
        store: Arc<dyn NodeStore>,
        capabilities: Capabilities,
        run_config: RunConfiguration,
        options: EngineOptions,
    ) -> Self {
        let ledger = Arc::new(BudgetLedger::new(run_config.budget_limit_usd));
        let settings = Arc::new(RunSettings::new(run_config, ledger.clone()));
        Self {
            store,
            frontier: Arc::new(Frontier::new()),
            ledger,
            settings,
            events: Arc::new(EventHub::new()),
            capabilities,
            projector: Arc::new(Projector::default()),
            stats: Arc::new(WorkerStats::default()),
            focus_guard: Arc::new(tokio::sync::Mutex::new(())),
            options,
        }
    }

    pub fn with_projector(mut self, projector: Projector) -> Self {
        self.projector = Arc::new(projector);
        self
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn settings(&self) -> &Arc<RunSettings> {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn focus_guard(&self) -> &tokio::sync::Mutex<()> {
        &self.focus_guard
    }

    pub fn reconstructor(&self) -> ConversationReconstructor<'_> {
        ConversationReconstructor::new(self.store.as_ref(), self.options.max_traversal_depth)
    }

    /// Run a capability call with retries and charge the ledger on success.
    pub async fn metered<T, F, Fut>(
        &self,
        capability: &'static str,
        op: F,
    ) -> Result<Metered<T>, ExploreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Metered<T>, crate::error::CapabilityError>>,
    {
        let metered = retry_capability(capability, &self.options.retry, op)
            .await
            .map_err(|e| ExploreError::capability(capability, e))?;
        self.ledger.charge(metered.cost_usd, metered.usage);
        Ok(metered)
    }

    /// Embed `text` and project it. Failures are returned, not logged.
    pub async fn embed(&self, text: &str) -> Result<(Metered<Embedding>, Position), ExploreError> {
        let embedder = self.capabilities.embedder.clone();
        let metered = self.metered("embedder", || embedder.embed(text)).await?;
        let position = self.projector.project(&metered.value);
        Ok((metered, position))
    }

    /// Insert `node`, admit it to the frontier at `priority` and announce it.
    ///
    /// There is no suspension point in here, so a cancelled caller either
    /// commits everything or nothing.
    pub fn commit(&self, node: NodeRecord, priority: f64) -> Result<NodeId, ExploreError> {
        let update = GraphUpdate::from(&node);
        let node_id = match self.store.create(node) {
            Ok(id) => id,
            Err(
                err @ (StorageError::ParentMissing { .. }
                | StorageError::DepthMismatch { .. }
                | StorageError::DuplicateId(_)),
            ) => {
                error!(node_id = %update.id, error = %err, "Refusing to commit node");
                return Err(ExploreError::StoreInvariantViolation(err.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        if self.frontier.push(node_id, priority) != PushOutcome::Inserted {
            warn!(node_id = %node_id, "Freshly created node was not admitted to the frontier");
        }
        self.events.publish(GraphEvent::NodeCreated(update));
        debug!(node_id = %node_id, priority, "Node committed");
        Ok(node_id)
    }

    /// Re-admit every unexpanded node with its recorded priority and seed the
    /// ledger with the spend recorded on nodes. Returns how many entries were
    /// admitted.
    pub fn recover(&self) -> Result<usize, ExploreError> {
        let nodes = self.store.list_all()?;
        let spent: f64 = nodes.iter().filter_map(|n| n.cost_usd).sum();
        self.ledger.restore_spent(spent);

        let fallback = self.settings.snapshot().seed_priority;
        let mut pending: Vec<&NodeRecord> = nodes.iter().filter(|n| !n.is_expanded()).collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        self.frontier
            .retire(nodes.iter().filter(|n| n.is_expanded()).map(|n| n.id));
        let admitted = self.frontier.recover(
            pending
                .iter()
                .map(|n| (n.id, n.priority.unwrap_or(fallback))),
        );
        info!(
            nodes = nodes.len(),
            admitted,
            spent_usd = spent,
            "Frontier recovered from store"
        );
        Ok(admitted)
    }

    /// Read-only status. `velocity` is supplied by the caller.
    pub fn status(&self, velocity_per_sec: f64) -> Result<StatusSnapshot, ExploreError> {
        Ok(StatusSnapshot {
            timestamp: Utc::now(),
            node_count: self.store.count()?,
            frontier_size: self.frontier.size(),
            spent_usd: self.ledger.spent(),
            limit_usd: self.ledger.limit(),
            remaining_usd: self.ledger.remaining(),
            velocity_per_sec,
            phase: self.stats.phase(),
            worker: self.stats.snapshot(),
        })
    }
}
