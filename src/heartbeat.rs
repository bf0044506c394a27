//! Heartbeat
//!
//! Periodic status report running as its own task. It only reads shared
//! counters; it never writes to the store or the frontier.

use crate::engine::Engine;
use crate::events::GraphEvent;
use crate::explorer::{WorkerPhase, WorkerStatsSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub node_count: usize,
    pub frontier_size: usize,
    pub spent_usd: f64,
    pub limit_usd: f64,
    pub remaining_usd: f64,
    /// Nodes created per second since the previous snapshot
    pub velocity_per_sec: f64,
    pub phase: WorkerPhase,
    pub worker: WorkerStatsSnapshot,
}

/// Tracks node growth between ticks.
pub struct Heartbeat {
    engine: Engine,
    interval: Duration,
    last: Option<(Instant, usize)>,
}

impl Heartbeat {
    pub fn new(engine: Engine, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            last: None,
        }
    }

    /// Take one snapshot, log it and publish it as an event.
    pub fn tick(&mut self) -> Option<StatusSnapshot> {
        let now = Instant::now();
        let count = match self.engine.store().count() {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "Heartbeat could not read node count");
                return None;
            }
        };
        let velocity = match self.last {
            Some((at, previous)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    count.saturating_sub(previous) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((now, count));

        let snapshot = match self.engine.status(velocity) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "Heartbeat status unavailable");
                return None;
            }
        };
        info!(
            nodes = snapshot.node_count,
            frontier = snapshot.frontier_size,
            spent_usd = snapshot.spent_usd,
            remaining_usd = snapshot.remaining_usd,
            velocity = format!("{:.2}/s", snapshot.velocity_per_sec),
            phase = ?snapshot.phase,
            "Heartbeat"
        );
        self.engine
            .events()
            .publish(GraphEvent::Heartbeat(snapshot.clone()));
        Some(snapshot)
    }

    /// Tick every interval until `shutdown` flips to true.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
