//! Run scheduler for cron-bearing definitions.
//!
//! Every tick asks the store for due definitions (the store advances their
//! next fire time in the same transaction) and emits one `StartRequest` per
//! definition. The engine consumes the requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dagrun_types::error::ValidationError;
use dagrun_types::run::StartRequest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::repository::DagStore;

// ---------------------------------------------------------------------------
// Cron helpers
// ---------------------------------------------------------------------------

/// Parse a 5-field (minute resolution) or 6-field (with seconds) cron
/// expression.
pub fn parse_schedule(expr: &str) -> Result<croner::Cron, ValidationError> {
    let trimmed = expr.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        _ => trimmed.to_string(),
    };

    normalized
        .parse::<croner::Cron>()
        .map_err(|e| ValidationError::InvalidSchedule {
            schedule: expr.to_string(),
            reason: e.to_string(),
        })
}

/// First fire time of `expr` strictly after `after`.
pub fn next_fire_time(
    expr: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    let cron = parse_schedule(expr)?;
    cron.iter_after(after)
        .next()
        .ok_or_else(|| ValidationError::InvalidSchedule {
            schedule: expr.to_string(),
            reason: "schedule never fires".to_string(),
        })
}

/// Name given to scheduler-started instances.
pub fn scheduled_run_name() -> String {
    format!("dagrun-{}", uuid::Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// RunScheduler
// ---------------------------------------------------------------------------

pub struct RunScheduler<S> {
    store: Arc<S>,
    interval: Duration,
    requests: mpsc::Sender<StartRequest>,
}

impl<S: DagStore> RunScheduler<S> {
    pub fn new(store: Arc<S>, interval: Duration, requests: mpsc::Sender<StartRequest>) -> Self {
        Self {
            store,
            interval,
            requests,
        }
    }

    /// Run one scheduling pass. Returns the number of start requests emitted.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due = match self.store.get_due_dags(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to get due definitions");
                return 0;
            }
        };

        let mut emitted = 0;
        for dag in due {
            let request = StartRequest {
                instance_name: scheduled_run_name(),
                dag_name: dag.name.clone(),
                namespace: dag.namespace.clone(),
                parameters: Vec::new(),
            };

            info!(
                dag = %dag.name,
                namespace = %dag.namespace,
                instance = %request.instance_name,
                "definition due, requesting run"
            );

            if self.requests.send(request).await.is_err() {
                warn!(dag = %dag.name, "start request consumer stopped");
                break;
            }
            emitted += 1;
        }
        emitted
    }

    /// Tick on a fixed interval until `cancel` fires. The first tick happens
    /// one interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        info!(interval_secs = self.interval.as_secs(), "run scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!("run scheduler stopped");
    }
}
