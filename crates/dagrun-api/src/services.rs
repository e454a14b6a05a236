//! Long-running engine tasks: event router, lifecycle workers, webhook
//! dispatcher and, optionally, the run scheduler.
//!
//! Every task shares one `CancellationToken`; `shutdown` cancels it and waits
//! for each task to finish its current event.

use std::sync::Arc;
use std::time::Duration;

use dagrun_core::allocator::{UnitSubstrate, unit_selector};
use dagrun_core::repository::DagStore;
use dagrun_core::router::EventRouter;
use dagrun_core::scheduler::RunScheduler;
use dagrun_core::webhook::WebhookNotifier;
use dagrun_core::worker::WorkerPool;
use dagrun_infra::webhook::WebhookDispatcher;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::state::AppState;

pub struct Services {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    workers: WorkerPool,
}

impl Services {
    /// Subscribe to unit events in `namespaces` and spawn every engine task.
    pub fn start<S: DagStore>(
        state: &AppState<S>,
        namespaces: &[String],
        with_scheduler: bool,
    ) -> anyhow::Result<Self> {
        let config = &state.config;
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let (notifier, webhook_rx) = WebhookNotifier::channel(config.webhook.channel_capacity);
        let dispatcher = WebhookDispatcher::new(&config.webhook)?;
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move { dispatcher.run(webhook_rx, cancel).await }
        }));

        let (router, queues) = EventRouter::new(config.workers.count, config.workers.queue_capacity);
        let workers = WorkerPool::spawn(
            queues,
            Arc::clone(&state.store),
            state.engine.allocator().clone(),
            notifier,
            Duration::from_millis(config.workers.poll_interval_ms),
            cancel.clone(),
        );

        let selector = unit_selector(&config.engine_id);
        let watches: Vec<_> = namespaces
            .iter()
            .map(|ns| state.substrate.watch(&selector, ns))
            .collect();
        let events = futures_util::stream::select_all(watches).boxed();
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move { router.run(events, cancel).await }
        }));

        if with_scheduler && config.scheduler.enabled {
            let (tx, rx) = mpsc::channel(config.workers.queue_capacity.max(1));
            let scheduler = RunScheduler::new(
                Arc::clone(&state.store),
                Duration::from_secs(config.scheduler.interval_secs),
                tx,
            );
            tasks.push(tokio::spawn({
                let cancel = cancel.clone();
                async move { scheduler.run(cancel).await }
            }));

            let engine = Arc::clone(&state.engine);
            tasks.push(tokio::spawn({
                let cancel = cancel.clone();
                async move { engine.consume_start_requests(rx, cancel).await }
            }));
        }

        info!(
            workers = workers.len(),
            namespaces = ?namespaces,
            scheduler = with_scheduler && config.scheduler.enabled,
            "engine services started"
        );

        Ok(Self {
            cancel,
            tasks,
            workers,
        })
    }

    /// Cancel every task and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "engine task panicked");
            }
        }
        self.workers.join().await;
        info!("engine services stopped");
    }
}
