use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::orchestrator::SyncOrchestrator;
use super::runtime::HandlerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// How often a ChangeFeedPoll task is requested per registry.
    pub poll_interval: Duration,
    /// How often an idle execution worker looks for work again.
    pub execute_interval: Duration,
    pub sweep_interval: Duration,
    pub workers_per_type: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            execute_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            workers_per_type: 1,
        }
    }
}

/// Background loops of one process.
/// - registry ごとの poll 要求
/// - handler の登録された task type ごとの実行 worker
/// - timeout sweep
///
/// `shutdown_tx` を drop するとすべての loop が止まる。
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(
        orchestrator: Arc<SyncOrchestrator>,
        handlers: Arc<HandlerRegistry>,
        registries: Vec<String>,
        options: SchedulerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::new();

        let registries = Arc::new(registries);
        {
            let orchestrator = Arc::clone(&orchestrator);
            joins.push(tokio::spawn(tick_loop(
                "poll",
                options.poll_interval,
                shutdown_rx.clone(),
                move || {
                    let orchestrator = Arc::clone(&orchestrator);
                    let registries = Arc::clone(&registries);
                    async move {
                        for registry in registries.iter() {
                            if let Err(e) = orchestrator.schedule_poll(registry).await {
                                tracing::warn!(%registry, error = %e, "failed to schedule poll");
                            }
                        }
                    }
                },
            )));
        }

        for task_type in handlers.task_types() {
            for worker_id in 0..options.workers_per_type.max(1) {
                let orchestrator = Arc::clone(&orchestrator);
                let handlers = Arc::clone(&handlers);
                joins.push(tokio::spawn(tick_loop(
                    "execute",
                    options.execute_interval,
                    shutdown_rx.clone(),
                    move || {
                        let orchestrator = Arc::clone(&orchestrator);
                        let handlers = Arc::clone(&handlers);
                        async move {
                            let Ok(handler) = handlers.get(task_type) else {
                                return;
                            };
                            let round = orchestrator
                                .run_execution_loop(task_type, handler.as_ref())
                                .await;
                            match round {
                                Ok(report) if report.claimed > 0 => {
                                    tracing::debug!(
                                        %task_type,
                                        worker_id,
                                        ?report,
                                        "execution round"
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(
                                        %task_type,
                                        worker_id,
                                        error = %e,
                                        "execution loop failed"
                                    );
                                }
                            }
                        }
                    },
                )));
            }
        }

        joins.push(tokio::spawn(tick_loop(
            "sweep",
            options.sweep_interval,
            shutdown_rx,
            move || {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(e) = orchestrator.run_timeout_sweep().await {
                        tracing::warn!(error = %e, "timeout sweep failed");
                    }
                }
            },
        )));

        Self { shutdown_tx, joins }
    }

    /// Stop starting new rounds. A round already running finishes first.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                tracing::error!(error = %e, "scheduler loop panicked");
            }
        }
    }
}

async fn tick_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut round: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = interval.tick() => {}
        }
        round().await;
    }
    tracing::debug!(loop_name = name, "scheduler loop stopped");
}
