//! Periodic patrol runs plus on-demand triggers

use pulse_core::{spawn_guarded, Cancellation, Lifecycle};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::PatrolEngine;

pub const TRIGGER_SCHEDULED: &str = "scheduled";

struct Workers {
    cancel: Cancellation,
    handle: JoinHandle<()>,
}

pub struct PatrolScheduler {
    engine: Arc<PatrolEngine>,
    lifecycle: Lifecycle,
    workers: Mutex<Option<Workers>>,
}

impl PatrolScheduler {
    pub fn new(engine: Arc<PatrolEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            lifecycle: Lifecycle::new(),
            workers: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<PatrolEngine> {
        &self.engine
    }

    /// Run every `interval`; the first run comes one interval after start.
    /// Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !self.lifecycle.begin_start() {
            debug!("Patrol scheduler already running");
            return;
        }
        let interval = self.engine.config().await.interval;
        info!(interval = ?interval, "Starting patrol scheduler");

        let cancel = Cancellation::new();
        let handle = {
            let scheduler = Arc::clone(self);
            let cancel = cancel.clone();
            spawn_guarded("patrol-loop", async move {
                scheduler.patrol_loop(interval, cancel).await;
            })
        };
        *workers = Some(Workers { cancel, handle });
        self.lifecycle.mark_running();
    }

    /// Cancel the loop and wait for it. A run in progress finishes first.
    pub async fn stop(&self) {
        let Some(workers) = self.workers.lock().await.take() else {
            return;
        };
        self.lifecycle.begin_stop();
        workers.cancel.cancel();
        if let Err(e) = workers.handle.await {
            warn!(error = %e, "Patrol loop join failed");
        }
        self.lifecycle.mark_stopped();
        info!("Patrol scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Start a run in the background. Returns false, doing nothing, when a
    /// run is already in progress.
    pub fn trigger_now(self: &Arc<Self>, reason: &str) -> bool {
        if self.engine.is_running() {
            debug!(reason, "Patrol already running, trigger ignored");
            return false;
        }
        let engine = Arc::clone(&self.engine);
        let reason = reason.to_string();
        spawn_guarded("patrol-trigger", async move {
            run_logged(&engine, &reason).await;
        });
        true
    }

    async fn patrol_loop(&self, interval: std::time::Duration, cancel: Cancellation) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Patrol loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    run_logged(&self.engine, TRIGGER_SCHEDULED).await;
                }
            }
        }
    }
}

async fn run_logged(engine: &PatrolEngine, trigger: &str) {
    match engine.run(trigger, false).await {
        Ok(record) => debug!(run_id = %record.id, summary = %record.summary, "Patrol run recorded"),
        Err(e) if matches!(e, pulse_core::Error::Conflict(_)) => {
            debug!(trigger, "Patrol run skipped, another run in progress")
        }
        Err(e) => warn!(trigger, error = %e, "Patrol run did not start"),
    }
}
