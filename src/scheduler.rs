use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::poller::CycleReport;

/// Work fired by the scheduler on every tick.
#[async_trait]
pub trait PollCycle: Send + Sync {
    async fn run_cycle(&self) -> Result<CycleReport>;
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fires a polling cycle on a fixed interval. Owned by the application
/// context; `start` and `stop` are both idempotent.
pub struct Scheduler {
    cycle: Arc<dyn PollCycle>,
    every: Duration,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(cycle: Arc<dyn PollCycle>, every: Duration) -> Self {
        Self {
            cycle,
            every,
            running: Mutex::new(None),
        }
    }

    /// Start ticking; the first cycle runs immediately. Returns `false` when
    /// the scheduler was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Scheduler already running; ignoring start");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(Arc::clone(&self.cycle), self.every, cancel.clone()));
        *running = Some(Running { cancel, handle });
        info!(interval_secs = self.every.as_secs(), "Scheduler started");
        true
    }

    /// Cancel the timer and wait for an in-flight cycle to settle. Returns
    /// `false` when the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            debug!("Scheduler not running; ignoring stop");
            return false;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
        info!("Scheduler stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

async fn tick_loop(cycle: Arc<dyn PollCycle>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let cycle = Arc::clone(&cycle);
        // Own task so that a panicking cycle cannot take the schedule down.
        match tokio::spawn(async move { cycle.run_cycle().await }).await {
            Ok(Ok(report)) => debug!(
                skipped = report.skipped,
                fetched = report.fetched,
                elapsed_ms = ?started.elapsed().as_millis(),
                "Cycle finished"
            ),
            Ok(Err(e)) => error!(
                error = ?e,
                elapsed_ms = ?started.elapsed().as_millis(),
                "Cycle failed; retrying on next tick"
            ),
            Err(e) => error!(error = %e, "Cycle panicked; retrying on next tick"),
        }
    }
}
