use std::sync::Arc;
use std::time::Duration;

use delay_store::Clock;
use delay_store::DelayStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::metrics::GateMetrics;

pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Most entries removed per tick.
pub const SWEEP_BATCH: usize = 100;

/// Periodically evicts expired delays in bounded batches.
#[derive(Debug)]
pub struct Sweeper<D>
where
    D: ?Sized,
{
    store: Arc<D>,
    clock: Arc<dyn Clock>,
    period: Duration,
    batch: usize,
    metrics: GateMetrics,
}

impl<D> Sweeper<D>
where
    D: DelayStore + ?Sized + 'static,
{
    pub fn new(store: Arc<D>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            period: SWEEP_PERIOD,
            batch: SWEEP_BATCH,
            metrics: GateMetrics::new(),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    /// Evicts one batch; returns how many entries went.
    pub fn tick(&self) -> usize {
        let now = self.clock.now_millis();
        let removed = self.store.evict_expired(now, self.batch);
        self.metrics.evicted(removed);
        if removed > 0 {
            tracing::debug!(removed, remaining = self.store.len(), "swept expired delays");
        }
        removed
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let start = Instant::now() + self.period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick();
                    }
                }
            }
            tracing::debug!("sweeper stopped");
        })
    }
}
