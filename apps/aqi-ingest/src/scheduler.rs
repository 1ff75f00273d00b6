use crate::ingest::SiteIngestor;
use crate::provider::WeatherProvider;
use crate::sites::Site;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Fixed-interval fan-out: every tick launches one unit per site and moves on.
pub struct Scheduler<P> {
    ingestor: SiteIngestor<P>,
    sites: Arc<[Site]>,
    interval: Duration,
    tracker: TaskTracker,
}

impl<P: WeatherProvider> Scheduler<P> {
    pub fn new(
        ingestor: SiteIngestor<P>,
        sites: Vec<Site>,
        interval: Duration,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            ingestor,
            sites: sites.into(),
            interval,
            tracker,
        }
    }

    /// Runs until `cancel` fires. Units already spawned keep running on the
    /// tracker; the caller decides how long to wait for them.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tick += 1;
                self.fan_out(tick);
            }
            tracing::info!(ticks = tick, "scheduler stopped");
        })
    }

    fn fan_out(&self, tick: u64) {
        let stats = self.ingestor.stats().snapshot();
        tracing::info!(
            tick,
            sites = self.sites.len(),
            in_flight = self.tracker.len(),
            queue_depth = stats.queue_depth,
            records_written = stats.records_written,
            site_successes = stats.site_successes,
            site_failures = stats.site_failures,
            units_shed = stats.units_shed,
            sink_failures = stats.sink_failures,
            breaker = %self.ingestor.breaker_state(),
            "scheduler tick"
        );

        for site in self.sites.iter() {
            let ingestor = self.ingestor.clone();
            let site = site.clone();
            // Outcomes are logged by the ingestor; nothing is awaited here.
            self.tracker.spawn(async move {
                let _ = ingestor.ingest_site(&site).await;
            });
        }
    }
}
