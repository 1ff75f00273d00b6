use super::SiteIngestor;
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::error::IngestError;
use crate::pipeline::{IngestStats, RecordQueue};
use crate::provider::WeatherProvider;
use crate::record::IngestedRecord;
use crate::retry::{Jitter, RetryPolicy};
use crate::sites::Site;
use crate::validate;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

impl<P: WeatherProvider> SiteIngestor<P> {
    pub fn new(
        provider: Arc<P>,
        breaker: Arc<CircuitBreaker>,
        queue: RecordQueue,
        retry: RetryPolicy,
        jitter: Arc<Jitter>,
        api_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            breaker,
            queue,
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                ..retry
            },
            jitter,
            api_timeout,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.queue.stats()
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// One site for one tick. The whole retry loop runs as a single breaker unit.
    pub async fn ingest_site(&self, site: &Site) -> Result<(), IngestError> {
        tracing::info!(site = %site.name, "fetching conditions and pollution");
        let result = self.breaker.execute(|| self.run_attempts(site)).await;

        let stats = self.queue.stats();
        match &result {
            Ok(()) => {
                stats.site_successes.fetch_add(1, Ordering::Relaxed);
                tracing::info!(site = %site.name, "site readings validated and queued");
            }
            Err(err) if err.is_load_shedding() => {
                stats.units_shed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    site = %site.name,
                    breaker = %self.breaker.name(),
                    error = %err,
                    "circuit breaker rejected fetch; skipping site this tick"
                );
            }
            Err(err) => {
                stats.site_failures.fetch_add(1, Ordering::Relaxed);
                stats.record_error(err.to_string());
                tracing::error!(site = %site.name, error = %err, "site ingest failed");
            }
        }
        result
    }

    async fn run_attempts(&self, site: &Site) -> Result<(), IngestError> {
        let max_attempts = self.retry.max_attempts;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.retry.backoff(&self.jitter);
                tracing::info!(
                    site = %site.name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying fetch"
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt(site).await {
                Ok(record) => {
                    self.queue.enqueue(record).await?;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        site = %site.name,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %err,
                        "fetch attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(IngestError::RetriesExhausted {
            site: site.name.clone(),
            attempts: max_attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| IngestError::Transport("no attempt was made".into())),
            ),
        })
    }

    /// Both legs share one deadline; a failure on either discards the pair.
    async fn attempt(&self, site: &Site) -> Result<IngestedRecord, IngestError> {
        let deadline = Instant::now() + self.api_timeout;
        let coordinates = site.coordinates();
        let (conditions, pollution) = tokio::join!(
            self.provider.fetch_conditions(coordinates, deadline),
            self.provider.fetch_pollution(coordinates, deadline),
        );

        let (conditions, pollution) = match (conditions, pollution) {
            (Ok(conditions), Ok(pollution)) => (conditions, pollution),
            (conditions, pollution) => {
                return Err(IngestError::Fetch {
                    conditions: conditions.err().map(Box::new),
                    pollution: pollution.err().map(Box::new),
                })
            }
        };

        validate::check_pair(&conditions, &pollution)?;
        Ok(IngestedRecord::new(site, conditions, pollution, Utc::now()))
    }
}
