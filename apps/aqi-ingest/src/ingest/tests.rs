use super::SiteIngestor;
use crate::breaker::{BreakerSettings, CircuitBreaker, CircuitState};
use crate::error::IngestError;
use crate::pipeline::{self, spawn_worker, IngestStats};
use crate::retry::{Jitter, RetryPolicy};
use crate::sites::{default_sites, Site};
use crate::testing::{conditions, default_config, pollution, MemorySink, ScriptedProvider};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const BASE_DELAY: Duration = Duration::from_millis(1000);
const MAX_JITTER: Duration = Duration::from_millis(500);
const API_TIMEOUT: Duration = Duration::from_secs(20);

struct Harness {
    provider: Arc<ScriptedProvider>,
    breaker: Arc<CircuitBreaker>,
    ingestor: SiteIngestor<ScriptedProvider>,
    sink: MemorySink,
    stats: Arc<IngestStats>,
    worker: JoinHandle<()>,
}

impl Harness {
    fn new(provider: ScriptedProvider) -> Self {
        Self::build(
            provider,
            BreakerSettings {
                name: "openweather".to_string(),
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
                half_open_max_trials: 1,
                counts_interval: None,
            },
            RetryPolicy {
                max_attempts: 3,
                base_delay: BASE_DELAY,
                max_jitter: MAX_JITTER,
            },
            API_TIMEOUT,
        )
    }

    /// Breaker, retry and deadline exactly as the binary configures them by default.
    fn shipped(provider: ScriptedProvider) -> Self {
        let config = default_config();
        Self::build(
            provider,
            config.breaker_settings(),
            config.retry_policy(),
            config.api_timeout(),
        )
    }

    fn build(
        provider: ScriptedProvider,
        breaker: BreakerSettings,
        retry: RetryPolicy,
        api_timeout: Duration,
    ) -> Self {
        let provider = Arc::new(provider);
        let stats = Arc::new(IngestStats::new());
        let (queue, rx) = pipeline::channel(16, stats.clone());
        let sink = MemorySink::new();
        let worker = spawn_worker(sink.clone(), rx, stats.clone(), Duration::from_secs(5));
        let breaker = Arc::new(CircuitBreaker::new(breaker));
        let ingestor = SiteIngestor::new(
            provider.clone(),
            breaker.clone(),
            queue,
            retry,
            Arc::new(Jitter::seeded(11)),
            api_timeout,
        );
        Self {
            provider,
            breaker,
            ingestor,
            sink,
            stats,
            worker,
        }
    }

    /// Closes the queue and waits for the sink worker to write what is left.
    async fn drain(self) -> (MemorySink, Arc<IngestStats>) {
        drop(self.ingestor);
        self.worker.await.unwrap();
        (self.sink, self.stats)
    }
}

fn lahore() -> Site {
    Site::new("Lahore", 31.52, 74.36)
}

fn transport_failure(_: usize) -> Result<crate::record::ConditionsSample, IngestError> {
    Err(IngestError::Transport("connection reset by peer".into()))
}

#[tokio::test]
async fn first_attempt_success_writes_one_record() {
    let harness = Harness::new(ScriptedProvider::healthy());

    let before = Utc::now();
    harness.ingestor.ingest_site(&lahore()).await.unwrap();
    let after = Utc::now();

    assert_eq!(harness.provider.conditions_calls(), 1);
    assert_eq!(harness.provider.pollution_calls(), 1);
    let provider = harness.provider.clone();
    let (sink, stats) = harness.drain().await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.city, "Lahore");
    assert_eq!(record.latitude, 31.52);
    assert_eq!(record.longitude, 74.36);
    assert_eq!(record.temperature, 25.0);
    assert_eq!(record.humidity, 40);
    assert_eq!(record.wind_speed, 5.0);
    assert_eq!(record.aqi, 2);
    assert!(record.timestamp >= before && record.timestamp <= after);
    assert!(after - before < chrono::Duration::seconds(1));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.site_successes, 1);
    assert_eq!(snapshot.records_written, 1);
    assert_eq!(provider.calls_for(31.52), 1);
}

#[tokio::test(start_paused = true)]
async fn implausible_pollution_exhausts_retries_without_writing() {
    let harness = Harness::new(ScriptedProvider::healthy().with_pollution(|_| Ok(pollution(7))));

    let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    match err {
        IngestError::RetriesExhausted {
            site,
            attempts,
            last,
        } => {
            assert_eq!(site, "Lahore");
            assert_eq!(attempts, 3);
            assert!(matches!(*last, IngestError::Validation(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(harness.provider.conditions_calls(), 3);
    assert_eq!(harness.provider.pollution_calls(), 3);

    let (sink, stats) = harness.drain().await;
    assert_eq!(sink.attempts(), 0);
    assert_eq!(stats.snapshot().site_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn retries_wait_base_delay_plus_bounded_jitter() {
    let harness = Harness::new(ScriptedProvider::healthy().with_conditions(transport_failure));

    harness.ingestor.ingest_site(&lahore()).await.unwrap_err();

    let starts = harness.provider.attempt_starts();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= BASE_DELAY, "gap {gap:?} below base delay");
        assert!(gap < BASE_DELAY + MAX_JITTER, "gap {gap:?} above jitter bound");
    }
}

#[tokio::test(start_paused = true)]
async fn a_failed_leg_refetches_both_legs() {
    let provider = ScriptedProvider::healthy().with_pollution(|call| {
        if call == 0 {
            Err(IngestError::Provider {
                status: Some(503),
                detail: "pollution response: busy".into(),
            })
        } else {
            Ok(pollution(3))
        }
    });
    let harness = Harness::new(provider);

    harness.ingestor.ingest_site(&lahore()).await.unwrap();
    assert_eq!(harness.provider.conditions_calls(), 2);
    assert_eq!(harness.provider.pollution_calls(), 2);

    let (sink, _) = harness.drain().await;
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].aqi, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_error_names_the_failing_leg() {
    let harness = Harness::new(ScriptedProvider::healthy().with_pollution(|_| {
        Err(IngestError::provider("pollution response contained no entries"))
    }));

    let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    let IngestError::RetriesExhausted { last, .. } = err else {
        panic!("expected exhausted retries");
    };
    match *last {
        IngestError::Fetch {
            conditions,
            pollution,
        } => {
            assert!(conditions.is_none());
            assert!(pollution.is_some());
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn slow_provider_is_cut_off_at_the_attempt_deadline() {
    let harness =
        Harness::new(ScriptedProvider::healthy().with_latency(API_TIMEOUT + Duration::from_secs(10)));

    let started = Instant::now();
    let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    let elapsed = started.elapsed();

    let IngestError::RetriesExhausted { last, .. } = err else {
        panic!("expected exhausted retries");
    };
    assert!(matches!(
        *last,
        IngestError::Fetch {
            conditions: Some(_),
            pollution: Some(_)
        }
    ));
    assert!(elapsed >= API_TIMEOUT * 3 + BASE_DELAY * 2);
    assert!(elapsed < (API_TIMEOUT + BASE_DELAY + MAX_JITTER) * 3);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_rejects_the_fourth_site_tick_without_fetching() {
    let harness = Harness::new(ScriptedProvider::healthy().with_conditions(transport_failure));

    for _ in 0..3 {
        let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
        assert!(matches!(err, IngestError::RetriesExhausted { .. }));
    }
    assert_eq!(harness.breaker.state(), CircuitState::Open);
    assert_eq!(harness.provider.conditions_calls(), 9);

    let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    assert!(matches!(err, IngestError::CircuitOpen));
    assert_eq!(harness.provider.conditions_calls(), 9);
    assert_eq!(harness.provider.pollution_calls(), 9);

    let (sink, stats) = harness.drain().await;
    assert!(sink.records().is_empty());
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.site_failures, 3);
    assert_eq!(snapshot.units_shed, 1);
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_after_cooldown_with_a_healthy_provider() {
    let provider = ScriptedProvider::healthy().with_conditions(|call| {
        if call < 9 {
            Err(IngestError::Transport("connection refused".into()))
        } else {
            Ok(conditions(18.5, 55, 2.0))
        }
    });
    let harness = Harness::new(provider);

    for _ in 0..3 {
        harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    }
    assert_eq!(harness.ingestor.breaker_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(60)).await;
    harness.ingestor.ingest_site(&lahore()).await.unwrap();
    assert_eq!(harness.ingestor.breaker_state(), CircuitState::Closed);

    let (sink, _) = harness.drain().await;
    assert_eq!(sink.records().len(), 1);
    assert_eq!(sink.records()[0].temperature, 18.5);
}

#[tokio::test(start_paused = true)]
async fn failures_from_different_sites_share_one_breaker() {
    let harness = Harness::new(ScriptedProvider::healthy().with_conditions(transport_failure));
    let sites = [
        Site::new("Lahore", 31.5204, 74.3587),
        Site::new("Kasur", 31.1167, 74.45),
        Site::new("Sialkot", 32.4833, 74.5333),
    ];

    for site in &sites {
        harness.ingestor.ingest_site(site).await.unwrap_err();
    }

    let err = harness
        .ingestor
        .ingest_site(&Site::new("Gujranwala", 32.1667, 74.1833))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::CircuitOpen));
    assert_eq!(harness.provider.calls_for(32.1667), 0);
}

#[tokio::test(start_paused = true)]
async fn shipped_breaker_opens_when_every_attempt_times_out() {
    let harness =
        Harness::shipped(ScriptedProvider::healthy().with_latency(API_TIMEOUT + Duration::from_secs(10)));

    for _ in 0..3 {
        let started = Instant::now();
        let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
        assert!(matches!(err, IngestError::RetriesExhausted { .. }));
        // Each unit outlives the 30s counts interval.
        assert!(started.elapsed() > Duration::from_secs(60));
    }
    assert_eq!(harness.breaker.state(), CircuitState::Open);
    assert_eq!(harness.provider.conditions_calls(), 9);

    let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    assert!(matches!(err, IngestError::CircuitOpen));
    assert_eq!(harness.provider.conditions_calls(), 9);

    let (_, stats) = harness.drain().await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.site_failures, 3);
    assert_eq!(snapshot.units_shed, 1);
}

#[tokio::test(start_paused = true)]
async fn one_tick_of_timeouts_across_all_sites_opens_the_shipped_breaker() {
    let harness =
        Harness::shipped(ScriptedProvider::healthy().with_latency(API_TIMEOUT + Duration::from_secs(10)));

    let units: Vec<_> = default_sites()
        .into_iter()
        .map(|site| {
            let ingestor = harness.ingestor.clone();
            tokio::spawn(async move { ingestor.ingest_site(&site).await })
        })
        .collect();
    for unit in units {
        let err = unit.await.unwrap().unwrap_err();
        assert!(matches!(err, IngestError::RetriesExhausted { .. }));
    }

    assert_eq!(harness.breaker.state(), CircuitState::Open);
    assert_eq!(harness.stats.snapshot().site_failures, 6);
    let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    assert!(matches!(err, IngestError::CircuitOpen));
}

#[tokio::test(start_paused = true)]
async fn shipped_breaker_closes_after_a_full_trial_streak() {
    let provider = ScriptedProvider::healthy().with_conditions(|call| {
        if call < 9 {
            Err(IngestError::Transport("connection refused".into()))
        } else {
            Ok(conditions(21.0, 60, 3.5))
        }
    });
    let harness = Harness::shipped(provider);

    for _ in 0..3 {
        harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    }
    assert_eq!(harness.breaker.state(), CircuitState::Open);
    let err = harness.ingestor.ingest_site(&lahore()).await.unwrap_err();
    assert!(matches!(err, IngestError::CircuitOpen));

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(harness.breaker.state(), CircuitState::HalfOpen);
    for _ in 0..4 {
        harness.ingestor.ingest_site(&lahore()).await.unwrap();
        assert_eq!(harness.breaker.state(), CircuitState::HalfOpen);
    }
    harness.ingestor.ingest_site(&lahore()).await.unwrap();
    assert_eq!(harness.breaker.state(), CircuitState::Closed);

    let (sink, _) = harness.drain().await;
    assert_eq!(sink.records().len(), 5);
}
