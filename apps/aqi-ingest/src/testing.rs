//! Fakes shared by the unit tests.

use crate::config::{Config, SetupConfigOverrides};
use crate::error::IngestError;
use crate::provider::WeatherProvider;
use crate::record::{Concentrations, ConditionsSample, IngestedRecord, PollutionSample};
use crate::sites::{Coordinates, Site};
use crate::store::RecordSink;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) fn conditions(temperature: f64, humidity: i32, wind_speed: f64) -> ConditionsSample {
    ConditionsSample {
        temperature,
        humidity,
        wind_speed,
        description: "clear sky".to_string(),
    }
}

pub(crate) fn pollution(quality_index: i32) -> PollutionSample {
    PollutionSample {
        quality_index,
        concentrations: Concentrations {
            co: 201.94,
            pm2_5: 41.0,
            pm10: 63.5,
            ..Concentrations::default()
        },
    }
}

pub(crate) fn sample_record(city: &str) -> IngestedRecord {
    IngestedRecord::new(
        &Site::new(city, 31.52, 74.36),
        conditions(25.0, 40, 5.0),
        pollution(2),
        Utc::now(),
    )
}

/// The configuration the binary runs with when only the required keys are set.
pub(crate) fn default_config() -> Config {
    let lookup = |key: &str| match key {
        "AQI_OPENWEATHER_API_KEY" => Some("test-key".to_string()),
        "AQI_DATABASE_URL" => Some("postgres://aqi@localhost/aqi".to_string()),
        _ => None,
    };
    Config::from_lookup(&lookup, SetupConfigOverrides::default()).unwrap()
}

type ConditionsScript = dyn Fn(usize) -> Result<ConditionsSample, IngestError> + Send + Sync;
type PollutionScript = dyn Fn(usize) -> Result<PollutionSample, IngestError> + Send + Sync;

/// Provider whose legs are scripted by call number (0-based, counted per leg).
pub(crate) struct ScriptedProvider {
    conditions: Box<ConditionsScript>,
    pollution: Box<PollutionScript>,
    latency: Duration,
    conditions_calls: AtomicUsize,
    pollution_calls: AtomicUsize,
    call_log: Mutex<Vec<(Instant, Coordinates)>>,
}

impl ScriptedProvider {
    pub(crate) fn healthy() -> Self {
        Self {
            conditions: Box::new(|_| Ok(conditions(25.0, 40, 5.0))),
            pollution: Box::new(|_| Ok(pollution(2))),
            latency: Duration::ZERO,
            conditions_calls: AtomicUsize::new(0),
            pollution_calls: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_conditions(
        mut self,
        script: impl Fn(usize) -> Result<ConditionsSample, IngestError> + Send + Sync + 'static,
    ) -> Self {
        self.conditions = Box::new(script);
        self
    }

    pub(crate) fn with_pollution(
        mut self,
        script: impl Fn(usize) -> Result<PollutionSample, IngestError> + Send + Sync + 'static,
    ) -> Self {
        self.pollution = Box::new(script);
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn conditions_calls(&self) -> usize {
        self.conditions_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn pollution_calls(&self) -> usize {
        self.pollution_calls.load(Ordering::SeqCst)
    }

    /// Start time of every conditions call.
    pub(crate) fn attempt_starts(&self) -> Vec<Instant> {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub(crate) fn calls_for(&self, latitude: f64) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, coordinates)| coordinates.latitude == latitude)
            .count()
    }

    async fn wait(&self, deadline: Instant) -> Result<(), IngestError> {
        if self.latency.is_zero() {
            return Ok(());
        }
        let ready = Instant::now() + self.latency;
        if ready > deadline {
            tokio::time::sleep_until(deadline).await;
            return Err(IngestError::Transport("deadline exceeded".into()));
        }
        tokio::time::sleep_until(ready).await;
        Ok(())
    }
}

impl WeatherProvider for ScriptedProvider {
    async fn fetch_conditions(
        &self,
        coordinates: Coordinates,
        deadline: Instant,
    ) -> Result<ConditionsSample, IngestError> {
        let call = self.conditions_calls.fetch_add(1, Ordering::SeqCst);
        self.call_log
            .lock()
            .unwrap()
            .push((Instant::now(), coordinates));
        self.wait(deadline).await?;
        (self.conditions)(call)
    }

    async fn fetch_pollution(
        &self,
        _coordinates: Coordinates,
        deadline: Instant,
    ) -> Result<PollutionSample, IngestError> {
        let call = self.pollution_calls.fetch_add(1, Ordering::SeqCst);
        self.wait(deadline).await?;
        (self.pollution)(call)
    }
}

#[derive(Default)]
struct SinkState {
    records: Vec<IngestedRecord>,
    attempts: usize,
    failing_site: Option<String>,
    stall: Option<Duration>,
}

/// In-memory sink recording every successful write.
#[derive(Clone, Default)]
pub(crate) struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_site(&self, site: &str) {
        self.state.lock().unwrap().failing_site = Some(site.to_string());
    }

    pub(crate) fn stall_for(&self, stall: Duration) {
        self.state.lock().unwrap().stall = Some(stall);
    }

    pub(crate) fn records(&self) -> Vec<IngestedRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }
}

impl RecordSink for MemorySink {
    async fn insert(&self, record: &IngestedRecord) -> Result<(), IngestError> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            state.attempts += 1;
            if state.failing_site.as_deref() == Some(record.city.as_str()) {
                return Err(IngestError::Sink(format!(
                    "refusing writes for {}",
                    record.city
                )));
            }
            state.stall
        };
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        self.state.lock().unwrap().records.push(record.clone());
        Ok(())
    }
}
