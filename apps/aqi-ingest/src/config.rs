use crate::breaker::BreakerSettings;
use crate::provider::DEFAULT_BASE_URL;
use crate::retry::RetryPolicy;
use crate::sites::{default_sites, parse_sites_json, validate_sites, Site};
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/aqi-ingest/config.json";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

fn setup_config_path(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    lookup("AQI_SETUP_CONFIG_PATH")
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

/// Values an operator may place in the setup file. Environment variables win.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    openweather_api_key: Option<String>,
    #[serde(default)]
    openweather_base_url: Option<String>,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    sites: Option<Vec<Site>>,
    #[serde(default)]
    fetch_interval_secs: Option<u64>,
    #[serde(default)]
    api_timeout_secs: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    daily_call_quota: Option<u64>,
    #[serde(default)]
    queue_capacity: Option<usize>,
}

fn parse_setup_overrides(contents: String) -> Result<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).context("setup config is not valid JSON")
}

/// A missing setup file is fine; one that exists but cannot be used stops startup.
fn load_setup_config_overrides(path: &Path) -> Result<Option<SetupConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read setup config {}", path.display()))?;
    parse_setup_overrides(contents)
        .with_context(|| format!("failed to parse setup config {}", path.display()))
        .map(Some)
}

/// Trimmed, non-empty variable lookups with parse errors naming the key.
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.optional(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .with_context(|| format!("invalid {key}: {value:?}"))
            })
            .transpose()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub database_url: String,
    pub db_pool_size: u32,
    pub collection: String,
    pub sites: Vec<Site>,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_jitter_ms: u64,
    pub jitter_seed: Option<u64>,
    pub fetch_interval_secs: u64,
    pub api_timeout_secs: u64,
    pub daily_call_quota: Option<u64>,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub breaker_half_open_trials: u32,
    pub breaker_counts_interval_secs: u64,
    pub queue_capacity: usize,
    pub write_timeout_secs: u64,
    pub startup_ping_timeout_secs: u64,
    pub shutdown_grace_secs: Option<u64>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let lookup = |key: &str| env::var(key).ok();
        let setup_overrides = load_setup_config_overrides(&setup_config_path(&lookup))?;
        Self::from_lookup(&lookup, setup_overrides.unwrap_or_default())
    }

    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: SetupConfigOverrides,
    ) -> Result<Self> {
        let vars = Vars { lookup };

        let api_key = vars
            .optional("AQI_OPENWEATHER_API_KEY")
            .or_else(|| vars.optional("OPENWEATHER_API_KEY"))
            .or_else(|| non_empty(overrides.openweather_api_key.as_deref()))
            .context("AQI_OPENWEATHER_API_KEY or OPENWEATHER_API_KEY is required (or openweather_api_key in the setup config)")?;
        let base_url = vars
            .optional("AQI_OPENWEATHER_BASE_URL")
            .or_else(|| non_empty(overrides.openweather_base_url.as_deref()))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let database_url = vars
            .optional("AQI_DATABASE_URL")
            .or_else(|| vars.optional("DATABASE_URL"))
            .or_else(|| non_empty(overrides.database_url.as_deref()))
            .context("AQI_DATABASE_URL or DATABASE_URL is required (or database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);
        let db_pool_size = vars.parsed("AQI_DB_POOL_SIZE")?.unwrap_or(2);
        let collection = vars
            .optional("AQI_COLLECTION")
            .or_else(|| non_empty(overrides.collection.as_deref()))
            .unwrap_or_else(|| "city_data".to_string());

        let sites = match vars.optional("AQI_SITES") {
            Some(raw) => parse_sites_json(&raw).context("invalid AQI_SITES")?,
            None => match overrides.sites {
                Some(sites) => {
                    validate_sites(&sites).context("invalid sites in setup config")?;
                    sites
                }
                None => default_sites(),
            },
        };

        let max_retries = vars
            .parsed::<u32>("AQI_MAX_RETRIES")?
            .or(overrides.max_retries)
            .unwrap_or(3)
            .max(1);
        let base_retry_delay_ms = vars.parsed("AQI_BASE_RETRY_DELAY_MS")?.unwrap_or(1000);
        let max_jitter_ms = vars.parsed("AQI_MAX_JITTER_MS")?.unwrap_or(500);
        let jitter_seed = vars.parsed("AQI_JITTER_SEED")?;

        let fetch_interval_secs = vars
            .parsed("AQI_FETCH_INTERVAL_SECS")?
            .or(overrides.fetch_interval_secs.filter(|v| *v != 0))
            .unwrap_or(540);
        if fetch_interval_secs == 0 {
            return Err(anyhow!("AQI_FETCH_INTERVAL_SECS must be greater than zero"));
        }
        let api_timeout_secs = vars
            .parsed("AQI_API_TIMEOUT_SECS")?
            .or(overrides.api_timeout_secs.filter(|v| *v != 0))
            .unwrap_or(20);
        if api_timeout_secs == 0 {
            return Err(anyhow!("AQI_API_TIMEOUT_SECS must be greater than zero"));
        }
        let daily_call_quota = vars
            .parsed("AQI_DAILY_CALL_QUOTA")?
            .or(overrides.daily_call_quota);

        let breaker_failure_threshold = vars.parsed("AQI_BREAKER_FAILURE_THRESHOLD")?.unwrap_or(3);
        let breaker_cooldown_secs = vars.parsed("AQI_BREAKER_COOLDOWN_SECS")?.unwrap_or(60);
        let breaker_half_open_trials = vars.parsed("AQI_BREAKER_HALF_OPEN_TRIALS")?.unwrap_or(5);
        let breaker_counts_interval_secs =
            vars.parsed("AQI_BREAKER_COUNTS_INTERVAL_SECS")?.unwrap_or(30);

        let queue_capacity = vars
            .parsed::<usize>("AQI_QUEUE_CAPACITY")?
            .or(overrides.queue_capacity.filter(|v| *v != 0))
            .unwrap_or_else(|| sites.len().saturating_mul(4).max(100));
        let write_timeout_secs = vars.parsed("AQI_WRITE_TIMEOUT_SECS")?.unwrap_or(5);
        if write_timeout_secs == 0 {
            return Err(anyhow!("AQI_WRITE_TIMEOUT_SECS must be greater than zero"));
        }
        let startup_ping_timeout_secs =
            vars.parsed("AQI_STARTUP_PING_TIMEOUT_SECS")?.unwrap_or(10);
        let shutdown_grace_secs = vars.parsed("AQI_SHUTDOWN_GRACE_SECS")?;
        let otlp_endpoint = vars.optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            api_key,
            base_url,
            database_url,
            db_pool_size,
            collection,
            sites,
            max_retries,
            base_retry_delay_ms,
            max_jitter_ms,
            jitter_seed,
            fetch_interval_secs,
            api_timeout_secs,
            daily_call_quota,
            breaker_failure_threshold,
            breaker_cooldown_secs,
            breaker_half_open_trials,
            breaker_counts_interval_secs,
            queue_capacity,
            write_timeout_secs,
            startup_ping_timeout_secs,
            shutdown_grace_secs,
            otlp_endpoint,
        })
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn startup_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_ping_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            name: "openweather".to_string(),
            failure_threshold: self.breaker_failure_threshold,
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            half_open_max_trials: self.breaker_half_open_trials,
            counts_interval: Some(Duration::from_secs(self.breaker_counts_interval_secs))
                .filter(|interval| !interval.is_zero()),
        }
    }

    /// Upper bound on how long shutdown waits for in-flight site units: one
    /// full retry budget unless set explicitly.
    pub fn shutdown_grace(&self) -> Duration {
        match self.shutdown_grace_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                let policy = self.retry_policy();
                (self.api_timeout() + policy.base_delay + policy.max_jitter)
                    * policy.max_attempts
            }
        }
    }

    /// Provider calls per day at the configured cadence, counting both legs of
    /// one attempt per site per tick.
    pub fn projected_daily_calls(&self) -> u64 {
        let ticks_per_day = SECONDS_PER_DAY.div_ceil(self.fetch_interval_secs.max(1));
        (self.sites.len() as u64)
            .saturating_mul(2)
            .saturating_mul(ticks_per_day)
    }

    pub fn exceeds_daily_quota(&self) -> bool {
        self.daily_call_quota
            .is_some_and(|quota| self.projected_daily_calls() > quota)
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
