use crate::error::IngestError;
use crate::record::{Concentrations, ConditionsSample, PollutionSample};
use crate::sites::Coordinates;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use tokio::time::Instant;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

/// Single-attempt access to the remote provider. Each call gives up at `deadline`.
pub trait WeatherProvider: Send + Sync + 'static {
    fn fetch_conditions(
        &self,
        coordinates: Coordinates,
        deadline: Instant,
    ) -> impl Future<Output = Result<ConditionsSample, IngestError>> + Send;

    fn fetch_pollution(
        &self,
        coordinates: Coordinates,
        deadline: Instant,
    ) -> impl Future<Output = Result<PollutionSample, IngestError>> + Send;
}

#[derive(Debug, Deserialize)]
struct CurrentWeatherResponse {
    main: CurrentWeatherMain,
    #[serde(default)]
    wind: CurrentWeatherWind,
    #[serde(default)]
    weather: Vec<CurrentWeatherDescription>,
}

#[derive(Debug, Deserialize)]
struct CurrentWeatherMain {
    temp: f64,
    humidity: i32,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentWeatherWind {
    #[serde(default)]
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct CurrentWeatherDescription {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct AirPollutionResponse {
    #[serde(default)]
    list: Vec<AirPollutionEntry>,
}

#[derive(Debug, Deserialize)]
struct AirPollutionEntry {
    main: AirPollutionMain,
    #[serde(default)]
    components: Concentrations,
}

#[derive(Debug, Deserialize)]
struct AirPollutionMain {
    aqi: i32,
}

#[derive(Clone)]
pub struct OpenWeatherClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl OpenWeatherClient {
    pub fn new(http: Client, api_key: impl Into<String>, base_url: &str) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        label: &str,
        path: &str,
        query: &[(&str, String)],
        deadline: Instant,
    ) -> Result<T, IngestError> {
        let url = format!("{}{}", self.base_url, path);
        let request = async {
            let response = self
                .http
                .get(&url)
                .query(query)
                .send()
                .await
                .map_err(|err| IngestError::Transport(format!("{label} request failed: {err}")))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|err| IngestError::Transport(format!("{label} body read failed: {err}")))?;
            if !status.is_success() {
                return Err(IngestError::Provider {
                    status: Some(status.as_u16()),
                    detail: format!("{label} response: {body}"),
                });
            }
            serde_json::from_str::<T>(&body)
                .map_err(|err| IngestError::provider(format!("{label} decode failed: {err}")))
        };

        match tokio::time::timeout_at(deadline, request).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Transport(format!(
                "{label} request exceeded its deadline"
            ))),
        }
    }

    fn location_query(&self, coordinates: Coordinates) -> Vec<(&'static str, String)> {
        vec![
            ("lat", format!("{:.6}", coordinates.latitude)),
            ("lon", format!("{:.6}", coordinates.longitude)),
            ("appid", self.api_key.clone()),
        ]
    }
}

impl WeatherProvider for OpenWeatherClient {
    async fn fetch_conditions(
        &self,
        coordinates: Coordinates,
        deadline: Instant,
    ) -> Result<ConditionsSample, IngestError> {
        let mut query = self.location_query(coordinates);
        query.push(("units", "metric".to_string()));
        let payload: CurrentWeatherResponse = self
            .get_json("conditions", "/data/2.5/weather", &query, deadline)
            .await?;

        Ok(ConditionsSample {
            temperature: payload.main.temp,
            humidity: payload.main.humidity,
            wind_speed: payload.wind.speed,
            description: payload
                .weather
                .into_iter()
                .next()
                .map(|entry| entry.description)
                .unwrap_or_default(),
        })
    }

    async fn fetch_pollution(
        &self,
        coordinates: Coordinates,
        deadline: Instant,
    ) -> Result<PollutionSample, IngestError> {
        let query = self.location_query(coordinates);
        let payload: AirPollutionResponse = self
            .get_json("pollution", "/data/2.5/air_pollution", &query, deadline)
            .await?;

        let entry = payload
            .list
            .into_iter()
            .next()
            .ok_or_else(|| IngestError::provider("pollution response contained no entries"))?;
        Ok(PollutionSample {
            quality_index: entry.main.aqi,
            concentrations: entry.components,
        })
    }
}
