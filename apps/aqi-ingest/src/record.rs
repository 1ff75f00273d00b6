use crate::sites::Site;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionsSample {
    pub temperature: f64,
    pub humidity: i32,
    pub wind_speed: f64,
    pub description: String,
}

/// Pollutant concentrations in μg/m³.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Concentrations {
    #[serde(default)]
    pub co: f64,
    #[serde(default)]
    pub no: f64,
    #[serde(default)]
    pub no2: f64,
    #[serde(default)]
    pub o3: f64,
    #[serde(default)]
    pub so2: f64,
    #[serde(default)]
    pub pm2_5: f64,
    #[serde(default)]
    pub pm10: f64,
    #[serde(default)]
    pub nh3: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollutionSample {
    /// Provider air quality index, 1 (good) to 5 (very poor).
    pub quality_index: i32,
    pub concentrations: Concentrations,
}

/// The stored document. `timestamp` is taken when both samples pass validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestedRecord {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature: f64,
    pub humidity: i32,
    pub wind_speed: f64,
    pub conditions: String,
    pub aqi: i32,
    #[serde(flatten)]
    pub concentrations: Concentrations,
    pub timestamp: DateTime<Utc>,
}

impl IngestedRecord {
    pub fn new(
        site: &Site,
        conditions: ConditionsSample,
        pollution: PollutionSample,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            city: site.name.clone(),
            latitude: site.latitude,
            longitude: site.longitude,
            temperature: conditions.temperature,
            humidity: conditions.humidity,
            wind_speed: conditions.wind_speed,
            conditions: conditions.description,
            aqi: pollution.quality_index,
            concentrations: pollution.concentrations,
            timestamp,
        }
    }

    pub fn document_id(&self) -> String {
        let payload = format!(
            "reading|{}|{}",
            self.city.trim().to_lowercase(),
            self.timestamp.timestamp_micros()
        );
        let digest = Sha256::digest(payload.as_bytes());
        let hex = format!("{digest:x}");
        hex.chars().take(24).collect()
    }
}
