use crate::error::IngestError;
use crate::record::{ConditionsSample, PollutionSample};

const MIN_TEMPERATURE_C: f64 = -50.0;
const MAX_TEMPERATURE_C: f64 = 70.0;
const MIN_AQI: i32 = 1;
const MAX_AQI: i32 = 5;

pub fn conditions_plausible(sample: Option<&ConditionsSample>) -> bool {
    let Some(sample) = sample else {
        return false;
    };
    sample.temperature > MIN_TEMPERATURE_C
        && sample.temperature < MAX_TEMPERATURE_C
        && (0..=100).contains(&sample.humidity)
        && sample.wind_speed >= 0.0
}

pub fn pollution_plausible(sample: Option<&PollutionSample>) -> bool {
    let Some(sample) = sample else {
        return false;
    };
    (MIN_AQI..=MAX_AQI).contains(&sample.quality_index)
}

/// Both samples must pass; the error describes every rejected sample.
pub fn check_pair(
    conditions: &ConditionsSample,
    pollution: &PollutionSample,
) -> Result<(), IngestError> {
    let mut rejected = Vec::new();
    if !conditions_plausible(Some(conditions)) {
        rejected.push(format!(
            "conditions temperature={} humidity={} wind_speed={}",
            conditions.temperature, conditions.humidity, conditions.wind_speed
        ));
    }
    if !pollution_plausible(Some(pollution)) {
        rejected.push(format!("pollution aqi={}", pollution.quality_index));
    }
    if rejected.is_empty() {
        Ok(())
    } else {
        Err(IngestError::Validation(rejected.join(", ")))
    }
}
