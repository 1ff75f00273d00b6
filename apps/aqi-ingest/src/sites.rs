use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// A monitored site. Built once from configuration and shared read-only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Site {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Site {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

pub fn default_sites() -> Vec<Site> {
    vec![
        Site::new("Lahore", 31.5204, 74.3587),
        Site::new("Sheikhupura", 31.7167, 74.0000),
        Site::new("Kasur", 31.1167, 74.4500),
        Site::new("Amritsar", 31.6333, 74.8333),
        Site::new("Gujranwala", 32.1667, 74.1833),
        Site::new("Sialkot", 32.4833, 74.5333),
    ]
}

pub fn parse_sites_json(raw: &str) -> Result<Vec<Site>> {
    let mut bytes = raw.as_bytes().to_vec();
    let sites: Vec<Site> = simd_json::serde::from_slice(&mut bytes)
        .context("sites must be a JSON array of {name, latitude, longitude}")?;
    validate_sites(&sites)?;
    Ok(sites)
}

pub fn validate_sites(sites: &[Site]) -> Result<()> {
    if sites.is_empty() {
        return Err(anyhow!("site registry is empty"));
    }
    let mut seen = HashSet::new();
    for site in sites {
        let name = site.name.trim();
        if name.is_empty() {
            return Err(anyhow!("site name must not be empty"));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(anyhow!("duplicate site name {name}"));
        }
        if !(-90.0..=90.0).contains(&site.latitude) {
            return Err(anyhow!("site {name} has latitude {} outside [-90, 90]", site.latitude));
        }
        if !(-180.0..=180.0).contains(&site.longitude) {
            return Err(anyhow!(
                "site {name} has longitude {} outside [-180, 180]",
                site.longitude
            ));
        }
    }
    Ok(())
}
