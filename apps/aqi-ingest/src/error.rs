use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned {}: {detail}", status_label(.status))]
    Provider { status: Option<u16>, detail: String },
    #[error("implausible data: {0}")]
    Validation(String),
    #[error("fetch failed (conditions: {}; pollution: {})", leg(.conditions), leg(.pollution))]
    Fetch {
        conditions: Option<Box<IngestError>>,
        pollution: Option<Box<IngestError>>,
    },
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("circuit breaker half-open trial limit reached")]
    TooManyTrials,
    #[error("all {attempts} attempts failed for {site}: {last}")]
    RetriesExhausted {
        site: String,
        attempts: u32,
        last: Box<IngestError>,
    },
    #[error("persistence queue closed")]
    QueueClosed,
    #[error("sink write failed: {0}")]
    Sink(String),
}

impl IngestError {
    pub fn provider(detail: impl Into<String>) -> Self {
        Self::Provider {
            status: None,
            detail: detail.into(),
        }
    }

    /// True when the breaker refused the unit without running it.
    pub fn is_load_shedding(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::TooManyTrials)
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Sink(err.to_string())
    }
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "an unusable response".to_string(),
    }
}

fn leg(err: &Option<Box<IngestError>>) -> String {
    match err {
        Some(err) => err.to_string(),
        None => "ok".to_string(),
    }
}
