use chrono::{DateTime, Utc};
use thiserror::Error;

/// Reasons a raw sample is rejected before statistics are computed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("sample has an empty {field}")]
    MissingField { field: &'static str },

    #[error("sample value {value} is not a finite number")]
    NonFinite { value: f64 },
}

/// One raw metric observation from the sample source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub server_id: String,
    pub metric_type: String,
    pub ts: DateTime<Utc>,
    pub value: f64,
}

impl RawSample {
    /// Creates a raw sample.
    pub fn new(
        server_id: impl Into<String>,
        metric_type: impl Into<String>,
        ts: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            metric_type: metric_type.into(),
            ts,
            value,
        }
    }

    /// Checks that the sample can take part in aggregation.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.server_id.is_empty() {
            return Err(SampleError::MissingField { field: "server_id" });
        }
        if self.metric_type.is_empty() {
            return Err(SampleError::MissingField {
                field: "metric_type",
            });
        }
        if !self.value.is_finite() {
            return Err(SampleError::NonFinite { value: self.value });
        }
        Ok(())
    }
}

/// Summary statistics for one `(server_id, metric_type, bin_end)` group.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub server_id: String,
    pub metric_type: String,
    pub bin_end: DateTime<Utc>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p80: f64,
    pub sample_count: u32,
}
