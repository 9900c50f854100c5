//! Analytics fact rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One statistical observation.
///
/// Immutable once written. Corrections arrive as new rows with a later
/// `ingested_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub dataset_id: String,
    pub territory_key: String,
    /// SDMX-style period: `2023`, `2023-05`, `2023-Q2`, `2023-05-17`, ...
    pub time_key: String,
    pub measure_key: String,
    pub value: Option<f64>,
    pub quality_score: Option<f64>,
    pub ingested_at: DateTime<Utc>,
}

impl Observation {
    /// Year component of the partition key, if `time_key` starts with one.
    pub fn year(&self) -> Option<i32> {
        period_year(&self.time_key)
    }

    /// `ingested_at` as microseconds since the Unix epoch (storage form).
    pub fn ingested_at_micros(&self) -> i64 {
        self.ingested_at.timestamp_micros()
    }
}

/// Observation as submitted for ingestion, before it is stamped with its
/// dataset and ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub territory_key: String,
    pub time_key: String,
    pub measure_key: String,
    pub value: Option<f64>,
    pub quality_score: Option<f64>,
}

impl ObservationRow {
    pub fn new(
        territory_key: impl Into<String>,
        time_key: impl Into<String>,
        measure_key: impl Into<String>,
        value: Option<f64>,
    ) -> Self {
        Self {
            territory_key: territory_key.into(),
            time_key: time_key.into(),
            measure_key: measure_key.into(),
            value,
            quality_score: None,
        }
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = Some(quality_score);
        self
    }

    pub fn into_observation(self, dataset_id: &str, ingested_at: DateTime<Utc>) -> Observation {
        Observation {
            dataset_id: dataset_id.to_string(),
            territory_key: self.territory_key,
            time_key: self.time_key,
            measure_key: self.measure_key,
            value: self.value,
            quality_score: self.quality_score,
            ingested_at,
        }
    }
}

/// Leading four-digit year of an SDMX period string.
///
/// Accepts a bare year or a year followed by `-` and a sub-period
/// (`2023-05`, `2023-Q2`, `2023-S1`, `2023-W12`, `2023-05-17`).
pub fn period_year(time_key: &str) -> Option<i32> {
    let key = time_key.trim();
    let bytes = key.as_bytes();
    if bytes.len() < 4 || !bytes[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    if bytes.len() > 4 && bytes[4] != b'-' {
        return None;
    }
    key[..4].parse().ok()
}

/// Rebuild a timestamp from its stored microsecond form.
pub fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}
