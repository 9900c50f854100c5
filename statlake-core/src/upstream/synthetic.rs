//! Deterministic synthetic payloads, the last-resort offline fallback.
//!
//! Same id, same bytes: the RNG is seeded from BLAKE3 of the dataset id.
//! Every synthetic payload is tagged `"synthetic": true` in its body and is
//! always returned degraded.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const TERRITORIES: &[&str] = &["IT", "ITC", "ITF", "ITG", "ITH", "ITI"];
const YEARS: std::ops::RangeInclusive<i32> = 2018..=2023;

/// One generated observation as it appears in the synthetic body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticObservation {
    pub territory_key: String,
    pub time_key: String,
    pub measure_key: String,
    pub value: Option<f64>,
    pub quality_score: Option<f64>,
}

/// Body of a synthetic payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticDataset {
    pub dataset_id: String,
    pub synthetic: bool,
    pub observations: Vec<SyntheticObservation>,
}

/// Generate the synthetic dataset for `dataset_id`.
pub fn generate_synthetic(dataset_id: &str) -> SyntheticDataset {
    let seed: [u8; 32] = *blake3::hash(dataset_id.as_bytes()).as_bytes();
    let mut rng = StdRng::from_seed(seed);

    let measure = format!("{}_VALUE", dataset_id.to_ascii_uppercase());
    let mut observations = Vec::with_capacity(TERRITORIES.len() * YEARS.clone().count());
    let base: f64 = rng.gen_range(100.0..10_000.0);

    for territory in TERRITORIES {
        let mut level = base * rng.gen_range(0.5..1.5);
        for year in YEARS {
            level *= 1.0 + rng.gen_range(-0.05..0.05);
            // Roughly one in twenty cells is missing, as in real releases.
            let value = if rng.gen_bool(0.05) {
                None
            } else {
                Some((level * 100.0).round() / 100.0)
            };
            observations.push(SyntheticObservation {
                territory_key: (*territory).to_string(),
                time_key: year.to_string(),
                measure_key: measure.clone(),
                value,
                quality_score: Some((rng.gen_range(0.6..1.0_f64) * 1000.0).round() / 1000.0),
            });
        }
    }

    SyntheticDataset {
        dataset_id: dataset_id.to_string(),
        synthetic: true,
        observations,
    }
}

/// Synthetic dataset serialized to JSON bytes.
pub fn synthetic_body(dataset_id: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&generate_synthetic(dataset_id))
}
