//! Domain types shared by the upstream client and the stores.

pub mod dataset;
pub mod observation;
pub mod value;

pub use dataset::{DatasetCategory, DatasetId, DatasetStatus, InvalidDatasetId, MAX_DATASET_ID_LEN};
pub use observation::{micros_to_datetime, period_year, Observation, ObservationRow};
pub use value::SqlValue;
