//! Cancellation handle for batch fetches.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared between the caller and the batch workers.
///
/// Cancelling an id that already finished has no effect on its result. An
/// in-flight fetch notices cancellation before its next attempt.
#[derive(Debug, Default)]
pub struct BatchCancellation {
    all: AtomicBool,
    ids: Mutex<HashSet<String>>,
}

impl BatchCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel a single dataset id.
    pub fn cancel(&self, dataset_id: &str) {
        self.ids.lock().insert(dataset_id.to_string());
    }

    /// Cancel everything not yet finished.
    pub fn cancel_all(&self) {
        self.all.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self, dataset_id: &str) -> bool {
        self.all.load(Ordering::SeqCst) || self.ids.lock().contains(dataset_id)
    }
}
