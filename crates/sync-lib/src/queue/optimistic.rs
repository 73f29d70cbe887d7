//! Optimistic updates applied before the backend confirms them

use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

struct UpdateRecord {
    created_at: DateTime<Utc>,
    rollback: Box<dyn FnOnce() + Send>,
    commit: Box<dyn FnOnce() -> Result<()> + Send>,
}

/// Registry of outstanding optimistic updates.
///
/// Each record fires exactly one of its callbacks: `commit` on confirmation,
/// or `rollback` on failure. A commit that fails triggers the rollback.
#[derive(Default)]
pub struct OptimisticUpdates {
    records: Mutex<HashMap<String, UpdateRecord>>,
}

impl OptimisticUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an update whose optimistic value the caller has already applied.
    ///
    /// `rollback` receives `original` to restore; `commit` receives `optimistic`.
    /// Registering an id that is still outstanding rolls the older record back.
    pub fn create<T, R, C>(&self, id: &str, original: T, optimistic: T, rollback: R, commit: C)
    where
        T: Send + 'static,
        R: FnOnce(T) + Send + 'static,
        C: FnOnce(T) -> Result<()> + Send + 'static,
    {
        let record = UpdateRecord {
            created_at: Utc::now(),
            rollback: Box::new(move || rollback(original)),
            commit: Box::new(move || commit(optimistic)),
        };

        let replaced = self.records.lock().insert(id.to_string(), record);
        if let Some(previous) = replaced {
            warn!(update_id = %id, "Replacing outstanding optimistic update, rolling back previous");
            (previous.rollback)();
        }
        debug!(update_id = %id, "Optimistic update created");
    }

    /// Confirm an update. Returns `Ok(false)` for unknown ids.
    ///
    /// If `commit` fails the update is rolled back and the error returned.
    pub fn commit(&self, id: &str) -> Result<bool> {
        let Some(record) = self.records.lock().remove(id) else {
            return Ok(false);
        };
        match (record.commit)() {
            Ok(()) => {
                debug!(update_id = %id, "Optimistic update committed");
                Ok(true)
            }
            Err(e) => {
                warn!(update_id = %id, error = %e, "Commit failed, rolling back optimistic update");
                (record.rollback)();
                Err(e)
            }
        }
    }

    /// Restore the original value. Returns false for unknown ids.
    pub fn rollback(&self, id: &str) -> bool {
        let Some(record) = self.records.lock().remove(id) else {
            return false;
        };
        (record.rollback)();
        debug!(update_id = %id, "Optimistic update rolled back");
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().contains_key(id)
    }

    pub fn pending(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut pending: Vec<(String, DateTime<Utc>)> = self
            .records
            .lock()
            .iter()
            .map(|(id, record)| (id.clone(), record.created_at))
            .collect();
        pending.sort_by(|a, b| a.1.cmp(&b.1));
        pending
    }
}
