use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::{Error, Result};

/// How long form data survives a trip through sign-in
pub fn default_ttl() -> Duration {
    Duration::minutes(5)
}

#[derive(Debug, Clone)]
struct PreservedForm {
    data: Value,
    saved_at: DateTime<Utc>,
}

/// Form data saved when a request needed re-authentication, keyed by user.
///
/// Entries are handed back at most once and only within the TTL.
#[derive(Debug)]
pub struct PreservedForms {
    ttl: Duration,
    entries: Mutex<HashMap<String, PreservedForm>>,
}

impl Default for PreservedForms {
    fn default() -> Self {
        Self::new(default_ttl())
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::StorageError("preserved form lock poisoned".to_string())
}

impl PreservedForms {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn preserve(&self, key: &str, data: Value) -> Result<()> {
        self.preserve_at(key, data, Utc::now())
    }

    fn preserve_at(&self, key: &str, data: Value, now: DateTime<Utc>) -> Result<()> {
        self.entries.lock().map_err(poisoned)?.insert(
            key.to_string(),
            PreservedForm {
                data,
                saved_at: now,
            },
        );
        Ok(())
    }

    /// Removes and returns the entry if it has not expired
    pub fn take(&self, key: &str) -> Result<Option<Value>> {
        self.take_at(key, Utc::now())
    }

    fn take_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Value>> {
        let entry = self.entries.lock().map_err(poisoned)?.remove(key);
        Ok(entry
            .filter(|form| now - form.saved_at <= self.ttl)
            .map(|form| form.data))
    }

    /// Drops expired entries, returning how many were removed
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, form| now - form.saved_at <= self.ttl);
        Ok(before - entries.len())
    }
}
