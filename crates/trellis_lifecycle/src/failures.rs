use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use trellis_plugin::Plugin;

/// Number of unload failures retained before the oldest is evicted.
pub const UNLOAD_FAILURE_CAPACITY: usize = 100;

/// A plugin that did not unload cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadFailureRecord {
    /// Plugin name.
    pub plugin_name: String,
    /// Plugin ID.
    pub plugin_id: String,
    /// When the failure was recorded.
    pub failure_time: DateTime<Utc>,
    /// Rendered stop failure, if stop failed.
    pub stop_error: Option<String>,
    /// Rendered cleanup failure, if cleanup failed.
    pub cleanup_error: Option<String>,
    /// Retries attempted so far. Always zero: failed unloads are not retried.
    pub retry_count: u32,
}

impl UnloadFailureRecord {
    pub(crate) fn new(
        plugin: &dyn Plugin,
        stop_error: Option<String>,
        cleanup_error: Option<String>,
    ) -> Self {
        Self {
            plugin_name: plugin.name().to_owned(),
            plugin_id: plugin.id().to_owned(),
            failure_time: Utc::now(),
            stop_error,
            cleanup_error,
            retry_count: 0,
        }
    }
}

/// Bounded FIFO log of unload failures, safe to share between orchestrators.
#[derive(Debug)]
pub struct UnloadFailureLog {
    records: Mutex<VecDeque<UnloadFailureRecord>>,
    capacity: usize,
}

impl Default for UnloadFailureLog {
    fn default() -> Self {
        Self::new(UNLOAD_FAILURE_CAPACITY)
    }
}

impl UnloadFailureLog {
    /// Creates a log holding at most `capacity` records (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends `record`, evicting the oldest entry when full.
    pub fn record(&self, record: UnloadFailureRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Returns the retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UnloadFailureRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Drops every record.
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: usize) -> UnloadFailureRecord {
        UnloadFailureRecord {
            plugin_name: format!("P{id}"),
            plugin_id: format!("p{id}"),
            failure_time: Utc::now(),
            stop_error: Some("stuck".into()),
            cleanup_error: None,
            retry_count: 0,
        }
    }

    #[test]
    fn evicts_oldest_first() {
        let log = UnloadFailureLog::default();
        for id in 0..UNLOAD_FAILURE_CAPACITY + 5 {
            log.record(record(id));
        }
        let records = log.snapshot();
        assert_eq!(records.len(), UNLOAD_FAILURE_CAPACITY);
        assert_eq!(records[0].plugin_id, "p5");
        assert_eq!(records.last().unwrap().plugin_id, "p104");
    }

    #[test]
    fn clear_empties() {
        let log = UnloadFailureLog::new(2);
        log.record(record(1));
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn records_serialize() {
        let json = serde_json::to_value(record(7)).unwrap();
        assert_eq!(json["plugin_id"], "p7");
        assert_eq!(json["retry_count"], 0);
        assert!(json["cleanup_error"].is_null());
    }
}
