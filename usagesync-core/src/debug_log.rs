//! Bounded record of recent classification decisions, for human inspection.
//! The synchronization logic never reads it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Decision;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugRecord {
    pub ts: DateTime<Utc>,
    pub decision: Decision,
    pub method: String,
    pub scope: String,
    pub host: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ring buffer that drops the oldest record once full
#[derive(Debug)]
pub struct DebugLog {
    capacity: usize,
    records: VecDeque<DebugRecord>,
}

impl DebugLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, record: DebugRecord) {
        tracing::debug!(
            decision = %record.decision,
            method = %record.method,
            scope = %record.scope,
            host = %record.host,
            path = %record.path,
            reason = record.reason.as_deref().unwrap_or(""),
            "Classified observation"
        );

        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records oldest first
    pub fn records(&self) -> Vec<DebugRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str) -> DebugRecord {
        DebugRecord {
            ts: Utc::now(),
            decision: Decision::Counted,
            method: "POST".to_string(),
            scope: "tab-1".to_string(),
            host: "a.test".to_string(),
            path: path.to_string(),
            reason: None,
        }
    }

    #[test]
    fn test_oldest_records_are_dropped() {
        let mut log = DebugLog::new(3);
        for i in 0..5 {
            log.push(record(&format!("/{}", i)));
        }

        let paths: Vec<_> = log.records().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/2", "/3", "/4"]);
    }
}
