//! Core domain types for usagesync
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Observation** | One raw network request seen by the host runtime |
//! | **Scope** | The session a request came from (a tab, a window); debounce is per scope |
//! | **Dimension key** | The string counts are aggregated under; always a hostname |
//! | **Pending counts** | Per-host deltas not yet confirmed applied by the server |
//! | **Flush** | One `add` exchange carrying a snapshot of pending counts under one sequence number |
//! | **Sequence fencing** | The server only applies a flush whose seq is exactly its last applied seq + 1 |
//! | **Realignment** | Resetting the local seq to the server's view after a conflict |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::debug_log::DebugRecord;

/// Per-host deltas awaiting a confirmed flush. Never holds a zero value.
pub type PendingCounts = BTreeMap<String, u64>;

// ============================================
// Classification
// ============================================

/// Result of classifying a (method, URL) observation against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    /// Matches an allow predicate and no deny predicate
    Counted,
    /// Wrong method, unknown host, or no allow predicate matched
    NotAllowlisted,
    /// A deny predicate matched; allow rules were not consulted
    #[serde(rename = "host-deny")]
    HostDenied,
}

/// What happened to an observation, as recorded in the debug log.
///
/// Extends [`Verdict`] with `Debounced` for counted observations that the
/// debounce filter rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Counted,
    NotAllowlisted,
    #[serde(rename = "host-deny")]
    HostDenied,
    Debounced,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Counted => "counted",
            Decision::NotAllowlisted => "not-allowlisted",
            Decision::HostDenied => "host-deny",
            Decision::Debounced => "debounced",
        }
    }
}

impl From<Verdict> for Decision {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Counted => Decision::Counted,
            Verdict::NotAllowlisted => Decision::NotAllowlisted,
            Verdict::HostDenied => Decision::HostDenied,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Decision::from(*self).fmt(f)
    }
}

// ============================================
// Observations
// ============================================

/// A raw network request notification from the host runtime.
///
/// The feed only delivers requests for in-scope hosts; path filtering is the
/// classifier's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// HTTP method as reported by the runtime
    pub method: String,
    /// Full request URL
    pub url: String,
    /// Session scope (tab id, window id, ...)
    #[serde(default)]
    pub scope: String,
}

impl Observation {
    pub fn new(method: impl Into<String>, url: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            scope: scope.into(),
        }
    }
}

// ============================================
// Status
// ============================================

/// Local synchronization state exposed to collaborators (CLI, popup).
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Installation identity
    pub client_id: String,
    /// Last sequence number the server acknowledged
    pub seq: u64,
    /// Counts not yet confirmed applied
    pub pending: PendingCounts,
    /// Recent classification decisions, oldest first
    pub debug: Vec<DebugRecord>,
}

impl Status {
    /// Sum of all pending deltas
    pub fn pending_total(&self) -> u64 {
        self.pending.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_strings() {
        assert_eq!(Decision::from(Verdict::HostDenied).as_str(), "host-deny");
        assert_eq!(Verdict::NotAllowlisted.to_string(), "not-allowlisted");
        assert_eq!(
            serde_json::to_string(&Decision::Debounced).unwrap(),
            "\"debounced\""
        );
    }

    #[test]
    fn test_observation_scope_defaults_empty() {
        let obs: Observation =
            serde_json::from_str(r#"{"method":"POST","url":"https://t3.chat/api/chat"}"#).unwrap();
        assert_eq!(obs.scope, "");
    }
}
