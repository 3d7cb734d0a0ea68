//! Per-observation debounce
//!
//! One logical user action often produces several identical requests (retries,
//! multiplexed streams). The filter admits the first observation for a
//! `(scope, host, path)` key and rejects repeats until `window` has elapsed
//! since that first admission. Rejections do not move the window.
//!
//! This is a heuristic. A duplicate that slips through (window of zero, a
//! restart, two processes) inflates the count by one; sequence fencing only
//! protects flushes, not individual observations.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Table size past which expired entries are pruned, at most once per window
const PRUNE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DebounceKey {
    scope: String,
    host: String,
    path: String,
}

/// Process-lifetime table of last admissions
#[derive(Debug)]
pub struct DebounceFilter {
    window: Duration,
    last_admitted: HashMap<DebounceKey, Instant>,
    last_prune: Option<Instant>,
}

impl DebounceFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_admitted: HashMap::new(),
            last_prune: None,
        }
    }

    /// Returns true if the observation should be counted
    pub fn admit(&mut self, scope: &str, host: &str, path: &str, now: Instant) -> bool {
        let key = DebounceKey {
            scope: scope.to_string(),
            host: host.to_string(),
            path: path.to_string(),
        };

        if let Some(last) = self.last_admitted.get(&key) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }

        if self.last_admitted.len() >= PRUNE_THRESHOLD && self.prune_due(now) {
            self.prune(now);
        }
        self.last_admitted.insert(key, now);
        true
    }

    /// Nothing can expire sooner than a window after the previous prune
    fn prune_due(&self, now: Instant) -> bool {
        match self.last_prune {
            Some(last) => now.saturating_duration_since(last) >= self.window,
            None => true,
        }
    }

    /// Drop entries whose window has already elapsed
    fn prune(&mut self, now: Instant) {
        self.last_prune = Some(now);
        let window = self.window;
        self.last_admitted
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.last_admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_admitted.is_empty()
    }
}
