//! Bounded in-memory log of slow queries.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::mpsc::Sender;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::plan::ExplainPlan;

/// Default slow-query threshold.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(100);
/// Default number of retained entries.
pub const DEFAULT_MAX_SLOW_QUERIES: usize = 1000;

/// A query that took at least the logger's threshold.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlowQuery {
    pub query: String,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub rows_affected: i64,
    /// Free-form tag naming the code path that ran the query.
    pub caller: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExplainPlan>,
}

impl SlowQuery {
    pub fn new(
        query: impl Into<String>,
        duration: Duration,
        rows_affected: i64,
        caller: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            duration,
            rows_affected,
            caller: caller.into(),
            timestamp: Utc::now(),
            plan: None,
        }
    }

    pub fn with_plan(mut self, plan: ExplainPlan) -> Self {
        self.plan = Some(plan);
        self
    }
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// FIFO ring of the most recent slow queries.
///
/// Entries below the threshold are ignored. When an event channel is
/// configured, each logged entry is also sent there; the send never blocks,
/// so a slow consumer cannot add latency to the query path.
#[derive(Debug)]
pub struct SlowQueryLogger {
    threshold: Duration,
    max_entries: usize,
    entries: RwLock<VecDeque<SlowQuery>>,
    events: Option<Sender<SlowQuery>>,
}

impl SlowQueryLogger {
    pub fn new(threshold: Duration, max_entries: usize) -> Self {
        Self {
            threshold,
            max_entries: max_entries.max(1),
            entries: RwLock::new(VecDeque::new()),
            events: None,
        }
    }

    /// Publishes every logged entry to `events`.
    pub fn with_events(mut self, events: Sender<SlowQuery>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Records `entry` if it is at least as slow as the threshold.
    ///
    /// Returns whether the entry was kept.
    pub fn log(&self, entry: SlowQuery) -> bool {
        if entry.duration < self.threshold {
            return false;
        }

        warn!(
            caller = %entry.caller,
            duration_ms = entry.duration.as_millis() as u64,
            rows = entry.rows_affected,
            query = %truncate(&entry.query, 200),
            "slow query"
        );

        let event = self.events.as_ref().map(|_| entry.clone());
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.push_back(entry);
            while entries.len() > self.max_entries {
                entries.pop_front();
            }
        }

        if let (Some(tx), Some(event)) = (self.events.as_ref(), event)
            && tx.send(event).is_err()
        {
            debug!("slow query receiver dropped");
        }
        true
    }

    /// Returns a copy of the retained entries, oldest first.
    pub fn queries(&self) -> Vec<SlowQuery> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for SlowQueryLogger {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_QUERY_THRESHOLD, DEFAULT_MAX_SLOW_QUERIES)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    fn q(ms: u64, tag: &str) -> SlowQuery {
        SlowQuery::new("SELECT 1", Duration::from_millis(ms), 1, tag)
    }

    #[test]
    fn ignores_entries_below_threshold() {
        let log = SlowQueryLogger::new(Duration::from_millis(100), 10);
        assert!(!log.log(q(99, "fast")));
        assert!(log.log(q(100, "edge")));
        assert_eq!(log.len(), 1);
        assert_eq!(log.queries()[0].caller, "edge");
    }

    #[test]
    fn evicts_oldest_first() {
        let log = SlowQueryLogger::new(Duration::ZERO, 3);
        for i in 0..5 {
            log.log(q(1, &format!("q{i}")));
        }
        let callers: Vec<_> = log.queries().into_iter().map(|e| e.caller).collect();
        assert_eq!(callers, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn queries_returns_a_copy() {
        let log = SlowQueryLogger::new(Duration::ZERO, 3);
        log.log(q(1, "a"));
        let snapshot = log.queries();
        log.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn publishes_kept_entries_only() {
        let (tx, rx) = mpsc::channel();
        let log = SlowQueryLogger::new(Duration::from_millis(50), 10).with_events(tx);
        log.log(q(10, "fast"));
        log.log(q(60, "slow"));
        let got: Vec<_> = rx.try_iter().map(|e| e.caller).collect();
        assert_eq!(got, vec!["slow"]);
    }

    #[test]
    fn dropped_receiver_does_not_fail_logging() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let log = SlowQueryLogger::new(Duration::ZERO, 10).with_events(tx);
        assert!(log.log(q(1, "a")));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn concurrent_logging_respects_capacity() {
        let log = Arc::new(SlowQueryLogger::new(Duration::ZERO, 50));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        log.log(q(1, &format!("t{t}-{i}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 50);
    }
}
