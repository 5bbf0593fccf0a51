//! Oscillation detection over committed transitions.
//!
//! Only exact `(from, to)` pair repeats are counted. Longer cycles such as
//! `A -> B -> C -> A` are not detected.

use std::collections::HashMap;

use serde::Serialize;

/// Default number of identical committed pairs that flags a deadlock.
pub const DEFAULT_THRESHOLD: usize = 3;

/// A committed `(from, to)` pair and how often it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepeatedPair {
    pub from_state: String,
    pub to_state: String,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct DeadlockDetector {
    threshold: usize,
    history: HashMap<String, Vec<(String, String)>>,
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl DeadlockDetector {
    /// A threshold of 0 is treated as 1.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            history: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn observe(&mut self, project_id: &str, from_state: &str, to_state: &str) {
        self.history
            .entry(project_id.to_string())
            .or_default()
            .push((from_state.to_string(), to_state.to_string()));
    }

    pub fn detect(&self, project_id: &str) -> bool {
        !self.repeated_pairs(project_id).is_empty()
    }

    /// Pairs whose count reached the threshold, most frequent first.
    pub fn repeated_pairs(&self, project_id: &str) -> Vec<RepeatedPair> {
        let Some(history) = self.history.get(project_id) else {
            return Vec::new();
        };

        let mut counts: HashMap<(&str, &str), usize> = HashMap::new();
        for (from, to) in history {
            *counts.entry((from.as_str(), to.as_str())).or_insert(0) += 1;
        }

        let mut repeated: Vec<RepeatedPair> = counts
            .into_iter()
            .filter(|&(_, count)| count >= self.threshold)
            .map(|((from, to), count)| RepeatedPair {
                from_state: from.to_string(),
                to_state: to.to_string(),
                count,
            })
            .collect();
        repeated.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.from_state.cmp(&b.from_state))
                .then_with(|| a.to_state.cmp(&b.to_state))
        });
        repeated
    }

    pub fn observed(&self, project_id: &str) -> usize {
        self.history.get(project_id).map_or(0, Vec::len)
    }

    /// Forget a project's window after an operator override.
    pub fn reset(&mut self, project_id: &str) {
        self.history.remove(project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_deadlock_initially() {
        let dd = DeadlockDetector::new(3);
        assert!(!dd.detect("p1"));
        assert!(dd.repeated_pairs("p1").is_empty());
    }

    #[test]
    fn deadlock_detected_at_threshold() {
        let mut dd = DeadlockDetector::new(2);
        dd.observe("p1", "A", "B");
        assert!(!dd.detect("p1"));
        dd.observe("p1", "A", "B");
        assert!(dd.detect("p1"));

        // Stays flagged as history grows.
        dd.observe("p1", "B", "A");
        dd.observe("p1", "A", "B");
        assert!(dd.detect("p1"));
    }

    #[test]
    fn different_pairs_do_not_contribute() {
        let mut dd = DeadlockDetector::new(2);
        dd.observe("p1", "A", "B");
        dd.observe("p1", "B", "C");
        assert!(!dd.detect("p1"));
        dd.observe("p1", "A", "B");
        assert!(dd.detect("p1"));
        assert_eq!(
            dd.repeated_pairs("p1"),
            vec![RepeatedPair {
                from_state: "A".into(),
                to_state: "B".into(),
                count: 2
            }]
        );
    }

    #[test]
    fn longer_cycles_are_not_flagged() {
        let mut dd = DeadlockDetector::new(2);
        for (from, to) in [("A", "B"), ("B", "C"), ("C", "A")] {
            dd.observe("p1", from, to);
        }
        assert!(!dd.detect("p1"));
    }

    #[test]
    fn projects_are_isolated() {
        let mut dd = DeadlockDetector::new(2);
        dd.observe("p1", "A", "B");
        dd.observe("p2", "A", "B");
        assert!(!dd.detect("p1"));
        assert!(!dd.detect("p2"));
    }

    #[test]
    fn default_threshold_is_three() {
        let mut dd = DeadlockDetector::default();
        assert_eq!(dd.threshold(), 3);
        dd.observe("p1", "A", "B");
        dd.observe("p1", "A", "B");
        assert!(!dd.detect("p1"));
        dd.observe("p1", "A", "B");
        assert!(dd.detect("p1"));
    }

    #[test]
    fn reset_clears_window() {
        let mut dd = DeadlockDetector::new(1);
        dd.observe("p1", "A", "B");
        assert!(dd.detect("p1"));
        dd.reset("p1");
        assert!(!dd.detect("p1"));
        assert_eq!(dd.observed("p1"), 0);
    }
}
