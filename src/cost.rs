//! Token and dollar accounting with advisory admission checks.
//!
//! The [`CostMonitor`] never blocks anything on its own. Callers ask
//! [`CostMonitor::will_exceed`] before committing spend and then report the
//! actual spend with [`CostMonitor::record`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Spending limits for one project.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub token_budget: u64,
    pub dollar_budget: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            token_budget: 100_000,
            dollar_budget: 50.0,
        }
    }
}

/// One additive usage entry, as handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub project_id: String,
    pub agent_id: String,
    pub tokens: u64,
    pub dollars: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub tokens: u64,
    pub dollars: f64,
}

#[derive(Debug, Clone, Default)]
struct UsageLedger {
    tokens_used: u64,
    dollars_used: f64,
    by_agent: BTreeMap<String, AgentUsage>,
}

/// Read-only snapshot of a project's usage against its budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    pub project_id: String,
    pub tokens_used: u64,
    pub dollars_used: f64,
    pub token_budget: u64,
    pub dollar_budget: f64,
    pub tokens_remaining: u64,
    pub by_agent: BTreeMap<String, AgentUsage>,
}

#[derive(Debug, Clone, Default)]
pub struct CostMonitor {
    default_budget: Budget,
    budgets: HashMap<String, Budget>,
    ledgers: HashMap<String, UsageLedger>,
}

impl CostMonitor {
    pub fn new(default_budget: Budget) -> Self {
        Self {
            default_budget,
            budgets: HashMap::new(),
            ledgers: HashMap::new(),
        }
    }

    pub fn with_token_budget(token_budget: u64) -> Self {
        Self::new(Budget {
            token_budget,
            ..Budget::default()
        })
    }

    /// Override the default budget for one project.
    pub fn set_budget(&mut self, project_id: &str, budget: Budget) {
        self.budgets.insert(project_id.to_string(), budget);
    }

    pub fn budget(&self, project_id: &str) -> Budget {
        self.budgets
            .get(project_id)
            .copied()
            .unwrap_or(self.default_budget)
    }

    /// Add usage. Counters only grow: negative or non-finite dollar amounts
    /// are ignored and token counts saturate.
    pub fn record(&mut self, project_id: &str, agent_id: &str, tokens: u64, dollars: f64) -> CostRecord {
        let dollars = if dollars.is_finite() && dollars > 0.0 { dollars } else { 0.0 };

        let ledger = self.ledgers.entry(project_id.to_string()).or_default();
        ledger.tokens_used = ledger.tokens_used.saturating_add(tokens);
        ledger.dollars_used += dollars;

        let agent = ledger.by_agent.entry(agent_id.to_string()).or_default();
        agent.tokens = agent.tokens.saturating_add(tokens);
        agent.dollars += dollars;

        CostRecord {
            project_id: project_id.to_string(),
            agent_id: agent_id.to_string(),
            tokens,
            dollars,
            recorded_at: Utc::now(),
        }
    }

    pub fn used_tokens(&self, project_id: &str) -> u64 {
        self.ledgers.get(project_id).map_or(0, |l| l.tokens_used)
    }

    /// True iff `used + est_tokens > token_budget`. Dollars are not checked here.
    pub fn will_exceed(&self, project_id: &str, est_tokens: u64) -> bool {
        self.used_tokens(project_id).saturating_add(est_tokens) > self.budget(project_id).token_budget
    }

    /// Dollar-level counterpart of [`CostMonitor::will_exceed`].
    pub fn will_exceed_dollars(&self, project_id: &str, est_dollars: f64) -> bool {
        let used = self.ledgers.get(project_id).map_or(0.0, |l| l.dollars_used);
        used + est_dollars.max(0.0) > self.budget(project_id).dollar_budget
    }

    pub fn report(&self, project_id: &str) -> CostReport {
        let budget = self.budget(project_id);
        let ledger = self.ledgers.get(project_id).cloned().unwrap_or_default();
        CostReport {
            project_id: project_id.to_string(),
            tokens_used: ledger.tokens_used,
            dollars_used: ledger.dollars_used,
            token_budget: budget.token_budget,
            dollar_budget: budget.dollar_budget,
            tokens_remaining: budget.token_budget.saturating_sub(ledger.tokens_used),
            by_agent: ledger.by_agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(token_budget: u64, dollar_budget: f64) -> CostMonitor {
        CostMonitor::new(Budget {
            token_budget,
            dollar_budget,
        })
    }

    #[test]
    fn record_and_report() {
        let mut cm = monitor(100, 10.0);
        cm.record("p1", "a1", 10, 1.0);
        cm.record("p1", "a2", 20, 2.0);

        let report = cm.report("p1");
        assert_eq!(report.tokens_used, 30);
        assert!((report.dollars_used - 3.0).abs() < 1e-9);
        assert_eq!(report.token_budget, 100);
        assert_eq!(report.dollar_budget, 10.0);
        assert_eq!(report.tokens_remaining, 70);
        assert_eq!(report.by_agent["a2"].tokens, 20);
    }

    #[test]
    fn will_exceed_is_strictly_greater_than_budget() {
        let mut cm = CostMonitor::with_token_budget(100);
        cm.record("p1", "agent", 40, 0.5);
        assert!(!cm.will_exceed("p1", 50));
        assert!(!cm.will_exceed("p1", 60));
        assert!(cm.will_exceed("p1", 65));
    }

    #[test]
    fn record_order_does_not_matter() {
        let mut a = CostMonitor::default();
        a.record("p1", "x", 5, 0.25);
        a.record("p1", "y", 7, 0.5);
        let mut b = CostMonitor::default();
        b.record("p1", "y", 7, 0.5);
        b.record("p1", "x", 5, 0.25);
        assert_eq!(a.report("p1"), b.report("p1"));
    }

    #[test]
    fn counters_never_decrease() {
        let mut cm = CostMonitor::default();
        cm.record("p1", "a", 10, 1.0);
        cm.record("p1", "a", 0, -5.0);
        cm.record("p1", "a", u64::MAX, f64::NAN);
        let report = cm.report("p1");
        assert_eq!(report.tokens_used, u64::MAX);
        assert!((report.dollars_used - 1.0).abs() < 1e-9);
    }

    #[test]
    fn report_is_side_effect_free_for_unknown_project() {
        let cm = monitor(100, 1.0);
        let report = cm.report("ghost");
        assert_eq!(report.tokens_used, 0);
        assert_eq!(report.tokens_remaining, 100);
        assert_eq!(cm.used_tokens("ghost"), 0);
    }

    #[test]
    fn dollar_budget_is_not_part_of_token_check() {
        let mut cm = monitor(1_000, 1.0);
        cm.record("p1", "a", 10, 5.0);
        assert!(!cm.will_exceed("p1", 10));
        assert!(cm.will_exceed_dollars("p1", 0.0));
    }

    #[test]
    fn per_project_budget_overrides_default() {
        let mut cm = CostMonitor::with_token_budget(1_000);
        cm.set_budget(
            "tight",
            Budget {
                token_budget: 10,
                dollar_budget: 1.0,
            },
        );
        assert!(cm.will_exceed("tight", 11));
        assert!(!cm.will_exceed("other", 11));
    }
}
