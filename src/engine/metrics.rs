//! Engine run statistics.
//!
//! Collection is *opt-in* through the `statistics` option: the hot path
//! skips the clock entirely when it is off. The numbers exist to answer two
//! questions during grammar development: which rules burn the time, and
//! which rules actually fire.

use std::collections::HashMap;
use std::time::Duration;

use crate::RuleLine;

/// Match/fail counts and accumulated wall time for one rule.
#[derive(Debug, Default, Clone)]
pub struct RuleStats {
    /// Readings that passed both target and tests.
    pub matches: u64,
    /// Candidate readings or cohorts the rule bounced off.
    pub fails: u64,
    /// Total time spent applying the rule, tests included.
    pub total_time: Duration,
}

/// Aggregated statistics for an applicator's lifetime.
#[derive(Debug, Default, Clone)]
pub struct ApplyMetrics {
    /// Windows fully processed.
    pub windows: u64,
    /// Section passes executed, fixpoint re-runs included.
    pub passes: u64,
    /// Reading-level memo cache hits and misses.
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rules: HashMap<RuleLine, RuleStats>,
}

impl ApplyMetrics {
    pub(crate) fn rule_mut(&mut self, line: RuleLine) -> &mut RuleStats {
        self.rules.entry(line).or_default()
    }
}
