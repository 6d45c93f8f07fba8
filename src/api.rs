//! Public entry points.
//!
//! An [`Applicator`] binds a compiled [`Grammar`] to the mutable engine
//! state (memo caches, variables, statistics) and processes windows one at
//! a time. The adapter in [`crate::stream`] drives it from a JSONL stream;
//! library users can also assemble [`Window`]s directly and call
//! [`Applicator::run_grammar_on_window`].

use std::collections::BTreeSet;

use crate::engine::{self, ApplyMetrics, MatchState};
use crate::grammar::Grammar;
use crate::window::{Cohort, Window};
use crate::RuleLine;

/// Engine configuration. Everything defaults to the common streaming setup.
#[derive(Debug, Clone)]
pub struct Options {
    /// Allow MAP/ADD/REPLACE rules.
    pub apply_mappings: bool,
    /// Allow SUBSTITUTE/APPEND rules.
    pub apply_corrections: bool,
    /// Permit REMOVE to strip the last reading unless the rule says SAFE.
    pub unsafe_mode: bool,
    /// Record rule lines on readings and emit them on output.
    pub trace: bool,
    /// Accumulate per-rule timing and match counts.
    pub statistics: bool,
    /// Sliding-buffer depth: how many past/future windows stay reachable
    /// for spanning tests.
    pub num_windows: u32,
    /// Cohort count after which a soft delimiter may break the window.
    pub soft_limit: u32,
    /// Cohort count at which the window is broken unconditionally.
    pub hard_limit: u32,
    /// Iteration cap per section; 0 means iterate to fixpoint unbounded.
    pub section_max_count: u32,
    /// Break windows when dependency self-ids restart.
    pub dep_delimit: bool,
    /// Emit input dependency ids untouched instead of engine-assigned ones.
    pub dep_original: bool,
    /// Parse and emit relation tags.
    pub has_relations: bool,
    /// Keep sentence end tags in output.
    pub show_end_tags: bool,
    /// Drop duplicate tags when serializing readings.
    pub unique_tags: bool,
    pub no_before_sections: bool,
    pub no_sections: bool,
    pub no_after_sections: bool,
    /// Forbid scans from passing the rule's own cohort.
    pub no_pass_origin: bool,
    /// Give readingless cohorts a magic wordform reading.
    pub allow_magic_readings: bool,
    /// When set, only rules on these lines may fire.
    pub valid_rules: Option<BTreeSet<RuleLine>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            apply_mappings: true,
            apply_corrections: true,
            unsafe_mode: false,
            trace: false,
            statistics: false,
            num_windows: 2,
            soft_limit: 300,
            hard_limit: 500,
            section_max_count: 0,
            dep_delimit: false,
            dep_original: false,
            has_relations: false,
            show_end_tags: false,
            unique_tags: false,
            no_before_sections: false,
            no_sections: false,
            no_after_sections: false,
            no_pass_origin: false,
            allow_magic_readings: true,
            valid_rules: None,
        }
    }
}

/// A grammar bound to its runtime state.
pub struct Applicator {
    grammar: Grammar,
    options: Options,
    pub(crate) state: MatchState,
    pub(crate) metrics: ApplyMetrics,
}

impl Applicator {
    pub fn new(grammar: Grammar, options: Options) -> Self {
        Applicator { grammar, options, state: MatchState::new(), metrics: ApplyMetrics::default() }
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub(crate) fn grammar_mut(&mut self) -> &mut Grammar {
        &mut self.grammar
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn metrics(&self) -> &ApplyMetrics {
        &self.metrics
    }

    /// A window buffer sized to this applicator's options.
    pub fn new_window(&self) -> Window {
        Window::new(self.options.num_windows)
    }

    /// Run the whole grammar on the buffer's current window, in place.
    pub fn run_grammar_on_window(&mut self, window: &mut Window) {
        let Applicator { grammar, options, state, metrics } = self;
        engine::run_grammar_on_window(grammar, options, state, metrics, window);
        metrics.cache_hits = state.cache_hits;
        metrics.cache_misses = state.cache_misses;
    }

    /// Set an engine-global variable (stream `SETVAR`). Cached verdicts for
    /// `VAR:` probes are dropped.
    pub fn set_variable(&mut self, name: &str, value: &str) {
        self.state.variables.insert(name.to_string(), value.to_string());
        self.state.reset_indexes();
    }

    /// Clear an engine-global variable (stream `REMVAR`).
    pub fn rem_variable(&mut self, name: &str) {
        if self.state.variables.shift_remove(name).is_some() {
            self.state.reset_indexes();
        }
    }

    /// Drop the reading-derived caches. The adapter calls this periodically
    /// so a long stream cannot accumulate stale hashes forever.
    pub fn reset_indexes(&mut self) {
        self.state.reset_indexes();
    }

    /// Does `cohort` match the grammar's (soft) delimiter set? Used by
    /// adapters to decide window breaks.
    pub(crate) fn matches_delimiter(&mut self, cohort: &Cohort, soft: bool) -> bool {
        let set = if soft { self.grammar.soft_delimiters() } else { self.grammar.delimiters() };
        let Some(set) = set else { return false };
        let vars = indexmap::IndexMap::new();
        engine::cohort_matches_normal(&self.grammar, &mut self.state, &vars, cohort, set)
    }
}
