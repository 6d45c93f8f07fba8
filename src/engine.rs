//! Rule application engine.
//!
//! This module is the operational core of the crate. It is split into
//! focused submodules under `src/engine/` while keeping paths stable
//! (for example `crate::engine::run_grammar_on_window`).
//!
//! ## How the parts work together
//!
//! Processing one sentence window is a pipeline:
//!
//! ```text
//! grammar (compiled) ──┐
//!                      │  index_single_window        (indexes.rs)
//!                      └────────────┬───────────────
//!                                   │  possible_sets + rule_to_cohorts
//!                                   v
//!                     run_grammar_on_window (runner.rs)
//!                       - before sections once
//!                       - each section to fixpoint
//!                       - after sections once
//!                       - restart on DELIMIT
//!                                   │
//!             ┌─────────────────────┼──────────────────────┐
//!             v                     v                      v
//!      set matching          contextual tests         mutations
//!      (matcher.rs)           (context.rs)           (runner.rs)
//! ```
//!
//! The engine leans on **fixpoint iteration**: a section's rules are
//! re-applied until a pass changes nothing. Mutations are visible to later
//! rules in the same pass, and every reading mutation invalidates the memo
//! caches keyed on reading hashes.
//!
//! ## Responsibilities by module
//!
//! - `matcher.rs`: tag-against-reading and set-against-reading decisions,
//!   with the per-engine yes/no memo caches.
//! - `context.rs`: walks window positions and dependency edges to evaluate
//!   contextual tests, honoring scan modes, barriers, spans and negation.
//! - `runner.rs`: section scheduling, candidate iteration, and all rule
//!   mutations.
//! - `indexes.rs`: per-window candidate maps and their incremental updates.
//! - `metrics.rs`: opt-in per-rule statistics.
//!
//! ## Debugging
//!
//! Set `CG_DEBUG_RULES=1` to print rule activation and mutation traces.

#[path = "engine/context.rs"]
mod context;
#[path = "engine/indexes.rs"]
mod indexes;
#[path = "engine/matcher.rs"]
mod matcher;
#[path = "engine/metrics.rs"]
mod metrics;
#[path = "engine/runner.rs"]
mod runner;


pub use metrics::{ApplyMetrics, RuleStats};

pub(crate) use matcher::{cohort_matches_normal, MatchState};
pub(crate) use runner::run_grammar_on_window;

pub(crate) fn debug_rules() -> bool {
    std::env::var_os("CG_DEBUG_RULES").is_some()
}
