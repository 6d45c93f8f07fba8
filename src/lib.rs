//! torvik: a Constraint Grammar rule engine.
//!
//! The crate applies a compiled Constraint Grammar to a stream of
//! morphologically analyzed tokens ("cohorts", each carrying candidate
//! "readings") and rewrites each sentence window in place: disambiguation
//! (SELECT/REMOVE/IFF), mapping (MAP/ADD/REPLACE), correction
//! (SUBSTITUTE/APPEND), window control (DELIMIT/REMCOHORT/MOVE/SWITCH),
//! dependency attachment (SETPARENT/SETCHILD), relation edits and window
//! variables. Sections of rules are iterated until a fixpoint is reached.
//!
//! Grammar compilation from source text is out of scope: grammars are built
//! programmatically through [`GrammarBuilder`]. The JSONL adapter
//! ([`run_jsonl`]) converts the wire format to and from the window model.

#[macro_use]
mod macros;

mod api;
mod engine;
mod grammar;
mod stream;
mod tags;
mod window;

pub use api::{Applicator, Options};
pub use engine::{ApplyMetrics, RuleStats};
pub use grammar::{
    ContextualTest, Grammar, GrammarBuilder, GrammarError, Rule, RuleFlags, RuleType, Section,
    Set, SetFlags, SetOp,
};
pub use stream::{run_jsonl, JsonlError};
pub use tags::{CompOp, CompositeId, NumericMatch, Tag, TagError, TagFlags, TagId, TagPool};
pub use window::{Cohort, CohortType, Reading, SingleWindow, Window};

// --- Identifiers ------------------------------------------------------------

/// Rules are identified by their grammar line number, which doubles as the
/// firing order within a section.
pub type RuleLine = u32;

/// Index of a set in its grammar's set arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetId(pub(crate) u32);

impl SetId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Sentinel for "cohort has no dependency parent".
pub const DEP_NO_PARENT: u32 = u32::MAX;
