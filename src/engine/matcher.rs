//! Set and tag matching.
//!
//! The matcher answers one question: does this reading (or cohort) satisfy
//! this set? Everything else in the engine is built on that answer, so the
//! matcher carries the two performance devices the engine depends on:
//!
//! - A **negative prefilter**: for non-special sets, a reading that carries
//!   no tag indexed to the set cannot match, and is cached as a miss without
//!   evaluating the set expression.
//! - **Memo caches** keyed on the reading's content hash. A stale hash
//!   poisons these, which is why every mutation path reflows readings; the
//!   caches are dropped wholesale whenever a reading changes.
//!
//! Matching also has one side channel: a successful match through a mapping
//! tag records it in [`MatchState::last_mapping_tag`], which SELECT/REMOVE
//! use to narrow multi-mapped readings instead of deleting them.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::grammar::{Grammar, SetFlags, SetOp};
use crate::tags::{TagFlags, TagId};
use crate::window::{Cohort, Reading};
use crate::{RuleLine, SetId};

/// Mutable engine state threaded through matching and rule application:
/// memo caches, the per-rule scratch registers, and the engine-global
/// variable store.
#[derive(Debug, Default)]
pub(crate) struct MatchState {
    /// reading hash -> sets known to match it.
    pub(crate) index_reading_yes: HashMap<u64, HashSet<SetId>>,
    /// reading hash -> sets known not to match it.
    pub(crate) index_reading_no: HashMap<u64, HashSet<SetId>>,
    /// (rule, cohort) pairs that failed this section; skipped until a
    /// mutation invalidates the cache.
    pub(crate) rule_cohort_no: HashSet<(RuleLine, u32)>,
    /// (rule, cohort) pairs APPEND has already fired for.
    pub(crate) appended: HashSet<(RuleLine, u32)>,
    /// Engine-global variables (stream SETVAR/REMVAR).
    pub(crate) variables: IndexMap<String, String>,
    /// Mapping tag of the most recent successful tag match.
    pub(crate) last_mapping_tag: Option<TagId>,
    /// Unification state for SET_ISECT_U members, reset per rule-cohort.
    pub(crate) unif_sets: Option<HashSet<SetId>>,
    /// Cohorts a dependency-target search must skip (rejected attachments).
    pub(crate) dep_exclude: HashSet<u32>,
    /// Remembered position from a REMEMBERX rule (global number).
    pub(crate) mark: Option<u32>,
    /// The rule's own cohort; scans stop here under `no_pass_origin`.
    pub(crate) origin: Option<u32>,
    /// Per-rule test evaluation order; a failing test is hoisted to the
    /// front unless the rule pins order with KEEPORDER.
    pub(crate) test_order: HashMap<RuleLine, Vec<usize>>,
    /// Rules made runnable mid-pass by new tags; merged into the worklist.
    pub(crate) pending_rules: Vec<RuleLine>,
    /// Local positions of the re-inserted parenthesis span during enclosure
    /// phases.
    pub(crate) par_left: Option<u32>,
    pub(crate) par_right: Option<u32>,
    pub(crate) cache_hits: u64,
    pub(crate) cache_misses: u64,
}

impl MatchState {
    pub(crate) fn new() -> Self {
        MatchState::default()
    }

    /// Drop every reading-derived cache. Called after mutations and
    /// periodically between windows.
    pub(crate) fn reset_indexes(&mut self) {
        self.index_reading_yes.clear();
        self.index_reading_no.clear();
        self.rule_cohort_no.clear();
    }
}

/// Does `tag` match `reading`? Handles variable probes, numeric
/// comparisons, regex/case-folded textual tags and plain membership, then
/// applies NEGATIVE inversion and the FAILFAST veto.
pub(crate) fn tag_matches_reading(
    g: &Grammar,
    st: &mut MatchState,
    vars: &IndexMap<String, String>,
    reading: &Reading,
    tag_id: TagId,
) -> bool {
    let tag = g.pool().get(tag_id);

    let mut matched;
    if tag.is(TagFlags::VARIABLE) {
        let name = tag.text();
        matched = vars.contains_key(name) || st.variables.contains_key(name);
    } else if tag.is(TagFlags::NUMERICAL) && !reading.tags_numerical.is_empty() {
        matched = false;
        if let Some(want) = tag.numeric() {
            for &rid in &reading.tags_numerical {
                if let Some(have) = g.pool().get(rid).numeric() {
                    if want.key == have.key && want.op.compatible(want.value, have.op, have.value)
                    {
                        matched = true;
                        break;
                    }
                }
            }
        }
    } else if tag.regex().is_some() && !reading.tags_textual.is_empty() {
        matched = false;
        if let Some(re) = tag.regex() {
            for &rid in &reading.tags_textual {
                if re.is_match(g.pool().get(rid).text()) {
                    matched = true;
                    break;
                }
            }
        }
    } else {
        // a !X or ^X tag probes the reading for plain X
        matched = match g.pool().plain_of(tag_id) {
            Some(plain) => reading.tags.contains(&plain),
            None => false,
        };
    }

    if tag.is(TagFlags::NEGATIVE) {
        matched = !matched;
    }
    if !matched {
        return false;
    }
    if tag.is(TagFlags::MAPPING) {
        st.last_mapping_tag = Some(tag_id);
    }
    !tag.is(TagFlags::FAILFAST)
}

/// Does `set` match `reading`? Consults and fills the memo caches.
///
/// `bypass` skips the positive cache (but still records): it is used when
/// the caller needs the `last_mapping_tag` side effect recomputed, i.e.
/// whenever the set has mapping constituents.
pub(crate) fn set_matches_reading(
    g: &Grammar,
    st: &mut MatchState,
    vars: &IndexMap<String, String>,
    reading: &Reading,
    set_id: SetId,
    bypass: bool,
) -> bool {
    debug_assert!(reading.hash != 0, "reading must be reflowed before matching");

    let cacheable = reading.hash > 1;
    if cacheable {
        if !bypass {
            if let Some(sets) = st.index_reading_yes.get(&reading.hash) {
                if sets.contains(&set_id) {
                    st.cache_hits += 1;
                    return true;
                }
            }
        }
        if let Some(sets) = st.index_reading_no.get(&reading.hash) {
            if sets.contains(&set_id) {
                st.cache_hits += 1;
                return false;
            }
        }
    }
    st.cache_misses += 1;

    let set = g.set(set_id);

    // Prefilter: a non-special set can only match through a tag it indexes.
    if !set.is_special() {
        let possible = reading
            .tags_list
            .iter()
            .any(|t| g.sets_by_tag(*t).is_some_and(|sets| sets.contains(&set_id)));
        if !possible {
            if cacheable {
                st.index_reading_no.entry(reading.hash).or_default().insert(set_id);
            }
            return false;
        }
    }

    let retval = if set.flags.contains(SetFlags::MATCH_ANY) {
        true
    } else if set.sets.is_empty() {
        leaf_set_matches(g, st, vars, reading, set_id)
    } else {
        combined_set_matches(g, st, vars, reading, set_id, bypass)
    };

    if cacheable {
        if retval {
            st.index_reading_yes.entry(reading.hash).or_default().insert(set_id);
        } else {
            st.index_reading_no.entry(reading.hash).or_default().insert(set_id);
        }
    }
    retval
}

/// A leaf set: OR over single tags, then OR over composite conjunctions.
fn leaf_set_matches(
    g: &Grammar,
    st: &mut MatchState,
    vars: &IndexMap<String, String>,
    reading: &Reading,
    set_id: SetId,
) -> bool {
    let set = g.set(set_id);
    for &t in &set.single_tags {
        if tag_matches_reading(g, st, vars, reading, t) {
            return true;
        }
    }
    for &comp in &set.composites {
        let members = g.pool().composite(comp).tags();
        if members.iter().all(|&t| tag_matches_reading(g, st, vars, reading, t)) {
            if !g.pool().composite_has_mapping(comp) {
                st.last_mapping_tag = None;
            }
            return true;
        }
    }
    false
}

/// Ordered set combination: left-associative groups delimited by OR. The
/// first group to hold wins; FAILFAST inside a group that would otherwise
/// hold fails the whole set.
fn combined_set_matches(
    g: &Grammar,
    st: &mut MatchState,
    vars: &IndexMap<String, String>,
    reading: &Reading,
    set_id: SetId,
    bypass: bool,
) -> bool {
    let set = g.set(set_id);
    let members = &set.sets;
    let ops = &set.ops;
    let size = members.len();

    let mut i = 0;
    while i < size {
        let mut matched = set_matches_reading(g, st, vars, reading, members[i], bypass);
        let mut failfast = false;
        while i < size - 1 && ops[i] != SetOp::Or {
            let rhs = members[i + 1];
            match ops[i] {
                SetOp::Plus => {
                    if matched {
                        matched = set_matches_reading(g, st, vars, reading, rhs, bypass);
                    }
                }
                SetOp::IsectU => {
                    if matched {
                        matched = set_matches_reading(g, st, vars, reading, rhs, bypass);
                    }
                    if matched {
                        // unification: later evaluations must agree on the
                        // member that satisfied the intersection
                        match &st.unif_sets {
                            Some(prev) if !prev.contains(&rhs) => matched = false,
                            Some(_) => {}
                            None => st.unif_sets = Some(HashSet::from([rhs])),
                        }
                    }
                }
                SetOp::Failfast => {
                    if matched && set_matches_reading(g, st, vars, reading, rhs, bypass) {
                        matched = false;
                        failfast = true;
                    }
                }
                SetOp::Minus => {
                    if matched && set_matches_reading(g, st, vars, reading, rhs, bypass) {
                        matched = false;
                    }
                }
                SetOp::Not => {
                    matched =
                        !matched && !set_matches_reading(g, st, vars, reading, rhs, bypass);
                }
                SetOp::SymdiffU => {
                    let right = set_matches_reading(g, st, vars, reading, rhs, bypass);
                    matched = matched != right;
                }
                SetOp::Or => unreachable!("inner loop stops at OR"),
            }
            i += 1;
        }
        if matched {
            return true;
        }
        if failfast {
            return false;
        }
        i += 1;
    }
    false
}

/// Cohort-level wrapper: some non-deleted reading matches.
pub(crate) fn cohort_matches_normal(
    g: &Grammar,
    st: &mut MatchState,
    vars: &IndexMap<String, String>,
    cohort: &Cohort,
    set_id: SetId,
) -> bool {
    cohort
        .readings
        .iter()
        .filter(|r| !r.deleted)
        .any(|r| set_matches_reading(g, st, vars, r, set_id, false))
}

/// Careful wrapper: every non-deleted reading matches, and when the set has
/// mapping constituents, a reading satisfied through a mapping tag must not
/// carry more than one mapped tag.
pub(crate) fn cohort_matches_careful(
    g: &Grammar,
    st: &mut MatchState,
    vars: &IndexMap<String, String>,
    cohort: &Cohort,
    set_id: SetId,
) -> bool {
    let bypass = g.set(set_id).has_mappings();
    for reading in cohort.readings.iter().filter(|r| !r.deleted) {
        st.last_mapping_tag = None;
        if !set_matches_reading(g, st, vars, reading, set_id, bypass) {
            return false;
        }
        if st.last_mapping_tag.is_some() && reading.tags_mapped.len() > 1 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{GrammarBuilder, Rule, RuleType};
    use crate::window::Reading;

    struct Fixture {
        g: Grammar,
        st: MatchState,
        vars: IndexMap<String, String>,
    }

    impl Fixture {
        fn matches(&mut self, reading: &Reading, set: SetId) -> bool {
            set_matches_reading(&self.g, &mut self.st, &self.vars, reading, set, false)
        }
    }

    fn build(f: impl FnOnce(&mut GrammarBuilder) -> Vec<SetId>) -> (Fixture, Vec<SetId>) {
        let mut b = GrammarBuilder::new();
        let sets = f(&mut b);
        // grammars must have at least one rule; the matcher ignores it
        let t = b.list("__T", &["__t"]).unwrap();
        b.add(Rule::new(RuleType::Remove, t)).unwrap();
        let g = b.build().unwrap();
        (Fixture { g, st: MatchState::new(), vars: IndexMap::new() }, sets)
    }

    fn reading(g: &mut Grammar, tags: &[&str]) -> Reading {
        let ids: Vec<TagId> = tags.iter().map(|t| g.pool_mut().intern_input(t)).collect();
        Reading::with_tags(ids, g.pool())
    }

    #[test]
    fn single_and_composite_membership() {
        let (mut f, sets) = build(|b| {
            vec![b.list("NOMSG", &["A", "N Sg"]).unwrap()]
        });
        let r_a = reading(&mut f.g, &["A"]);
        let r_n = reading(&mut f.g, &["N"]);
        let r_nsg = reading(&mut f.g, &["N", "Sg"]);
        assert!(f.matches(&r_a, sets[0]));
        assert!(!f.matches(&r_n, sets[0]), "composite needs all constituents");
        assert!(f.matches(&r_nsg, sets[0]));
    }

    #[test]
    fn group_semantics_or_minus_failfast() {
        let (mut f, sets) = build(|b| {
            let n = b.list("N", &["N"]).unwrap();
            let sg = b.list("SG", &["Sg"]).unwrap();
            let v = b.list("V", &["V"]).unwrap();
            let minus = b.set("N-SG", &[n, sg], &[crate::grammar::SetOp::Minus]).unwrap();
            let or = b.set("N-OR-V", &[n, v], &[crate::grammar::SetOp::Or]).unwrap();
            let ff = b.set("N^SG", &[n, sg], &[crate::grammar::SetOp::Failfast]).unwrap();
            let ff_or =
                b.set("N^SG-OR-V", &[n, sg, v], &[crate::grammar::SetOp::Failfast, crate::grammar::SetOp::Or]).unwrap();
            vec![minus, or, ff, ff_or]
        });
        let n = reading(&mut f.g, &["N"]);
        let nsg = reading(&mut f.g, &["N", "Sg"]);
        let v = reading(&mut f.g, &["V"]);

        assert!(f.matches(&n, sets[0]));
        assert!(!f.matches(&nsg, sets[0]), "MINUS removes the right side");
        assert!(f.matches(&n, sets[1]));
        assert!(f.matches(&v, sets[1]));
        assert!(f.matches(&n, sets[2]));
        assert!(!f.matches(&nsg, sets[2]), "FAILFAST on both sides fails");
        // FAILFAST aborts later OR groups too
        assert!(!f.matches(&nsg, sets[3]));
        assert!(f.matches(&v, sets[3]));
    }

    #[test]
    fn not_group_requires_both_absent() {
        let (mut f, sets) = build(|b| {
            let a = b.list("A", &["A"]).unwrap();
            let c = b.list("C", &["C"]).unwrap();
            vec![b.set("NOT-AC", &[a, c], &[crate::grammar::SetOp::Not]).unwrap()]
        });
        let other = reading(&mut f.g, &["X"]);
        let has_a = reading(&mut f.g, &["A"]);
        let has_c = reading(&mut f.g, &["C"]);
        assert!(f.matches(&other, sets[0]));
        assert!(!f.matches(&has_a, sets[0]));
        assert!(!f.matches(&has_c, sets[0]));
    }

    #[test]
    fn negative_and_failfast_tags() {
        let (mut f, sets) = build(|b| {
            let neg = b.list("NOT-N", &["!N"]).unwrap();
            let ff = b.list("ANY-BUT-N", &["*", "^N"]).unwrap();
            vec![neg, ff]
        });
        let n = reading(&mut f.g, &["N"]);
        let v = reading(&mut f.g, &["V"]);
        assert!(!f.matches(&n, sets[0]));
        assert!(f.matches(&v, sets[0]));
        // ^N alone never matches; the reading matches through *
        assert!(f.matches(&v, sets[1]));
        assert!(f.matches(&n, sets[1]), "FAILFAST tag vetoes itself, * still matches");
    }

    #[test]
    fn negated_failfast_never_matches() {
        // !^X inverts first, then the failfast veto eats the remainder: the
        // tag can gate a set but never satisfy it
        let (mut f, sets) = build(|b| vec![b.list("ODD", &["!^X", "Y"]).unwrap()]);
        let has_x = reading(&mut f.g, &["X"]);
        let has_y = reading(&mut f.g, &["Y"]);
        let other = reading(&mut f.g, &["Z"]);
        assert!(!f.matches(&has_x, sets[0]));
        assert!(f.matches(&has_y, sets[0]), "Y still satisfies the set");
        assert!(!f.matches(&other, sets[0]));
    }

    #[test]
    fn match_any_set() {
        let (mut f, sets) = build(|b| vec![b.list("ANY", &["*"]).unwrap()]);
        let r = reading(&mut f.g, &["whatever"]);
        assert!(f.matches(&r, sets[0]));
    }

    #[test]
    fn numeric_tags_compare_by_interval() {
        let (mut f, sets) = build(|b| {
            vec![b.list("BIG", &["<w>10>"]).unwrap()]
        });
        let small = reading(&mut f.g, &["<w=5>"]);
        let big = reading(&mut f.g, &["<w=50>"]);
        let open = reading(&mut f.g, &["<w>3>"]);
        assert!(!f.matches(&small, sets[0]));
        assert!(f.matches(&big, sets[0]));
        assert!(f.matches(&open, sets[0]), ">10 and >3 intersect");
    }

    #[test]
    fn regex_tags_match_textual_tags() {
        let (mut f, sets) = build(|b| {
            vec![b.list("CATLIKE", &["\"ca.*\"r"]).unwrap()]
        });
        let cat = reading(&mut f.g, &["\"cat\""]);
        let dog = reading(&mut f.g, &["\"dog\""]);
        assert!(f.matches(&cat, sets[0]));
        assert!(!f.matches(&dog, sets[0]));
    }

    #[test]
    fn variable_tags_consult_both_stores() {
        let (mut f, sets) = build(|b| vec![b.list("HASV", &["VAR:mode"]).unwrap()]);
        let r = reading(&mut f.g, &["N"]);
        assert!(!f.matches(&r, sets[0]));
        f.st.variables.insert("mode".into(), "1".into());
        f.st.reset_indexes();
        assert!(f.matches(&r, sets[0]));
        f.st.variables.clear();
        f.st.reset_indexes();
        f.vars.insert("mode".into(), "x".into());
        assert!(f.matches(&r, sets[0]), "window variables count too");
    }

    #[test]
    fn caches_agree_with_fresh_computation() {
        let (mut f, sets) = build(|b| {
            let n = b.list("N", &["N"]).unwrap();
            let sg = b.list("SG", &["Sg"]).unwrap();
            vec![n, b.set("N-SG", &[n, sg], &[crate::grammar::SetOp::Minus]).unwrap()]
        });
        let readings = [
            reading(&mut f.g, &["N"]),
            reading(&mut f.g, &["N", "Sg"]),
            reading(&mut f.g, &["V"]),
        ];
        // populate
        for r in &readings {
            for &s in &sets {
                f.matches(r, s);
            }
        }
        // every cached verdict must agree with a cache-free recomputation
        for r in &readings {
            for &s in &sets {
                let cached = f.matches(r, s);
                let mut fresh = MatchState::new();
                let recomputed =
                    set_matches_reading(&f.g, &mut fresh, &f.vars, r, s, false);
                assert_eq!(cached, recomputed);
            }
        }
        assert!(f.st.cache_hits > 0);
    }

    #[test]
    fn careful_cohort_needs_all_readings() {
        let (mut f, sets) = build(|b| vec![b.list("N", &["N"]).unwrap()]);
        let wf = f.g.pool_mut().intern_input("\"<x>\"");
        let mut cohort = Cohort::new(wf, 1);
        let r1 = reading(&mut f.g, &["N"]);
        let r2 = reading(&mut f.g, &["N", "Sg"]);
        let r3 = reading(&mut f.g, &["V"]);
        cohort.append_reading(r1);
        cohort.append_reading(r2);
        assert!(cohort_matches_careful(&f.g, &mut f.st, &f.vars, &cohort, sets[0]));
        cohort.append_reading(r3);
        assert!(!cohort_matches_careful(&f.g, &mut f.st, &f.vars, &cohort, sets[0]));
        assert!(cohort_matches_normal(&f.g, &mut f.st, &f.vars, &cohort, sets[0]));
        // deleted readings do not count
        cohort.readings[2].deleted = true;
        assert!(cohort_matches_careful(&f.g, &mut f.st, &f.vars, &cohort, sets[0]));
    }

    #[test]
    fn mapping_tag_recording() {
        let (mut f, sets) = build(|b| vec![b.list("SUBJ", &["@SUBJ"]).unwrap()]);
        let r = reading(&mut f.g, &["N", "@SUBJ"]);
        f.st.last_mapping_tag = None;
        let hit = set_matches_reading(&f.g, &mut f.st, &f.vars, &r, sets[0], true);
        assert!(hit);
        assert!(f.st.last_mapping_tag.is_some());
    }
}
