//! Rule running: section scheduling, candidate iteration, mutations.
//!
//! The scheduler runs `before_sections` once, then each numbered section to
//! a fixpoint (every pass re-runs all rules of sections `1..=k`), then
//! `after_sections` once. A DELIMIT anywhere restarts the whole schedule on
//! the shrunk current window; the split-off tail waits in the buffer.
//!
//! Within a pass, rules fire in ascending line order and each rule visits
//! its candidate cohorts in ascending position. Evaluation is two-phase per
//! cohort: first target and tests are decided against an immutable window,
//! then the mutation is applied. Mutations are immediately visible to the
//! rest of the pass.
//!
//! Candidate bookkeeping mirrors the indexes module: a cohort where no
//! reading even matches the target leaves the rule's candidate set for
//! good; a cohort that merely failed the tests goes into the negative
//! (rule, cohort) cache, which any reading mutation clears.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{info, warn};

use super::context::run_contextual_test;
use super::debug_rules;
use super::indexes::{index_single_window, update_valid_rules};
use super::matcher::{set_matches_reading, MatchState};
use super::metrics::ApplyMetrics;
use crate::api::Options;
use crate::grammar::{Grammar, Rule, RuleFlags, RuleType};
use crate::tags::{TagFlags, TagId};
use crate::window::{Cohort, CohortType, Enclosure, Reading, SingleWindow, Window};
use crate::{RuleLine, DEP_NO_PARENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Clean,
    Changed,
    Delimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOutcome {
    NoChange,
    Changed,
    Delimited,
}

/// Which enclosure phase the scheduler is in. ENCL_* rules only fire in
/// their phase; everything else is gated out of the final phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnclPhase {
    Normal,
    Reinsert,
    Final,
}

#[derive(Debug, Default, Clone, Copy)]
struct Decision {
    matched_target: bool,
    matched_tests: bool,
    mapping_tag: Option<TagId>,
}

/// Run the whole grammar on the buffer's current window.
pub(crate) fn run_grammar_on_window(
    g: &Grammar,
    opt: &Options,
    st: &mut MatchState,
    metrics: &mut ApplyMetrics,
    window: &mut Window,
) {
    if window.current().is_none() {
        return;
    }

    if g.has_enclosures() {
        if let Some(cur) = window.current_mut() {
            extract_enclosures(g, cur);
        }
    }

    run_schedule(g, opt, st, metrics, window, EnclPhase::Normal);

    if g.has_enclosures() {
        // Re-insert each parenthesized region and re-run with the span
        // position gates active.
        loop {
            let Some(cur) = window.current_mut() else { break };
            if cur.enclosures.is_empty() {
                break;
            }
            let Enclosure { at, cohorts } = cur.enclosures.remove(0);
            let at = at.min(cur.cohorts.len());
            let span = cohorts.len();
            for (k, mut cohort) in cohorts.into_iter().enumerate() {
                cohort.ctype.remove(CohortType::ENCLOSED);
                cur.cohorts.insert(at + k, cohort);
            }
            cur.renumber();
            st.par_left = Some(at as u32);
            st.par_right = Some((at + span).saturating_sub(1) as u32);
            run_schedule(g, opt, st, metrics, window, EnclPhase::Reinsert);
            st.par_left = None;
            st.par_right = None;
        }
        run_schedule(g, opt, st, metrics, window, EnclPhase::Final);
    }

    metrics.windows += 1;
}

/// before-sections once, sections to fixpoint, after-sections once;
/// restart from the top whenever a rule delimits.
fn run_schedule(
    g: &Grammar,
    opt: &Options,
    st: &mut MatchState,
    metrics: &mut ApplyMetrics,
    window: &mut Window,
    phase: EnclPhase,
) {
    'restart: loop {
        if let Some(cur) = window.current_mut() {
            index_single_window(g, cur);
        } else {
            return;
        }
        window.rebuild_cohort_map();

        if !opt.no_before_sections && !g.before_sections().is_empty() {
            let rv = run_rules(g, opt, st, metrics, window, g.before_sections(), phase);
            if rv == PassOutcome::Delimited {
                continue 'restart;
            }
        }

        if !opt.no_sections {
            for rules in g.runsections() {
                let mut iterations = 0u32;
                loop {
                    let rv = run_rules(g, opt, st, metrics, window, rules, phase);
                    metrics.passes += 1;
                    match rv {
                        PassOutcome::Delimited => continue 'restart,
                        PassOutcome::Changed => {
                            iterations += 1;
                            // 0 means unbounded
                            if opt.section_max_count > 0 && iterations >= opt.section_max_count {
                                break;
                            }
                            // the final enclosure phase fires its rules once
                            if phase == EnclPhase::Final {
                                break;
                            }
                        }
                        PassOutcome::Clean => break,
                    }
                }
            }
        }

        if !opt.no_after_sections && !g.after_sections().is_empty() {
            let rv = run_rules(g, opt, st, metrics, window, g.after_sections(), phase);
            if rv == PassOutcome::Delimited {
                continue 'restart;
            }
        }

        return;
    }
}

/// One pass: every rule of `rules` still considered valid for the window,
/// in line order. Rules made relevant mid-pass by new tags are merged into
/// the worklist when their line is still ahead.
fn run_rules(
    g: &Grammar,
    opt: &Options,
    st: &mut MatchState,
    metrics: &mut ApplyMetrics,
    window: &mut Window,
    rules: &[RuleLine],
    phase: EnclPhase,
) -> PassOutcome {
    let mut worklist: Vec<RuleLine> = {
        let Some(cur) = window.current() else { return PassOutcome::Clean };
        rules.iter().copied().filter(|r| cur.valid_rules.contains(r)).collect()
    };

    let mut did_something = false;
    let mut i = 0;
    while i < worklist.len() {
        let line = worklist[i];
        i += 1;
        let rule = g.rule(line);

        if let Some(allow) = &opt.valid_rules {
            if !allow.contains(&line) {
                continue;
            }
        }
        if !opt.apply_mappings && rule.kind.is_mapping() {
            continue;
        }
        if !opt.apply_corrections && rule.kind.is_correction() {
            continue;
        }
        let gated_out = match phase {
            EnclPhase::Normal => rule.flags.intersects(RuleFlags::ENCL_ANY),
            EnclPhase::Reinsert => rule.flags.contains(RuleFlags::ENCL_FINAL),
            EnclPhase::Final => !rule.flags.contains(RuleFlags::ENCL_FINAL),
        };
        if gated_out {
            continue;
        }

        let started = opt.statistics.then(Instant::now);
        let outcome = run_single_rule(g, opt, st, metrics, window, rule, phase);
        if let Some(started) = started {
            metrics.rule_mut(line).total_time += started.elapsed();
        }

        match outcome {
            RuleOutcome::Delimited => return PassOutcome::Delimited,
            RuleOutcome::Changed => {
                if !rule.flags.contains(RuleFlags::NOITERATE) {
                    did_something = true;
                }
            }
            RuleOutcome::NoChange => {}
        }

        if !st.pending_rules.is_empty() {
            let pending = std::mem::take(&mut st.pending_rules);
            for p in pending {
                if !rules.contains(&p) || worklist.contains(&p) {
                    continue;
                }
                let ins = worklist.partition_point(|&x| x < p);
                if ins >= i {
                    // still ahead of the cursor: this pass picks it up
                    worklist.insert(ins, p);
                }
                // rules behind the cursor wait for the next pass
            }
        }
    }

    if did_something {
        PassOutcome::Changed
    } else {
        PassOutcome::Clean
    }
}

fn run_single_rule(
    g: &Grammar,
    opt: &Options,
    st: &mut MatchState,
    metrics: &mut ApplyMetrics,
    window: &mut Window,
    rule: &Rule,
    phase: EnclPhase,
) -> RuleOutcome {
    let line = rule.line;
    let target_has_mappings = g.set(rule.target).has_mappings();
    let allow_unsafe =
        rule.flags.contains(RuleFlags::UNSAFE) || (opt.unsafe_mode && !rule.flags.contains(RuleFlags::SAFE));

    if rule.flags.contains(RuleFlags::RESETX) {
        st.mark = None;
    }

    // Candidates in ascending position; positions are re-resolved per
    // cohort because reading mutations never move cohorts, and structural
    // mutations end the iteration.
    let candidate_order: Vec<u32> = {
        let Some(cur) = window.current() else { return RuleOutcome::NoChange };
        let Some(set) = cur.rule_to_cohorts.get(&line) else { return RuleOutcome::NoChange };
        let mut order: Vec<(u32, u32)> = set
            .iter()
            .filter_map(|&glob| cur.cohort_by_global(glob).map(|c| (c.local_number, glob)))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, glob)| glob).collect()
    };

    let mut changed = false;

    'cohorts: for global in candidate_order {
        // ---- evaluation phase (window immutable) ----
        let eval = {
            let Some(cur) = window.current() else { break };
            let Some(idx) = cur.cohorts.iter().position(|c| c.global_number == global) else {
                continue;
            };
            if idx == 0 {
                continue;
            }
            let cohort = &cur.cohorts[idx];
            if cohort.ctype.intersects(CohortType::REMOVED | CohortType::ENCLOSED) {
                continue;
            }
            if cohort.readings.is_empty() {
                continue;
            }
            if phase == EnclPhase::Reinsert {
                let inside = match (st.par_left, st.par_right) {
                    (Some(l), Some(r)) => (l..=r).contains(&cohort.local_number),
                    _ => false,
                };
                if rule.flags.contains(RuleFlags::ENCL_INNER) && !inside {
                    continue;
                }
                if rule.flags.contains(RuleFlags::ENCL_OUTER) && inside {
                    continue;
                }
            }
            if matches!(rule.kind, RuleType::Select | RuleType::Remove | RuleType::Iff)
                && cohort.num_non_deleted() == 1
            {
                let narrowable = target_has_mappings
                    && cohort.non_deleted().next().is_some_and(|r| r.tags_mapped.len() > 1);
                let unsafe_removal =
                    allow_unsafe && matches!(rule.kind, RuleType::Remove | RuleType::Iff);
                if !narrowable && !unsafe_removal {
                    continue;
                }
            }
            if rule.kind == RuleType::Delimit && idx == cur.cohorts.len() - 1 {
                continue;
            }
            if let Some(wf) = rule.wordform {
                if wf != cohort.wordform {
                    if opt.statistics {
                        metrics.rule_mut(line).fails += 1;
                    }
                    continue;
                }
            }
            if st.rule_cohort_no.contains(&(line, global)) {
                continue;
            }

            st.unif_sets = None;
            st.dep_exclude.clear();
            st.origin = opt.no_pass_origin.then_some(global);

            let win_no = cur.number;
            let mut decisions: Vec<Decision> = Vec::with_capacity(cohort.readings.len());
            let mut num_active = 0usize;
            let mut num_iff = 0usize;
            let mut did_test = false;
            let mut test_good = false;
            let mut effective_kind = if rule.kind == RuleType::Iff { RuleType::Remove } else { rule.kind };

            for reading in &cohort.readings {
                let mut d = Decision::default();
                if reading.deleted || (reading.mapped && rule.kind.is_mapping()) {
                    decisions.push(d);
                    continue;
                }
                st.last_mapping_tag = None;
                let hit = set_matches_reading(
                    g,
                    st,
                    &cur.variables,
                    reading,
                    rule.target,
                    target_has_mappings,
                );
                if hit {
                    d.matched_target = true;
                    d.mapping_tag = st.last_mapping_tag;
                    num_iff += 1;
                    let mut good = true;
                    if !rule.tests.is_empty() {
                        if !did_test {
                            test_good = run_test_chain(g, st, window, win_no, idx, rule);
                            did_test = true;
                        }
                        good = test_good;
                    }
                    if good {
                        if rule.kind == RuleType::Iff {
                            effective_kind = RuleType::Select;
                        }
                        d.matched_tests = true;
                        num_active += 1;
                        if opt.statistics {
                            metrics.rule_mut(line).matches += 1;
                        }
                    }
                } else if opt.statistics {
                    metrics.rule_mut(line).fails += 1;
                }
                decisions.push(d);
            }
            st.origin = None;

            let any_target = decisions.iter().any(|d| d.matched_target);
            (idx, decisions, num_active, num_iff, effective_kind, any_target)
        };
        let (idx, decisions, num_active, num_iff, effective_kind, any_target) = eval;

        if num_active == 0 && (num_iff == 0 || rule.kind != RuleType::Iff) {
            if !any_target {
                // the target can never match here: drop the candidate for good
                if let Some(cur) = window.current_mut() {
                    if let Some(set) = cur.rule_to_cohorts.get_mut(&line) {
                        set.remove(&global);
                    }
                }
            } else {
                st.rule_cohort_no.insert((line, global));
            }
            continue;
        }

        if debug_rules() {
            eprintln!(
                "[rule:fire] line={} kind={:?} cohort={} active={} mark={:?}",
                line, rule.kind, global, num_active, st.mark
            );
        }

        // ---- mutation phase ----
        match effective_kind {
            RuleType::Select | RuleType::Remove => {
                let iff_remove = rule.kind == RuleType::Iff && effective_kind == RuleType::Remove;
                if apply_select_remove(
                    g, st, window, rule, idx, global, &decisions, effective_kind, iff_remove,
                    num_active, allow_unsafe,
                ) {
                    changed = true;
                }
            }
            RuleType::Iff => unreachable!("IFF resolves to SELECT or REMOVE"),
            RuleType::Add | RuleType::Map => {
                if apply_add_map(g, st, window, rule, idx, global, &decisions) {
                    changed = true;
                }
            }
            RuleType::Replace => {
                if apply_replace(g, st, window, rule, idx, global, &decisions) {
                    changed = true;
                }
            }
            RuleType::Substitute => {
                if apply_substitute(g, st, window, rule, idx, global, &decisions) {
                    changed = true;
                }
            }
            RuleType::Append => {
                if apply_append(g, st, window, rule, idx, global) {
                    changed = true;
                }
            }
            RuleType::SetVariable => {
                if let Some(cur) = window.current_mut() {
                    let name = rule.varname.clone().unwrap_or_default();
                    let value = rule.varvalue.clone().unwrap_or_else(|| "1".to_string());
                    info!(variable = %name, "SETVARIABLE fired");
                    if cur.variables.get(&name) != Some(&value) {
                        cur.variables.insert(name, value);
                        // VAR: probes were answered against the old store
                        st.reset_indexes();
                        changed = true;
                    }
                }
            }
            RuleType::RemVariable => {
                if let Some(cur) = window.current_mut() {
                    let name = rule.varname.clone().unwrap_or_default();
                    info!(variable = %name, "REMVARIABLE fired");
                    if cur.variables.shift_remove(&name).is_some() {
                        st.reset_indexes();
                        changed = true;
                    }
                }
            }
            RuleType::Delimit => {
                apply_delimit(g, st, window, rule, idx);
                return RuleOutcome::Delimited;
            }
            RuleType::RemCohort => {
                apply_remcohort(g, st, window, rule, idx);
                changed = true;
                break 'cohorts;
            }
            RuleType::MoveBefore | RuleType::MoveAfter | RuleType::Switch => {
                if apply_move(g, st, window, rule, idx, global) {
                    changed = true;
                    // the cohort sequence shifted: end this iteration, the
                    // rule restarts on the next pass
                    break 'cohorts;
                }
            }
            RuleType::SetParent | RuleType::SetChild => {
                if apply_attach(g, st, window, rule, idx, global) {
                    changed = true;
                }
            }
            RuleType::AddRelation
            | RuleType::SetRelation
            | RuleType::RemRelation
            | RuleType::AddRelations
            | RuleType::SetRelations
            | RuleType::RemRelations => {
                if apply_relation(g, st, window, rule, idx, global) {
                    changed = true;
                }
            }
        }
    }

    st.origin = None;
    if changed {
        RuleOutcome::Changed
    } else {
        RuleOutcome::NoChange
    }
}

/// Evaluate the rule's sibling tests in their current order. A failing test
/// is hoisted to the front for future cohorts unless KEEPORDER pins it.
fn run_test_chain(
    g: &Grammar,
    st: &mut MatchState,
    window: &Window,
    win_no: u32,
    idx: usize,
    rule: &Rule,
) -> bool {
    let order: Vec<usize> = st
        .test_order
        .entry(rule.line)
        .or_insert_with(|| (0..rule.tests.len()).collect())
        .clone();
    for (oi, &ti) in order.iter().enumerate() {
        let res = run_contextual_test(g, st, window, win_no, idx, &rule.tests[ti]);
        if res.matched {
            if rule.flags.contains(RuleFlags::REMEMBERX) {
                st.mark = res.target.or(st.mark);
            }
        } else {
            if !rule.flags.contains(RuleFlags::KEEPORDER) && oi != 0 {
                if let Some(ord) = st.test_order.get_mut(&rule.line) {
                    ord.retain(|&x| x != ti);
                    ord.insert(0, ti);
                }
            }
            return false;
        }
    }
    true
}

/// Post-mutation bookkeeping: reflow, cache invalidation, incremental
/// candidate registration for any tags the mutation introduced.
fn note_mutation(
    g: &Grammar,
    st: &mut MatchState,
    cur: &mut SingleWindow,
    idx: usize,
    global: u32,
    added_tags: &[TagId],
) {
    cur.cohorts[idx].ctype.remove(CohortType::NUM_CURRENT);
    st.rule_cohort_no.clear();
    let mut seen = HashSet::new();
    for &tag in added_tags {
        if seen.insert(tag) {
            update_valid_rules(g, cur, tag, global, &mut st.pending_rules);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_select_remove(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
    decisions: &[Decision],
    kind: RuleType,
    iff_remove: bool,
    num_active: usize,
    allow_unsafe: bool,
) -> bool {
    let Some(cur) = window.current_mut() else { return false };
    let line = rule.line;
    let delayed = rule.flags.contains(RuleFlags::DELAYED);

    let good = |ri: usize| {
        if iff_remove {
            decisions[ri].matched_target
        } else {
            decisions[ri].matched_tests
        }
    };
    let live = cur.cohorts[idx].readings.len();
    let num_good = (0..live).filter(|&ri| good(ri)).count();

    // no-op and last-reading guards
    if kind == RuleType::Select && num_active == live {
        return false;
    }
    if kind == RuleType::Remove && num_good == live && !allow_unsafe {
        return false;
    }
    if kind == RuleType::Select && num_good == 0 {
        return false;
    }

    let cohort = &mut cur.cohorts[idx];
    let mut kept: Vec<Reading> = Vec::with_capacity(cohort.readings.len());
    let mut dropped: Vec<Reading> = Vec::new();
    let mut narrowed = false;

    for (ri, mut reading) in cohort.readings.drain(..).enumerate() {
        let is_good = good(ri);
        let mapping_tag = decisions[ri].mapping_tag;
        match kind {
            RuleType::Remove => {
                if is_good {
                    if let Some(map_tag) =
                        mapping_tag.filter(|_| reading.tags_mapped.len() > 1)
                    {
                        // more than one mapping: strip just the matched one
                        reading.tags_list.retain(|t| *t != map_tag);
                        reading.hit_by.push(line);
                        reading.reflow(g.pool());
                        narrowed = true;
                        kept.push(reading);
                    } else {
                        reading.deleted = true;
                        reading.hit_by.push(line);
                        dropped.push(reading);
                    }
                } else {
                    kept.push(reading);
                }
            }
            RuleType::Select => {
                if is_good {
                    if let Some(map_tag) =
                        mapping_tag.filter(|_| reading.tags_mapped.len() > 1)
                    {
                        let mapped: Vec<TagId> = reading.tags_mapped.clone();
                        reading.tags_list.retain(|t| !mapped.contains(t));
                        reading.tags_list.push(map_tag);
                        reading.reflow(g.pool());
                        narrowed = true;
                    }
                    reading.hit_by.push(line);
                    kept.push(reading);
                } else {
                    reading.deleted = true;
                    reading.hit_by.push(line);
                    dropped.push(reading);
                }
            }
            _ => kept.push(reading),
        }
    }
    cohort.readings = kept;
    let any_dropped = !dropped.is_empty();
    if delayed {
        cohort.delayed.extend(dropped);
    } else {
        cohort.deleted.extend(dropped);
    }

    let changed = any_dropped || narrowed;
    if changed {
        note_mutation(g, st, cur, idx, global, &[]);
    }
    changed
}

fn apply_add_map(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
    decisions: &[Decision],
) -> bool {
    let Some(cur) = window.current_mut() else { return false };
    let pool = g.pool();
    let cohort = &mut cur.cohorts[idx];
    let mapping_tags: Vec<TagId> =
        rule.maplist.iter().copied().filter(|&t| pool.get(t).is(TagFlags::MAPPING)).collect();
    let plain_tags: Vec<TagId> =
        rule.maplist.iter().copied().filter(|&t| !pool.get(t).is(TagFlags::MAPPING)).collect();

    let mut splits: Vec<Reading> = Vec::new();
    let mut changed = false;
    for (ri, reading) in cohort.readings.iter_mut().enumerate() {
        if !decisions.get(ri).is_some_and(|d| d.matched_tests) {
            continue;
        }
        // tags the reading already carries are not re-added, so re-running
        // the section converges instead of growing the list forever
        let mut added = false;
        for &t in &plain_tags {
            if !reading.tags.contains(&t) {
                reading.push_tag(t);
                added = true;
            }
        }
        let missing_mappings: Vec<TagId> =
            mapping_tags.iter().copied().filter(|t| !reading.tags.contains(t)).collect();
        if missing_mappings.len() > 1 {
            // one reading per mapping tag: the original keeps the first,
            // clones carry the rest
            for &extra in &missing_mappings[1..] {
                let mut clone = reading.clone();
                clone.push_tag(extra);
                clone.reflow(pool);
                clone.mapped = rule.kind == RuleType::Map;
                splits.push(clone);
            }
            reading.push_tag(missing_mappings[0]);
            added = true;
        } else if let Some(&only) = missing_mappings.first() {
            reading.push_tag(only);
            added = true;
        }
        if !added && !(rule.kind == RuleType::Map && !reading.mapped) {
            continue;
        }
        reading.hit_by.push(rule.line);
        reading.noprint = false;
        reading.reflow(pool);
        if rule.kind == RuleType::Map {
            reading.mapped = true;
        }
        changed = true;
    }
    for split in splits {
        cohort.append_reading(split);
    }

    if changed {
        note_mutation(g, st, cur, idx, global, &rule.maplist);
    }
    changed
}

fn apply_replace(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
    decisions: &[Decision],
) -> bool {
    let Some(cur) = window.current_mut() else { return false };
    let cohort = &mut cur.cohorts[idx];
    let cohort_wf = cohort.wordform;
    let mut changed = false;
    for (ri, reading) in cohort.readings.iter_mut().enumerate() {
        if !decisions.get(ri).is_some_and(|d| d.matched_tests) {
            continue;
        }
        let wf = reading.wordform.unwrap_or(cohort_wf);
        let bf = reading.baseform;
        let before = reading.hash;
        reading.tags_list.clear();
        reading.tags_list.push(wf);
        if let Some(bf) = bf {
            reading.tags_list.push(bf);
        }
        for &t in &rule.maplist {
            reading.push_tag(t);
        }
        reading.reflow(g.pool());
        if reading.hash == before {
            continue;
        }
        reading.hit_by.push(rule.line);
        reading.noprint = false;
        if !reading.tags_mapped.is_empty() {
            reading.mapped = true;
        }
        changed = true;
    }
    if changed {
        note_mutation(g, st, cur, idx, global, &rule.maplist);
    }
    changed
}

fn apply_substitute(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
    decisions: &[Decision],
) -> bool {
    let Some(cur) = window.current_mut() else { return false };
    let cohort = &mut cur.cohorts[idx];
    let mut changed = false;
    for (ri, reading) in cohort.readings.iter_mut().enumerate() {
        if !decisions.get(ri).is_some_and(|d| d.matched_tests) {
            continue;
        }
        // drop every sublist tag, remembering where the last one sat
        let mut kept: Vec<TagId> = Vec::with_capacity(reading.tags_list.len());
        let mut removed_at: Option<usize> = None;
        for &t in reading.tags_list.iter() {
            if rule.sublist.contains(&t) {
                removed_at = Some(kept.len());
            } else {
                kept.push(t);
            }
        }
        let Some(at) = removed_at else { continue };
        // the replacement goes where the removed tags were
        for (k, &t) in rule.maplist.iter().enumerate() {
            kept.insert(at + k, t);
        }
        reading.tags_list = kept.into();
        reading.hit_by.push(rule.line);
        reading.noprint = false;
        reading.reflow(g.pool());
        if !reading.tags_mapped.is_empty() {
            reading.mapped = true;
        }
        changed = true;
    }
    if changed {
        note_mutation(g, st, cur, idx, global, &rule.maplist);
    }
    changed
}

fn apply_append(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
) -> bool {
    if !st.appended.insert((rule.line, global)) {
        return false;
    }
    let Some(cur) = window.current_mut() else { return false };
    let cohort = &mut cur.cohorts[idx];
    let mut reading = Reading::new();
    reading.push_tag(cohort.wordform);
    for &t in &rule.maplist {
        reading.push_tag(t);
    }
    reading.reflow(g.pool());
    reading.hit_by.push(rule.line);
    reading.noprint = false;
    if !reading.tags_mapped.is_empty() {
        reading.mapped = true;
    }
    cohort.append_reading(reading);
    note_mutation(g, st, cur, idx, global, &rule.maplist);
    true
}

/// Split the current window after the cohort at `idx`: the tail becomes a
/// fresh window at the head of the `next` buffer, the delimiting cohort
/// gets the sentence-end tag.
fn apply_delimit(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
) {
    let number = window.next_window_number();
    let sentinel_global = window.next_global_number();

    let Some(cur) = window.current_mut() else { return };
    let tail: Vec<Cohort> = cur.cohorts.split_off(idx + 1);

    let pool = g.pool();
    for reading in &mut cur.cohorts[idx].readings {
        reading.push_tag(pool.end_tag());
        reading.hit_by.push(rule.line);
        reading.reflow(pool);
    }

    let mut sentinel = Cohort::new(pool.begin_tag(), sentinel_global);
    let mut begin_reading = Reading::new();
    begin_reading.push_tag(pool.begin_tag());
    begin_reading.reflow(pool);
    begin_reading.baseform = Some(pool.begin_tag());
    sentinel.append_reading(begin_reading);

    let mut nwin = SingleWindow::new(number, sentinel);
    for cohort in tail {
        nwin.append_cohort(cohort);
    }
    window.next.push_front(nwin);
    st.rule_cohort_no.clear();
    window.rebuild_cohort_map();
}

fn apply_remcohort(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
) {
    {
        let Some(cur) = window.current_mut() else { return };
        let mut cohort = cur.cohorts.remove(idx);
        cohort.ctype.insert(CohortType::REMOVED);
        for reading in &mut cohort.readings {
            reading.deleted = true;
            reading.hit_by.push(rule.line);
        }
        cur.removed.push(cohort);
        index_single_window(g, cur);
    }
    st.rule_cohort_no.clear();
    window.rebuild_cohort_map();
}

/// Resolve the rule's dependency-target context from the acting cohort.
fn resolve_dep_target(
    g: &Grammar,
    st: &mut MatchState,
    window: &Window,
    win_no: u32,
    idx: usize,
    rule: &Rule,
) -> Option<u32> {
    let test = rule.dep_target.as_ref()?;
    let res = run_contextual_test(g, st, window, win_no, idx, test);
    if res.matched {
        res.target.filter(|&t| {
            // the acting cohort itself is never a valid counterpart
            window.current().map_or(true, |cur| {
                cur.cohorts.get(idx).map_or(true, |c| c.global_number != t)
            })
        })
    } else {
        None
    }
}

fn apply_move(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
) -> bool {
    let win_no = match window.current() {
        Some(cur) => cur.number,
        None => return false,
    };
    let Some(a_global) = resolve_dep_target(g, st, window, win_no, idx, rule) else {
        return false;
    };

    let Some(cur) = window.current() else { return false };
    let Some(a_idx) = cur.cohorts.iter().position(|c| c.global_number == a_global) else {
        warn!(rule = rule.line, target = a_global, "cross-window move refused");
        return false;
    };
    if a_idx == 0 || a_idx == idx {
        return false;
    }

    if rule.kind == RuleType::Switch {
        let Some(cur) = window.current_mut() else { return false };
        cur.cohorts.swap(idx, a_idx);
        for i in [idx, a_idx] {
            for reading in &mut cur.cohorts[i].readings {
                reading.hit_by.push(rule.line);
            }
        }
        index_single_window(g, cur);
        st.rule_cohort_no.clear();
        window.rebuild_cohort_map();
        return true;
    }

    // Gather the moving block: the cohort plus its dependency children
    // matching childset1.
    let block: Vec<usize> = {
        let cohort = &cur.cohorts[idx];
        let mut ids: Vec<usize> = vec![idx];
        if let Some(cs1) = rule.childset1 {
            let children: Vec<u32> = cohort.dep_children.iter().copied().collect();
            for child in children {
                if let Some(ci) = cur.cohorts.iter().position(|c| c.global_number == child) {
                    if crate::engine::cohort_matches_normal(
                        g,
                        st,
                        &cur.variables,
                        &cur.cohorts[ci],
                        cs1,
                    ) {
                        ids.push(ci);
                    }
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    };
    if block.contains(&a_idx) {
        return false;
    }

    // Anchor edge: the target cohort together with its childset2-matching
    // children.
    let Some(cur) = window.current() else { return false };
    let anchor: (usize, usize) = {
        let mut lo = a_idx;
        let mut hi = a_idx;
        if let Some(cs2) = rule.childset2 {
            let children: Vec<u32> = cur.cohorts[a_idx].dep_children.iter().copied().collect();
            for child in children {
                if let Some(ci) = cur.cohorts.iter().position(|c| c.global_number == child) {
                    if crate::engine::cohort_matches_normal(
                        g,
                        st,
                        &cur.variables,
                        &cur.cohorts[ci],
                        cs2,
                    ) {
                        lo = lo.min(ci);
                        hi = hi.max(ci);
                    }
                }
            }
        }
        (lo, hi)
    };

    let Some(cur) = window.current_mut() else { return false };
    let order_before: Vec<u32> = cur.cohorts.iter().map(|c| c.global_number).collect();

    // pull the block out back-to-front so indices stay valid
    let mut moving: Vec<Cohort> = Vec::with_capacity(block.len());
    for &bi in block.iter().rev() {
        moving.push(cur.cohorts.remove(bi));
    }
    moving.reverse();

    let removed_before = |p: usize| block.iter().filter(|&&bi| bi < p).count();
    let mut insert_at = match rule.kind {
        RuleType::MoveBefore => anchor.0 - removed_before(anchor.0),
        _ => anchor.1 + 1 - removed_before(anchor.1 + 1),
    };
    insert_at = insert_at.clamp(1, cur.cohorts.len());
    for (k, mut cohort) in moving.into_iter().enumerate() {
        for reading in &mut cohort.readings {
            reading.hit_by.push(rule.line);
        }
        cur.cohorts.insert(insert_at + k, cohort);
    }

    let order_after: Vec<u32> = cur.cohorts.iter().map(|c| c.global_number).collect();
    if order_before == order_after {
        // already in place: refiring forever would never converge
        index_single_window(g, cur);
        window.rebuild_cohort_map();
        return false;
    }

    index_single_window(g, cur);
    st.rule_cohort_no.clear();
    window.rebuild_cohort_map();
    true
}

fn walk_creates_loop(window: &Window, parent: u32, child: u32) -> bool {
    let mut seen = HashSet::new();
    let mut at = parent;
    loop {
        if at == child {
            return true;
        }
        if !seen.insert(at) {
            return false;
        }
        match window.find_cohort(at) {
            Some((_, cohort))
                if cohort.dep_parent != DEP_NO_PARENT && cohort.dep_parent != cohort.global_number =>
            {
                at = cohort.dep_parent;
            }
            _ => return false,
        }
    }
}

/// Would edge (child, parent) cross an existing edge in the same window?
fn edge_crosses(window: &Window, child: u32, parent: u32) -> bool {
    let Some((win, child_cohort)) = window.find_cohort(child) else { return false };
    let Some((pwin, parent_cohort)) = window.find_cohort(parent) else { return false };
    if win.number != pwin.number {
        return false;
    }
    let (lo, hi) = {
        let a = child_cohort.local_number;
        let b = parent_cohort.local_number;
        (a.min(b), a.max(b))
    };
    for other in &win.cohorts {
        if other.global_number == child || other.dep_parent == DEP_NO_PARENT {
            continue;
        }
        let Some(op) = win.cohorts.iter().find(|c| c.global_number == other.dep_parent) else {
            continue;
        };
        let (olo, ohi) = {
            let a = other.local_number;
            let b = op.local_number;
            (a.min(b), a.max(b))
        };
        let partial_overlap = (olo < lo && lo < ohi && ohi < hi) || (lo < olo && olo < hi && hi < ohi);
        if partial_overlap {
            return true;
        }
    }
    false
}

fn apply_attach(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
) -> bool {
    let win_no = match window.current() {
        Some(cur) => cur.number,
        None => return false,
    };

    loop {
        let Some(a_global) = resolve_dep_target(g, st, window, win_no, idx, rule) else {
            return false;
        };
        let (child, parent) = match rule.kind {
            RuleType::SetParent => (global, a_global),
            _ => (a_global, global),
        };

        if !rule.flags.contains(RuleFlags::ALLOWLOOP) && walk_creates_loop(window, parent, child) {
            warn!(rule = rule.line, child, parent, "attachment would loop - refused");
            if rule.flags.contains(RuleFlags::NEAREST) {
                return false;
            }
            st.dep_exclude.insert(a_global);
            continue;
        }
        if !rule.flags.contains(RuleFlags::ALLOWCROSS) && edge_crosses(window, child, parent) {
            warn!(rule = rule.line, child, parent, "attachment would cross - refused");
            if rule.flags.contains(RuleFlags::NEAREST) {
                return false;
            }
            st.dep_exclude.insert(a_global);
            continue;
        }

        // sequential two-cohort edit: set the child's parent edge, then
        // register the child on the parent
        let child_win_no = match window.find_cohort(child) {
            Some((w, _)) => w.number,
            None => return false,
        };
        let mut edge_changed = false;
        if let Some(win) = window.by_number_mut(child_win_no) {
            if let Some(c) = win.cohort_by_global_mut(child) {
                if c.dep_parent != parent {
                    c.dep_parent = parent;
                    edge_changed = true;
                }
            }
            win.has_dep = true;
        }
        if let Some((pwin_no, _)) = window.find_cohort(parent).map(|(w, c)| (w.number, c.global_number)) {
            if let Some(win) = window.by_number_mut(pwin_no) {
                if let Some(p) = win.cohort_by_global_mut(parent) {
                    p.dep_children.insert(child);
                }
                win.has_dep = true;
            }
        }
        if edge_changed {
            if let Some(cur) = window.current_mut() {
                note_mutation(g, st, cur, idx, global, &[]);
            }
        }
        return edge_changed;
    }
}

fn apply_relation(
    g: &Grammar,
    st: &mut MatchState,
    window: &mut Window,
    rule: &Rule,
    idx: usize,
    global: u32,
) -> bool {
    let win_no = match window.current() {
        Some(cur) => cur.number,
        None => return false,
    };
    let Some(a_global) = resolve_dep_target(g, st, window, win_no, idx, rule) else {
        return false;
    };
    let Some(&name) = rule.maplist.first() else { return false };

    let mut changed = edit_relation(window, win_no, global, name, a_global, rule.kind);

    if matches!(
        rule.kind,
        RuleType::AddRelations | RuleType::SetRelations | RuleType::RemRelations
    ) {
        if let Some(&back_name) = rule.sublist.first() {
            let a_win = window.find_cohort(a_global).map(|(w, _)| w.number);
            if let Some(a_win) = a_win {
                changed |= edit_relation(window, a_win, a_global, back_name, global, rule.kind);
            }
        }
    }

    if changed {
        st.rule_cohort_no.clear();
        if let Some(cur) = window.current_mut() {
            if cur.cohorts.get(idx).map(|c| c.global_number) == Some(global) {
                cur.cohorts[idx].ctype.insert(CohortType::RELATED);
            }
        }
    }
    changed
}

fn edit_relation(
    window: &mut Window,
    win_no: u32,
    from: u32,
    name: TagId,
    to: u32,
    kind: RuleType,
) -> bool {
    let Some(win) = window.by_number_mut(win_no) else { return false };
    let Some(cohort) = win.cohort_by_global_mut(from) else { return false };
    cohort.ctype.insert(CohortType::RELATED);
    match kind {
        RuleType::AddRelation | RuleType::AddRelations => {
            cohort.relations.entry(name).or_default().insert(to)
        }
        RuleType::SetRelation | RuleType::SetRelations => {
            let entry = cohort.relations.entry(name).or_default();
            let already = entry.len() == 1 && entry.contains(&to);
            if !already {
                entry.clear();
                entry.insert(to);
            }
            !already
        }
        RuleType::RemRelation | RuleType::RemRelations => {
            cohort.relations.get_mut(&name).is_some_and(|set| set.remove(&to))
        }
        _ => false,
    }
}

/// Lift parenthesized regions out of the window before the main passes.
fn extract_enclosures(g: &Grammar, win: &mut SingleWindow) {
    fn has_par(g: &Grammar, cohort: &Cohort, flag: TagFlags) -> bool {
        cohort
            .readings
            .iter()
            .any(|r| r.tags_list.iter().any(|&t| g.pool().get(t).is(flag)))
    }

    let mut i = 1;
    while i < win.cohorts.len() {
        if has_par(g, &win.cohorts[i], TagFlags::PAR_LEFT) {
            let close = (i + 1..win.cohorts.len())
                .find(|&j| has_par(g, &win.cohorts[j], TagFlags::PAR_RIGHT));
            if let Some(j) = close {
                let mut cohorts: Vec<Cohort> = win.cohorts.drain(i..=j).collect();
                for cohort in &mut cohorts {
                    cohort.ctype.insert(CohortType::ENCLOSED);
                }
                win.enclosures.push(Enclosure { at: i, cohorts });
                continue;
            }
        }
        i += 1;
    }
    win.renumber();
}
