//! Window indexing and incremental index maintenance.
//!
//! Before rules run, every cohort is summarized into `possible_sets` (the
//! union of all sets its tags could contribute to) and every rule gets its
//! candidate cohorts registered in `rule_to_cohorts`. A rule whose target
//! set never appears in any cohort's `possible_sets` is simply not in
//! `valid_rules` and costs nothing per pass.
//!
//! The index is refreshed wholesale after structural mutations (REMCOHORT,
//! MOVE, DELIMIT) and incrementally when a mutation introduces a new tag:
//! [`update_valid_rules`] registers the cohort for every rule indexed under
//! the tag and queues the rule so the running pass picks it up.

use std::collections::BTreeSet;

use crate::grammar::Grammar;
use crate::tags::TagId;
use crate::window::SingleWindow;
use crate::RuleLine;

/// Renumber, rebuild dependency links, recompute `possible_sets` and the
/// rule-to-candidate-cohort map for one window.
pub(crate) fn index_single_window(g: &Grammar, win: &mut SingleWindow) {
    win.renumber();
    win.reflow_dependencies();

    for cohort in &mut win.cohorts {
        for reading in &mut cohort.readings {
            if reading.hash == 0 {
                reading.reflow(g.pool());
            }
        }
        cohort.possible_sets.clear();
        cohort.possible_sets.extend(g.sets_any().iter().copied());
        for reading in &cohort.readings {
            for &tag in reading.tags_list.iter() {
                if let Some(sets) = g.sets_by_tag(tag) {
                    cohort.possible_sets.extend(sets.iter().copied());
                }
            }
        }
    }

    win.rule_to_cohorts.clear();
    win.valid_rules.clear();
    for rule in g.rules() {
        let mut candidates: BTreeSet<u32> = BTreeSet::new();
        for cohort in win.cohorts.iter().skip(1) {
            if cohort.possible_sets.contains(&rule.target) {
                candidates.insert(cohort.global_number);
            }
        }
        if !candidates.is_empty() {
            win.valid_rules.insert(rule.line);
            win.rule_to_cohorts.insert(rule.line, candidates);
        }
    }
    // special targets cannot be prefiltered: all cohorts are candidates
    for &line in g.special_rules() {
        let candidates: BTreeSet<u32> =
            win.cohorts.iter().skip(1).map(|c| c.global_number).collect();
        if !candidates.is_empty() {
            win.valid_rules.insert(line);
            win.rule_to_cohorts.insert(line, candidates);
        }
    }
}

/// A mutation added `new_tag` to a reading of `cohort_global`: register the
/// cohort with every rule indexed under the tag, and queue newly relevant
/// rules for the current pass.
pub(crate) fn update_valid_rules(
    g: &Grammar,
    win: &mut SingleWindow,
    new_tag: TagId,
    cohort_global: u32,
    pending: &mut Vec<RuleLine>,
) {
    if let Some(sets) = g.sets_by_tag(new_tag) {
        if let Some(cohort) = win.cohort_by_global_mut(cohort_global) {
            cohort.possible_sets.extend(sets.iter().copied());
        }
    }
    for &line in g.rules_by_tag(new_tag) {
        let entry = win.rule_to_cohorts.entry(line).or_default();
        if entry.insert(cohort_global) {
            pending.push(line);
        }
        win.valid_rules.insert(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{GrammarBuilder, Rule, RuleType};
    use crate::window::{Cohort, Reading, Window};

    #[test]
    fn candidates_follow_possible_sets() {
        let mut b = GrammarBuilder::new();
        let n = b.list("N", &["N"]).unwrap();
        let v = b.list("V", &["V"]).unwrap();
        let r_n = b.add(Rule::new(RuleType::Remove, n)).unwrap();
        let r_v = b.add(Rule::new(RuleType::Remove, v)).unwrap();
        let mut g = b.build().unwrap();

        let mut w = Window::new(2);
        w.alloc_append_window(g.pool());
        let wf = g.pool_mut().intern_input("\"<x>\"");
        let tn = g.pool_mut().intern_input("N");
        let g1 = w.next_global_number();
        {
            let win = w.next.back_mut().unwrap();
            let mut c = Cohort::new(wf, g1);
            c.append_reading(Reading::with_tags([wf, tn], g.pool()));
            win.append_cohort(c);
        }
        w.shuffle_down();

        let win = w.current_mut().unwrap();
        index_single_window(&g, win);
        assert!(win.valid_rules.contains(&r_n));
        assert!(!win.valid_rules.contains(&r_v));
        assert!(win.rule_to_cohorts[&r_n].contains(&g1));
    }

    #[test]
    fn update_valid_rules_registers_new_tag() {
        let mut b = GrammarBuilder::new();
        let n = b.list("N", &["N"]).unwrap();
        let v = b.list("V", &["V"]).unwrap();
        let _r_n = b.add(Rule::new(RuleType::Remove, n)).unwrap();
        let r_v = b.add(Rule::new(RuleType::Select, v)).unwrap();
        let mut g = b.build().unwrap();

        let mut w = Window::new(2);
        w.alloc_append_window(g.pool());
        let wf = g.pool_mut().intern_input("\"<x>\"");
        let tn = g.pool_mut().intern_input("N");
        let tv = g.pool_mut().intern_input("V");
        let g1 = w.next_global_number();
        {
            let win = w.next.back_mut().unwrap();
            let mut c = Cohort::new(wf, g1);
            c.append_reading(Reading::with_tags([wf, tn], g.pool()));
            win.append_cohort(c);
        }
        w.shuffle_down();
        let win = w.current_mut().unwrap();
        index_single_window(&g, win);
        assert!(!win.valid_rules.contains(&r_v));

        let mut pending = Vec::new();
        update_valid_rules(&g, win, tv, g1, &mut pending);
        assert!(win.valid_rules.contains(&r_v));
        assert_eq!(pending, vec![r_v]);
        assert!(win.rule_to_cohorts[&r_v].contains(&g1));
    }
}
