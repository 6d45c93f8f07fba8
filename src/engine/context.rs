//! Contextual test evaluation.
//!
//! A test walks the window (or the dependency graph) from a starting cohort
//! and decides whether the context holds. Three modes exist:
//!
//! - **Point**: test the single cohort at `position + offset`.
//! - **Scan** (`*` / `*C`): walk in the sign direction of the offset. `*C`
//!   stops at the first cohort matching the target; `*` succeeds if any
//!   scanned position satisfies the whole test. A `BARRIER` aborts the walk
//!   when an intermediate cohort matches it; `CBARRIER` aborts only on a
//!   careful match.
//! - **Dependency**: follow parent/child/sibling edges instead of
//!   positions.
//!
//! Window edges are hard walls unless the test carries a span flag, in
//! which case the walk continues in the adjacent buffered window. Linked
//! tests re-enter the evaluator at the position where the outer test was
//! satisfied.
//!
//! Besides the boolean verdict, the evaluator reports *which* cohort
//! satisfied the test: dependency and relation rules need the matched
//! target, and SETPARENT retries exclude already-rejected attachment
//! candidates through [`MatchState::dep_exclude`].

use tracing::warn;

use super::matcher::{cohort_matches_careful, cohort_matches_normal, MatchState};
use crate::grammar::{ContextualTest, Grammar};
use crate::window::{SingleWindow, Window};
use crate::DEP_NO_PARENT;

/// Outcome of a contextual test.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TestResult {
    pub(crate) matched: bool,
    /// Global number of the cohort that satisfied the test, when one did.
    pub(crate) target: Option<u32>,
}

impl TestResult {
    fn fail() -> Self {
        TestResult { matched: false, target: None }
    }

    fn of(matched: bool, target: u32) -> Self {
        TestResult { matched, target: matched.then_some(target) }
    }
}

/// Evaluate `test` relative to `position` in window `win_number`.
pub(crate) fn run_contextual_test(
    g: &Grammar,
    st: &mut MatchState,
    window: &Window,
    win_number: u32,
    position: usize,
    test: &ContextualTest,
) -> TestResult {
    let mut win = match window.by_number(win_number) {
        Some(w) => w,
        None => return TestResult::fail(),
    };

    let mut pos: i64 = if test.absolute {
        if test.offset < 0 {
            win.cohorts.len() as i64 + test.offset as i64
        } else {
            test.offset as i64
        }
    } else {
        position as i64 + test.offset as i64
    };

    // Migrate out-of-range start positions into adjacent windows when the
    // test spans.
    while pos < 0 && (test.span_both || test.span_left) {
        match window.previous_from(win.number) {
            Some(prev) => {
                pos += prev.cohorts.len() as i64;
                win = prev;
            }
            None => break,
        }
    }
    while pos >= win.cohorts.len() as i64 && (test.span_both || test.span_right) {
        match window.next_from(win.number) {
            Some(next) => {
                pos -= win.cohorts.len() as i64;
                win = next;
            }
            None => break,
        }
    }

    if pos < 0 || pos >= win.cohorts.len() as i64 {
        // position past the window edge: false, unless the test is negated
        return TestResult { matched: test.negative, target: None };
    }
    let pos = pos as usize;

    if (test.scanall || test.scanfirst) && test.offset != 0 {
        scan(g, st, window, win, pos, test)
    } else if test.dep_child || test.dep_sibling || test.dep_parent {
        dependency(g, st, window, win, pos, test)
    } else {
        point(g, st, window, win, pos, test)
    }
}

fn match_at(
    g: &Grammar,
    st: &mut MatchState,
    win: &SingleWindow,
    pos: usize,
    test: &ContextualTest,
) -> bool {
    let cohort = &win.cohorts[pos];
    if st.dep_exclude.contains(&cohort.global_number) {
        return false;
    }
    let mut hit = cohort_matches_normal(g, st, &win.variables, cohort, test.target);
    if hit && test.careful {
        hit = cohort_matches_careful(g, st, &win.variables, cohort, test.target);
    }
    hit
}

fn scan(
    g: &Grammar,
    st: &mut MatchState,
    window: &Window,
    start_win: &SingleWindow,
    start: usize,
    test: &ContextualTest,
) -> TestResult {
    let backward = test.offset < 0;
    let mut win = start_win;
    let mut pos = start as i64;

    loop {
        while pos >= 0 && pos < win.cohorts.len() as i64 {
            let i = pos as usize;
            let cohort_global = win.cohorts[i].global_number;
            let hit = match_at(g, st, win, i, test);

            let mut result = hit;
            if result {
                if let Some(linked) = &test.linked {
                    result = run_contextual_test(g, st, window, win.number, i, linked).matched;
                }
            }
            if test.negative {
                result = !result;
            }
            if test.scanfirst && hit {
                // *C: the first target hit decides, whatever the linked and
                // negation outcome
                return TestResult::of(result, cohort_global);
            }
            if result {
                return TestResult::of(true, cohort_global);
            }
            if let Some(barrier) = test.barrier {
                if cohort_matches_normal(g, st, &win.variables, &win.cohorts[i], barrier) {
                    return TestResult::fail();
                }
            }
            if let Some(cbarrier) = test.cbarrier {
                if cohort_matches_careful(g, st, &win.variables, &win.cohorts[i], cbarrier) {
                    return TestResult::fail();
                }
            }
            if st.origin == Some(cohort_global) {
                // no_pass_origin: the rule's own cohort is a wall
                return TestResult::fail();
            }
            pos += if backward { -1 } else { 1 };
        }

        // window edge: continue in the adjacent window if the span allows
        let crossed = if backward && (test.span_both || test.span_left) {
            window.previous_from(win.number).map(|prev| {
                let p = prev.cohorts.len() as i64 - 1;
                (prev, p)
            })
        } else if !backward && (test.span_both || test.span_right) {
            window.next_from(win.number).map(|next| (next, 0))
        } else {
            None
        };
        match crossed {
            Some((next_win, next_pos)) => {
                win = next_win;
                pos = next_pos;
            }
            None => return TestResult::fail(),
        }
    }
}

fn point(
    g: &Grammar,
    st: &mut MatchState,
    window: &Window,
    win: &SingleWindow,
    pos: usize,
    test: &ContextualTest,
) -> TestResult {
    let cohort_global = win.cohorts[pos].global_number;
    let mut result = match_at(g, st, win, pos, test);
    if test.negative {
        result = !result;
    }
    if result {
        if let Some(linked) = &test.linked {
            result = run_contextual_test(g, st, window, win.number, pos, linked).matched;
        }
    }
    TestResult::of(result, cohort_global)
}

/// Walk dependency edges from the cohort at `pos`. Children are visited in
/// ascending global order, then siblings; the first satisfying cohort wins.
fn dependency(
    g: &Grammar,
    st: &mut MatchState,
    window: &Window,
    win: &SingleWindow,
    pos: usize,
    test: &ContextualTest,
) -> TestResult {
    let cohort = &win.cohorts[pos];

    let candidates: Vec<u32> = if test.dep_parent {
        if cohort.dep_parent == DEP_NO_PARENT || cohort.dep_parent == cohort.global_number {
            Vec::new()
        } else {
            vec![cohort.dep_parent]
        }
    } else if test.dep_child {
        cohort.dep_children.iter().copied().collect()
    } else {
        // siblings: the other children of this cohort's parent
        match window
            .find_cohort(cohort.dep_parent)
            .filter(|_| cohort.dep_parent != DEP_NO_PARENT)
        {
            Some((_, parent)) => parent
                .dep_children
                .iter()
                .copied()
                .filter(|&c| c != cohort.global_number)
                .collect(),
            None => Vec::new(),
        }
    };

    let here = window.order_of(win.number);
    let mut matched_target = None;

    for cand in candidates {
        if st.dep_exclude.contains(&cand) {
            continue;
        }
        let Some((cand_win, cand_cohort)) = window.find_cohort(cand) else {
            warn!(dependency = cand, "dependency does not exist - ignoring");
            continue;
        };
        if cand_win.number != win.number {
            let there = window.order_of(cand_win.number);
            let left = there < here;
            if left && !(test.span_both || test.span_left) {
                continue;
            }
            if !left && !(test.span_both || test.span_right) {
                continue;
            }
        }
        let hit = if test.careful {
            cohort_matches_careful(g, st, &cand_win.variables, cand_cohort, test.target)
        } else {
            cohort_matches_normal(g, st, &cand_win.variables, cand_cohort, test.target)
        };
        if hit {
            matched_target = Some((cand_win.number, cand_cohort.local_number as usize, cand));
            break;
        }
    }

    let mut result = matched_target.is_some();
    if test.negative {
        result = !result;
    }
    if result {
        if let Some(linked) = &test.linked {
            let (lw, lp) = match matched_target {
                Some((w, p, _)) => (w, p),
                None => (win.number, pos),
            };
            result = run_contextual_test(g, st, window, lw, lp, linked).matched;
        }
    }
    TestResult {
        matched: result,
        target: matched_target.map(|(_, _, global)| global),
    }
}
