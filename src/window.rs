//! Window / Cohort / Reading data model.
//!
//! This is the graph the rules mutate. Ownership is strictly tree-shaped:
//! a [`Window`] owns its [`SingleWindow`]s, a window owns its [`Cohort`]s,
//! a cohort owns its [`Reading`]s, and a reading owns its sub-reading chain.
//! Cross-links (dependency edges, relations, the global cohort map) are
//! plain integer ids, never pointers, so any cohort can be looked up again
//! after the vectors shift.
//!
//! The single most important invariant: `Reading::tags_list` is the ground
//! truth. The set view, the partitioned numeric/textual/mapped views, the
//! wordform/baseform shortcuts and the content hash are all derived, and
//! must be rebuilt with [`Reading::reflow`] after any mutation of the list.
//! The engine's memo caches key on `Reading::hash`, so a stale hash silently
//! poisons matching.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::tags::{TagFlags, TagId, TagPool};
use crate::{RuleLine, SetId, DEP_NO_PARENT};

/// One candidate morphological analysis of a cohort.
#[derive(Debug, Default, Clone)]
pub struct Reading {
    pub(crate) tags_list: SmallVec<[TagId; 8]>,
    pub(crate) tags: HashSet<TagId>,
    pub(crate) tags_numerical: Vec<TagId>,
    pub(crate) tags_textual: Vec<TagId>,
    pub(crate) tags_mapped: Vec<TagId>,
    pub(crate) wordform: Option<TagId>,
    pub(crate) baseform: Option<TagId>,
    pub(crate) hash: u64,
    pub(crate) hash_plain: u64,
    /// Sub-reading chain (sub-word analyses).
    pub(crate) next: Option<Box<Reading>>,
    pub(crate) deleted: bool,
    pub(crate) noprint: bool,
    pub(crate) mapped: bool,
    /// Lines of the rules that touched this reading, in firing order.
    pub(crate) hit_by: Vec<RuleLine>,
    /// Input order, used to keep output deterministic.
    pub(crate) number: u32,
}

impl Reading {
    pub fn new() -> Self {
        Reading::default()
    }

    pub fn with_tags(tags: impl IntoIterator<Item = TagId>, pool: &TagPool) -> Self {
        let mut r = Reading::new();
        r.tags_list.extend(tags);
        r.reflow(pool);
        r
    }

    pub fn tags(&self) -> &[TagId] {
        &self.tags_list
    }

    pub fn has_tag(&self, tag: TagId) -> bool {
        self.tags.contains(&tag)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn baseform(&self) -> Option<TagId> {
        self.baseform
    }

    pub fn hit_by(&self) -> &[RuleLine] {
        &self.hit_by
    }

    pub fn sub_reading(&self) -> Option<&Reading> {
        self.next.as_deref()
    }

    pub(crate) fn push_tag(&mut self, tag: TagId) {
        self.tags_list.push(tag);
    }

    /// Rebuild every derived view and the content hash from `tags_list`.
    pub fn reflow(&mut self, pool: &TagPool) {
        self.tags.clear();
        self.tags_numerical.clear();
        self.tags_textual.clear();
        self.tags_mapped.clear();
        self.wordform = None;
        self.baseform = None;

        for &id in &self.tags_list {
            self.tags.insert(id);
            let tag = pool.get(id);
            if tag.is(TagFlags::NUMERICAL) {
                self.tags_numerical.push(id);
            }
            if tag.is(TagFlags::TEXTUAL) {
                self.tags_textual.push(id);
            }
            if tag.is(TagFlags::MAPPING) {
                self.tags_mapped.push(id);
            }
            if tag.is(TagFlags::WORDFORM) && self.wordform.is_none() {
                self.wordform = Some(id);
            } else if tag.is(TagFlags::BASEFORM) && self.baseform.is_none() {
                self.baseform = Some(id);
            }
        }

        let mut h = DefaultHasher::new();
        for &id in &self.tags_list {
            id.0.hash(&mut h);
        }
        self.hash = h.finish().max(1);

        let mut hp = DefaultHasher::new();
        for &id in &self.tags_list {
            if Some(id) != self.wordform {
                id.0.hash(&mut hp);
            }
        }
        self.hash_plain = hp.finish().max(1);
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CohortType: u8 {
        const REMOVED     = 1 << 0;
        const ENCLOSED    = 1 << 1;
        const RELATED     = 1 << 2;
        /// Candidate-set entry for this cohort is up to date.
        const NUM_CURRENT = 1 << 3;
    }
}

/// One input token with its candidate readings.
#[derive(Debug)]
pub struct Cohort {
    pub(crate) wordform: TagId,
    pub(crate) readings: Vec<Reading>,
    /// Readings removed during this run, kept for output fidelity.
    pub(crate) deleted: Vec<Reading>,
    /// Readings deferred by DELAYED rules.
    pub(crate) delayed: Vec<Reading>,
    pub(crate) static_tags: Vec<TagId>,
    /// Raw text attached between this cohort and the next.
    pub(crate) text: String,
    pub(crate) local_number: u32,
    pub(crate) global_number: u32,
    /// Superset of the sets any reading here may match; indexing hint only.
    pub(crate) possible_sets: HashSet<SetId>,
    pub(crate) dep_self: u32,
    pub(crate) dep_parent: u32,
    pub(crate) dep_children: BTreeSet<u32>,
    /// Relation-name tag -> target cohorts (global numbers).
    pub(crate) relations: IndexMap<TagId, BTreeSet<u32>>,
    pub(crate) ctype: CohortType,
    pub(crate) reading_counter: u32,
}

impl Cohort {
    pub fn new(wordform: TagId, global_number: u32) -> Self {
        Cohort {
            wordform,
            readings: Vec::new(),
            deleted: Vec::new(),
            delayed: Vec::new(),
            static_tags: Vec::new(),
            text: String::new(),
            local_number: 0,
            global_number,
            possible_sets: HashSet::new(),
            dep_self: global_number,
            dep_parent: DEP_NO_PARENT,
            dep_children: BTreeSet::new(),
            relations: IndexMap::new(),
            ctype: CohortType::empty(),
            reading_counter: 0,
        }
    }

    pub fn wordform(&self) -> TagId {
        self.wordform
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn deleted_readings(&self) -> &[Reading] {
        &self.deleted
    }

    pub fn global_number(&self) -> u32 {
        self.global_number
    }

    pub fn local_number(&self) -> u32 {
        self.local_number
    }

    pub fn dep_parent(&self) -> u32 {
        self.dep_parent
    }

    pub fn relations(&self) -> &IndexMap<TagId, BTreeSet<u32>> {
        &self.relations
    }

    pub fn append_reading(&mut self, mut reading: Reading) {
        self.reading_counter += 1;
        reading.number = self.reading_counter;
        self.readings.push(reading);
    }

    /// A cohort whose adapter gave it no readings gets one magic reading
    /// carrying only its wordform, so rules can still see it.
    pub fn init_empty(&mut self, pool: &TagPool) {
        if self.readings.is_empty() {
            let mut r = Reading::new();
            r.push_tag(self.wordform);
            r.reflow(pool);
            r.baseform = Some(self.wordform);
            self.append_reading(r);
        }
    }

    pub(crate) fn non_deleted(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter().filter(|r| !r.deleted)
    }

    pub(crate) fn num_non_deleted(&self) -> usize {
        self.non_deleted().count()
    }
}

/// A region of cohorts lifted out of the window before the main passes.
#[derive(Debug)]
pub(crate) struct Enclosure {
    /// Local position the region was removed from.
    pub(crate) at: usize,
    pub(crate) cohorts: Vec<Cohort>,
}

/// One sentence: the unit the rules run to fixpoint over. Cohort 0 is a
/// sentinel carrying the sentence-start tag and is never a rule target.
#[derive(Debug)]
pub struct SingleWindow {
    pub(crate) number: u32,
    pub(crate) cohorts: Vec<Cohort>,
    /// REMCOHORT victims, in removal order.
    pub(crate) removed: Vec<Cohort>,
    pub(crate) rule_to_cohorts: HashMap<RuleLine, BTreeSet<u32>>,
    pub(crate) valid_rules: BTreeSet<RuleLine>,
    pub(crate) variables: IndexMap<String, String>,
    pub(crate) flush_after: bool,
    pub(crate) enclosures: Vec<Enclosure>,
    pub(crate) has_dep: bool,
}

impl SingleWindow {
    pub(crate) fn new(number: u32, sentinel: Cohort) -> Self {
        SingleWindow {
            number,
            cohorts: vec![sentinel],
            removed: Vec::new(),
            rule_to_cohorts: HashMap::new(),
            valid_rules: BTreeSet::new(),
            variables: IndexMap::new(),
            flush_after: false,
            enclosures: Vec::new(),
            has_dep: false,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn cohorts(&self) -> &[Cohort] {
        &self.cohorts
    }

    pub fn removed_cohorts(&self) -> &[Cohort] {
        &self.removed
    }

    pub fn variables(&self) -> &IndexMap<String, String> {
        &self.variables
    }

    pub fn append_cohort(&mut self, mut cohort: Cohort) {
        cohort.local_number = self.cohorts.len() as u32;
        self.cohorts.push(cohort);
    }

    pub(crate) fn renumber(&mut self) {
        for (i, cohort) in self.cohorts.iter_mut().enumerate() {
            cohort.local_number = i as u32;
        }
    }

    pub(crate) fn cohort_by_global(&self, global: u32) -> Option<&Cohort> {
        self.cohorts.iter().find(|c| c.global_number == global)
    }

    pub(crate) fn cohort_by_global_mut(&mut self, global: u32) -> Option<&mut Cohort> {
        self.cohorts.iter_mut().find(|c| c.global_number == global)
    }

    /// Rebuild `dep_children` from the `dep_parent` edges within this window.
    pub(crate) fn reflow_dependencies(&mut self) {
        let edges: Vec<(u32, u32)> = self
            .cohorts
            .iter()
            .filter(|c| c.dep_parent != DEP_NO_PARENT && c.dep_parent != c.global_number)
            .map(|c| (c.global_number, c.dep_parent))
            .collect();
        for cohort in &mut self.cohorts {
            cohort.dep_children.clear();
        }
        let mut any = false;
        for (child, parent) in edges {
            if let Some(p) = self.cohort_by_global_mut(parent) {
                p.dep_children.insert(child);
                any = true;
            }
        }
        if any {
            self.has_dep = true;
        }
    }
}

/// Sliding buffer of sentence windows: past windows kept for left-spanning
/// tests, future windows for right-spanning ones. `span` bounds both sides.
#[derive(Debug)]
pub struct Window {
    pub(crate) previous: VecDeque<SingleWindow>,
    pub(crate) current: Option<SingleWindow>,
    pub(crate) next: VecDeque<SingleWindow>,
    pub(crate) cohort_map: HashMap<u32, u32>,
    pub(crate) cohort_counter: u32,
    pub(crate) window_counter: u32,
    pub(crate) span: u32,
}

impl Window {
    pub fn new(span: u32) -> Self {
        Window {
            previous: VecDeque::new(),
            current: None,
            next: VecDeque::new(),
            cohort_map: HashMap::new(),
            cohort_counter: 1,
            window_counter: 0,
            span,
        }
    }

    pub fn next_global_number(&mut self) -> u32 {
        let n = self.cohort_counter;
        self.cohort_counter += 1;
        n
    }

    pub(crate) fn next_window_number(&mut self) -> u32 {
        self.window_counter += 1;
        self.window_counter
    }

    /// Allocate a fresh window (with its sentinel cohort) and append it to
    /// the `next` buffer.
    pub fn alloc_append_window(&mut self, pool: &TagPool) -> &mut SingleWindow {
        let number = self.next_window_number();
        let global = self.next_global_number();
        let mut sentinel = Cohort::new(pool.begin_tag(), global);
        let mut reading = Reading::new();
        reading.push_tag(pool.begin_tag());
        reading.reflow(pool);
        reading.baseform = Some(pool.begin_tag());
        sentinel.append_reading(reading);
        self.next.push_back(SingleWindow::new(number, sentinel));
        self.next.back_mut().expect("window was just pushed")
    }

    /// Rotate: current moves to `previous`, the head of `next` becomes
    /// current. Old windows past the span are expected to have been drained
    /// by the caller (the adapter prints and drops them).
    pub fn shuffle_down(&mut self) {
        if let Some(cur) = self.current.take() {
            self.previous.push_back(cur);
        }
        self.current = self.next.pop_front();
    }

    pub fn current(&self) -> Option<&SingleWindow> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut SingleWindow> {
        self.current.as_mut()
    }

    pub(crate) fn windows(&self) -> impl Iterator<Item = &SingleWindow> {
        self.previous.iter().chain(self.current.iter()).chain(self.next.iter())
    }

    pub(crate) fn by_number(&self, number: u32) -> Option<&SingleWindow> {
        self.windows().find(|w| w.number == number)
    }

    pub(crate) fn by_number_mut(&mut self, number: u32) -> Option<&mut SingleWindow> {
        self.previous
            .iter_mut()
            .chain(self.current.iter_mut())
            .chain(self.next.iter_mut())
            .find(|w| w.number == number)
    }

    /// Buffer-order position of a window, for left/right comparisons.
    pub(crate) fn order_of(&self, number: u32) -> Option<usize> {
        self.windows().position(|w| w.number == number)
    }

    /// Window immediately before `number` in buffer order. DELIMIT can slot
    /// windows into the middle of the buffer, so adjacency is positional,
    /// not numeric.
    pub(crate) fn previous_from(&self, number: u32) -> Option<&SingleWindow> {
        let mut prev = None;
        for win in self.windows() {
            if win.number == number {
                return prev;
            }
            prev = Some(win);
        }
        None
    }

    /// Window immediately after `number` in buffer order.
    pub(crate) fn next_from(&self, number: u32) -> Option<&SingleWindow> {
        let mut found = false;
        for win in self.windows() {
            if found {
                return Some(win);
            }
            if win.number == number {
                found = true;
            }
        }
        None
    }

    /// Rebuild the global-number -> window map over every buffered window.
    pub(crate) fn rebuild_cohort_map(&mut self) {
        let mut map = HashMap::new();
        for win in self.windows() {
            for cohort in &win.cohorts {
                map.insert(cohort.global_number, win.number);
            }
        }
        self.cohort_map = map;
    }

    /// Locate a cohort by global number across all buffered windows.
    pub(crate) fn find_cohort(&self, global: u32) -> Option<(&SingleWindow, &Cohort)> {
        let win_no = *self.cohort_map.get(&global)?;
        let win = self.by_number(win_no)?;
        let cohort = win.cohort_by_global(global)?;
        Some((win, cohort))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> TagPool {
        TagPool::new('@')
    }

    #[test]
    fn reflow_rebuilds_views_and_hash() {
        let mut p = pool();
        let wf = p.intern_input("\"<cat>\"");
        let bf = p.intern_input("\"cat\"");
        let n = p.intern_input("N");
        let num = p.intern_input("<n=3>");
        let map = p.intern_input("@SUBJ");

        let mut r = Reading::new();
        for t in [wf, bf, n, num, map] {
            r.push_tag(t);
        }
        r.reflow(&p);

        assert_eq!(r.wordform, Some(wf));
        assert_eq!(r.baseform, Some(bf));
        assert_eq!(r.tags_numerical, vec![num]);
        assert_eq!(r.tags_mapped, vec![map]);
        assert!(r.tags_textual.contains(&wf) && r.tags_textual.contains(&bf));
        assert_ne!(r.hash, 0);

        let before = r.hash;
        let extra = p.intern_input("Sg");
        r.push_tag(extra);
        r.reflow(&p);
        assert_ne!(r.hash, before);
        assert!(r.has_tag(extra));
    }

    #[test]
    fn hash_tracks_tags_list_exactly() {
        let mut p = pool();
        let a = p.intern_input("a");
        let b = p.intern_input("b");
        let mut r1 = Reading::with_tags([a, b], &p);
        let r2 = Reading::with_tags([a, b], &p);
        assert_eq!(r1.hash, r2.hash);

        // order matters: tags_list is a sequence, not a set
        let r3 = Reading::with_tags([b, a], &p);
        assert_ne!(r1.hash, r3.hash);

        // add then remove restores the hash
        let c = p.intern_input("c");
        let before = r1.hash;
        r1.push_tag(c);
        r1.reflow(&p);
        assert_ne!(r1.hash, before);
        r1.tags_list.retain(|t| *t != c);
        r1.reflow(&p);
        assert_eq!(r1.hash, before);
    }

    #[test]
    fn empty_cohort_gets_magic_reading() {
        let mut p = pool();
        let wf = p.intern_input("\"<x>\"");
        let mut c = Cohort::new(wf, 1);
        c.init_empty(&p);
        assert_eq!(c.readings.len(), 1);
        assert_eq!(c.readings[0].baseform, Some(wf));
        // idempotent
        c.init_empty(&p);
        assert_eq!(c.readings.len(), 1);
    }

    #[test]
    fn window_allocation_and_rotation() {
        let mut p = pool();
        let mut w = Window::new(2);
        {
            let win = w.alloc_append_window(&p);
            assert_eq!(win.cohorts.len(), 1);
            assert_eq!(win.cohorts[0].local_number, 0);
        }
        let wf = p.intern_input("\"<a>\"");
        let g = w.next_global_number();
        w.next.back_mut().unwrap().append_cohort(Cohort::new(wf, g));

        w.shuffle_down();
        assert!(w.current().is_some());
        assert_eq!(w.current().unwrap().cohorts.len(), 2);
        assert_eq!(w.current().unwrap().cohorts[1].local_number, 1);

        w.rebuild_cohort_map();
        let (win, cohort) = w.find_cohort(g).unwrap();
        assert_eq!(win.number, w.current().unwrap().number);
        assert_eq!(cohort.global_number, g);
    }

    #[test]
    fn dependency_reflow_builds_children() {
        let mut p = pool();
        let mut w = Window::new(2);
        w.alloc_append_window(&p);
        let wf = p.intern_input("\"<t>\"");
        let g1 = w.next_global_number();
        let g2 = w.next_global_number();
        let g3 = w.next_global_number();
        {
            let win = w.next.back_mut().unwrap();
            for g in [g1, g2, g3] {
                win.append_cohort(Cohort::new(wf, g));
            }
            win.cohorts[1].dep_parent = g2;
            win.cohorts[3].dep_parent = g2;
            win.reflow_dependencies();
            let parent = win.cohort_by_global(g2).unwrap();
            assert_eq!(parent.dep_children.iter().copied().collect::<Vec<_>>(), vec![g1, g3]);
            assert!(win.has_dep);
        }
    }
}
