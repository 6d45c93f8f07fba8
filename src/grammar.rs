//! Compiled grammar: sets, rules, contextual tests and load-time indexes.
//!
//! Grammars are immutable after [`GrammarBuilder::build`]. The builder is the
//! crate's substitute for a grammar-source parser (out of scope): callers
//! intern tags, compose sets, and push rules programmatically, then `build`
//! validates everything and derives the static indexes the engine needs:
//!
//! - `sets_by_tag`: tag -> every set that transitively references it. Used
//!   both for the matcher's negative prefilter and for per-cohort
//!   `possible_sets` during window indexing.
//! - `rules_by_tag`: tag -> rules whose target set transitively references
//!   it. Drives candidate-cohort registration and incremental
//!   `update_valid_rules` after a mutation introduces a new tag.
//! - `runsections`: cumulative rule lists, so section `k` re-runs everything
//!   from sections `1..=k`.
//!
//! Set flags (`SPECIAL`, `HAS_MAPPINGS`, `MATCH_ANY`) are derived here once
//! rather than checked per match.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::tags::{CompositeId, TagError, TagFlags, TagId, TagPool};
use crate::{RuleLine, SetId};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetFlags: u8 {
        /// The set contains the `*` tag and matches any reading.
        const MATCH_ANY    = 1 << 0;
        /// Membership cannot be prefiltered through the tag index.
        const SPECIAL      = 1 << 1;
        /// Some transitive constituent is a mapping tag.
        const HAS_MAPPINGS = 1 << 2;
        const CHILD_UNIFY  = 1 << 3;
        const MAPPING      = 1 << 4;
    }
}

/// Binary operator between adjacent members of a set expression.
///
/// The member list is evaluated left-associatively in groups delimited by
/// `Or`; see the matcher for the group semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Or,
    /// Intersection: both sides must match.
    Plus,
    /// Difference: left matches, right does not.
    Minus,
    /// Left matches but right matching fails the whole set.
    Failfast,
    /// Neither side matches.
    Not,
    /// Unifying intersection.
    IsectU,
    /// Unifying symmetric difference.
    SymdiffU,
}

/// A named or anonymous boolean combination of tags and sub-sets.
#[derive(Debug)]
pub struct Set {
    pub(crate) name: String,
    pub(crate) single_tags: HashSet<TagId>,
    pub(crate) composites: Vec<CompositeId>,
    pub(crate) sets: Vec<SetId>,
    pub(crate) ops: Vec<SetOp>,
    pub(crate) flags: SetFlags,
}

impl Set {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> SetFlags {
        self.flags
    }

    pub(crate) fn is_special(&self) -> bool {
        self.flags.contains(SetFlags::SPECIAL)
    }

    pub(crate) fn has_mappings(&self) -> bool {
        self.flags.contains(SetFlags::HAS_MAPPINGS)
    }
}

/// Action keyword of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Select,
    Remove,
    Iff,
    Add,
    Map,
    Replace,
    Substitute,
    Append,
    Delimit,
    RemCohort,
    MoveBefore,
    MoveAfter,
    Switch,
    SetParent,
    SetChild,
    AddRelation,
    SetRelation,
    RemRelation,
    AddRelations,
    SetRelations,
    RemRelations,
    SetVariable,
    RemVariable,
}

impl RuleType {
    /// MAP/ADD/REPLACE are gated by the `apply_mappings` option.
    pub(crate) fn is_mapping(self) -> bool {
        matches!(self, RuleType::Map | RuleType::Add | RuleType::Replace)
    }

    /// SUBSTITUTE/APPEND are gated by the `apply_corrections` option.
    pub(crate) fn is_correction(self) -> bool {
        matches!(self, RuleType::Substitute | RuleType::Append)
    }

    /// Rules that resolve a second cohort through `dep_target`.
    pub(crate) fn needs_dep_target(self) -> bool {
        matches!(
            self,
            RuleType::MoveBefore
                | RuleType::MoveAfter
                | RuleType::Switch
                | RuleType::SetParent
                | RuleType::SetChild
                | RuleType::AddRelation
                | RuleType::SetRelation
                | RuleType::RemRelation
                | RuleType::AddRelations
                | RuleType::SetRelations
                | RuleType::RemRelations
        )
    }
}

bitflags::bitflags! {
    /// Per-rule behavior modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuleFlags: u32 {
        const NEAREST    = 1 << 0;
        const ALLOWLOOP  = 1 << 1;
        const ALLOWCROSS = 1 << 2;
        const DELAYED    = 1 << 3;
        const UNSAFE     = 1 << 4;
        const SAFE       = 1 << 5;
        const REMEMBERX  = 1 << 6;
        const RESETX     = 1 << 7;
        const KEEPORDER  = 1 << 8;
        const ENCL_INNER = 1 << 9;
        const ENCL_OUTER = 1 << 10;
        const ENCL_FINAL = 1 << 11;
        const NOITERATE  = 1 << 12;
        const ITERATE    = 1 << 13;
    }
}

impl RuleFlags {
    pub(crate) const ENCL_ANY: RuleFlags = RuleFlags::ENCL_INNER
        .union(RuleFlags::ENCL_OUTER)
        .union(RuleFlags::ENCL_FINAL);
}

/// Which batch of the grammar a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Before,
    /// 1-based section number.
    Numbered(u32),
    After,
}

/// A positional (or dependency-directed) predicate on the window, evaluated
/// relative to a target cohort. Linked tests chain through `linked`; sibling
/// tests on the same rule live in `Rule::tests`.
#[derive(Debug, Clone)]
pub struct ContextualTest {
    pub offset: i32,
    pub absolute: bool,
    pub span_both: bool,
    pub span_left: bool,
    pub span_right: bool,
    /// `*`: any position in scan direction may satisfy the test.
    pub scanall: bool,
    /// `*C`: the scan stops at the first cohort matching the target.
    pub scanfirst: bool,
    /// All readings of the tested cohort must match.
    pub careful: bool,
    pub negative: bool,
    pub target: SetId,
    pub barrier: Option<SetId>,
    pub cbarrier: Option<SetId>,
    pub dep_child: bool,
    pub dep_sibling: bool,
    pub dep_parent: bool,
    pub linked: Option<Box<ContextualTest>>,
}

impl ContextualTest {
    pub fn at(offset: i32, target: SetId) -> Self {
        ContextualTest {
            offset,
            absolute: false,
            span_both: false,
            span_left: false,
            span_right: false,
            scanall: false,
            scanfirst: false,
            careful: false,
            negative: false,
            target,
            barrier: None,
            cbarrier: None,
            dep_child: false,
            dep_sibling: false,
            dep_parent: false,
            linked: None,
        }
    }

    pub fn scan_all(mut self) -> Self {
        self.scanall = true;
        self
    }

    pub fn scan_first(mut self) -> Self {
        self.scanfirst = true;
        self
    }

    pub fn careful(mut self) -> Self {
        self.careful = true;
        self
    }

    pub fn negative(mut self) -> Self {
        self.negative = true;
        self
    }

    pub fn absolute(mut self) -> Self {
        self.absolute = true;
        self
    }

    pub fn spanning(mut self) -> Self {
        self.span_both = true;
        self
    }

    pub fn span_left(mut self) -> Self {
        self.span_left = true;
        self
    }

    pub fn span_right(mut self) -> Self {
        self.span_right = true;
        self
    }

    pub fn barrier(mut self, set: SetId) -> Self {
        self.barrier = Some(set);
        self
    }

    pub fn cbarrier(mut self, set: SetId) -> Self {
        self.cbarrier = Some(set);
        self
    }

    pub fn child(mut self) -> Self {
        self.dep_child = true;
        self
    }

    pub fn sibling(mut self) -> Self {
        self.dep_sibling = true;
        self
    }

    pub fn parent(mut self) -> Self {
        self.dep_parent = true;
        self
    }

    pub fn link(mut self, test: ContextualTest) -> Self {
        self.linked = Some(Box::new(test));
        self
    }
}

/// A grammar rule, immutable after load.
#[derive(Debug)]
pub struct Rule {
    pub line: RuleLine,
    pub kind: RuleType,
    pub target: SetId,
    pub wordform: Option<TagId>,
    pub flags: RuleFlags,
    pub maplist: Vec<TagId>,
    pub sublist: Vec<TagId>,
    pub tests: Vec<ContextualTest>,
    pub dep_target: Option<ContextualTest>,
    pub childset1: Option<SetId>,
    pub childset2: Option<SetId>,
    pub varname: Option<String>,
    pub varvalue: Option<String>,
    pub section: Section,
}

impl Rule {
    pub fn new(kind: RuleType, target: SetId) -> Self {
        Rule {
            line: 0,
            kind,
            target,
            wordform: None,
            flags: RuleFlags::empty(),
            maplist: Vec::new(),
            sublist: Vec::new(),
            tests: Vec::new(),
            dep_target: None,
            childset1: None,
            childset2: None,
            varname: None,
            varvalue: None,
            section: Section::Numbered(1),
        }
    }

    pub fn wordform(mut self, tag: TagId) -> Self {
        self.wordform = Some(tag);
        self
    }

    pub fn flags(mut self, flags: RuleFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn maplist(mut self, tags: Vec<TagId>) -> Self {
        self.maplist = tags;
        self
    }

    pub fn sublist(mut self, tags: Vec<TagId>) -> Self {
        self.sublist = tags;
        self
    }

    pub fn test(mut self, test: ContextualTest) -> Self {
        self.tests.push(test);
        self
    }

    pub fn dep_target(mut self, test: ContextualTest) -> Self {
        self.dep_target = Some(test);
        self
    }

    pub fn childset1(mut self, set: SetId) -> Self {
        self.childset1 = Some(set);
        self
    }

    pub fn childset2(mut self, set: SetId) -> Self {
        self.childset2 = Some(set);
        self
    }

    pub fn varname(mut self, name: &str) -> Self {
        self.varname = Some(name.to_string());
        self
    }

    pub fn varvalue(mut self, value: &str) -> Self {
        self.varvalue = Some(value.to_string());
        self
    }

    pub fn section(mut self, section: Section) -> Self {
        self.section = section;
        self
    }
}

/// Fatal grammar-load errors. Nothing here is recoverable: a grammar that
/// fails to build never reaches the engine.
#[derive(Debug, Error)]
pub enum GrammarError {
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("unknown set {0:?}")]
    UnknownSet(String),
    #[error("duplicate set name {0:?}")]
    DuplicateSet(String),
    #[error("set {0:?} has no members")]
    EmptySet(String),
    #[error("set {name:?} has {members} members but {ops} operators")]
    BadSetOps { name: String, members: usize, ops: usize },
    #[error("set id {0} out of range")]
    BadSetId(u32),
    #[error("rule on line {line} is missing {what}")]
    MissingOperand { line: RuleLine, what: &'static str },
    #[error("grammar has no rules")]
    NoRules,
}

/// The compiled grammar.
#[derive(Debug)]
pub struct Grammar {
    pool: TagPool,
    sets: Vec<Set>,
    rules: Vec<Rule>,
    rules_by_line: HashMap<RuleLine, usize>,
    before_sections: Vec<RuleLine>,
    /// `runsections[k]` holds every numbered-section rule from sections
    /// `1..=k+1`, sorted by line.
    runsections: Vec<Vec<RuleLine>>,
    after_sections: Vec<RuleLine>,
    delimiters: Option<SetId>,
    soft_delimiters: Option<SetId>,
    sets_by_tag: HashMap<TagId, HashSet<SetId>>,
    rules_by_tag: HashMap<TagId, Vec<RuleLine>>,
    /// Sets that match any cohort; always part of `possible_sets`.
    sets_any: Vec<SetId>,
    /// Rules whose target set cannot be prefiltered by tag.
    special_rules: Vec<RuleLine>,
    has_enclosures: bool,
}

impl Grammar {
    pub fn builder() -> GrammarBuilder {
        GrammarBuilder::new()
    }

    pub fn pool(&self) -> &TagPool {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut TagPool {
        &mut self.pool
    }

    pub fn set(&self, id: SetId) -> &Set {
        &self.sets[id.index()]
    }

    pub fn rule(&self, line: RuleLine) -> &Rule {
        &self.rules[self.rules_by_line[&line]]
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub(crate) fn before_sections(&self) -> &[RuleLine] {
        &self.before_sections
    }

    pub(crate) fn runsections(&self) -> &[Vec<RuleLine>] {
        &self.runsections
    }

    pub(crate) fn after_sections(&self) -> &[RuleLine] {
        &self.after_sections
    }

    pub fn delimiters(&self) -> Option<SetId> {
        self.delimiters
    }

    pub fn soft_delimiters(&self) -> Option<SetId> {
        self.soft_delimiters
    }

    pub(crate) fn sets_by_tag(&self, tag: TagId) -> Option<&HashSet<SetId>> {
        self.sets_by_tag.get(&tag)
    }

    pub(crate) fn rules_by_tag(&self, tag: TagId) -> &[RuleLine] {
        self.rules_by_tag.get(&tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn sets_any(&self) -> &[SetId] {
        &self.sets_any
    }

    pub(crate) fn special_rules(&self) -> &[RuleLine] {
        &self.special_rules
    }

    pub(crate) fn has_enclosures(&self) -> bool {
        self.has_enclosures
    }
}

/// Programmatic grammar construction with build-time validation.
pub struct GrammarBuilder {
    pool: TagPool,
    sets: Vec<Set>,
    sets_by_name: HashMap<String, SetId>,
    rules: Vec<Rule>,
    delimiters: Option<SetId>,
    soft_delimiters: Option<SetId>,
    next_line: RuleLine,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::with_mapping_prefix('@')
    }

    pub fn with_mapping_prefix(prefix: char) -> Self {
        GrammarBuilder {
            pool: TagPool::new(prefix),
            sets: Vec::new(),
            sets_by_name: HashMap::new(),
            rules: Vec::new(),
            delimiters: None,
            soft_delimiters: None,
            next_line: 1,
        }
    }

    pub fn pool_mut(&mut self) -> &mut TagPool {
        &mut self.pool
    }

    pub fn tag(&mut self, raw: &str) -> Result<TagId, GrammarError> {
        Ok(self.pool.intern(raw)?)
    }

    /// `LIST name = items`: each item is a tag text; whitespace inside an
    /// item makes it a composite tag (a conjunction).
    pub fn list(&mut self, name: &str, items: &[&str]) -> Result<SetId, GrammarError> {
        let mut single_tags = HashSet::new();
        let mut composites = Vec::new();
        for item in items {
            let parts: Vec<&str> = item.split_whitespace().collect();
            match parts.as_slice() {
                [] => return Err(GrammarError::EmptySet(name.to_string())),
                [one] => {
                    single_tags.insert(self.pool.intern(one)?);
                }
                many => {
                    let mut tags = Vec::with_capacity(many.len());
                    for part in many {
                        tags.push(self.pool.intern(part)?);
                    }
                    composites.push(self.pool.intern_composite(tags));
                }
            }
        }
        if single_tags.is_empty() && composites.is_empty() {
            return Err(GrammarError::EmptySet(name.to_string()));
        }
        self.insert_set(Set {
            name: name.to_string(),
            single_tags,
            composites,
            sets: Vec::new(),
            ops: Vec::new(),
            flags: SetFlags::empty(),
        })
    }

    /// `SET name = a OP b OP c ...`: a combination of previously defined
    /// sets. `ops` must hold exactly `members.len() - 1` operators.
    pub fn set(&mut self, name: &str, members: &[SetId], ops: &[SetOp]) -> Result<SetId, GrammarError> {
        if members.is_empty() {
            return Err(GrammarError::EmptySet(name.to_string()));
        }
        if ops.len() + 1 != members.len() {
            return Err(GrammarError::BadSetOps {
                name: name.to_string(),
                members: members.len(),
                ops: ops.len(),
            });
        }
        for &m in members {
            if m.index() >= self.sets.len() {
                return Err(GrammarError::BadSetId(m.0));
            }
        }
        self.insert_set(Set {
            name: name.to_string(),
            single_tags: HashSet::new(),
            composites: Vec::new(),
            sets: members.to_vec(),
            ops: ops.to_vec(),
            flags: SetFlags::empty(),
        })
    }

    pub fn set_by_name(&self, name: &str) -> Result<SetId, GrammarError> {
        self.sets_by_name
            .get(name)
            .copied()
            .ok_or_else(|| GrammarError::UnknownSet(name.to_string()))
    }

    pub fn delimiters(&mut self, set: SetId) -> &mut Self {
        self.delimiters = Some(set);
        self
    }

    pub fn soft_delimiters(&mut self, set: SetId) -> &mut Self {
        self.soft_delimiters = Some(set);
        self
    }

    /// Append a rule; its line number is assigned in push order unless the
    /// caller set one explicitly.
    pub fn add(&mut self, mut rule: Rule) -> Result<RuleLine, GrammarError> {
        if rule.line == 0 {
            rule.line = self.next_line;
        }
        self.next_line = self.next_line.max(rule.line) + 1;
        self.validate_rule(&rule)?;
        let line = rule.line;
        self.rules.push(rule);
        Ok(line)
    }

    fn validate_rule(&self, rule: &Rule) -> Result<(), GrammarError> {
        let line = rule.line;
        let missing = |what| GrammarError::MissingOperand { line, what };
        if rule.target.index() >= self.sets.len() {
            return Err(GrammarError::BadSetId(rule.target.0));
        }
        match rule.kind {
            RuleType::Map | RuleType::Add | RuleType::Replace | RuleType::Append => {
                if rule.maplist.is_empty() {
                    return Err(missing("a tag list"));
                }
            }
            RuleType::Substitute => {
                // an empty maplist is a pure removal
                if rule.sublist.is_empty() {
                    return Err(missing("tags to remove"));
                }
            }
            RuleType::AddRelation | RuleType::SetRelation | RuleType::RemRelation => {
                if rule.maplist.is_empty() {
                    return Err(missing("a relation name"));
                }
                if rule.dep_target.is_none() {
                    return Err(missing("a target context"));
                }
            }
            RuleType::AddRelations | RuleType::SetRelations | RuleType::RemRelations => {
                if rule.maplist.is_empty() || rule.sublist.is_empty() {
                    return Err(missing("both relation names"));
                }
                if rule.dep_target.is_none() {
                    return Err(missing("a target context"));
                }
            }
            RuleType::MoveBefore
            | RuleType::MoveAfter
            | RuleType::Switch
            | RuleType::SetParent
            | RuleType::SetChild => {
                if rule.dep_target.is_none() {
                    return Err(missing("a target context"));
                }
            }
            RuleType::SetVariable | RuleType::RemVariable => {
                if rule.varname.is_none() {
                    return Err(missing("a variable name"));
                }
            }
            _ => {}
        }
        for test in rule.tests.iter().chain(rule.dep_target.as_ref()) {
            self.validate_test(test)?;
        }
        Ok(())
    }

    fn validate_test(&self, test: &ContextualTest) -> Result<(), GrammarError> {
        for set in [Some(test.target), test.barrier, test.cbarrier].into_iter().flatten() {
            if set.index() >= self.sets.len() {
                return Err(GrammarError::BadSetId(set.0));
            }
        }
        if let Some(linked) = &test.linked {
            self.validate_test(linked)?;
        }
        Ok(())
    }

    fn insert_set(&mut self, set: Set) -> Result<SetId, GrammarError> {
        if !set.name.is_empty() && self.sets_by_name.contains_key(&set.name) {
            return Err(GrammarError::DuplicateSet(set.name));
        }
        let id = SetId(self.sets.len() as u32);
        if !set.name.is_empty() {
            self.sets_by_name.insert(set.name.clone(), id);
        }
        self.sets.push(set);
        Ok(id)
    }

    /// Every tag transitively reachable from `id`, across single tags,
    /// composite constituents and sub-sets.
    fn transitive_tags(&self, id: SetId, out: &mut HashSet<TagId>, seen: &mut HashSet<SetId>) {
        if !seen.insert(id) {
            return;
        }
        let set = &self.sets[id.index()];
        out.extend(set.single_tags.iter().copied());
        for &comp in &set.composites {
            out.extend(self.pool.composite(comp).tags().iter().copied());
        }
        for &sub in &set.sets {
            self.transitive_tags(sub, out, seen);
        }
    }

    fn derive_set_flags(&mut self) {
        // Bottom-up would need a topological order; sets can only reference
        // earlier ids, so a forward pass is already bottom-up.
        for i in 0..self.sets.len() {
            let mut flags = self.sets[i].flags;
            let set = &self.sets[i];
            for &t in &set.single_tags {
                let tag = self.pool.get(t);
                if tag.is(TagFlags::ANY) {
                    flags |= SetFlags::MATCH_ANY | SetFlags::SPECIAL;
                }
                if tag.is(TagFlags::SPECIAL) {
                    flags |= SetFlags::SPECIAL;
                }
                if tag.is(TagFlags::MAPPING) {
                    flags |= SetFlags::HAS_MAPPINGS;
                }
            }
            for &comp in &set.composites {
                for &t in self.pool.composite(comp).tags() {
                    let tag = self.pool.get(t);
                    if tag.is(TagFlags::SPECIAL) {
                        flags |= SetFlags::SPECIAL;
                    }
                    if tag.is(TagFlags::MAPPING) {
                        flags |= SetFlags::HAS_MAPPINGS;
                    }
                }
            }
            // NOT can match a reading carrying no constituent tag at all, so
            // the tag prefilter is unsound for it.
            if set.ops.contains(&SetOp::Not) {
                flags |= SetFlags::SPECIAL;
            }
            for &sub in &set.sets.clone() {
                let sub_flags = self.sets[sub.index()].flags;
                if sub_flags.contains(SetFlags::SPECIAL) {
                    flags |= SetFlags::SPECIAL;
                }
                if sub_flags.contains(SetFlags::MATCH_ANY) {
                    flags |= SetFlags::MATCH_ANY | SetFlags::SPECIAL;
                }
                if sub_flags.contains(SetFlags::HAS_MAPPINGS) {
                    flags |= SetFlags::HAS_MAPPINGS;
                }
            }
            self.sets[i].flags = flags;
        }
    }

    pub fn build(mut self) -> Result<Grammar, GrammarError> {
        if self.rules.is_empty() {
            return Err(GrammarError::NoRules);
        }
        self.derive_set_flags();

        let mut sets_by_tag: HashMap<TagId, HashSet<SetId>> = HashMap::new();
        for i in 0..self.sets.len() {
            let id = SetId(i as u32);
            let mut tags = HashSet::new();
            self.transitive_tags(id, &mut tags, &mut HashSet::new());
            for t in tags {
                sets_by_tag.entry(t).or_default().insert(id);
            }
        }

        let mut rules_by_tag: HashMap<TagId, Vec<RuleLine>> = HashMap::new();
        let mut special_rules = Vec::new();
        let mut has_enclosures = false;
        for rule in &self.rules {
            let mut tags = HashSet::new();
            self.transitive_tags(rule.target, &mut tags, &mut HashSet::new());
            for t in tags {
                rules_by_tag.entry(t).or_default().push(rule.line);
            }
            if self.sets[rule.target.index()].is_special() {
                special_rules.push(rule.line);
            }
            if rule.flags.intersects(RuleFlags::ENCL_ANY) {
                has_enclosures = true;
            }
        }
        for lines in rules_by_tag.values_mut() {
            lines.sort_unstable();
            lines.dedup();
        }
        special_rules.sort_unstable();
        special_rules.dedup();

        let sets_any: Vec<SetId> = self
            .sets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.flags.contains(SetFlags::MATCH_ANY))
            .map(|(i, _)| SetId(i as u32))
            .collect();

        self.rules.sort_by_key(|r| r.line);
        let rules_by_line: HashMap<RuleLine, usize> =
            self.rules.iter().enumerate().map(|(i, r)| (r.line, i)).collect();

        let mut before_sections = Vec::new();
        let mut after_sections = Vec::new();
        let mut numbered: Vec<(u32, RuleLine)> = Vec::new();
        for rule in &self.rules {
            match rule.section {
                Section::Before => before_sections.push(rule.line),
                Section::After => after_sections.push(rule.line),
                Section::Numbered(n) => numbered.push((n.max(1), rule.line)),
            }
        }
        let max_section = numbered.iter().map(|&(n, _)| n).max().unwrap_or(0);
        let mut runsections: Vec<Vec<RuleLine>> = Vec::with_capacity(max_section as usize);
        for k in 1..=max_section {
            let mut lines: Vec<RuleLine> =
                numbered.iter().filter(|&&(n, _)| n <= k).map(|&(_, l)| l).collect();
            lines.sort_unstable();
            runsections.push(lines);
        }

        Ok(Grammar {
            pool: self.pool,
            sets: self.sets,
            rules: self.rules,
            rules_by_line,
            before_sections,
            runsections,
            after_sections,
            delimiters: self.delimiters,
            soft_delimiters: self.soft_delimiters,
            sets_by_tag,
            rules_by_tag,
            sets_any,
            special_rules,
            has_enclosures,
        })
    }
}

impl Default for GrammarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_builds_singles_and_composites() {
        let mut b = GrammarBuilder::new();
        let s = b.list("NOMINAL", &["N", "A", "N Sg"]).unwrap();
        let target = b.list("T", &["N"]).unwrap();
        b.add(Rule::new(RuleType::Select, target)).unwrap();
        let g = b.build().unwrap();
        let set = g.set(s);
        assert_eq!(set.single_tags.len(), 2);
        assert_eq!(set.composites.len(), 1);
    }

    #[test]
    fn set_ops_arity_is_checked() {
        let mut b = GrammarBuilder::new();
        let a = b.list("A", &["a"]).unwrap();
        let c = b.list("C", &["c"]).unwrap();
        let err = b.set("X", &[a, c], &[]).unwrap_err();
        assert!(matches!(err, GrammarError::BadSetOps { .. }));
        assert!(b.set("Y", &[a, c], &[SetOp::Minus]).is_ok());
    }

    #[test]
    fn duplicate_set_names_rejected() {
        let mut b = GrammarBuilder::new();
        b.list("A", &["a"]).unwrap();
        assert!(matches!(b.list("A", &["b"]), Err(GrammarError::DuplicateSet(_))));
    }

    #[test]
    fn sets_by_tag_is_transitive() {
        let mut b = GrammarBuilder::new();
        let noun = b.list("NOUN", &["N"]).unwrap();
        let verb = b.list("VERB", &["V"]).unwrap();
        let open = b.set("OPEN", &[noun, verb], &[SetOp::Or]).unwrap();
        b.add(Rule::new(RuleType::Remove, open)).unwrap();
        let g = b.build().unwrap();
        // "N" must index both NOUN and OPEN
        let mut found_open = false;
        let mut found_noun = false;
        for (tag, sets) in g.sets_by_tag.iter() {
            if g.pool().get(*tag).text() == "N" {
                found_open = sets.contains(&open);
                found_noun = sets.contains(&noun);
            }
        }
        assert!(found_open && found_noun);
    }

    #[test]
    fn runsections_accumulate() {
        let mut b = GrammarBuilder::new();
        let t = b.list("T", &["x"]).unwrap();
        b.add(Rule::new(RuleType::Remove, t).section(Section::Numbered(1))).unwrap();
        b.add(Rule::new(RuleType::Remove, t).section(Section::Numbered(2))).unwrap();
        b.add(Rule::new(RuleType::Remove, t).section(Section::Before)).unwrap();
        b.add(Rule::new(RuleType::Remove, t).section(Section::After)).unwrap();
        let g = b.build().unwrap();
        assert_eq!(g.runsections().len(), 2);
        assert_eq!(g.runsections()[0].len(), 1);
        assert_eq!(g.runsections()[1].len(), 2);
        assert_eq!(g.before_sections().len(), 1);
        assert_eq!(g.after_sections().len(), 1);
    }

    #[test]
    fn special_flag_propagates_through_not_and_any() {
        let mut b = GrammarBuilder::new();
        let any = b.list("ANY", &["*"]).unwrap();
        let a = b.list("A", &["a"]).unwrap();
        let c = b.list("C", &["c"]).unwrap();
        let not = b.set("NOT-AC", &[a, c], &[SetOp::Not]).unwrap();
        let wraps = b.set("WRAPS", &[not, c], &[SetOp::Or]).unwrap();
        b.add(Rule::new(RuleType::Remove, a)).unwrap();
        let g = b.build().unwrap();
        assert!(g.set(any).flags().contains(SetFlags::MATCH_ANY));
        assert!(g.set(not).is_special());
        assert!(g.set(wraps).is_special());
        assert!(!g.set(a).is_special());
    }

    #[test]
    fn rule_validation_catches_missing_operands() {
        let mut b = GrammarBuilder::new();
        let t = b.list("T", &["x"]).unwrap();
        assert!(matches!(
            b.add(Rule::new(RuleType::Map, t)),
            Err(GrammarError::MissingOperand { .. })
        ));
        assert!(matches!(
            b.add(Rule::new(RuleType::SetParent, t)),
            Err(GrammarError::MissingOperand { .. })
        ));
        assert!(matches!(
            b.add(Rule::new(RuleType::SetVariable, t)),
            Err(GrammarError::MissingOperand { .. })
        ));
    }

    #[test]
    fn mapping_flag_propagates() {
        let mut b = GrammarBuilder::new();
        let m = b.list("M", &["@SUBJ"]).unwrap();
        let plain = b.list("P", &["N"]).unwrap();
        let combo = b.set("COMBO", &[plain, m], &[SetOp::Or]).unwrap();
        b.add(Rule::new(RuleType::Remove, plain)).unwrap();
        let g = b.build().unwrap();
        assert!(g.set(m).has_mappings());
        assert!(g.set(combo).has_mappings());
        assert!(!g.set(plain).has_mappings());
    }
}
