//! Tag model and intern pools.
//!
//! A `Tag` is the atomic predicate of the grammar: a plain lexical label, a
//! quoted baseform/wordform, an anchored regex, a numeric comparison, a
//! stream variable probe, or a structural marker. Tags are parsed once,
//! interned by content, and immutable afterwards; every other layer works
//! with the compact [`TagId`].
//!
//! Two parse entry points exist, mirroring the two sides of the engine:
//!
//! - [`TagPool::intern`] — grammar-side parsing: `!`/`^` prefixes,
//!   `META:`/`VAR:`/`SET:` markers, trailing `r`/`i` modifiers, numeric
//!   comparisons, structural tags.
//! - [`TagPool::intern_input`] — input-side parsing: textual detection,
//!   numeric comparisons, `#self->parent` dependency tags, `R:name:target`
//!   relation tags. Input tags never compile regexes.
//!
//! Composite tags (conjunctions) are interned separately as sorted id
//! vectors so that two composites with the same members share one id.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use thiserror::Error;

bitflags::bitflags! {
    /// Predicate class and modifier bits of a tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TagFlags: u32 {
        const NEGATIVE         = 1 << 0;
        const FAILFAST         = 1 << 1;
        const TEXTUAL          = 1 << 2;
        const WORDFORM         = 1 << 3;
        const BASEFORM         = 1 << 4;
        const REGEXP           = 1 << 5;
        const CASE_INSENSITIVE = 1 << 6;
        const NUMERICAL        = 1 << 7;
        const VARIABLE         = 1 << 8;
        const META             = 1 << 9;
        const SET              = 1 << 10;
        const MAPPING          = 1 << 11;
        const DEPENDENCY       = 1 << 12;
        const RELATION         = 1 << 13;
        const ANY              = 1 << 14;
        const TARGET           = 1 << 15;
        const MARK             = 1 << 16;
        const PAR_LEFT         = 1 << 17;
        const PAR_RIGHT        = 1 << 18;
        const SPECIAL          = 1 << 19;
        const USED             = 1 << 20;
        const VARSTRING        = 1 << 21;
    }
}

impl TagFlags {
    /// Bits that make a tag "special": it can match a reading that does not
    /// literally carry it, so set prefiltering must not skip it.
    const SPECIAL_MASK: TagFlags = TagFlags::ANY
        .union(TagFlags::TARGET)
        .union(TagFlags::MARK)
        .union(TagFlags::PAR_LEFT)
        .union(TagFlags::PAR_RIGHT)
        .union(TagFlags::NUMERICAL)
        .union(TagFlags::VARIABLE)
        .union(TagFlags::META)
        .union(TagFlags::NEGATIVE)
        .union(TagFlags::FAILFAST)
        .union(TagFlags::CASE_INSENSITIVE)
        .union(TagFlags::REGEXP)
        .union(TagFlags::VARSTRING)
        .union(TagFlags::SET);

    /// Bits that distinguish otherwise identical texts in the intern key.
    const KEY_MASK: TagFlags = TagFlags::NEGATIVE
        .union(TagFlags::FAILFAST)
        .union(TagFlags::META)
        .union(TagFlags::VARIABLE)
        .union(TagFlags::SET)
        .union(TagFlags::REGEXP)
        .union(TagFlags::CASE_INSENSITIVE)
        .union(TagFlags::VARSTRING);
}

/// Numeric comparison operator of a `<key OP value>` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompOp {
    /// Integer interval denoted by `(op, value)`. Outer `None` is the empty
    /// set (`<MIN`, `>MAX`); inner `None` is the cofinite set of `Neq`.
    fn interval(self, v: i64) -> Option<Option<(i64, i64)>> {
        match self {
            CompOp::Eq => Some(Some((v, v))),
            CompOp::Le => Some(Some((i64::MIN, v))),
            CompOp::Ge => Some(Some((v, i64::MAX))),
            CompOp::Lt => v.checked_sub(1).map(|hi| Some((i64::MIN, hi))),
            CompOp::Gt => v.checked_add(1).map(|lo| Some((lo, i64::MAX))),
            CompOp::Neq => Some(None),
        }
    }

    /// Whether the value sets denoted by `(self, a)` and `(other, b)`
    /// intersect. This is the full 6x6 operator compatibility table from the
    /// matcher: a grammar tag `<n>2>` is compatible with a reading tag
    /// `<n<5>` because some n satisfies both.
    pub fn compatible(self, a: i64, other: CompOp, b: i64) -> bool {
        let lhs = match self.interval(a) {
            Some(iv) => iv,
            None => return false,
        };
        let rhs = match other.interval(b) {
            Some(iv) => iv,
            None => return false,
        };
        match (lhs, rhs) {
            (Some((alo, ahi)), Some((blo, bhi))) => alo.max(blo) <= ahi.min(bhi),
            // Neq a vs interval: the interval must contain something != a
            (None, Some((lo, hi))) => !(lo == hi && lo == a),
            (Some((lo, hi)), None) => !(lo == hi && lo == b),
            // two cofinite sets over i64 always intersect
            (None, None) => true,
        }
    }
}

/// Stable id of an interned tag.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(pub(crate) u32);

impl TagId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagId({})", self.0)
    }
}

/// Stable id of an interned composite tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeId(pub(crate) u32);

impl CompositeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Numeric comparison payload of a `NUMERICAL` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericMatch {
    /// Name of the compared property, e.g. `n` in `<n>5>`.
    pub key: String,
    pub op: CompOp,
    pub value: i64,
}

/// An interned, immutable tag.
#[derive(Debug)]
pub struct Tag {
    text: String,
    flags: TagFlags,
    numeric: Option<NumericMatch>,
    regex: Option<Regex>,
    /// `(self, parent)` of a `#self->parent` dependency tag.
    dep: Option<(u32, u32)>,
    /// `(name, target)` of an `R:name:target` relation tag.
    relation: Option<(String, u32)>,
}

impl Tag {
    /// The tag's inner text, without prefixes or modifiers.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn flags(&self) -> TagFlags {
        self.flags
    }

    pub fn is(&self, flags: TagFlags) -> bool {
        self.flags.intersects(flags)
    }

    pub fn numeric(&self) -> Option<&NumericMatch> {
        self.numeric.as_ref()
    }

    pub(crate) fn regex(&self) -> Option<&Regex> {
        self.regex.as_ref()
    }

    pub fn dependency(&self) -> Option<(u32, u32)> {
        self.dep
    }

    pub fn relation(&self) -> Option<(&str, u32)> {
        self.relation.as_ref().map(|(n, t)| (n.as_str(), *t))
    }

    /// For textual tags, the text stripped of its quoting: `"<the>"` and
    /// `<the>` both yield `the`; `"cat"` yields `cat`.
    pub fn unquoted(&self) -> &str {
        let t = self.text.as_str();
        if self.flags.contains(TagFlags::WORDFORM) && t.len() >= 4 {
            &t[2..t.len() - 2]
        } else if self.flags.contains(TagFlags::BASEFORM) && t.len() >= 2 {
            &t[1..t.len() - 1]
        } else {
            t
        }
    }
}

impl fmt::Display for Tag {
    /// Renders the tag back to grammar syntax, prefixes and modifiers
    /// included.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.contains(TagFlags::NEGATIVE) {
            f.write_str("!")?;
        }
        if self.flags.contains(TagFlags::FAILFAST) {
            f.write_str("^")?;
        }
        if self.flags.contains(TagFlags::META) {
            f.write_str("META:")?;
        }
        if self.flags.contains(TagFlags::VARIABLE) {
            f.write_str("VAR:")?;
        }
        if self.flags.contains(TagFlags::SET) {
            f.write_str("SET:")?;
        }
        f.write_str(&self.text)?;
        if self.flags.contains(TagFlags::REGEXP) {
            f.write_str("r")?;
        }
        if self.flags.contains(TagFlags::CASE_INSENSITIVE) {
            f.write_str("i")?;
        }
        Ok(())
    }
}

/// Errors from tag parsing. Fatal at grammar load.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("parsing {0:?} resulted in an empty tag")]
    Empty(String),
    #[error("regex compile failed for tag {tag:?}: {source}")]
    Regex {
        tag: String,
        #[source]
        source: regex::Error,
    },
}

/// A composite tag: an unordered conjunction of tag ids. A reading matches
/// it iff it matches every constituent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeTag {
    tags: Vec<TagId>,
}

impl CompositeTag {
    pub fn tags(&self) -> &[TagId] {
        &self.tags
    }
}

const BEGIN_TAG: &str = ">>>";
const END_TAG: &str = "<<<";

/// Intern pool for tags and composite tags.
///
/// Write-heavy at grammar load, append-only while streaming (input tags not
/// seen in the grammar still get ids), never mutated in place.
pub struct TagPool {
    tags: Vec<Tag>,
    by_key: HashMap<(String, u32), TagId>,
    composites: Vec<CompositeTag>,
    composites_by_tags: HashMap<Vec<TagId>, CompositeId>,
    mapping_prefix: char,
    begin: TagId,
    end: TagId,
    any: TagId,
}

impl fmt::Debug for TagPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagPool")
            .field("tags", &self.tags.len())
            .field("composites", &self.composites.len())
            .field("mapping_prefix", &self.mapping_prefix)
            .finish()
    }
}

impl TagPool {
    pub fn new(mapping_prefix: char) -> Self {
        let mut pool = TagPool {
            tags: Vec::new(),
            by_key: HashMap::new(),
            composites: Vec::new(),
            composites_by_tags: HashMap::new(),
            mapping_prefix,
            begin: TagId(0),
            end: TagId(0),
            any: TagId(0),
        };
        pool.begin = pool.intern_input(BEGIN_TAG);
        pool.end = pool.intern_input(END_TAG);
        pool.any = pool.intern("*").expect("the ANY tag is well-formed");
        pool
    }

    /// Sentence-start sentinel tag (`>>>`).
    pub fn begin_tag(&self) -> TagId {
        self.begin
    }

    /// Sentence-end tag (`<<<`).
    pub fn end_tag(&self) -> TagId {
        self.end
    }

    /// The `*` tag.
    pub fn any_tag(&self) -> TagId {
        self.any
    }

    pub fn mapping_prefix(&self) -> char {
        self.mapping_prefix
    }

    pub fn get(&self, id: TagId) -> &Tag {
        &self.tags[id.index()]
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn insert(&mut self, tag: Tag) -> TagId {
        let key = (tag.text.clone(), (tag.flags & TagFlags::KEY_MASK).bits());
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }
        let id = TagId(self.tags.len() as u32);
        self.tags.push(tag);
        self.by_key.insert(key, id);
        id
    }

    /// Grammar-side tag parsing and interning.
    pub fn intern(&mut self, raw: &str) -> Result<TagId, TagError> {
        let mut flags = TagFlags::empty();
        let mut rest = raw;

        // ! and ^ may stack in either order
        loop {
            if let Some(r) = rest.strip_prefix('!') {
                flags |= TagFlags::NEGATIVE;
                rest = r;
            } else if let Some(r) = rest.strip_prefix('^') {
                flags |= TagFlags::FAILFAST;
                rest = r;
            } else {
                break;
            }
        }

        if let Some(r) = rest.strip_prefix("META:") {
            flags |= TagFlags::META;
            rest = r;
        } else if let Some(r) = rest.strip_prefix("VAR:") {
            flags |= TagFlags::VARIABLE;
            rest = r;
        } else if let Some(r) = rest.strip_prefix("SET:") {
            flags |= TagFlags::SET;
            rest = r;
        } else if let Some(r) = rest.strip_prefix("VSTR:") {
            flags |= TagFlags::VARSTRING;
            rest = r;
        }

        let mut text = rest.to_string();

        // Trailing r/i modifiers only attach to quoted or angled texts.
        if text.starts_with('"') || text.starts_with('<') {
            let mut trimmed = text.clone();
            let mut mods = TagFlags::empty();
            loop {
                if trimmed.ends_with('r') && !mods.contains(TagFlags::REGEXP) {
                    mods |= TagFlags::REGEXP;
                    trimmed.pop();
                } else if trimmed.ends_with('i') && !mods.contains(TagFlags::CASE_INSENSITIVE) {
                    mods |= TagFlags::CASE_INSENSITIVE;
                    trimmed.pop();
                } else {
                    break;
                }
            }
            let quoted = trimmed.len() >= 2
                && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
                    || (trimmed.starts_with('<') && trimmed.ends_with('>')));
            if quoted {
                flags |= mods | TagFlags::TEXTUAL;
                if trimmed.starts_with('"') {
                    if trimmed.len() >= 4 && trimmed[1..].starts_with('<') && trimmed[..trimmed.len() - 1].ends_with('>') {
                        flags |= TagFlags::WORDFORM;
                    } else {
                        flags |= TagFlags::BASEFORM;
                    }
                }
                text = trimmed;
            }
        }

        text = unescape(&text);
        if text.is_empty() {
            return Err(TagError::Empty(raw.to_string()));
        }

        let numeric = parse_numeric(&text);
        if numeric.is_some() {
            flags |= TagFlags::NUMERICAL;
        }

        match text.as_str() {
            "*" => flags |= TagFlags::ANY,
            "_LEFT_" => flags |= TagFlags::PAR_LEFT,
            "_RIGHT_" => flags |= TagFlags::PAR_RIGHT,
            "_TARGET_" => flags |= TagFlags::TARGET,
            "_MARK_" => flags |= TagFlags::MARK,
            _ => {}
        }

        if text.starts_with(self.mapping_prefix) {
            flags |= TagFlags::MAPPING;
        }

        let regex = if flags.contains(TagFlags::REGEXP)
            || (flags.contains(TagFlags::CASE_INSENSITIVE) && flags.contains(TagFlags::TEXTUAL))
        {
            Some(compile_tag_regex(&text, flags)?)
        } else {
            None
        };

        if flags.intersects(TagFlags::SPECIAL_MASK) {
            flags |= TagFlags::SPECIAL;
        }

        Ok(self.insert(Tag { text, flags, numeric, regex, dep: None, relation: None }))
    }

    /// Input-side tag parsing and interning: no prefixes, no modifiers, no
    /// regex compilation, but dependency and relation tags are recognized.
    pub fn intern_input(&mut self, raw: &str) -> TagId {
        let mut flags = TagFlags::empty();
        let text = raw.to_string();

        let quoted = text.len() >= 2
            && ((text.starts_with('"') && text.ends_with('"'))
                || (text.starts_with('<') && text.ends_with('>')));
        if quoted {
            flags |= TagFlags::TEXTUAL;
            if text.starts_with('"') {
                if text.len() >= 4 && text[1..].starts_with('<') && text[..text.len() - 1].ends_with('>') {
                    flags |= TagFlags::WORDFORM;
                } else {
                    flags |= TagFlags::BASEFORM;
                }
            }
        }

        let numeric = parse_numeric(&text);
        if numeric.is_some() {
            flags |= TagFlags::NUMERICAL;
        }

        // structural markers look the same on both sides of the engine
        match text.as_str() {
            "_LEFT_" => flags |= TagFlags::PAR_LEFT,
            "_RIGHT_" => flags |= TagFlags::PAR_RIGHT,
            "_TARGET_" => flags |= TagFlags::TARGET,
            "_MARK_" => flags |= TagFlags::MARK,
            _ => {}
        }

        let dep = parse_dependency(&text);
        if dep.is_some() {
            flags |= TagFlags::DEPENDENCY;
        }

        let relation = parse_relation(&text);
        if relation.is_some() {
            flags |= TagFlags::RELATION;
        }

        if text.starts_with(self.mapping_prefix) {
            flags |= TagFlags::MAPPING;
        }

        if flags.intersects(TagFlags::SPECIAL_MASK) {
            flags |= TagFlags::SPECIAL;
        }

        self.insert(Tag { text, flags, numeric, regex: None, dep, relation })
    }

    /// Intern a conjunction of tags. Members are sorted so that composites
    /// with the same multiset share an id.
    pub fn intern_composite(&mut self, mut tags: Vec<TagId>) -> CompositeId {
        tags.sort_unstable();
        tags.dedup();
        if let Some(&id) = self.composites_by_tags.get(&tags) {
            return id;
        }
        let id = CompositeId(self.composites.len() as u32);
        self.composites.push(CompositeTag { tags: tags.clone() });
        self.composites_by_tags.insert(tags, id);
        id
    }

    pub fn composite(&self, id: CompositeId) -> &CompositeTag {
        &self.composites[id.index()]
    }

    /// The un-prefixed counterpart of a `!`/`^` tag, when one is interned.
    /// Membership tests probe readings for the plain tag; the prefixed id
    /// itself never appears on a reading.
    pub(crate) fn plain_of(&self, id: TagId) -> Option<TagId> {
        let tag = self.get(id);
        if !tag.flags.intersects(TagFlags::NEGATIVE | TagFlags::FAILFAST) {
            return Some(id);
        }
        let key_flags =
            tag.flags & TagFlags::KEY_MASK & !(TagFlags::NEGATIVE | TagFlags::FAILFAST);
        self.by_key.get(&(tag.text.clone(), key_flags.bits())).copied()
    }

    /// Whether any constituent of `id` carries the MAPPING flag.
    pub(crate) fn composite_has_mapping(&self, id: CompositeId) -> bool {
        self.composites[id.index()]
            .tags
            .iter()
            .any(|&t| self.get(t).is(TagFlags::MAPPING))
    }
}

fn unescape(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn compile_tag_regex(text: &str, flags: TagFlags) -> Result<Regex, TagError> {
    let body = if flags.contains(TagFlags::REGEXP) {
        text.to_string()
    } else {
        regex::escape(text)
    };
    let mut pat = String::with_capacity(body.len() + 8);
    if flags.contains(TagFlags::CASE_INSENSITIVE) {
        pat.push_str("(?i)");
    }
    pat.push('^');
    pat.push_str(&body);
    pat.push('$');
    Regex::new(&pat).map_err(|source| TagError::Regex { tag: text.to_string(), source })
}

fn parse_numeric(text: &str) -> Option<NumericMatch> {
    let caps = regex!(r"^<([^<>=:!]+)([<>=:!][<>=:]?)(-?[0-9]+|MAX|MIN)>$").captures(text)?;
    let key = caps[1].to_string();
    let op_str = &caps[2];
    let value = match &caps[3] {
        "MAX" => i64::MAX,
        "MIN" => i64::MIN,
        v => v.parse().ok()?,
    };

    let mut ops = op_str.chars();
    let mut op = match ops.next()? {
        '<' => CompOp::Lt,
        '>' => CompOp::Gt,
        '=' | ':' => CompOp::Eq,
        '!' => CompOp::Neq,
        _ => return None,
    };
    if let Some(second) = ops.next() {
        op = match (op, second) {
            (CompOp::Gt, '=' | ':') => CompOp::Ge,
            (CompOp::Lt, '=' | ':') => CompOp::Le,
            (CompOp::Neq, '=' | ':') => CompOp::Neq,
            (CompOp::Eq, '>') => CompOp::Ge,
            (CompOp::Eq, '<') => CompOp::Le,
            (CompOp::Lt, '>') => CompOp::Neq,
            (CompOp::Gt, '<') => CompOp::Neq,
            _ => return None,
        };
    }
    Some(NumericMatch { key, op, value })
}

fn parse_dependency(text: &str) -> Option<(u32, u32)> {
    let caps = regex!(r"^#([0-9]+)(?:->|\u{2192})([0-9]+)$").captures(text)?;
    let dep_self: u32 = caps[1].parse().ok()?;
    if dep_self == 0 {
        return None;
    }
    let dep_parent: u32 = caps[2].parse().ok()?;
    Some((dep_self, dep_parent))
}

fn parse_relation(text: &str) -> Option<(String, u32)> {
    let caps = regex!(r"^R:([^:]+):([0-9]+)$").captures(text)?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> TagPool {
        TagPool::new('@')
    }

    #[test]
    fn interning_is_stable() {
        let mut p = pool();
        let a = p.intern("N").unwrap();
        let b = p.intern("N").unwrap();
        assert_eq!(a, b);
        let c = p.intern("!N").unwrap();
        assert_ne!(a, c);
        assert_eq!(p.get(a).text(), "N");
        assert!(p.get(c).is(TagFlags::NEGATIVE));
    }

    #[test]
    fn prefix_cross_matrix() {
        // !^X and ^!X both mean negated failfast
        let mut p = pool();
        for raw in ["!^X", "^!X"] {
            let id = p.intern(raw).unwrap();
            let tag = p.get(id);
            assert!(tag.is(TagFlags::NEGATIVE), "{raw}");
            assert!(tag.is(TagFlags::FAILFAST), "{raw}");
            assert_eq!(tag.text(), "X");
        }
        let neg = p.intern("!X").unwrap();
        let ff = p.intern("^X").unwrap();
        let both = p.intern("!^X").unwrap();
        assert_ne!(neg, ff);
        assert_ne!(neg, both);
        assert_ne!(ff, both);
    }

    #[test]
    fn textual_forms() {
        let mut p = pool();
        let wf = p.intern("\"<the>\"").unwrap();
        let wf = p.get(wf);
        assert!(wf.flags().contains(TagFlags::WORDFORM | TagFlags::TEXTUAL));
        assert_eq!(wf.unquoted(), "the");

        let bf = p.intern("\"cat\"").unwrap();
        let bf = p.get(bf);
        assert!(bf.flags().contains(TagFlags::BASEFORM | TagFlags::TEXTUAL));
        assert_eq!(bf.unquoted(), "cat");

        let ang = p.intern("<sem>").unwrap();
        let ang = p.get(ang);
        assert!(ang.is(TagFlags::TEXTUAL));
        assert!(!ang.is(TagFlags::BASEFORM | TagFlags::WORDFORM));
    }

    #[test]
    fn regex_modifiers() {
        let mut p = pool();
        let r = p.intern("\"ca.*\"r").unwrap();
        let r = p.get(r);
        assert!(r.is(TagFlags::REGEXP));
        assert!(r.regex().unwrap().is_match("\"cats\""));
        assert!(!r.regex().unwrap().is_match("\"a cat\""));

        let ri = p.intern("\"<THE>\"ri").unwrap();
        let ri = p.get(ri);
        assert!(ri.is(TagFlags::CASE_INSENSITIVE));
        assert!(ri.regex().unwrap().is_match("\"<the>\""));

        // i without r: literal, case-folded, anchored
        let i = p.intern("\"<a+b>\"i").unwrap();
        let i = p.get(i);
        assert!(i.regex().unwrap().is_match("\"<A+B>\""));
        assert!(!i.regex().unwrap().is_match("\"<AAB>\""));
    }

    #[test]
    fn numeric_operators() {
        let mut p = pool();
        let cases = [
            ("<n=5>", CompOp::Eq, 5),
            ("<n:5>", CompOp::Eq, 5),
            ("<n<5>", CompOp::Lt, 5),
            ("<n>5>", CompOp::Gt, 5),
            ("<n<=5>", CompOp::Le, 5),
            ("<n>=5>", CompOp::Ge, 5),
            ("<n!=5>", CompOp::Neq, 5),
            ("<n<>5>", CompOp::Neq, 5),
            ("<n=<5>", CompOp::Le, 5),
            ("<n=>5>", CompOp::Ge, 5),
            ("<n=MAX>", CompOp::Eq, i64::MAX),
            ("<n=MIN>", CompOp::Eq, i64::MIN),
            ("<n=-3>", CompOp::Eq, -3),
        ];
        for (raw, op, val) in cases {
            let id = p.intern(raw).unwrap();
            let tag = p.get(id);
            let num = tag.numeric().unwrap_or_else(|| panic!("{raw} not numeric"));
            assert_eq!(num.op, op, "{raw}");
            assert_eq!(num.value, val, "{raw}");
            assert_eq!(num.key, "n", "{raw}");
            assert!(tag.is(TagFlags::NUMERICAL));
        }
    }

    #[test]
    fn operator_compatibility() {
        use CompOp::*;
        // grammar <n>2> vs reading <n<5>: 3 and 4 satisfy both
        assert!(Gt.compatible(2, Lt, 5));
        assert!(!Gt.compatible(5, Lt, 3));
        assert!(Eq.compatible(4, Lt, 5));
        assert!(!Eq.compatible(5, Lt, 5));
        assert!(Le.compatible(3, Ge, 3));
        assert!(!Le.compatible(2, Ge, 3));
        assert!(Neq.compatible(5, Eq, 4));
        assert!(!Neq.compatible(4, Eq, 4));
        assert!(Neq.compatible(4, Neq, 4));
        // <MAX is true for any finite value
        assert!(Eq.compatible(123, Lt, i64::MAX));
        assert!(Lt.compatible(i64::MAX, Eq, 123));
        // empty denotations never match
        assert!(!Lt.compatible(i64::MIN, Eq, 0));
        assert!(!Gt.compatible(i64::MAX, Neq, 0));
    }

    #[test]
    fn dependency_and_relation_input_tags() {
        let mut p = pool();
        let dep = p.intern_input("#3->1");
        assert_eq!(p.get(dep).dependency(), Some((3, 1)));
        assert!(p.get(dep).is(TagFlags::DEPENDENCY));

        let dep_u = p.intern_input("#2\u{2192}0");
        assert_eq!(p.get(dep_u).dependency(), Some((2, 0)));

        let rel = p.intern_input("R:obj:7");
        assert_eq!(p.get(rel).relation(), Some(("obj", 7)));

        let plain = p.intern_input("#notdep");
        assert_eq!(p.get(plain).dependency(), None);
    }

    #[test]
    fn mapping_prefix_sets_flag() {
        let mut p = pool();
        let mapped = p.intern("@SUBJ").unwrap();
        assert!(p.get(mapped).is(TagFlags::MAPPING));
        let mapped_in = p.intern_input("@OBJ");
        assert!(p.get(mapped_in).is(TagFlags::MAPPING));
        let plain = p.intern("SUBJ").unwrap();
        assert!(!p.get(plain).is(TagFlags::MAPPING));
    }

    #[test]
    fn structural_tags() {
        let mut p = pool();
        assert!(p.get(p.any_tag()).is(TagFlags::ANY));
        for (raw, flag) in [
            ("_LEFT_", TagFlags::PAR_LEFT),
            ("_RIGHT_", TagFlags::PAR_RIGHT),
            ("_MARK_", TagFlags::MARK),
        ] {
            let id = p.intern(raw).unwrap();
            assert!(p.get(id).is(flag), "{raw}");
        }
    }

    #[test]
    fn composites_share_ids_regardless_of_order() {
        let mut p = pool();
        let n = p.intern("N").unwrap();
        let sg = p.intern("Sg").unwrap();
        let a = p.intern_composite(vec![n, sg]);
        let b = p.intern_composite(vec![sg, n]);
        assert_eq!(a, b);
        assert_eq!(p.composite(a).tags().len(), 2);
    }
}
