//! JSONL stream adapter.
//!
//! One JSON object per line, one object per cohort:
//!
//! ```text
//! {"w":"the","rs":[{"l":"the","ts":["DET"]},{"l":"the","ts":["N"]}]}
//! ```
//!
//! - `w` wordform, `z` attached raw text, `sts` static tags
//! - `rs` readings: `l` baseform, `ts` tags, `s` nested sub-reading
//! - `drs` previously deleted readings
//! - `ds`/`dp` dependency self/parent ids (input numbering; remapped to
//!   engine numbering when the window closes)
//!
//! The adapter owns the window lifecycle: it assembles cohorts into
//! windows, breaks on delimiters or limits, stamps the sentence-end tag,
//! pushes every finished window through the engine, and serializes
//! processed windows back out in order. Malformed lines are warned about
//! and skipped; only real I/O failures abort the stream.
//!
//! Stream commands are recognized on their own lines:
//! `<STREAMCMD:FLUSH>`, `<STREAMCMD:EXIT>`, `<STREAMCMD:IGNORE>`,
//! `<STREAMCMD:RESUME>`, `<STREAMCMD:SETVAR:k[=v]>`, `<STREAMCMD:REMVAR:k>`.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::api::Applicator;
use crate::tags::{TagFlags, TagId};
use crate::window::{Cohort, Reading, SingleWindow, Window};
use crate::DEP_NO_PARENT;

/// Fatal adapter errors. Per-line problems never surface here; they are
/// logged and the line is skipped.
#[derive(Debug, Error)]
pub enum JsonlError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run the applicator over a JSONL stream, writing processed windows to
/// `output` in input order.
pub fn run_jsonl<R: BufRead, W: Write>(
    app: &mut Applicator,
    input: R,
    mut output: W,
) -> Result<(), JsonlError> {
    let mut window = app.new_window();
    let num_windows = app.options().num_windows;
    let reset_after = (num_windows + 4) * 2 + 1;

    let mut line_no: u32 = 0;
    let mut windows_done: u32 = 0;
    let mut ignoring = false;
    let mut open = false;

    for line in input.lines() {
        let line = line?;
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(cmd) = trimmed.strip_prefix("<STREAMCMD:").and_then(|s| s.strip_suffix('>')) {
            match cmd {
                "FLUSH" => {
                    if open {
                        if let Some(win) = window.next.back_mut() {
                            win.flush_after = true;
                        }
                        seal_open_window(app, &mut window);
                        open = false;
                    }
                    drain_all(app, &mut window, &mut output)?;
                    output.flush()?;
                }
                "EXIT" => break,
                "IGNORE" => ignoring = true,
                "RESUME" => ignoring = false,
                _ => {
                    if let Some(var) = cmd.strip_prefix("SETVAR:") {
                        let (name, value) = match var.split_once('=') {
                            Some((n, v)) => (n, v),
                            None => (var, "1"),
                        };
                        app.set_variable(name, value);
                    } else if let Some(name) = cmd.strip_prefix("REMVAR:") {
                        app.rem_variable(name);
                    } else {
                        warn!(line = line_no, command = cmd, "unknown stream command - ignoring");
                    }
                }
            }
            continue;
        }

        if ignoring {
            writeln!(output, "{line}")?;
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(err) => {
                warn!(line = line_no, error = %err, "failed to parse JSON - skipping line");
                continue;
            }
        };
        let Some(obj) = value.as_object() else {
            warn!(line = line_no, "JSON line is not an object - skipping");
            continue;
        };

        if !open {
            window.alloc_append_window(app.grammar().pool());
            open = true;
        }
        parse_cohort(app, &mut window, obj, line_no);

        let break_now = window_break(app, &window, line_no);
        if break_now {
            seal_open_window(app, &mut window);
            open = false;
        }
        if break_now || window.next.len() as u32 > num_windows {
            window.shuffle_down();
            app.run_grammar_on_window(&mut window);
            windows_done += 1;
            if windows_done % reset_after == 0 {
                app.reset_indexes();
            }
            print_beyond_span(app, &mut window, &mut output)?;
        }
    }

    if open {
        seal_open_window(app, &mut window);
    }
    drain_all(app, &mut window, &mut output)?;
    output.flush()?;
    Ok(())
}

/// Should the window be closed after the cohort just appended?
fn window_break(app: &mut Applicator, window: &Window, line_no: u32) -> bool {
    let soft_limit = app.options().soft_limit;
    let hard_limit = app.options().hard_limit;
    let dep_delimit = app.options().dep_delimit;

    let Some(win) = window.next.back() else { return false };
    let Some(cohort) = win.cohorts.last() else { return false };
    if cohort.local_number == 0 {
        return false;
    }
    let size = win.cohorts.len() as u32;

    if size >= soft_limit && app.matches_delimiter(cohort, true) {
        return true;
    }
    if size >= hard_limit {
        warn!(line = line_no, limit = hard_limit, "hard cohort limit reached - forcing window break");
        return true;
    }
    if dep_delimit && size > 2 {
        // a restarting dependency numbering marks a new tree
        let prev = win.cohorts[win.cohorts.len() - 2].dep_self;
        if cohort.dep_self != 0 && prev != 0 && cohort.dep_self <= prev {
            return true;
        }
    }
    app.matches_delimiter(cohort, false)
}

/// Stamp the end tag onto the closing cohort and translate input
/// dependency ids to engine numbering.
fn seal_open_window(app: &mut Applicator, window: &mut Window) {
    let Some(win) = window.next.back_mut() else { return };
    let pool = app.grammar().pool();
    if let Some(cohort) = win.cohorts.last_mut() {
        if cohort.local_number != 0 {
            for reading in &mut cohort.readings {
                if !reading.has_tag(pool.end_tag()) {
                    reading.push_tag(pool.end_tag());
                    reading.reflow(pool);
                }
            }
        }
    }
    remap_dependencies(win);
}

/// Input `ds`/`dp` ids live in the producer's numbering; dependency edges
/// inside the engine use global cohort numbers.
fn remap_dependencies(win: &mut SingleWindow) {
    let by_input: HashMap<u32, u32> = win
        .cohorts
        .iter()
        .filter(|c| c.dep_self != 0)
        .map(|c| (c.dep_self, c.global_number))
        .collect();
    let mut any = false;
    for cohort in &mut win.cohorts {
        let mapped: Vec<(TagId, Vec<u32>)> = cohort
            .relations
            .iter()
            .map(|(name, targets)| {
                let remapped = targets
                    .iter()
                    .map(|t| by_input.get(t).copied().unwrap_or(*t))
                    .collect();
                (*name, remapped)
            })
            .collect();
        for (name, targets) in mapped {
            if let Some(set) = cohort.relations.get_mut(&name) {
                set.clear();
                set.extend(targets);
            }
        }

        if cohort.dep_parent == DEP_NO_PARENT || cohort.dep_parent == 0 {
            cohort.dep_parent = DEP_NO_PARENT;
            continue;
        }
        match by_input.get(&cohort.dep_parent) {
            Some(&global) => {
                cohort.dep_parent = global;
                any = true;
            }
            None => {
                warn!(parent = cohort.dep_parent, "dependency parent not in window - dropping edge");
                cohort.dep_parent = DEP_NO_PARENT;
            }
        }
    }
    if any {
        win.has_dep = true;
    }
}

fn drain_all<W: Write>(
    app: &mut Applicator,
    window: &mut Window,
    output: &mut W,
) -> Result<(), JsonlError> {
    while !window.next.is_empty() {
        window.shuffle_down();
        app.run_grammar_on_window(window);
    }
    window.shuffle_down();
    while let Some(win) = window.previous.pop_front() {
        print_single_window(app, &win, output)?;
        if win.flush_after {
            output.flush()?;
        }
    }
    Ok(())
}

/// Windows older than the spanning depth can no longer be referenced by
/// tests and are written out.
fn print_beyond_span<W: Write>(
    app: &mut Applicator,
    window: &mut Window,
    output: &mut W,
) -> Result<(), JsonlError> {
    while window.previous.len() as u32 > window.span {
        let Some(win) = window.previous.pop_front() else { break };
        print_single_window(app, &win, output)?;
        if win.flush_after {
            output.flush()?;
        }
    }
    Ok(())
}

// --- input -------------------------------------------------------------------

fn parse_cohort(app: &mut Applicator, window: &mut Window, obj: &Map<String, Value>, line_no: u32) {
    let global = window.next_global_number();

    let wform = match obj.get("w").and_then(Value::as_str) {
        Some(w) => w.to_string(),
        None => {
            warn!(line = line_no, "cohort missing 'w' (wordform) - using empty");
            String::new()
        }
    };
    let wf = app.grammar_mut().pool_mut().intern_input(&format!("\"<{wform}>\""));
    let mut cohort = Cohort::new(wf, global);
    cohort.dep_self = 0;

    if let Some(z) = obj.get("z").and_then(Value::as_str) {
        cohort.text = z.to_string();
    }

    if let Some(sts) = obj.get("sts").and_then(Value::as_array) {
        for tag in sts.iter().filter_map(Value::as_str) {
            if !tag.is_empty() {
                let id = app.grammar_mut().pool_mut().intern_input(tag);
                cohort.static_tags.push(id);
            }
        }
    }

    if let Some(rs) = obj.get("rs").and_then(Value::as_array) {
        for rv in rs {
            let Some(robj) = rv.as_object() else {
                warn!(line = line_no, "non-object in 'rs' - skipping reading");
                continue;
            };
            for reading in parse_reading(app, &mut cohort, robj, line_no) {
                cohort.append_reading(reading);
            }
        }
    }

    if let Some(drs) = obj.get("drs").and_then(Value::as_array) {
        for rv in drs {
            let Some(robj) = rv.as_object() else { continue };
            for mut reading in parse_reading(app, &mut cohort, robj, line_no) {
                reading.deleted = true;
                cohort.deleted.push(reading);
            }
        }
    }

    if let Some(ds) = obj.get("ds").and_then(Value::as_u64) {
        cohort.dep_self = ds as u32;
    }
    if let Some(dp) = obj.get("dp").and_then(Value::as_u64) {
        cohort.dep_parent = dp as u32;
    }

    if cohort.readings.is_empty() && app.options().allow_magic_readings {
        cohort.init_empty(app.grammar().pool());
    }

    if let Some(win) = window.next.back_mut() {
        win.append_cohort(cohort);
    }
}

/// Parse one reading object. A reading whose tag list carries several
/// mapping tags is split into one reading per mapping tag.
fn parse_reading(
    app: &mut Applicator,
    cohort: &mut Cohort,
    obj: &Map<String, Value>,
    line_no: u32,
) -> Vec<Reading> {
    let has_relations = app.options().has_relations;
    let mut reading = Reading::new();
    reading.push_tag(cohort.wordform);

    let mut baseform = None;
    match obj.get("l").and_then(Value::as_str) {
        Some(l) if !l.is_empty() => {
            let id = app.grammar_mut().pool_mut().intern_input(&format!("\"{l}\""));
            reading.push_tag(id);
            baseform = Some(id);
        }
        Some(_) => warn!(line = line_no, "empty 'l' (baseform) in reading"),
        None => warn!(line = line_no, "reading missing 'l' (baseform)"),
    }

    let mut mappings: Vec<TagId> = Vec::new();
    if let Some(ts) = obj.get("ts").and_then(Value::as_array) {
        for text in ts.iter().filter_map(Value::as_str) {
            if text.is_empty() {
                continue;
            }
            let id = app.grammar_mut().pool_mut().intern_input(text);
            let tag = app.grammar().pool().get(id);
            if let Some((self_id, parent_id)) = tag.dependency() {
                cohort.dep_self = self_id;
                cohort.dep_parent = parent_id;
                continue;
            }
            if has_relations {
                if let Some((_, target)) = tag.relation() {
                    cohort.relations.entry(id).or_default().insert(target);
                    continue;
                }
            }
            if tag.is(TagFlags::MAPPING) {
                mappings.push(id);
            } else {
                reading.push_tag(id);
            }
        }
    }

    if let Some(sub) = obj.get("s") {
        if let Some(sobj) = sub.as_object() {
            let subs = parse_reading(app, cohort, sobj, line_no);
            if let Some(first) = subs.into_iter().next() {
                reading.next = Some(Box::new(first));
            }
        } else {
            warn!(line = line_no, "'s' (sub-reading) is not an object - skipping");
        }
    }

    reading.reflow(app.grammar().pool());
    if reading.baseform.is_none() {
        reading.baseform = baseform.or(Some(cohort.wordform));
    }

    match mappings.len() {
        0 => vec![reading],
        1 => {
            reading.push_tag(mappings[0]);
            reading.reflow(app.grammar().pool());
            vec![reading]
        }
        _ => {
            // one reading per mapping tag
            let mut out = Vec::with_capacity(mappings.len());
            for &m in &mappings {
                let mut r = reading.clone();
                r.push_tag(m);
                r.reflow(app.grammar().pool());
                out.push(r);
            }
            out
        }
    }
}

// --- output ------------------------------------------------------------------

fn print_single_window<W: Write>(
    app: &Applicator,
    win: &SingleWindow,
    output: &mut W,
) -> Result<(), JsonlError> {
    for cohort in win.cohorts().iter().skip(1) {
        print_cohort(app, win, cohort, output)?;
    }
    Ok(())
}

fn print_cohort<W: Write>(
    app: &Applicator,
    win: &SingleWindow,
    cohort: &Cohort,
    output: &mut W,
) -> Result<(), JsonlError> {
    let opt = app.options();
    let pool = app.grammar().pool();
    let mut doc = Map::new();

    doc.insert("w".into(), Value::from(pool.get(cohort.wordform()).unquoted()));

    if !cohort.static_tags.is_empty() {
        let sts: Vec<Value> =
            cohort.static_tags.iter().map(|&t| Value::from(pool.get(t).text())).collect();
        doc.insert("sts".into(), Value::from(sts));
    }

    if !cohort.text.is_empty() {
        let z = cohort.text.trim_end_matches('\n');
        if !z.is_empty() {
            doc.insert("z".into(), Value::from(z));
        }
    }

    if win.has_dep {
        let ds = if opt.dep_original && cohort.dep_self != 0 {
            cohort.dep_self
        } else {
            cohort.global_number()
        };
        doc.insert("ds".into(), Value::from(ds));
        if cohort.dep_parent() != DEP_NO_PARENT {
            doc.insert("dp".into(), Value::from(cohort.dep_parent()));
        }
    }

    if opt.has_relations && !cohort.relations().is_empty() {
        let mut rels = Map::new();
        for (name, targets) in cohort.relations() {
            let list: Vec<Value> = targets.iter().map(|&t| Value::from(t)).collect();
            rels.insert(pool.get(*name).text().to_string(), Value::from(list));
        }
        doc.insert("rels".into(), Value::from(rels));
    }

    let mut readings: Vec<&Reading> = cohort.readings().iter().filter(|r| !r.noprint).collect();
    readings.sort_by_key(|r| r.number);
    let rs: Vec<Value> = readings.iter().map(|r| build_reading(app, cohort, r)).collect();
    if !rs.is_empty() {
        doc.insert("rs".into(), Value::from(rs));
    }

    let mut gone: Vec<&Reading> =
        cohort.deleted_readings().iter().chain(cohort.delayed.iter()).collect();
    gone.sort_by_key(|r| r.number);
    let drs: Vec<Value> = gone.iter().map(|r| build_reading(app, cohort, r)).collect();
    if !drs.is_empty() {
        doc.insert("drs".into(), Value::from(drs));
    }

    writeln!(output, "{}", Value::from(doc))?;
    Ok(())
}

fn build_reading(app: &Applicator, cohort: &Cohort, reading: &Reading) -> Value {
    let opt = app.options();
    let pool = app.grammar().pool();
    let mut doc = Map::new();

    let baseform = reading
        .baseform()
        .map(|b| pool.get(b).unquoted().to_string())
        .unwrap_or_default();
    doc.insert("l".into(), Value::from(baseform));

    let mut seen: Vec<TagId> = Vec::new();
    let mut ts: Vec<Value> = Vec::new();
    for &t in reading.tags() {
        if t == pool.begin_tag() || (!opt.show_end_tags && t == pool.end_tag()) {
            continue;
        }
        if Some(t) == reading.baseform() || t == cohort.wordform() {
            continue;
        }
        if opt.unique_tags {
            if seen.contains(&t) {
                continue;
            }
            seen.push(t);
        }
        let tag = pool.get(t);
        if tag.is(TagFlags::DEPENDENCY) && !opt.dep_original {
            continue;
        }
        if tag.is(TagFlags::RELATION) && opt.has_relations {
            continue;
        }
        ts.push(Value::from(tag.text()));
    }
    if !ts.is_empty() {
        doc.insert("ts".into(), Value::from(ts));
    }

    if opt.trace && !reading.hit_by().is_empty() {
        let hb: Vec<Value> = reading.hit_by().iter().map(|&l| Value::from(l)).collect();
        doc.insert("hb".into(), Value::from(hb));
    }

    if let Some(sub) = reading.sub_reading() {
        doc.insert("s".into(), build_reading(app, cohort, sub));
    }

    doc.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{ContextualTest, GrammarBuilder, Rule, RuleType};
    use crate::api::Options;

    fn select_n_app() -> Applicator {
        let mut b = GrammarBuilder::new();
        let n = b.list("N", &["N"]).unwrap();
        let the = b.list("THE", &["\"<the>\""]).unwrap();
        let delim = b.list("DELIM", &["\"<.>\""]).unwrap();
        b.delimiters(delim);
        b.add(Rule::new(RuleType::Select, n).test(ContextualTest::at(0, the))).unwrap();
        Applicator::new(b.build().unwrap(), Options::default())
    }

    fn run(app: &mut Applicator, input: &str) -> Vec<Value> {
        let mut out = Vec::new();
        run_jsonl(app, input.as_bytes(), &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn selects_and_serializes() {
        let mut app = select_n_app();
        let input = concat!(
            r#"{"w":"the","rs":[{"l":"the","ts":["DET"]},{"l":"the","ts":["N"]}]}"#,
            "\n",
            r#"{"w":".","rs":[{"l":".","ts":["PUNCT"]}]}"#,
            "\n",
        );
        let lines = run(&mut app, input);
        assert_eq!(lines.len(), 2);

        let the = &lines[0];
        assert_eq!(the["w"], "the");
        let rs = the["rs"].as_array().unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0]["ts"].as_array().unwrap()[0], "N");
        let drs = the["drs"].as_array().unwrap();
        assert_eq!(drs.len(), 1);
        assert_eq!(drs[0]["ts"].as_array().unwrap()[0], "DET");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut app = select_n_app();
        let input = concat!(
            "this is not json\n",
            "[1,2,3]\n",
            r#"{"w":"the","rs":[{"l":"the","ts":["DET"]},{"l":"the","ts":["N"]}]}"#,
            "\n",
            r#"{"w":".","rs":[{"l":".","ts":["PUNCT"]}]}"#,
            "\n",
        );
        let lines = run(&mut app, input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["w"], "the");
    }

    #[test]
    fn stream_commands() {
        let mut app = select_n_app();
        let input = concat!(
            "<STREAMCMD:SETVAR:mode=fast>\n",
            "<STREAMCMD:IGNORE>\n",
            "raw text passes through\n",
            "<STREAMCMD:RESUME>\n",
            r#"{"w":"x","rs":[{"l":"x","ts":["N"]}]}"#,
            "\n",
            "<STREAMCMD:FLUSH>\n",
            "<STREAMCMD:EXIT>\n",
            r#"{"w":"never","rs":[{"l":"never","ts":["N"]}]}"#,
            "\n",
        );
        let mut out = Vec::new();
        run_jsonl(&mut app, input.as_bytes(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("raw text passes through"));
        assert!(text.contains("\"x\""));
        assert!(!text.contains("never"));
    }

    #[test]
    fn sub_readings_round_trip() {
        let mut app = select_n_app();
        let input = concat!(
            r#"{"w":"husband","rs":[{"l":"hus","ts":["N"],"s":{"l":"band","ts":["N"]}}]}"#,
            "\n",
            r#"{"w":".","rs":[{"l":".","ts":["PUNCT"]}]}"#,
            "\n",
        );
        let lines = run(&mut app, input);
        let sub = &lines[0]["rs"][0]["s"];
        assert_eq!(sub["l"], "band");
    }

    #[test]
    fn dependencies_are_remapped_and_emitted() {
        let mut app = select_n_app();
        let input = concat!(
            r#"{"w":"dog","ds":1,"rs":[{"l":"dog","ts":["N"]}]}"#,
            "\n",
            r#"{"w":"barks","ds":2,"dp":1,"rs":[{"l":"bark","ts":["V"]}]}"#,
            "\n",
            r#"{"w":".","ds":3,"dp":2,"rs":[{"l":".","ts":["PUNCT"]}]}"#,
            "\n",
        );
        let lines = run(&mut app, input);
        assert_eq!(lines.len(), 3);
        let dog_ds = lines[0]["ds"].as_u64().unwrap();
        let barks_dp = lines[1]["dp"].as_u64().unwrap();
        assert_eq!(dog_ds, barks_dp, "parent edge follows the engine numbering");
        assert!(lines[0].get("dp").is_none());
    }

    #[test]
    fn deleted_input_readings_stay_deleted() {
        let mut app = select_n_app();
        let input = concat!(
            r#"{"w":"x","rs":[{"l":"x","ts":["N"]}],"drs":[{"l":"x","ts":["OLD"]}]}"#,
            "\n",
            r#"{"w":".","rs":[{"l":".","ts":["PUNCT"]}]}"#,
            "\n",
        );
        let lines = run(&mut app, input);
        let drs = lines[0]["drs"].as_array().unwrap();
        assert_eq!(drs.len(), 1);
        assert_eq!(drs[0]["ts"].as_array().unwrap()[0], "OLD");
    }

    #[test]
    fn readingless_cohort_gets_magic_reading() {
        let mut app = select_n_app();
        let input = concat!(
            r#"{"w":"mystery"}"#,
            "\n",
            r#"{"w":".","rs":[{"l":".","ts":["PUNCT"]}]}"#,
            "\n",
        );
        let lines = run(&mut app, input);
        assert_eq!(lines[0]["w"], "mystery");
        let rs = lines[0]["rs"].as_array().unwrap();
        assert_eq!(rs.len(), 1);
    }

    #[test]
    fn trace_emits_rule_lines() {
        let mut b = GrammarBuilder::new();
        let n = b.list("N", &["N"]).unwrap();
        let delim = b.list("DELIM", &["\"<.>\""]).unwrap();
        b.delimiters(delim);
        let line = b.add(Rule::new(RuleType::Select, n)).unwrap();
        let mut options = Options::default();
        options.trace = true;
        let mut app = Applicator::new(b.build().unwrap(), options);

        let input = concat!(
            r#"{"w":"x","rs":[{"l":"x","ts":["N"]},{"l":"x","ts":["V"]}]}"#,
            "\n",
            r#"{"w":".","rs":[{"l":".","ts":["PUNCT"]}]}"#,
            "\n",
        );
        let lines = run(&mut app, input);
        let hb = lines[0]["rs"][0]["hb"].as_array().unwrap();
        assert_eq!(hb[0].as_u64().unwrap(), line as u64);
    }
}
