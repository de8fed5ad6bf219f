//! Scanner for the supervisor's textual dumps.
//!
//! The dump format is the one `launchctl print` shows: indentation-based
//! blocks opened by `name = {` and closed by `}`, `key = value` lines, and
//! free-form annotations in parentheses. The format varies between object
//! kinds and OS releases, so every accessor returns `Option` or an empty
//! collection instead of failing, and unknown sections are ignored.

use std::collections::HashSet;

use crate::models::{Endpoint, EndpointKind, ProgramTarget, Service};

const SERVICES_HEADER: &str = "services = {";
const DISABLED_SERVICES_HEADER: &str = "disabled services = {";

/// One line inside a block, with its nesting depth relative to the block
/// (direct children have depth 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockLine<'a> {
    depth: usize,
    text: &'a str,
}

/// Returns the lines enclosed by the first block whose opening line is
/// exactly `header`. A block truncated at end of input yields what was read.
fn block<'a>(text: &'a str, header: &str) -> Option<Vec<BlockLine<'a>>> {
    let mut lines = text.lines();
    lines.by_ref().find(|line| line.trim() == header)?;

    let mut depth: usize = 1;
    let mut body = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with('}') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                break;
            }
            continue;
        }
        body.push(BlockLine {
            depth,
            text: trimmed,
        });
        if trimmed.ends_with('{') {
            depth = depth.saturating_add(1);
        }
    }
    Some(body)
}

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// Removes every `( ... )` annotation from a label.
fn strip_parentheticals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth: usize = 0;
    for c in s.chars() {
        match c {
            '(' => depth = depth.saturating_add(1),
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_integer(token: &str) -> bool {
    token.parse::<i64>().is_ok()
}

/// Splits `key = value` on the first ` = `.
fn key_value(line: &str) -> Option<(&str, &str)> {
    line.split_once(" = ")
        .or_else(|| line.strip_suffix(" =").map(|key| (key, "")))
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// First scalar value for `key` anywhere in the dump.
pub fn value_of<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .filter_map(|line| key_value(line.trim()))
        .find(|(k, v)| *k == key && !v.is_empty() && *v != "{")
        .map(|(_, v)| strip_quotes(v))
        .filter(|v| !v.is_empty())
}

/// Parses one `handle [internal...] [-] name` line of a services block.
fn parse_service_line(line: &str) -> Option<Service> {
    let mut tokens = line.split_whitespace().peekable();
    let handle: u64 = tokens.next()?.parse().ok()?;
    while tokens.next_if(|t| *t == "-" || is_integer(t)).is_some() {}

    let name = strip_parentheticals(&tokens.collect::<Vec<_>>().join(" "));
    let name = strip_quotes(&name);
    if name.is_empty() {
        return None;
    }
    Some(Service::new((handle != 0).then_some(handle), name))
}

/// Services listed in the `services = { ... }` block of a domain dump, in
/// listing order. Malformed lines are skipped.
pub fn parse_services(text: &str) -> Vec<Service> {
    block(text, SERVICES_HEADER)
        .unwrap_or_default()
        .into_iter()
        .filter(|line| line.depth == 1)
        .filter_map(|line| parse_service_line(line.text))
        .collect()
}

/// Endpoints of a service dump, across the standard, pid-local and
/// instance-specific sections. Entries without a `port =` line are dropped
/// because nothing can be resolved against them.
pub fn parse_endpoints(text: &str) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for kind in EndpointKind::ALL {
        let Some(lines) = block(text, kind.section_header()) else {
            continue;
        };

        let mut current: Option<(&str, Option<&str>)> = None;
        for line in lines {
            match line.depth {
                1 => {
                    flush_endpoint(current.take(), kind, &mut seen, &mut endpoints);
                    if let Some(name) = line.text.strip_suffix('{').and_then(|h| h.trim_end().strip_suffix('=')) {
                        current = Some((strip_quotes(name), None));
                    }
                }
                2 => {
                    if let Some((name, None)) = current
                        && let Some(("port", port)) = key_value(line.text)
                        && !port.is_empty()
                    {
                        current = Some((name, Some(port)));
                    }
                }
                _ => {}
            }
        }
        flush_endpoint(current, kind, &mut seen, &mut endpoints);
    }

    endpoints
}

fn flush_endpoint(
    entry: Option<(&str, Option<&str>)>,
    kind: EndpointKind,
    seen: &mut HashSet<(String, EndpointKind)>,
    out: &mut Vec<Endpoint>,
) {
    if let Some((name, Some(port))) = entry
        && !name.is_empty()
        && seen.insert((name.to_owned(), kind))
    {
        out.push(Endpoint::new(name, kind, Some(port.to_owned())));
    }
}

/// Labels listed in the `disabled services = { ... }` block.
pub fn parse_disabled_services(text: &str) -> Vec<String> {
    block(text, DISABLED_SERVICES_HEADER)
        .unwrap_or_default()
        .into_iter()
        .filter(|line| line.depth == 1)
        .filter_map(|line| line.text.split_once("=>"))
        .map(|(label, _)| strip_quotes(label).to_owned())
        .filter(|label| !label.is_empty())
        .collect()
}

/// The first `pid = N` value of a dump.
pub fn parse_pid(text: &str) -> Option<i32> {
    value_of(text, "pid")?.parse().ok()
}

/// The program a service record refers to.
///
/// Tries `program =`, then `originator =`, then `program identifier =`. The
/// last form only names a stem with a parenthetical process reference; the
/// pid is then taken from the record's `pid =` line (or the parenthetical
/// itself) so the caller can look up the real executable path.
pub fn parse_program_target(text: &str) -> Option<ProgramTarget> {
    if let Some(program) = value_of(text, "program") {
        return Some(ProgramTarget::path(program));
    }
    if let Some(originator) = value_of(text, "originator") {
        return Some(ProgramTarget::path(originator));
    }

    let identifier = value_of(text, "program identifier")?;
    let (stem, annotation) = match identifier.split_once('(') {
        Some((stem, rest)) => (stem.trim(), Some(rest)),
        None => (identifier.trim(), None),
    };
    if stem.is_empty() {
        return None;
    }

    let pid = parse_pid(text).or_else(|| {
        annotation.and_then(|a| {
            a.trim_end_matches(')')
                .split_whitespace()
                .find_map(|t| t.parse::<i32>().ok())
        })
    });

    Some(match pid {
        Some(pid) => ProgramTarget::with_pid(stem, pid),
        None => ProgramTarget::path(stem),
    })
}
