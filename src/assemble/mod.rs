use std::collections::HashSet;

use crate::error::{SynthError, SynthResult};
use crate::models::{DedupStrategy, RenderedFragment, RenderedLine, RenderedSection};

/// Split a statement into tokens, keeping quoted strings and `[ ... ]`
/// command substitutions intact
pub(crate) fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut depth = 0usize;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '[' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ']' if !in_quotes => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Normalized form of a RouterOS statement: whitespace collapsed, `key=value`
/// attributes sorted, the command path and bare arguments kept in place
pub fn normalize_statement(line: &str) -> String {
    let tokens = tokenize(line);
    let split = tokens
        .iter()
        .position(|t| !t.starts_with('[') && t.contains('='))
        .unwrap_or(tokens.len());

    let (head, tail) = tokens.split_at(split);
    let mut attrs: Vec<&String> = tail.iter().collect();
    attrs.sort();

    head.iter()
        .chain(attrs)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

fn dedup_key(line: &str, strategy: DedupStrategy) -> String {
    match strategy {
        DedupStrategy::Exact => line.to_string(),
        DedupStrategy::Normalized => normalize_statement(line),
    }
}

/// Merge rendered template sections with rendered fragments.
///
/// Sections come out in `order`; each fragment's lines are appended to its
/// target section in the order the fragments are given. Within a section the
/// first occurrence of a statement wins. Empty sections are dropped.
pub fn assemble(
    sections: Vec<RenderedSection>,
    fragments: &[RenderedFragment],
    order: &[&str],
    strategy: DedupStrategy,
) -> SynthResult<Vec<RenderedSection>> {
    for fragment in fragments {
        if !order.contains(&fragment.target.as_str()) {
            return Err(SynthError::UnknownSection {
                section: fragment.target.clone(),
                referenced_by: format!("fragment {}", fragment.name),
            });
        }
    }
    if let Some(stray) = sections.iter().find(|s| !order.contains(&s.name.as_str())) {
        return Err(SynthError::UnknownSection {
            section: stray.name.clone(),
            referenced_by: "template".to_string(),
        });
    }

    let mut by_name: Vec<(String, Vec<RenderedLine>)> =
        sections.into_iter().map(|s| (s.name, s.lines)).collect();

    let mut out = Vec::new();
    for name in order {
        // Template lines first
        let mut candidates: Vec<RenderedLine> = Vec::new();
        while let Some(pos) = by_name.iter().position(|(n, _)| n == name) {
            let (_, lines) = by_name.swap_remove(pos);
            candidates.extend(lines);
        }
        // Then fragments targeting this section, in request order
        for fragment in fragments.iter().filter(|f| f.target == *name) {
            candidates.extend(fragment.lines.iter().cloned());
        }

        let mut seen = HashSet::new();
        let mut lines = Vec::with_capacity(candidates.len());
        for line in candidates {
            if seen.insert(dedup_key(&line.text, strategy)) {
                lines.push(line);
            } else {
                tracing::debug!("Dropping duplicate statement in [{}]: {}", name, line.text);
            }
        }

        if !lines.is_empty() {
            out.push(RenderedSection {
                name: name.to_string(),
                lines,
            });
        }
    }

    Ok(out)
}
