use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{SynthError, SynthResult};
use crate::models::{
    group, section, ComplianceFragment, ROW_SCOPE, DedupStrategy, LineTag, Section, Template, TemplateFamily,
    TemplateLine, TemplateNode,
};
use crate::utils;

const TAG_MARKER: &str = " #@";

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> SynthError {
    SynthError::CatalogParse {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

fn each_open_re() -> Option<&'static regex_lite::Regex> {
    static RE: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    RE.get_or_init(|| regex_lite::Regex::new(r"^\{\{\s*#each\s+([A-Za-z0-9_]+)\s*\}\}$").ok())
        .as_ref()
}

fn is_each_close(line: &str) -> bool {
    let inner = line
        .strip_prefix("{{")
        .and_then(|l| l.strip_suffix("}}"))
        .map(str::trim);
    inner == Some("/each")
}

/// Default id for a catalog file: the file name up to the first dot
fn file_stem(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .unwrap_or_default()
        .to_string()
}

/// Split a `@key value` directive
fn split_directive(rest: &str) -> (&str, &str) {
    match rest.split_once(char::is_whitespace) {
        Some((k, v)) => (k, v.trim()),
        None => (rest, ""),
    }
}

fn parse_version(path: &Path, line_no: usize, value: &str) -> SynthResult<u32> {
    value
        .parse::<u32>()
        .map_err(|_| parse_error(path, line_no, format!("@version must be an integer, got {:?}", value)))
}

/// Parse the ` #@ ...` suffix of a statement into tags
fn parse_tags(path: &Path, line_no: usize, raw: &str) -> SynthResult<Vec<LineTag>> {
    let mut tags = Vec::new();
    for token in raw.split_whitespace() {
        let tag = match token.split_once('=') {
            None if token == "marker" => LineTag::Marker,
            Some(("loopback", attrs)) => {
                let attributes: Vec<String> = attrs
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect();
                if attributes.is_empty() {
                    return Err(parse_error(path, line_no, "loopback tag names no attributes"));
                }
                LineTag::Loopback { attributes }
            }
            Some(("count", g)) => {
                if !group::ALL.contains(&g) {
                    return Err(parse_error(path, line_no, format!("count tag names unknown group {:?}", g)));
                }
                LineTag::Count { group: g.to_string() }
            }
            Some(("scope", ROW_SCOPE)) => LineTag::RowScope,
            Some(("scope", s)) => {
                if !utils::is_valid_identifier(s) {
                    return Err(parse_error(path, line_no, format!("scope tag {:?} is not an identifier", s)));
                }
                LineTag::Scope { scope: s.to_string() }
            }
            _ => return Err(parse_error(path, line_no, format!("unknown tag {:?}", token))),
        };
        tags.push(tag);
    }
    Ok(tags)
}

/// Parse a statement line, stripping and parsing trailing tags
fn parse_statement(path: &Path, line_no: usize, line: &str) -> SynthResult<TemplateLine> {
    let (text, tags) = match line.find(TAG_MARKER) {
        Some(idx) => (
            line[..idx].trim_end(),
            parse_tags(path, line_no, &line[idx + TAG_MARKER.len()..])?,
        ),
        None => (line, Vec::new()),
    };
    if text.is_empty() {
        return Err(parse_error(path, line_no, "tags without a statement"));
    }
    Ok(TemplateLine {
        text: text.to_string(),
        tags,
        line_no,
    })
}

/// Parse a template file.
///
/// `@key value` directives come first, then RouterOS statements grouped under
/// `[section]` headers, optionally inside `{{#each group}} ... {{/each}}`
/// blocks. A trailing ` #@ tag tag` is stripped from the statement text.
pub fn parse_template(path: &Path, content: &str) -> SynthResult<Template> {
    let mut id = file_stem(path);
    let mut version: Option<u32> = None;
    let mut family: Option<TemplateFamily> = None;
    let mut description = None;
    let mut default_fragments: Vec<String> = Vec::new();
    let mut dedup = DedupStrategy::default();

    let mut sections: Vec<Section> = Vec::new();
    // (group name, lines, opening line number)
    let mut open_group: Option<(String, Vec<TemplateLine>, usize)> = None;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(";;") {
            continue;
        }

        // Header directives
        if let Some(rest) = line.strip_prefix('@') {
            if !sections.is_empty() {
                return Err(parse_error(path, line_no, "directive after the first section"));
            }
            let (key, value) = split_directive(rest);
            match key {
                "id" => id = value.to_string(),
                "version" => version = Some(parse_version(path, line_no, value)?),
                "family" => {
                    family = Some(value.parse().map_err(|e: String| parse_error(path, line_no, e))?)
                }
                "description" => description = Some(value.to_string()),
                "fragments" => {
                    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                        if !default_fragments.iter().any(|f| f == name) {
                            default_fragments.push(name.to_string());
                        }
                    }
                }
                "dedup" => dedup = value.parse().map_err(|e: String| parse_error(path, line_no, e))?,
                other => return Err(parse_error(path, line_no, format!("unknown directive @{}", other))),
            }
            continue;
        }

        // Section header
        if line.starts_with('[') && line.ends_with(']') {
            if let Some((g, _, opened)) = &open_group {
                return Err(parse_error(
                    path,
                    line_no,
                    format!("section starts inside {{{{#each {}}}}} opened on line {}", g, opened),
                ));
            }
            let fam = family.ok_or_else(|| parse_error(path, line_no, "@family must precede the first section"))?;
            let name = line[1..line.len() - 1].trim();
            if !fam.allows(name) {
                return Err(SynthError::UnknownSection {
                    section: name.to_string(),
                    referenced_by: format!("template {} ({}:{})", id, path.display(), line_no),
                });
            }
            if sections.iter().any(|s| s.name == name) {
                return Err(parse_error(path, line_no, format!("section [{}] declared twice", name)));
            }
            sections.push(Section {
                name: name.to_string(),
                nodes: Vec::new(),
            });
            continue;
        }

        let Some(current) = sections.last_mut() else {
            return Err(parse_error(path, line_no, "statement outside of a section"));
        };

        // Repeated group markers
        if let Some(caps) = each_open_re().and_then(|re| re.captures(line)) {
            if let Some((g, _, opened)) = &open_group {
                return Err(parse_error(
                    path,
                    line_no,
                    format!("nested {{{{#each}}}} inside {} opened on line {}", g, opened),
                ));
            }
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if !group::ALL.contains(&name) {
                return Err(parse_error(path, line_no, format!("unknown repeated group {:?}", name)));
            }
            open_group = Some((name.to_string(), Vec::new(), line_no));
            continue;
        }
        if is_each_close(line) {
            let (g, lines, opened) = open_group
                .take()
                .ok_or_else(|| parse_error(path, line_no, "{{/each}} without an open group"))?;
            if lines.is_empty() {
                return Err(parse_error(path, opened, format!("empty {{{{#each {}}}}} block", g)));
            }
            current.nodes.push(TemplateNode::Group { group: g, lines });
            continue;
        }

        let statement = parse_statement(path, line_no, line)?;
        if statement.has_marker() {
            return Err(parse_error(path, line_no, "marker tags belong in fragments"));
        }
        if statement.has_row_scope() && !matches!(&open_group, Some((g, _, _)) if g == group::ADDITIONAL_SCOPES) {
            return Err(parse_error(
                path,
                line_no,
                format!("scope={} is only valid inside {{{{#each {}}}}}", ROW_SCOPE, group::ADDITIONAL_SCOPES),
            ));
        }
        match open_group.as_mut() {
            Some((_, lines, _)) => lines.push(statement),
            None => current.nodes.push(TemplateNode::Line(statement)),
        }
    }

    if let Some((g, _, opened)) = open_group {
        return Err(parse_error(path, opened, format!("unterminated {{{{#each {}}}}}", g)));
    }
    let family = family.ok_or_else(|| parse_error(path, 0, "missing @family"))?;
    let version = version.ok_or_else(|| parse_error(path, 0, "missing @version"))?;
    if sections.is_empty() {
        return Err(parse_error(path, 0, "template has no sections"));
    }

    Ok(Template {
        id,
        version,
        family,
        description,
        default_fragments,
        dedup,
        sections,
        source: PathBuf::from(path),
    })
}

/// Parse a compliance fragment file
pub fn parse_fragment(path: &Path, content: &str) -> SynthResult<ComplianceFragment> {
    let mut id = file_stem(path);
    let mut version: Option<u32> = None;
    let mut target: Option<String> = None;
    let mut description = None;
    let mut lines: Vec<TemplateLine> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(";;") {
            continue;
        }

        if let Some(rest) = line.strip_prefix('@') {
            if !lines.is_empty() {
                return Err(parse_error(path, line_no, "directive after the first statement"));
            }
            let (key, value) = split_directive(rest);
            match key {
                "id" => id = value.to_string(),
                "version" => version = Some(parse_version(path, line_no, value)?),
                "target" => {
                    if !section::is_known(value) {
                        return Err(SynthError::UnknownSection {
                            section: value.to_string(),
                            referenced_by: format!("fragment {} ({}:{})", id, path.display(), line_no),
                        });
                    }
                    target = Some(value.to_string());
                }
                "description" => description = Some(value.to_string()),
                other => return Err(parse_error(path, line_no, format!("unknown directive @{}", other))),
            }
            continue;
        }

        if (line.starts_with('[') && line.ends_with(']')) || line.starts_with("{{#") || is_each_close(line) {
            return Err(parse_error(path, line_no, "fragments contain statements only"));
        }

        let statement = parse_statement(path, line_no, line)?;
        if statement
            .tags
            .iter()
            .any(|t| matches!(t, LineTag::Count { .. }))
        {
            return Err(parse_error(path, line_no, "count tags belong in templates"));
        }
        if statement.has_row_scope() {
            return Err(parse_error(path, line_no, format!("scope={} belongs in templates", ROW_SCOPE)));
        }
        lines.push(statement);
    }

    let version = version.ok_or_else(|| parse_error(path, 0, "missing @version"))?;
    let target = target.ok_or_else(|| parse_error(path, 0, "missing @target"))?;
    if lines.is_empty() {
        return Err(parse_error(path, 0, "fragment has no statements"));
    }
    if lines.iter().filter(|l| l.has_marker()).count() > 1 {
        return Err(parse_error(path, 0, "more than one marker statement"));
    }

    Ok(ComplianceFragment {
        id,
        version,
        target,
        description,
        lines,
        source: PathBuf::from(path),
    })
}
