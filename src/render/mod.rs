pub mod bindings;

pub use bindings::{group_fields, Bindings, Row, Value};

use std::sync::{Arc, OnceLock};
use tera::{Context, Tera};

use crate::error::{SynthError, SynthResult};
use crate::models::{
    ComplianceFragment, LineOrigin, LineTag, RenderedFragment, RenderedLine, RenderedSection, Template,
    TemplateLine, TemplateNode,
};

fn placeholder_re() -> Option<&'static regex_lite::Regex> {
    static RE: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    RE.get_or_init(|| regex_lite::Regex::new(r"\{\{(.*?)\}\}").ok())
        .as_ref()
}

fn key_re() -> Option<&'static regex_lite::Regex> {
    static RE: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    RE.get_or_init(|| regex_lite::Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?:\|.*)?$").ok())
        .as_ref()
}

/// A line split into literal text and `{{ expr }}` placeholders
#[derive(Debug, PartialEq, Eq)]
enum Piece<'a> {
    Literal(&'a str),
    Placeholder { key: &'a str, expr: &'a str },
}

fn split_line(text: &str) -> Result<Vec<Piece<'_>>, String> {
    let (Some(re), Some(key_re)) = (placeholder_re(), key_re()) else {
        return Err("placeholder pattern failed to compile".to_string());
    };

    let mut pieces = Vec::new();
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            pieces.push(Piece::Literal(&text[last..whole.start()]));
        }
        let key = key_re
            .captures(expr.as_str())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| format!("unsupported placeholder expression {{{{{}}}}}", expr.as_str()))?;
        pieces.push(Piece::Placeholder {
            key,
            expr: expr.as_str(),
        });
        last = whole.end();
    }
    if last < text.len() {
        pieces.push(Piece::Literal(&text[last..]));
    }

    for piece in &pieces {
        if let Piece::Literal(lit) = piece {
            if lit.contains("{{") || lit.contains("}}") {
                return Err(format!("unbalanced placeholder braces in {:?}", text));
            }
        }
    }
    Ok(pieces)
}

/// Placeholder keys referenced by a line, in order of appearance
pub fn placeholder_keys(text: &str) -> SynthResult<Vec<String>> {
    let pieces = split_line(text).map_err(|message| SynthError::Render {
        location: "line".to_string(),
        message,
    })?;
    Ok(pieces
        .into_iter()
        .filter_map(|p| match p {
            Piece::Placeholder { key, .. } => Some(key.to_string()),
            Piece::Literal(_) => None,
        })
        .collect())
}

/// Tera block and comment openers that occur in RouterOS text
fn escape_literal(lit: &str) -> String {
    lit.replace("{%", "{{ \"{%\" }}").replace("{#", "{{ \"{#\" }}")
}

fn describe(e: &tera::Error) -> String {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        message.push_str(": ");
        message.push_str(&s.to_string());
        source = s.source();
    }
    message
}

fn render_line(text: &str, ctx: &Context, location: &str) -> SynthResult<String> {
    let pieces = split_line(text).map_err(|message| SynthError::Render {
        location: location.to_string(),
        message,
    })?;
    if !pieces.iter().any(|p| matches!(p, Piece::Placeholder { .. })) {
        return Ok(text.to_string());
    }

    let mut source = String::with_capacity(text.len() + 16);
    for piece in pieces {
        match piece {
            Piece::Literal(lit) => source.push_str(&escape_literal(lit)),
            Piece::Placeholder { expr, .. } => {
                source.push_str("{{");
                source.push_str(expr);
                source.push_str("}}");
            }
        }
    }

    let render_error = |e: tera::Error| SynthError::Render {
        location: location.to_string(),
        message: describe(&e),
    };
    let mut tera = Tera::default();
    tera.add_raw_template("line", &source).map_err(render_error)?;
    tera.render("line", ctx).map_err(render_error)
}

/// Tags of a group line for one element; `scope=each` becomes that element's scope
fn row_tags(tags: &[LineTag], row: &Row) -> Vec<LineTag> {
    tags.iter()
        .filter_map(|t| match t {
            LineTag::RowScope => row.get("name").map(|name| LineTag::Scope {
                scope: name.to_string(),
            }),
            other => Some(other.clone()),
        })
        .collect()
}

fn base_context(bindings: &Bindings) -> Context {
    let mut ctx = Context::new();
    for (key, value) in bindings.scalars() {
        ctx.insert(key.as_str(), value);
    }
    ctx
}

/// Scalars plus one group element; element fields shadow scalars
fn row_context(base: &Context, row: &Row) -> Context {
    let mut ctx = base.clone();
    for (field, value) in row {
        ctx.insert(*field, value);
    }
    ctx
}

struct KeyCheck<'a> {
    bindings: &'a Bindings,
    missing: Vec<String>,
}

impl KeyCheck<'_> {
    fn line(&mut self, line: &TemplateLine, group: Option<&str>, location: &str) -> SynthResult<()> {
        let keys = placeholder_keys(&line.text).map_err(|e| match e {
            SynthError::Render { message, .. } => SynthError::Render {
                location: location.to_string(),
                message,
            },
            other => other,
        })?;
        let fields = group.and_then(group_fields).unwrap_or(&[]);
        for key in keys {
            let known = fields.contains(&key.as_str()) || self.bindings.scalar(&key).is_some();
            if !known && !self.missing.contains(&key) {
                self.missing.push(key);
            }
        }
        Ok(())
    }
}

/// Fail with every unresolved key across the template and fragments
fn ensure_resolved(
    template: &Template,
    fragments: &[Arc<ComplianceFragment>],
    bindings: &Bindings,
) -> SynthResult<()> {
    let mut check = KeyCheck {
        bindings,
        missing: Vec::new(),
    };

    for section in &template.sections {
        for node in &section.nodes {
            match node {
                TemplateNode::Line(line) => {
                    let location = format!("template {} line {}", template.id, line.line_no);
                    check.line(line, None, &location)?;
                }
                TemplateNode::Group { group, lines } => {
                    if bindings.group(group).is_none() && !check.missing.contains(group) {
                        check.missing.push(group.clone());
                    }
                    for line in lines {
                        let location = format!("template {} line {}", template.id, line.line_no);
                        check.line(line, Some(group), &location)?;
                    }
                }
            }
        }
    }

    for fragment in fragments {
        for line in &fragment.lines {
            let location = format!("fragment {} line {}", fragment.id, line.line_no);
            check.line(line, None, &location)?;
        }
    }

    if check.missing.is_empty() {
        Ok(())
    } else {
        Err(SynthError::UnresolvedPlaceholder {
            keys: check.missing,
        })
    }
}

fn render_sections(template: &Template, bindings: &Bindings, base: &Context) -> SynthResult<Vec<RenderedSection>> {
    let mut sections = Vec::with_capacity(template.sections.len());

    for section in &template.sections {
        let mut lines = Vec::new();
        let origin = |line: &TemplateLine| LineOrigin::Template {
            section: section.name.clone(),
            line_no: line.line_no,
        };

        for node in &section.nodes {
            match node {
                TemplateNode::Line(line) => {
                    let location = format!("template {} line {}", template.id, line.line_no);
                    lines.push(RenderedLine {
                        text: render_line(&line.text, base, &location)?,
                        tags: line.tags.clone(),
                        origin: origin(line),
                    });
                }
                TemplateNode::Group { group, lines: body } => {
                    // Rows in input order; each row renders the whole block
                    for row in bindings.group(group).unwrap_or(&[]) {
                        let ctx = row_context(base, row);
                        for line in body {
                            let location = format!("template {} line {} ({})", template.id, line.line_no, group);
                            lines.push(RenderedLine {
                                text: render_line(&line.text, &ctx, &location)?,
                                tags: row_tags(&line.tags, row),
                                origin: origin(line),
                            });
                        }
                    }
                }
            }
        }

        sections.push(RenderedSection {
            name: section.name.clone(),
            lines,
        });
    }

    Ok(sections)
}

fn render_fragment(fragment: &ComplianceFragment, base: &Context) -> SynthResult<RenderedFragment> {
    let marker_no = fragment.marker_line().map(|l| l.line_no);
    let mut marker = None;
    let mut lines = Vec::with_capacity(fragment.lines.len());

    for line in &fragment.lines {
        let location = format!("fragment {} line {}", fragment.id, line.line_no);
        let text = render_line(&line.text, base, &location)?;
        if Some(line.line_no) == marker_no {
            marker = Some(text.clone());
        }
        lines.push(RenderedLine {
            text,
            tags: line.tags.clone(),
            origin: LineOrigin::Fragment {
                name: fragment.id.clone(),
                line_no: line.line_no,
            },
        });
    }

    Ok(RenderedFragment {
        name: fragment.id.clone(),
        version: fragment.version,
        target: fragment.target.clone(),
        marker,
        lines,
    })
}

/// Render a template's sections (pre-dedup, template order)
pub fn render(template: &Template, bindings: &Bindings) -> SynthResult<Vec<RenderedSection>> {
    ensure_resolved(template, &[], bindings)?;
    render_sections(template, bindings, &base_context(bindings))
}

/// Render a template together with the fragments that will be merged into it.
/// Every line is scanned before any is rendered, so unresolved keys are
/// reported for all of them at once.
pub fn render_with_fragments(
    template: &Template,
    fragments: &[Arc<ComplianceFragment>],
    bindings: &Bindings,
) -> SynthResult<(Vec<RenderedSection>, Vec<RenderedFragment>)> {
    ensure_resolved(template, fragments, bindings)?;

    let base = base_context(bindings);
    let sections = render_sections(template, bindings, &base)?;
    let fragments = fragments
        .iter()
        .map(|f| render_fragment(f, &base))
        .collect::<SynthResult<Vec<_>>>()?;
    Ok((sections, fragments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{parse_fragment, parse_template};
    use crate::models::SiteParameters;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn bindings() -> Bindings {
        let params = SiteParameters::from_json(
            &serde_json::json!({
                "device_name": "TWR-ALPHA-01",
                "time_zone": "America/Chicago",
                "loopback": "10.1.1.1",
                "cpe_scope": {"cidr": "10.10.10.0/24", "pool_range": "10.10.10.50-10.10.10.254"},
                "unauth_scope": {"cidr": "10.11.0.0/24", "pool_range": "10.11.0.10-10.11.0.250"},
                "cgnat_private_scope": {"cidr": "100.64.0.0/22", "pool_range": "100.64.0.10-100.64.3.250"},
                "cgnat_public_ip": "203.0.113.10",
                "dhcp_dns_servers": ["1.1.1.1"],
                "tower_links": [
                    {"interface": "ether2", "name": "TWR-BRAVO", "cidr": "10.20.0.0/29", "local_ip": "10.20.0.3"},
                    {"interface": "ether3", "name": "TWR-CHARLIE", "cidr": "10.20.0.8/30", "local_ip": "10.20.0.10"}
                ]
            })
            .to_string(),
        )
        .unwrap();
        Bindings::from_params(&params)
    }

    fn template(body: &str) -> Template {
        parse_template(Path::new("t.tmpl"), &format!("@version 1\n@family tower\n{}", body)).unwrap()
    }

    fn texts(sections: &[RenderedSection]) -> Vec<String> {
        sections
            .iter()
            .flat_map(|s| s.lines.iter().map(|l| l.text.clone()))
            .collect()
    }

    #[test]
    fn test_split_line() {
        assert_eq!(
            placeholder_keys("/ip address add address={{ cpe_gateway }}/{{cpe_prefix}} comment={{device_name | lower}}").unwrap(),
            vec!["cpe_gateway", "cpe_prefix", "device_name"]
        );
        assert!(placeholder_keys("/x {{ a + b }}").is_err());
        assert!(placeholder_keys("/x {{ broken").is_err());
    }

    #[test]
    fn test_render_scalars_and_groups() {
        let t = template(
            "[addresses]\n/ip address add address={{cpe_gateway_cidr}} interface=bridge-cpe #@ scope=cpe\n\
             [routing]\n{{#each tower_links}}\n/routing ospf interface-template add interfaces={{interface}} networks={{cidr}} comment=\"{{index}} {{name}} {{device_name}}\"\n{{/each}}\n",
        );
        let sections = render(&t, &bindings()).unwrap();
        assert_eq!(
            texts(&sections),
            vec![
                "/ip address add address=10.10.10.1/24 interface=bridge-cpe",
                "/routing ospf interface-template add interfaces=ether2 networks=10.20.0.0/29 comment=\"1 TWR-BRAVO TWR-ALPHA-01\"",
                "/routing ospf interface-template add interfaces=ether3 networks=10.20.0.8/30 comment=\"2 TWR-CHARLIE TWR-ALPHA-01\"",
            ]
        );
        assert_eq!(sections[0].lines[0].scope(), Some("cpe"));
    }

    #[test]
    fn test_empty_group_renders_nothing_but_checks_fields() {
        let t = template("[management]\n{{#each radius_servers}}\n/radius add address={{address}} secret=\"{{secret}}\"\n{{/each}}\n");
        assert!(render(&t, &bindings()).unwrap()[0].lines.is_empty());

        let t = template("[management]\n{{#each radius_servers}}\n/radius add address={{addr}}\n{{/each}}\n");
        match render(&t, &bindings()) {
            Err(SynthError::UnresolvedPlaceholder { keys }) => assert_eq!(keys, vec!["addr"]),
            other => panic!("expected UnresolvedPlaceholder, got {:?}", other),
        }
    }

    #[test]
    fn test_every_missing_key_is_listed() {
        let t = template("[identity]\n/system identity set name={{UNDEFINED_KEY}}\n/system clock set time-zone-name={{tz}} x={{UNDEFINED_KEY}}\n");
        let frag = parse_fragment(
            Path::new("f.frag"),
            "@version 1\n@target compliance\n/snmp set contact={{snmp_contact}}\n",
        )
        .unwrap();
        match render_with_fragments(&t, &[Arc::new(frag)], &bindings()) {
            Err(SynthError::UnresolvedPlaceholder { keys }) => {
                assert_eq!(keys, vec!["UNDEFINED_KEY", "tz", "snmp_contact"])
            }
            other => panic!("expected UnresolvedPlaceholder, got {:?}", other),
        }
    }

    #[test]
    fn test_routeros_braces_survive() {
        let t = template("[system]\n/system scheduler add name=ping on-event=\"{% :log info {{device_name}} %}\"\n/system script add source=\"{#x}\"\n");
        assert_eq!(
            texts(&render(&t, &bindings()).unwrap()),
            vec![
                "/system scheduler add name=ping on-event=\"{% :log info TWR-ALPHA-01 %}\"",
                "/system script add source=\"{#x}\"",
            ]
        );
    }

    #[test]
    fn test_row_scope_takes_element_name() {
        let params = SiteParameters::from_json(
            &serde_json::json!({
                "device_name": "TWR-ALPHA-01",
                "time_zone": "America/Chicago",
                "loopback": "10.1.1.1",
                "cpe_scope": {"cidr": "10.10.10.0/24", "pool_range": "10.10.10.50-10.10.10.254"},
                "unauth_scope": {"cidr": "10.11.0.0/24", "pool_range": "10.11.0.10-10.11.0.250"},
                "cgnat_private_scope": {"cidr": "100.64.0.0/22", "pool_range": "100.64.0.10-100.64.3.250"},
                "additional_scopes": [
                    {"name": "voip", "cidr": "10.30.0.0/25", "pool_range": "10.30.0.10-10.30.0.100"},
                    {"name": "iot", "cidr": "10.31.0.0/26", "pool_range": "10.31.0.10-10.31.0.50"}
                ],
                "cgnat_public_ip": "203.0.113.10",
                "dhcp_dns_servers": ["1.1.1.1"]
            })
            .to_string(),
        )
        .unwrap();
        let t = template("[dhcp]\n{{#each additional_scopes}}\n/ip pool add name={{name}}-pool ranges={{pool_range}} #@ scope=each\n{{/each}}\n");
        let sections = render(&t, &Bindings::from_params(&params)).unwrap();
        let scopes: Vec<Option<&str>> = sections[0].lines.iter().map(|l| l.scope()).collect();
        assert_eq!(scopes, vec![Some("voip"), Some("iot")]);
    }

    #[test]
    fn test_filters_apply() {
        let t = template("[identity]\n/system identity set name={{device_name | lower}}\n");
        assert_eq!(texts(&render(&t, &bindings()).unwrap()), vec!["/system identity set name=twr-alpha-01"]);

        let t = template("[identity]\n/system identity set name={{device_name | no_such_filter}}\n");
        assert!(matches!(render(&t, &bindings()), Err(SynthError::Render { .. })));
    }

    #[test]
    fn test_fragment_marker_is_rendered() {
        let t = template("[identity]\n/system identity set name={{device_name}}\n");
        let frag = parse_fragment(
            Path::new("ssh-redirect.frag"),
            "@version 2\n@target firewall-nat\n/ip firewall nat add chain=dstnat dst-address={{loopback}} dst-port=22 action=redirect to-ports=2200 #@ marker\n",
        )
        .unwrap();
        let (_, frags) = render_with_fragments(&t, &[Arc::new(frag)], &bindings()).unwrap();
        assert_eq!(
            frags[0].marker.as_deref(),
            Some("/ip firewall nat add chain=dstnat dst-address=10.1.1.1 dst-port=22 action=redirect to-ports=2200")
        );
        assert_eq!(frags[0].version, 2);
    }
}
