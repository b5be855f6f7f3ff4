use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Section names, in the canonical Output Assembly Order
pub mod section {
    pub const IDENTITY: &str = "identity";
    pub const INTERFACES: &str = "interfaces";
    pub const TOWER_LINKS: &str = "tower-links";
    pub const ADDRESSES: &str = "addresses";
    pub const DHCP: &str = "dhcp";
    pub const MANAGEMENT: &str = "management";
    pub const ROUTING: &str = "routing";
    pub const MPLS: &str = "mpls";
    pub const FIREWALL_ADDRESS_LISTS: &str = "firewall-address-lists";
    pub const FIREWALL_FILTER: &str = "firewall-filter";
    pub const FIREWALL_NAT: &str = "firewall-nat";
    pub const FIREWALL_RAW: &str = "firewall-raw";
    pub const COMPLIANCE: &str = "compliance";
    pub const SYSTEM: &str = "system";

    pub const CANONICAL_ORDER: &[&str] = &[
        IDENTITY,
        INTERFACES,
        TOWER_LINKS,
        ADDRESSES,
        DHCP,
        MANAGEMENT,
        ROUTING,
        MPLS,
        FIREWALL_ADDRESS_LISTS,
        FIREWALL_FILTER,
        FIREWALL_NAT,
        FIREWALL_RAW,
        COMPLIANCE,
        SYSTEM,
    ];

    pub fn is_known(name: &str) -> bool {
        CANONICAL_ORDER.contains(&name)
    }
}

/// TemplateFamily fixes which sections a template may use and their order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateFamily {
    Tower,
    MplsAggregation,
    CustomerAccess,
}

impl TemplateFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tower => "tower",
            Self::MplsAggregation => "mpls-aggregation",
            Self::CustomerAccess => "customer-access",
        }
    }

    /// Output Assembly Order for this family
    pub fn section_order(&self) -> Vec<&'static str> {
        section::CANONICAL_ORDER
            .iter()
            .copied()
            .filter(|s| self.allows(s))
            .collect()
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::Tower => section::is_known(name) && name != section::MPLS,
            Self::MplsAggregation => section::is_known(name),
            Self::CustomerAccess => {
                section::is_known(name) && name != section::MPLS && name != section::TOWER_LINKS
            }
        }
    }
}

impl fmt::Display for TemplateFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "tower" => Ok(Self::Tower),
            "mpls-aggregation" => Ok(Self::MplsAggregation),
            "customer-access" => Ok(Self::CustomerAccess),
            other => Err(format!("unknown template family {:?}", other)),
        }
    }
}

/// How the assembler decides two statements are the same
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// Byte-identical lines only
    #[default]
    Exact,
    /// Whitespace collapsed and key=value attributes sorted before comparison
    Normalized,
}

impl FromStr for DedupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "exact" => Ok(Self::Exact),
            "normalized" => Ok(Self::Normalized),
            other => Err(format!("unknown dedup strategy {:?}", other)),
        }
    }
}

/// Metadata attached to a template line with a trailing `#@` annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineTag {
    /// These attributes must carry the loopback address
    Loopback { attributes: Vec<String> },
    /// Counted for the count-matching rule of a repeated group
    Count { group: String },
    /// Address attributes on this line derive from the named scope
    Scope { scope: String },
    /// `scope=each`: the scope is the current `additional_scopes` element,
    /// resolved to `Scope` when the line renders
    RowScope,
    /// Single-occurrence marker statement of a compliance fragment
    Marker,
}

/// A single template line: RouterOS text with placeholders plus its tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLine {
    pub text: String,
    pub tags: Vec<LineTag>,
    /// 1-based line number in the source file
    pub line_no: usize,
}

impl TemplateLine {
    pub fn has_marker(&self) -> bool {
        self.tags.iter().any(|t| matches!(t, LineTag::Marker))
    }

    pub fn has_row_scope(&self) -> bool {
        self.tags.iter().any(|t| matches!(t, LineTag::RowScope))
    }

    fn loopback_attributes(&self) -> usize {
        self.tags
            .iter()
            .map(|t| match t {
                LineTag::Loopback { attributes } => attributes.len(),
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateNode {
    Line(TemplateLine),
    /// `{{#each group}} ... {{/each}}`: lines rendered once per group element
    Group { group: String, lines: Vec<TemplateLine> },
}

impl TemplateNode {
    pub fn lines(&self) -> &[TemplateLine] {
        match self {
            Self::Line(l) => std::slice::from_ref(l),
            Self::Group { lines, .. } => lines,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub nodes: Vec<TemplateNode>,
}

/// Template is an immutable, versioned baseline loaded from the catalog
#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub version: u32,
    pub family: TemplateFamily,
    pub description: Option<String>,
    /// Fragments applied to every synthesis from this template, before caller-supplied ones
    pub default_fragments: Vec<String>,
    pub dedup: DedupStrategy,
    pub sections: Vec<Section>,
    pub source: PathBuf,
}

impl Template {
    pub fn section_order(&self) -> Vec<&'static str> {
        self.family.section_order()
    }

    /// Number of template lines tagged `count=<group>`
    pub fn count_tagged_lines(&self, group: &str) -> usize {
        self.sections
            .iter()
            .flat_map(|s| s.nodes.iter())
            .flat_map(|n| n.lines())
            .filter(|l| {
                l.tags
                    .iter()
                    .any(|t| matches!(t, LineTag::Count { group: g } if g == group))
            })
            .count()
    }

    /// Loopback-tagged attributes outside groups, and per element of each group
    pub fn loopback_locations(&self) -> LoopbackLocations {
        let mut locations = LoopbackLocations::default();
        for node in self.sections.iter().flat_map(|s| s.nodes.iter()) {
            match node {
                TemplateNode::Line(line) => locations.fixed += line.loopback_attributes(),
                TemplateNode::Group { group, lines } => {
                    let n: usize = lines.iter().map(TemplateLine::loopback_attributes).sum();
                    if n > 0 {
                        *locations.per_element.entry(group.clone()).or_default() += n;
                    }
                }
            }
        }
        locations
    }

    /// Every group named by a `count=` tag, in first-appearance order
    pub fn counted_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for node in self.sections.iter().flat_map(|s| s.nodes.iter()) {
            for tag in node.lines().iter().flat_map(|l| l.tags.iter()) {
                if let LineTag::Count { group } = tag {
                    if !groups.contains(group) {
                        groups.push(group.clone());
                    }
                }
            }
        }
        groups
    }
}

/// Loopback locations a template declares
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopbackLocations {
    /// Tagged attributes on lines outside any group
    pub fixed: usize,
    /// group -> tagged attributes rendered once per element
    pub per_element: BTreeMap<String, usize>,
}

impl LoopbackLocations {
    pub fn is_empty(&self) -> bool {
        self.fixed == 0 && self.per_element.is_empty()
    }

    /// Locations expected once every group is expanded
    pub fn expected(&self, group_len: impl Fn(&str) -> Option<usize>) -> usize {
        self.fixed
            + self
                .per_element
                .iter()
                .map(|(g, n)| group_len(g).unwrap_or(0) * n)
                .sum::<usize>()
    }
}

/// ComplianceFragment is a named, independently versioned block of statements
/// appended into one target section
#[derive(Debug, Clone)]
pub struct ComplianceFragment {
    pub id: String,
    pub version: u32,
    pub target: String,
    pub description: Option<String>,
    pub lines: Vec<TemplateLine>,
    pub source: PathBuf,
}

impl ComplianceFragment {
    /// The marker statement: the line tagged `marker`, else the first line
    pub fn marker_line(&self) -> Option<&TemplateLine> {
        self.lines
            .iter()
            .find(|l| l.has_marker())
            .or_else(|| self.lines.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_family_orders() {
        let tower = TemplateFamily::Tower.section_order();
        assert!(!tower.contains(&section::MPLS));
        assert_eq!(tower.first(), Some(&section::IDENTITY));
        assert_eq!(tower.last(), Some(&section::SYSTEM));

        let agg = TemplateFamily::MplsAggregation.section_order();
        assert_eq!(agg.len(), section::CANONICAL_ORDER.len());

        let access = TemplateFamily::CustomerAccess.section_order();
        assert!(!access.contains(&section::TOWER_LINKS));
    }

    #[test]
    fn test_firewall_subsections_are_ordered() {
        let order = TemplateFamily::Tower.section_order();
        let pos = |s: &str| order.iter().position(|x| *x == s).unwrap();
        assert!(pos(section::FIREWALL_ADDRESS_LISTS) < pos(section::FIREWALL_FILTER));
        assert!(pos(section::FIREWALL_FILTER) < pos(section::FIREWALL_NAT));
        assert!(pos(section::FIREWALL_NAT) < pos(section::FIREWALL_RAW));
        assert!(pos(section::ROUTING) < pos(section::FIREWALL_ADDRESS_LISTS));
    }

    #[test]
    fn test_loopback_locations_split_fixed_and_grouped() {
        let line = |tags: Vec<LineTag>| TemplateLine {
            text: "/x".into(),
            tags,
            line_no: 1,
        };
        let two = LineTag::Loopback {
            attributes: vec!["lsr-id".into(), "transport-addresses".into()],
        };
        let one = LineTag::Loopback {
            attributes: vec!["src-address".into()],
        };
        let template = Template {
            id: "t".into(),
            version: 1,
            family: TemplateFamily::MplsAggregation,
            description: None,
            default_fragments: Vec::new(),
            dedup: DedupStrategy::Exact,
            sections: vec![Section {
                name: section::MPLS.into(),
                nodes: vec![
                    TemplateNode::Line(line(vec![two])),
                    TemplateNode::Group {
                        group: "radius_servers".into(),
                        lines: vec![line(vec![one]), line(Vec::new())],
                    },
                ],
            }],
            source: PathBuf::from("t.tmpl"),
        };

        let locations = template.loopback_locations();
        assert_eq!(locations.fixed, 2);
        assert_eq!(locations.per_element.get("radius_servers"), Some(&1));
        assert_eq!(locations.expected(|_| Some(3)), 5);
        assert_eq!(locations.expected(|_| None), 2);
    }

    #[test]
    fn test_family_from_str() {
        assert_eq!("mpls-aggregation".parse::<TemplateFamily>(), Ok(TemplateFamily::MplsAggregation));
        assert!("edge".parse::<TemplateFamily>().is_err());
    }
}
