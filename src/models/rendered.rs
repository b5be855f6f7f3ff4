use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::templates::{DedupStrategy, LineTag, LoopbackLocations, Template, TemplateFamily};

/// Where a rendered line came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineOrigin {
    Template { section: String, line_no: usize },
    Fragment { name: String, line_no: usize },
}

/// RenderedLine is one RouterOS statement with the tags of the line it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedLine {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<LineTag>,
    pub origin: LineOrigin,
}

impl RenderedLine {
    /// Attribute names tagged as loopback locations on this line
    pub fn loopback_attributes(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter_map(|t| match t {
                LineTag::Loopback { attributes } => Some(attributes),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
    }

    pub fn counts_for(&self, group: &str) -> bool {
        self.tags
            .iter()
            .any(|t| matches!(t, LineTag::Count { group: g } if g == group))
    }

    pub fn scope(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| match t {
            LineTag::Scope { scope } => Some(scope.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedSection {
    pub name: String,
    pub lines: Vec<RenderedLine>,
}

/// A compliance fragment after placeholder substitution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedFragment {
    pub name: String,
    pub version: u32,
    pub target: String,
    pub marker: Option<String>,
    pub lines: Vec<RenderedLine>,
}

/// Record of a fragment merged into the output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedFragment {
    pub name: String,
    pub version: u32,
    pub target: String,
    pub marker: Option<String>,
}

impl From<&RenderedFragment> for AppliedFragment {
    fn from(f: &RenderedFragment) -> Self {
        Self {
            name: f.name.clone(),
            version: f.version,
            target: f.target.clone(),
            marker: f.marker.clone(),
        }
    }
}

/// RenderedConfiguration is the assembled script for one synthesis request.
/// Built once and never modified; callers re-synthesize instead of patching.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedConfiguration {
    id: Uuid,
    generated_at: DateTime<Utc>,
    template_id: String,
    template_version: u32,
    family: TemplateFamily,
    catalog_generation: u64,
    dedup: DedupStrategy,
    sections: Vec<RenderedSection>,
    applied_fragments: Vec<AppliedFragment>,
    /// group -> number of count-tagged template lines per group element
    count_expectations: BTreeMap<String, usize>,
    loopback_locations: LoopbackLocations,
}

impl RenderedConfiguration {
    pub(crate) fn new(
        template: &Template,
        catalog_generation: u64,
        sections: Vec<RenderedSection>,
        fragments: &[RenderedFragment],
    ) -> Self {
        let count_expectations = template
            .counted_groups()
            .into_iter()
            .map(|g| {
                let per_element = template.count_tagged_lines(&g);
                (g, per_element)
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            generated_at: Utc::now(),
            template_id: template.id.clone(),
            template_version: template.version,
            family: template.family,
            catalog_generation,
            dedup: template.dedup,
            sections,
            applied_fragments: fragments.iter().map(AppliedFragment::from).collect(),
            count_expectations,
            loopback_locations: template.loopback_locations(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn template_version(&self) -> u32 {
        self.template_version
    }

    pub fn family(&self) -> TemplateFamily {
        self.family
    }

    pub fn catalog_generation(&self) -> u64 {
        self.catalog_generation
    }

    pub fn dedup(&self) -> DedupStrategy {
        self.dedup
    }

    pub fn sections(&self) -> &[RenderedSection] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&RenderedSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn applied_fragments(&self) -> &[AppliedFragment] {
        &self.applied_fragments
    }

    pub fn count_expectations(&self) -> &BTreeMap<String, usize> {
        &self.count_expectations
    }

    /// Loopback locations the template declares
    pub fn loopback_locations(&self) -> &LoopbackLocations {
        &self.loopback_locations
    }

    /// All lines in output order
    pub fn lines(&self) -> impl Iterator<Item = &RenderedLine> {
        self.sections.iter().flat_map(|s| s.lines.iter())
    }

    /// Plain RouterOS script, one statement per line, suitable for `/import`
    pub fn to_script(&self) -> String {
        let mut out = String::new();
        for line in self.lines() {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }
}
