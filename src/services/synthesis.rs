use crate::assemble::assemble;
use crate::catalog::Catalog;
use crate::error::SynthResult;
use crate::models::{RenderedConfiguration, SiteParameters, ValidationReport};
use crate::render::{render_with_fragments, Bindings};
use crate::validate::validate;

/// Template defaults first, then caller names; first occurrence wins
pub fn merge_fragment_names<S: AsRef<str>>(defaults: &[String], requested: &[S]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(defaults.len() + requested.len());
    for name in defaults.iter().map(String::as_str).chain(requested.iter().map(AsRef::as_ref)) {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Produce a configuration and its validation report.
///
/// Structural problems (unknown template or fragment, unresolved placeholders,
/// fragments targeting sections outside the template's family) fail with no
/// output. Rule violations never fail: they are in the report, and the
/// configuration is still returned so it can be inspected.
pub fn synthesize<S: AsRef<str>>(
    catalog: &Catalog,
    template_id: &str,
    fragment_names: &[S],
    params: &SiteParameters,
) -> SynthResult<(RenderedConfiguration, ValidationReport)> {
    // 1. Resolve template and fragments
    let template = catalog.resolve(template_id)?;
    let names = merge_fragment_names(&template.default_fragments, fragment_names);
    let fragments = catalog.resolve_fragments(&names)?;

    // 2. Substitute
    let bindings = Bindings::from_params(params);
    let (sections, rendered_fragments) = render_with_fragments(&template, &fragments, &bindings)?;

    // 3. Assemble in the family's order
    let sections = assemble(
        sections,
        &rendered_fragments,
        &template.section_order(),
        template.dedup,
    )?;
    let config = RenderedConfiguration::new(&template, catalog.generation(), sections, &rendered_fragments);

    // 4. Validate
    let report = validate(&config, params);
    for item in report.failures() {
        tracing::warn!("{} rule {} failed: {}", params.device_name, item.rule_id, item.detail);
    }
    for item in report.warnings() {
        tracing::info!("{} rule {} warning: {}", params.device_name, item.rule_id, item.detail);
    }
    tracing::info!(
        "Synthesized {} from template {} v{} (catalog generation {}, {} fragments, {} lines): {}",
        params.device_name,
        template.id,
        template.version,
        catalog.generation(),
        names.len(),
        config.lines().count(),
        if report.accepted() { "accepted" } else { "rejected" }
    );

    Ok((config, report))
}
