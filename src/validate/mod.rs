use std::net::Ipv4Addr;

use crate::assemble::{normalize_statement, tokenize};
use crate::models::{
    DedupStrategy, LineOrigin, RenderedConfiguration, RenderedLine, RuleOutcome, Scope,
    SiteParameters, ValidationReport,
};
use crate::utils::{self, Cidr};

/// `key=value` attributes of a statement with surrounding quotes removed.
/// Command substitutions (`[find ...]`) are not attributes of the statement.
pub fn attributes(line: &str) -> Vec<(String, String)> {
    tokenize(line)
        .into_iter()
        .filter(|t| !t.starts_with('['))
        .filter_map(|t| {
            let (key, value) = t.split_once('=')?;
            Some((key.to_string(), unquote(value).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn attribute<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parse an address written bare or as a host route (`/32`)
fn host_address(value: &str) -> Option<Ipv4Addr> {
    value
        .trim()
        .strip_suffix("/32")
        .unwrap_or(value.trim())
        .parse()
        .ok()
}

fn describe(index: usize, line: &RenderedLine) -> String {
    format!("line {} ({})", index + 1, line.text)
}

/// Run every rule over an assembled configuration.
///
/// Validation never fails: each rule produces one or more report items and
/// the caller decides acceptance from the report.
pub fn validate(config: &RenderedConfiguration, params: &SiteParameters) -> ValidationReport {
    let lines: Vec<&RenderedLine> = config.lines().collect();
    let scope_tags_used = lines.iter().any(|l| l.scope().is_some());

    let mut items = vec![check_placeholders(&lines), check_loopback(config, &lines, params)];
    for scope in &params.scopes {
        items.push(check_scope_pool(scope));
        items.push(check_scope_consistency(scope, &lines, scope_tags_used));
    }
    items.extend(check_unknown_scope_tags(&lines, params));
    items.extend(check_counts(config, &lines, params));
    items.extend(check_markers(config, &lines));
    items.extend(check_tower_links(params));

    ValidationReport::new(items)
}

fn check_placeholders(lines: &[&RenderedLine]) -> RuleOutcome {
    let problems = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.text.contains("{{") || l.text.contains("}}"))
        .map(|(i, l)| format!("{} still contains a placeholder", describe(i, l)))
        .collect();
    RuleOutcome::from_problems("placeholders.resolved", "no placeholder tokens in output", problems)
}

fn check_loopback(config: &RenderedConfiguration, lines: &[&RenderedLine], params: &SiteParameters) -> RuleOutcome {
    let loopback = params.loopback;
    let mut problems = Vec::new();
    let mut locations = 0usize;
    let mut from_template = 0usize;

    for (i, line) in lines.iter().enumerate() {
        let attrs = attributes(&line.text);
        let tagged: Vec<&str> = line.loopback_attributes().collect();
        if matches!(line.origin, LineOrigin::Template { .. }) {
            from_template += tagged.len();
        }

        // 1. Tagged locations carry the loopback
        for name in &tagged {
            locations += 1;
            match attribute(&attrs, name) {
                None => problems.push(format!("{}: tagged attribute {} is missing", describe(i, line), name)),
                Some(value) if host_address(value) != Some(loopback) => problems.push(format!(
                    "{}: {}={} is not the loopback {}",
                    describe(i, line),
                    name,
                    value,
                    loopback
                )),
                Some(_) => {}
            }
        }

        // 2. Untagged attributes never carry it
        for (key, value) in &attrs {
            if tagged.contains(&key.as_str()) {
                continue;
            }
            if value.split(',').any(|part| host_address(part) == Some(loopback)) {
                problems.push(format!(
                    "{}: loopback {} used in untagged attribute {}",
                    describe(i, line),
                    loopback,
                    key
                ));
            }
        }
    }

    // 3. Every declared location rendered, once per group element
    let expected = config
        .loopback_locations()
        .expected(|g| params.group_len(g));
    if from_template != expected {
        problems.push(format!(
            "template declares {} loopback locations, found {}",
            expected, from_template
        ));
    }

    // 4. No other address parameter equals the loopback
    for (field, address) in params.non_loopback_addresses() {
        if address == loopback {
            problems.push(format!("{} equals the loopback {}", field, loopback));
        }
    }

    RuleOutcome::from_problems(
        "loopback.ubiquity",
        format!("{} tagged locations carry {}", locations, loopback),
        problems,
    )
}

fn check_scope_pool(scope: &Scope) -> RuleOutcome {
    let rule_id = format!("scope.{}.pool", scope.name);
    let derived = scope.derive();
    let pool = scope.pool_range;
    let mut problems = Vec::new();

    let base = u32::from(derived.network_base);
    let bcast = u32::from(derived.broadcast);
    let (low, high) = (u32::from(pool.low()), u32::from(pool.high()));
    if low <= base || high >= bcast || high < low {
        problems.push(format!(
            "pool {} is outside the usable range of {}",
            pool, derived.network
        ));
    }
    if pool.contains(derived.gateway) {
        problems.push(format!("gateway {} is inside pool {}", derived.gateway, pool));
    }

    RuleOutcome::from_problems(
        rule_id,
        format!("pool {} inside {}, gateway {} excluded", pool, derived.network, derived.gateway),
        problems,
    )
}

/// Lines tagged with a scope agree with its derived values. A scope no line
/// references fails once the output uses scope tags at all.
fn check_scope_consistency(scope: &Scope, lines: &[&RenderedLine], scope_tags_used: bool) -> RuleOutcome {
    let rule_id = format!("scope.{}.consistency", scope.name);
    let derived = scope.derive();
    let mut problems = Vec::new();
    let mut checked = 0usize;

    for (i, line) in lines.iter().enumerate() {
        if line.scope() != Some(scope.name.as_str()) {
            continue;
        }
        checked += 1;
        let at = describe(i, line);

        for (key, value) in attributes(&line.text) {
            match key.as_str() {
                "ranges" => match utils::parse_pool_range(&value) {
                    Ok(range) if range != scope.pool_range => {
                        problems.push(format!("{}: ranges={} differs from pool {}", at, value, scope.pool_range))
                    }
                    Ok(range) if !utils::range_within(&range, &scope.cidr) => {
                        problems.push(format!("{}: ranges={} is outside {}", at, value, derived.network))
                    }
                    Ok(_) => {}
                    Err(e) => problems.push(format!("{}: ranges={} ({})", at, value, e)),
                },
                "gateway" => {
                    if host_address(&value) != Some(derived.gateway) {
                        problems.push(format!("{}: gateway={} but the scope gateway is {}", at, value, derived.gateway));
                    }
                }
                "netmask" => {
                    let matches = value.parse::<u8>().ok() == Some(derived.prefix)
                        || value.parse::<Ipv4Addr>().ok() == Some(derived.netmask);
                    if !matches {
                        problems.push(format!("{}: netmask={} but the scope prefix is /{}", at, value, derived.prefix));
                    }
                }
                "address" => {
                    if let Some(problem) = address_problem(&value, &scope.cidr) {
                        problems.push(format!("{}: {}", at, problem));
                    }
                }
                _ => {}
            }
        }
    }

    if checked == 0 && scope_tags_used {
        problems.push(format!("no lines reference scope {}", scope.name));
    }

    RuleOutcome::from_problems(
        rule_id,
        format!("{} lines derive from {}", checked, derived.network),
        problems,
    )
}

fn address_problem(value: &str, cidr: &Cidr) -> Option<String> {
    if value.contains('/') {
        match utils::parse_cidr(value) {
            Ok(c) if c.prefix_len() != cidr.prefix_len() => Some(format!(
                "address={} has prefix /{} but the scope is /{}",
                value,
                c.prefix_len(),
                cidr.prefix_len()
            )),
            Ok(c) if !cidr.contains(c.address()) => Some(format!("address={} is outside {}", value, cidr.canonical())),
            Ok(_) => None,
            Err(e) => Some(format!("address={} ({})", value, e)),
        }
    } else {
        match value.parse::<Ipv4Addr>() {
            Ok(a) if !cidr.contains(a) => Some(format!("address={} is outside {}", value, cidr.canonical())),
            Ok(_) => None,
            Err(_) => Some(format!("address={} is not an IPv4 address", value)),
        }
    }
}

/// A `scope=` tag naming a scope the site does not define
fn check_unknown_scope_tags(lines: &[&RenderedLine], params: &SiteParameters) -> Vec<RuleOutcome> {
    let mut unknown: Vec<&str> = Vec::new();
    for line in lines {
        if let Some(name) = line.scope() {
            if params.scope(name).is_none() && !unknown.contains(&name) {
                unknown.push(name);
            }
        }
    }
    unknown
        .into_iter()
        .map(|name| {
            RuleOutcome::fail(
                format!("scope.{}.consistency", name),
                format!("lines are tagged with scope {} but the site defines no such scope", name),
            )
        })
        .collect()
}

fn check_counts(config: &RenderedConfiguration, lines: &[&RenderedLine], params: &SiteParameters) -> Vec<RuleOutcome> {
    config
        .count_expectations()
        .iter()
        .map(|(group, per_element)| {
            let rule_id = format!("count.{}", group);
            let actual = lines.iter().filter(|l| l.counts_for(group)).count();
            match params.group_len(group) {
                None => RuleOutcome::fail(rule_id, format!("unknown group {}", group)),
                Some(len) => {
                    let expected = len * per_element;
                    if actual == expected {
                        RuleOutcome::pass(rule_id, format!("{} tagged lines for {} entries", actual, len))
                    } else {
                        RuleOutcome::fail(
                            rule_id,
                            format!("expected {} tagged lines ({} entries x {}), found {}", expected, len, per_element, actual),
                        )
                    }
                }
            }
        })
        .collect()
}

fn check_markers(config: &RenderedConfiguration, lines: &[&RenderedLine]) -> Vec<RuleOutcome> {
    let key = |text: &str| match config.dedup() {
        DedupStrategy::Exact => text.to_string(),
        DedupStrategy::Normalized => normalize_statement(text),
    };

    let mut seen: Vec<&str> = Vec::new();
    let mut items = Vec::new();
    for fragment in config.applied_fragments() {
        if seen.contains(&fragment.name.as_str()) {
            continue;
        }
        seen.push(&fragment.name);

        let rule_id = format!("fragment.{}.marker", fragment.name);
        let Some(marker) = fragment.marker.as_deref() else {
            items.push(RuleOutcome::fail(rule_id, "fragment has no marker statement"));
            continue;
        };
        let wanted = key(marker);
        let count = lines.iter().filter(|l| key(&l.text) == wanted).count();
        items.push(if count == 1 {
            RuleOutcome::pass(rule_id, format!("marker appears once: {}", marker))
        } else {
            RuleOutcome::fail(rule_id, format!("marker appears {} times: {}", count, marker))
        });
    }
    items
}

fn check_tower_links(params: &SiteParameters) -> Vec<RuleOutcome> {
    params
        .tower_links
        .iter()
        .enumerate()
        .map(|(i, link)| {
            let rule_id = format!("tower_link.{}.local_ip", i);
            let base = u32::from(link.cidr.network_base());
            let local = u32::from(link.local_ip);

            if !link.cidr.is_usable_host(link.local_ip) {
                RuleOutcome::fail(
                    rule_id,
                    format!("{} ({}) local_ip {} is not a usable host of {}", link.name, link.interface, link.local_ip, link.cidr.canonical()),
                )
            } else if link.cidr.prefix_len() == 29 && (local == base + 1 || local == base + 2) {
                RuleOutcome::warn(
                    rule_id,
                    format!("{} local_ip {} occupies a host reserved for the radio endpoints", link.name, link.local_ip),
                )
            } else {
                RuleOutcome::pass(rule_id, format!("{} local_ip {} in {}", link.name, link.local_ip, link.cidr.canonical()))
            }
        })
        .collect()
}
