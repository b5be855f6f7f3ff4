use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{SynthError, SynthResult};
use crate::utils::{self, AddressRange, Cidr};

/// Canonical names of the built-in scopes
pub mod scope_name {
    pub const CPE: &str = "cpe";
    pub const UNAUTH: &str = "unauth";
    pub const CGNAT_PRIVATE: &str = "cgnat_private";

    pub const BUILTIN: &[&str] = &[CPE, UNAUTH, CGNAT_PRIVATE];
}

/// Scalar placeholder keys that do not come from a scope
pub mod scalar {
    pub const DEVICE_NAME: &str = "device_name";
    pub const TIME_ZONE: &str = "time_zone";
    pub const LOOPBACK: &str = "loopback";
    pub const LOOPBACK_CIDR: &str = "loopback_cidr";
    pub const CGNAT_PUBLIC_IP: &str = "cgnat_public_ip";
    pub const DHCP_DNS_SERVERS: &str = "dhcp_dns_servers";

    pub const ALL: &[&str] = &[
        DEVICE_NAME,
        TIME_ZONE,
        LOOPBACK,
        LOOPBACK_CIDR,
        CGNAT_PUBLIC_IP,
        DHCP_DNS_SERVERS,
    ];

    /// Suffixes of the `<scope>_<field>` keys every scope contributes
    pub const SCOPE_FIELDS: &[&str] = &[
        "cidr",
        "network",
        "gateway",
        "gateway_cidr",
        "netmask",
        "prefix",
        "broadcast",
        "pool_start",
        "pool_end",
        "pool_range",
    ];

    pub fn scope_key(scope: &str, field: &str) -> String {
        format!("{}_{}", scope, field)
    }
}

/// Scope tag value that binds a line to the current `additional_scopes` element
pub const ROW_SCOPE: &str = "each";

/// Names of the array fields a template can iterate with `{{#each ...}}`
pub mod group {
    pub const TOWER_LINKS: &str = "tower_links";
    pub const RADIUS_SERVERS: &str = "radius_servers";
    pub const MANAGEMENT_IPS: &str = "management_ips";
    pub const BRIDGE3000_IPS: &str = "bridge3000_ips";
    pub const DHCP_DNS_SERVERS: &str = "dhcp_dns_servers";
    pub const ADDITIONAL_SCOPES: &str = "additional_scopes";

    pub const ALL: &[&str] = &[
        TOWER_LINKS,
        RADIUS_SERVERS,
        MANAGEMENT_IPS,
        BRIDGE3000_IPS,
        DHCP_DNS_SERVERS,
        ADDITIONAL_SCOPES,
    ];
}

// ========== Input document ==========

/// ScopeInput is a routed subnet as submitted by the intake flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeInput {
    pub cidr: String,
    pub pool_range: String,
}

/// NamedScopeInput is an additional scope beyond cpe/unauth/cgnat_private
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamedScopeInput {
    pub name: String,
    pub cidr: String,
    pub pool_range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagementAddressInput {
    pub label: String,
    pub cidr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RadiusServerInput {
    pub address: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TowerLinkInput {
    pub interface: String,
    pub name: String,
    pub cidr: String,
    pub local_ip: String,
}

/// SiteParametersInput is the untyped site document (JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteParametersInput {
    pub device_name: String,
    pub time_zone: String,
    pub loopback: String,
    pub cpe_scope: ScopeInput,
    pub unauth_scope: ScopeInput,
    pub cgnat_private_scope: ScopeInput,
    #[serde(default)]
    pub additional_scopes: Vec<NamedScopeInput>,
    pub cgnat_public_ip: String,
    #[serde(default)]
    pub management_ips: Vec<ManagementAddressInput>,
    pub dhcp_dns_servers: Vec<String>,
    #[serde(default)]
    pub radius_servers: Vec<RadiusServerInput>,
    #[serde(default)]
    pub tower_links: Vec<TowerLinkInput>,
    #[serde(default)]
    pub bridge3000_ips: Vec<String>,
}

// ========== Typed parameters ==========

/// Scope represents one routed subnet serving a traffic class
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub name: String,
    pub cidr: Cidr,
    pub pool_range: AddressRange,
}

/// Values computed from a scope's CIDR; never supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DerivedScope {
    pub network: Cidr,
    pub network_base: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub prefix: u8,
    pub broadcast: Ipv4Addr,
}

impl Scope {
    pub fn derive(&self) -> DerivedScope {
        DerivedScope {
            network: self.cidr.canonical(),
            network_base: utils::network_base(&self.cidr),
            gateway: utils::first_usable_host(&self.cidr),
            netmask: utils::netmask_dotted(self.cidr.prefix_len()),
            prefix: self.cidr.prefix_len(),
            broadcast: utils::broadcast(&self.cidr),
        }
    }

    pub fn is_builtin(&self) -> bool {
        scope_name::BUILTIN.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagementAddress {
    pub label: String,
    pub cidr: Cidr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RadiusServer {
    pub address: Ipv4Addr,
    pub secret: String,
}

/// TowerLink is a point-to-point backhaul link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TowerLink {
    pub interface: String,
    pub name: String,
    pub cidr: Cidr,
    pub local_ip: Ipv4Addr,
}

/// SiteParameters is the validated site document every synthesis runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteParameters {
    pub device_name: String,
    pub time_zone: String,
    pub loopback: Ipv4Addr,
    /// cpe, unauth, cgnat_private, then additional scopes in input order
    pub scopes: Vec<Scope>,
    pub cgnat_public_ip: Ipv4Addr,
    pub management_ips: Vec<ManagementAddress>,
    pub dhcp_dns_servers: Vec<Ipv4Addr>,
    pub radius_servers: Vec<RadiusServer>,
    pub tower_links: Vec<TowerLink>,
    pub bridge3000_ips: Vec<Cidr>,
}

impl SiteParameters {
    /// Parse and validate a JSON site document
    pub fn from_json(json: &str) -> SynthResult<Self> {
        let input: SiteParametersInput = serde_json::from_str(json)?;
        Self::parse(input)
    }

    /// Validate every field of the input document.
    /// Errors name the exact field path, e.g. `tower_links[1].cidr`.
    pub fn parse(input: SiteParametersInput) -> SynthResult<Self> {
        if !utils::is_valid_device_name(&input.device_name) {
            return Err(SynthError::invalid(
                "device_name",
                format!("{:?} does not match the device naming pattern", input.device_name),
            ));
        }
        if !utils::is_valid_time_zone(&input.time_zone) {
            return Err(SynthError::invalid(
                "time_zone",
                format!("{:?} is not an IANA time zone", input.time_zone),
            ));
        }

        let loopback = parse_loopback(&input.loopback)?;

        let mut scopes = vec![
            parse_scope(scope_name::CPE, &input.cpe_scope, "cpe_scope")?,
            parse_scope(scope_name::UNAUTH, &input.unauth_scope, "unauth_scope")?,
            parse_scope(
                scope_name::CGNAT_PRIVATE,
                &input.cgnat_private_scope,
                "cgnat_private_scope",
            )?,
        ];

        let mut seen: HashSet<String> = scope_name::BUILTIN.iter().map(|s| s.to_string()).collect();
        // Every placeholder key bound so far; a scope may not shadow any of them
        let mut keys: HashSet<String> = scalar::ALL.iter().map(|k| k.to_string()).collect();
        for name in scope_name::BUILTIN {
            keys.extend(scalar::SCOPE_FIELDS.iter().map(|f| scalar::scope_key(name, f)));
        }

        for (i, extra) in input.additional_scopes.iter().enumerate() {
            let path = format!("additional_scopes[{}]", i);
            if !utils::is_valid_identifier(&extra.name) {
                return Err(SynthError::invalid(
                    format!("{}.name", path),
                    format!("{:?} must be a lowercase identifier", extra.name),
                ));
            }
            if extra.name == ROW_SCOPE {
                return Err(SynthError::invalid(
                    format!("{}.name", path),
                    format!("{:?} is reserved", extra.name),
                ));
            }
            if !seen.insert(extra.name.clone()) {
                return Err(SynthError::invalid(
                    format!("{}.name", path),
                    format!("scope {:?} is defined more than once", extra.name),
                ));
            }
            let own: Vec<String> = scalar::SCOPE_FIELDS
                .iter()
                .map(|f| scalar::scope_key(&extra.name, f))
                .collect();
            if let Some(clash) = own.iter().find(|k| keys.contains(*k)) {
                return Err(SynthError::invalid(
                    format!("{}.name", path),
                    format!("scope {:?} would rebind placeholder {}", extra.name, clash),
                ));
            }
            keys.extend(own);
            let raw = ScopeInput {
                cidr: extra.cidr.clone(),
                pool_range: extra.pool_range.clone(),
            };
            scopes.push(parse_scope(&extra.name, &raw, &path)?);
        }

        let cgnat_public_ip = utils::parse_ipv4(&input.cgnat_public_ip)
            .map_err(|e| e.in_field("cgnat_public_ip"))?;

        let management_ips = input
            .management_ips
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let path = format!("management_ips[{}]", i);
                if m.label.trim().is_empty() {
                    return Err(SynthError::invalid(format!("{}.label", path), "label is empty"));
                }
                Ok(ManagementAddress {
                    label: m.label.clone(),
                    cidr: utils::parse_cidr(&m.cidr).map_err(|e| e.in_field(&format!("{}.cidr", path)))?,
                })
            })
            .collect::<SynthResult<Vec<_>>>()?;

        if input.dhcp_dns_servers.is_empty() {
            return Err(SynthError::invalid("dhcp_dns_servers", "at least one DNS server is required"));
        }
        let dhcp_dns_servers = input
            .dhcp_dns_servers
            .iter()
            .enumerate()
            .map(|(i, s)| utils::parse_ipv4(s).map_err(|e| e.in_field(&format!("dhcp_dns_servers[{}]", i))))
            .collect::<SynthResult<Vec<_>>>()?;

        let radius_servers = input
            .radius_servers
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let path = format!("radius_servers[{}]", i);
                if r.secret.is_empty() {
                    return Err(SynthError::invalid(format!("{}.secret", path), "secret is empty"));
                }
                if r.secret.contains('"') || r.secret.contains('\n') {
                    return Err(SynthError::invalid(
                        format!("{}.secret", path),
                        "secret may not contain quotes or newlines",
                    ));
                }
                Ok(RadiusServer {
                    address: utils::parse_ipv4(&r.address)
                        .map_err(|e| e.in_field(&format!("{}.address", path)))?,
                    secret: r.secret.clone(),
                })
            })
            .collect::<SynthResult<Vec<_>>>()?;

        let tower_links = input
            .tower_links
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let path = format!("tower_links[{}]", i);
                if t.interface.trim().is_empty() || t.interface.contains(char::is_whitespace) {
                    return Err(SynthError::invalid(
                        format!("{}.interface", path),
                        format!("{:?} is not an interface name", t.interface),
                    ));
                }
                Ok(TowerLink {
                    interface: t.interface.clone(),
                    name: t.name.clone(),
                    cidr: utils::parse_cidr(&t.cidr).map_err(|e| e.in_field(&format!("{}.cidr", path)))?,
                    local_ip: utils::parse_ipv4(&t.local_ip)
                        .map_err(|e| e.in_field(&format!("{}.local_ip", path)))?,
                })
            })
            .collect::<SynthResult<Vec<_>>>()?;

        let bridge3000_ips = input
            .bridge3000_ips
            .iter()
            .enumerate()
            .map(|(i, s)| utils::parse_cidr(s).map_err(|e| e.in_field(&format!("bridge3000_ips[{}]", i))))
            .collect::<SynthResult<Vec<_>>>()?;

        Ok(Self {
            device_name: input.device_name,
            time_zone: input.time_zone,
            loopback,
            scopes,
            cgnat_public_ip,
            management_ips,
            dhcp_dns_servers,
            radius_servers,
            tower_links,
            bridge3000_ips,
        })
    }

    pub fn scope(&self, name: &str) -> Option<&Scope> {
        self.scopes.iter().find(|s| s.name == name)
    }

    pub fn additional_scopes(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter().filter(|s| !s.is_builtin())
    }

    /// Number of entries in a repeated group, or None for an unknown group name
    pub fn group_len(&self, name: &str) -> Option<usize> {
        match name {
            group::TOWER_LINKS => Some(self.tower_links.len()),
            group::RADIUS_SERVERS => Some(self.radius_servers.len()),
            group::MANAGEMENT_IPS => Some(self.management_ips.len()),
            group::BRIDGE3000_IPS => Some(self.bridge3000_ips.len()),
            group::DHCP_DNS_SERVERS => Some(self.dhcp_dns_servers.len()),
            group::ADDITIONAL_SCOPES => Some(self.additional_scopes().count()),
            _ => None,
        }
    }

    /// Every address-typed parameter other than the loopback, labelled by field path
    pub fn non_loopback_addresses(&self) -> Vec<(String, Ipv4Addr)> {
        let mut out = Vec::new();
        for scope in &self.scopes {
            let derived = scope.derive();
            out.push((format!("{}.cidr", scope.name), scope.cidr.address()));
            out.push((format!("{}.gateway", scope.name), derived.gateway));
            out.push((format!("{}.pool_range.start", scope.name), scope.pool_range.low()));
            out.push((format!("{}.pool_range.end", scope.name), scope.pool_range.high()));
        }
        out.push(("cgnat_public_ip".to_string(), self.cgnat_public_ip));
        for (i, m) in self.management_ips.iter().enumerate() {
            out.push((format!("management_ips[{}].cidr", i), m.cidr.address()));
        }
        for (i, r) in self.radius_servers.iter().enumerate() {
            out.push((format!("radius_servers[{}].address", i), r.address));
        }
        for (i, t) in self.tower_links.iter().enumerate() {
            out.push((format!("tower_links[{}].cidr", i), t.cidr.address()));
            out.push((format!("tower_links[{}].local_ip", i), t.local_ip));
        }
        for (i, c) in self.bridge3000_ips.iter().enumerate() {
            out.push((format!("bridge3000_ips[{}]", i), c.address()));
        }
        out
    }
}

/// The loopback is a single host: bare address or an explicit /32
fn parse_loopback(raw: &str) -> SynthResult<Ipv4Addr> {
    if raw.contains('/') {
        let cidr = utils::parse_cidr(raw).map_err(|e| e.in_field("loopback"))?;
        if cidr.prefix_len() != 32 {
            return Err(SynthError::invalid(
                "loopback",
                format!("{:?} must be a single host (/32)", raw),
            ));
        }
        Ok(cidr.address())
    } else {
        utils::parse_ipv4(raw).map_err(|e| e.in_field("loopback"))
    }
}

fn parse_scope(name: &str, raw: &ScopeInput, path: &str) -> SynthResult<Scope> {
    let cidr = utils::parse_cidr(&raw.cidr).map_err(|e| e.in_field(&format!("{}.cidr", path)))?;
    let pool_range = utils::parse_pool_range(&raw.pool_range)
        .map_err(|e| e.in_field(&format!("{}.pool_range", path)))?;
    Ok(Scope {
        name: name.to_string(),
        cidr,
        pool_range,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "device_name": "TWR-ALPHA-01",
            "time_zone": "America/Chicago",
            "loopback": "10.1.1.1",
            "cpe_scope": {"cidr": "10.10.10.0/24", "pool_range": "10.10.10.50-10.10.10.254"},
            "unauth_scope": {"cidr": "10.11.0.0/24", "pool_range": "10.11.0.10-10.11.0.250"},
            "cgnat_private_scope": {"cidr": "100.64.0.0/22", "pool_range": "100.64.0.10-100.64.3.250"},
            "cgnat_public_ip": "203.0.113.10",
            "dhcp_dns_servers": ["1.1.1.1", "8.8.8.8"],
            "tower_links": [
                {"interface": "ether2", "name": "TWR-BRAVO", "cidr": "10.20.0.0/29", "local_ip": "10.20.0.3"}
            ]
        })
    }

    fn parse(v: serde_json::Value) -> SynthResult<SiteParameters> {
        SiteParameters::from_json(&v.to_string())
    }

    #[test]
    fn test_parse_sample() {
        let params = parse(sample()).unwrap();
        assert_eq!(params.loopback, "10.1.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(params.scopes.len(), 3);
        let cpe = params.scope("cpe").unwrap().derive();
        assert_eq!(cpe.gateway.to_string(), "10.10.10.1");
        assert_eq!(cpe.netmask.to_string(), "255.255.255.0");
        assert_eq!(cpe.prefix, 24);
        assert_eq!(params.group_len("tower_links"), Some(1));
        assert_eq!(params.group_len("bridge3000_ips"), Some(0));
        assert_eq!(params.group_len("nope"), None);
    }

    #[test]
    fn test_field_path_in_cidr_error() {
        let mut doc = sample();
        doc["tower_links"][0]["cidr"] = "10.20.0.0/40".into();
        match parse(doc) {
            Err(SynthError::MalformedCidr { field, .. }) => assert_eq!(field, "tower_links[0].cidr"),
            other => panic!("expected MalformedCidr, got {:?}", other),
        }
    }

    #[test]
    fn test_loopback_must_be_host() {
        let mut doc = sample();
        doc["loopback"] = "10.1.1.0/24".into();
        assert!(matches!(parse(doc), Err(SynthError::InvalidField { field, .. }) if field == "loopback"));

        let mut doc = sample();
        doc["loopback"] = "10.1.1.1/32".into();
        assert!(parse(doc).is_ok());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut doc = sample();
        doc["loopbak"] = "10.1.1.1".into();
        assert!(matches!(parse(doc), Err(SynthError::Json(_))));
    }

    #[test]
    fn test_inverted_pool_range() {
        let mut doc = sample();
        doc["cpe_scope"]["pool_range"] = "10.10.10.254-10.10.10.50".into();
        assert!(matches!(parse(doc), Err(SynthError::InvalidField { field, .. }) if field == "cpe_scope.pool_range"));
    }

    #[test]
    fn test_duplicate_additional_scope() {
        let mut doc = sample();
        doc["additional_scopes"] = serde_json::json!([
            {"name": "cpe", "cidr": "10.40.0.0/24", "pool_range": "10.40.0.10-10.40.0.20"}
        ]);
        assert!(matches!(parse(doc), Err(SynthError::InvalidField { .. })));
    }

    #[test]
    fn test_scope_name_cannot_rebind_existing_keys() {
        // loopback_cidr, cpe_gateway_cidr, and a key of an earlier additional scope
        for (names, clash) in [
            (vec!["loopback"], "loopback_cidr"),
            (vec!["cpe_gateway"], "cpe_gateway_cidr"),
            (vec!["unauth_gateway"], "unauth_gateway_cidr"),
            (vec!["voip", "voip_gateway"], "voip_gateway_cidr"),
        ] {
            let mut doc = sample();
            doc["additional_scopes"] = names
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    serde_json::json!({
                        "name": n,
                        "cidr": format!("10.{}.0.0/24", 60 + i),
                        "pool_range": format!("10.{}.0.10-10.{}.0.20", 60 + i, 60 + i),
                    })
                })
                .collect();
            let last = names.len() - 1;
            match parse(doc) {
                Err(SynthError::InvalidField { field, reason }) => {
                    assert_eq!(field, format!("additional_scopes[{}].name", last));
                    assert!(reason.contains(clash), "{}", reason);
                }
                other => panic!("expected InvalidField for {:?}, got {:?}", names, other),
            }
        }
    }

    #[test]
    fn test_row_scope_name_is_reserved() {
        let mut doc = sample();
        doc["additional_scopes"] = serde_json::json!([
            {"name": "each", "cidr": "10.40.0.0/24", "pool_range": "10.40.0.10-10.40.0.20"}
        ]);
        assert!(matches!(parse(doc), Err(SynthError::InvalidField { field, .. }) if field == "additional_scopes[0].name"));
    }

    #[test]
    fn test_bad_device_name() {
        let mut doc = sample();
        doc["device_name"] = "tower 01".into();
        assert!(matches!(parse(doc), Err(SynthError::InvalidField { field, .. }) if field == "device_name"));
    }
}
