use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use crate::models::{group, scalar, Scope, SiteParameters};
use crate::utils::{AddressRange, Cidr};

/// A value a placeholder can resolve to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Address(Ipv4Addr),
    Network(Cidr),
    Range(AddressRange),
    Integer(u64),
    Text(String),
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(a) => write!(f, "{}", a),
            Self::Network(c) => write!(f, "{}", c),
            Self::Range(r) => write!(f, "{}", r),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Integer(n) => serializer.serialize_u64(*n),
            other => serializer.collect_str(other),
        }
    }
}

impl From<Ipv4Addr> for Value {
    fn from(a: Ipv4Addr) -> Self {
        Self::Address(a)
    }
}

impl From<Cidr> for Value {
    fn from(c: Cidr) -> Self {
        Self::Network(c)
    }
}

impl From<AddressRange> for Value {
    fn from(r: AddressRange) -> Self {
        Self::Range(r)
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Self {
        Self::Integer(u64::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Integer(n as u64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// One element of a repeated group, keyed by field name
pub type Row = BTreeMap<&'static str, Value>;

/// Field names available inside `{{#each group}}`, or None for an unknown group
pub fn group_fields(name: &str) -> Option<&'static [&'static str]> {
    let fields: &'static [&'static str] = match name {
        group::TOWER_LINKS => &[
            "index", "interface", "name", "cidr", "network", "prefix", "netmask", "local_ip",
            "local_cidr",
        ],
        group::RADIUS_SERVERS => &["index", "address", "secret"],
        group::MANAGEMENT_IPS => &["index", "label", "address", "cidr", "network", "prefix"],
        group::BRIDGE3000_IPS => &["index", "address", "cidr", "network", "network_address", "prefix"],
        group::DHCP_DNS_SERVERS => &["index", "address"],
        group::ADDITIONAL_SCOPES => &[
            "index",
            "name",
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
        ],
        _ => return None,
    };
    Some(fields)
}

/// Bindings is the full set of values a template can reference, typed and
/// derived from validated site parameters
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    scalars: BTreeMap<String, Value>,
    groups: BTreeMap<&'static str, Vec<Row>>,
}

impl Bindings {
    pub fn from_params(params: &SiteParameters) -> Self {
        let mut scalars = BTreeMap::new();
        scalars.insert(scalar::DEVICE_NAME.to_string(), Value::from(params.device_name.as_str()));
        scalars.insert(scalar::TIME_ZONE.to_string(), Value::from(params.time_zone.as_str()));
        scalars.insert(scalar::LOOPBACK.to_string(), Value::from(params.loopback));
        scalars.insert(scalar::LOOPBACK_CIDR.to_string(), Value::from(Cidr::host(params.loopback)));
        scalars.insert(scalar::CGNAT_PUBLIC_IP.to_string(), Value::from(params.cgnat_public_ip));
        scalars.insert(
            scalar::DHCP_DNS_SERVERS.to_string(),
            Value::List(params.dhcp_dns_servers.iter().copied().map(Value::from).collect()),
        );

        // Scope names were checked at parse time not to rebind any key above
        for scope in &params.scopes {
            for (field, value) in scope_values(scope) {
                scalars.insert(scalar::scope_key(&scope.name, field), value);
            }
        }

        let mut groups: BTreeMap<&'static str, Vec<Row>> = BTreeMap::new();

        groups.insert(
            group::TOWER_LINKS,
            params
                .tower_links
                .iter()
                .map(|t| {
                    let network = t.cidr.canonical();
                    Row::from([
                        ("interface", Value::from(t.interface.as_str())),
                        ("name", Value::from(t.name.as_str())),
                        ("cidr", Value::from(network)),
                        ("network", Value::from(network.address())),
                        ("prefix", Value::from(t.cidr.prefix_len())),
                        ("netmask", Value::from(t.cidr.netmask())),
                        ("local_ip", Value::from(t.local_ip)),
                        ("local_cidr", Value::from(t.cidr.with_address(t.local_ip))),
                    ])
                })
                .collect(),
        );

        groups.insert(
            group::RADIUS_SERVERS,
            params
                .radius_servers
                .iter()
                .map(|r| {
                    Row::from([
                        ("address", Value::from(r.address)),
                        ("secret", Value::from(r.secret.as_str())),
                    ])
                })
                .collect(),
        );

        groups.insert(
            group::MANAGEMENT_IPS,
            params
                .management_ips
                .iter()
                .map(|m| {
                    Row::from([
                        ("label", Value::from(m.label.as_str())),
                        ("address", Value::from(m.cidr.address())),
                        ("cidr", Value::from(m.cidr)),
                        ("network", Value::from(m.cidr.canonical())),
                        ("prefix", Value::from(m.cidr.prefix_len())),
                    ])
                })
                .collect(),
        );

        groups.insert(
            group::BRIDGE3000_IPS,
            params
                .bridge3000_ips
                .iter()
                .map(|c| {
                    Row::from([
                        ("address", Value::from(c.address())),
                        ("cidr", Value::from(*c)),
                        ("network", Value::from(c.canonical())),
                        ("network_address", Value::from(c.network_base())),
                        ("prefix", Value::from(c.prefix_len())),
                    ])
                })
                .collect(),
        );

        groups.insert(
            group::DHCP_DNS_SERVERS,
            params
                .dhcp_dns_servers
                .iter()
                .map(|a| Row::from([("address", Value::from(*a))]))
                .collect(),
        );

        groups.insert(
            group::ADDITIONAL_SCOPES,
            params
                .additional_scopes()
                .map(|s| {
                    let mut row: Row = scope_values(s).into_iter().collect();
                    row.insert("name", Value::from(s.name.as_str()));
                    row
                })
                .collect(),
        );

        // 1-based position, in input order
        for rows in groups.values_mut() {
            for (i, row) in rows.iter_mut().enumerate() {
                row.insert("index", Value::from(i + 1));
            }
        }

        Self { scalars, groups }
    }

    pub fn scalar(&self, key: &str) -> Option<&Value> {
        self.scalars.get(key)
    }

    pub fn scalars(&self) -> &BTreeMap<String, Value> {
        &self.scalars
    }

    pub fn group(&self, name: &str) -> Option<&[Row]> {
        self.groups.get(name).map(Vec::as_slice)
    }
}

/// Derived values for one scope, keyed by field suffix
fn scope_values(scope: &Scope) -> Vec<(&'static str, Value)> {
    let derived = scope.derive();
    let values = vec![
        Value::from(derived.network),
        Value::from(derived.network_base),
        Value::from(derived.gateway),
        Value::from(derived.network.with_address(derived.gateway)),
        Value::from(derived.netmask),
        Value::from(derived.prefix),
        Value::from(derived.broadcast),
        Value::from(scope.pool_range.low()),
        Value::from(scope.pool_range.high()),
        Value::from(scope.pool_range),
    ];
    scalar::SCOPE_FIELDS.iter().copied().zip(values).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> SiteParameters {
        SiteParameters::from_json(
            &serde_json::json!({
                "device_name": "TWR-ALPHA-01",
                "time_zone": "America/Chicago",
                "loopback": "10.1.1.1",
                "cpe_scope": {"cidr": "10.10.10.0/24", "pool_range": "10.10.10.50-10.10.10.254"},
                "unauth_scope": {"cidr": "10.11.0.0/24", "pool_range": "10.11.0.10-10.11.0.250"},
                "cgnat_private_scope": {"cidr": "100.64.0.0/22", "pool_range": "100.64.0.10-100.64.3.250"},
                "additional_scopes": [
                    {"name": "voip", "cidr": "10.30.0.0/25", "pool_range": "10.30.0.10-10.30.0.100"}
                ],
                "cgnat_public_ip": "203.0.113.10",
                "dhcp_dns_servers": ["1.1.1.1", "8.8.8.8"],
                "tower_links": [
                    {"interface": "ether2", "name": "TWR-BRAVO", "cidr": "10.20.0.3/29", "local_ip": "10.20.0.3"}
                ],
                "bridge3000_ips": ["10.50.0.1/30"]
            })
            .to_string(),
        )
        .unwrap()
    }

    fn text(v: Option<&Value>) -> Option<String> {
        v.map(|v| v.to_string())
    }

    #[test]
    fn test_scope_scalars() {
        let b = Bindings::from_params(&params());
        assert_eq!(text(b.scalar("cpe_gateway")), Some("10.10.10.1".into()));
        assert_eq!(text(b.scalar("cpe_gateway_cidr")), Some("10.10.10.1/24".into()));
        assert_eq!(text(b.scalar("cpe_netmask")), Some("255.255.255.0".into()));
        assert_eq!(text(b.scalar("cpe_prefix")), Some("24".into()));
        assert_eq!(text(b.scalar("cpe_pool_range")), Some("10.10.10.50-10.10.10.254".into()));
        assert_eq!(text(b.scalar("voip_broadcast")), Some("10.30.0.127".into()));
        assert_eq!(text(b.scalar("loopback_cidr")), Some("10.1.1.1/32".into()));
        assert_eq!(text(b.scalar("dhcp_dns_servers")), Some("1.1.1.1,8.8.8.8".into()));
    }

    #[test]
    fn test_group_rows() {
        let b = Bindings::from_params(&params());
        let links = b.group("tower_links").unwrap();
        assert_eq!(text(links[0].get("cidr")), Some("10.20.0.0/29".into()));
        assert_eq!(text(links[0].get("local_cidr")), Some("10.20.0.3/29".into()));
        assert_eq!(text(links[0].get("index")), Some("1".into()));

        let bridge = b.group("bridge3000_ips").unwrap();
        assert_eq!(text(bridge[0].get("cidr")), Some("10.50.0.1/30".into()));
        assert_eq!(text(bridge[0].get("network")), Some("10.50.0.0/30".into()));

        let extra = b.group("additional_scopes").unwrap();
        assert_eq!(extra.len(), 1);
        assert_eq!(text(extra[0].get("name")), Some("voip".into()));

        assert_eq!(b.group("radius_servers").map(<[Row]>::len), Some(0));
    }

    #[test]
    fn test_group_fields_cover_rows() {
        let b = Bindings::from_params(&params());
        for name in group::ALL {
            let fields = group_fields(name).unwrap();
            for row in b.group(name).unwrap() {
                let mut keys: Vec<&str> = row.keys().copied().collect();
                let mut expected = fields.to_vec();
                keys.sort_unstable();
                expected.sort_unstable();
                assert_eq!(keys, expected, "group {}", name);
            }
        }
    }
}
