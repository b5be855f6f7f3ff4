pub mod cidr;

pub use cidr::{
    broadcast, first_usable_host, is_within, netmask_dotted, network_base, parse_cidr,
    parse_ipv4, parse_pool_range, parse_range, range_within, AddressRange, Cidr,
};

use std::sync::OnceLock;

/// Validate a RouterOS device name.
/// Alphanumeric first character, then alphanumerics, hyphens, dots and underscores,
/// at most 63 characters. No spaces, quotes or shell metacharacters.
pub fn is_valid_device_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Validate an IANA time zone identifier by shape ("UTC", "America/Chicago",
/// "America/Argentina/Buenos_Aires", "Etc/GMT+5").
pub fn is_valid_time_zone(tz: &str) -> bool {
    static TZ_RE: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    TZ_RE
        .get_or_init(|| {
            regex_lite::Regex::new(r"^(UTC|[A-Z][A-Za-z_]+(/[A-Za-z0-9_+\-]+){1,2})$").ok()
        })
        .as_ref()
        .is_some_and(|re| re.is_match(tz))
}

/// Validate a scope or placeholder-safe identifier (lowercase, digits, underscores)
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_device_name() {
        assert!(is_valid_device_name("TWR-ALPHA-01"));
        assert!(is_valid_device_name("agg.core_1"));
        assert!(!is_valid_device_name(""));
        assert!(!is_valid_device_name("-leading-dash"));
        assert!(!is_valid_device_name("tower 01")); // spaces
        assert!(!is_valid_device_name("tower\"01")); // quote breaks identity line
        assert!(!is_valid_device_name("host;rm")); // semicolon
        assert!(!is_valid_device_name(&"a".repeat(64)));
    }

    #[test]
    fn test_is_valid_time_zone() {
        assert!(is_valid_time_zone("UTC"));
        assert!(is_valid_time_zone("America/Chicago"));
        assert!(is_valid_time_zone("America/Argentina/Buenos_Aires"));
        assert!(is_valid_time_zone("Etc/GMT+5"));
        assert!(!is_valid_time_zone("chicago"));
        assert!(!is_valid_time_zone("America/"));
        assert!(!is_valid_time_zone("America/Chicago; reboot"));
    }

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("voip"));
        assert!(is_valid_identifier("mgmt_2"));
        assert!(!is_valid_identifier("Voip"));
        assert!(!is_valid_identifier("2voip"));
        assert!(!is_valid_identifier("vo-ip"));
    }
}
