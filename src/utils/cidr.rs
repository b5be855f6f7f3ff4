use serde::{Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{SynthError, SynthResult};

/// An IPv4 address with a prefix length, e.g. `10.10.10.1/24`.
///
/// The address is kept as given (host bits may be set) in a `u32`; use
/// [`Cidr::canonical`] for the network form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    address: u32,
    prefix: u8,
}

impl Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> SynthResult<Self> {
        if prefix > 32 {
            return Err(SynthError::malformed_cidr(
                "cidr",
                format!("{}/{}", address, prefix),
                "prefix outside [0,32]",
            ));
        }
        Ok(Self {
            address: u32::from(address),
            prefix,
        })
    }

    /// Host form of a bare address (`/32`)
    pub fn host(address: Ipv4Addr) -> Self {
        Self {
            address: u32::from(address),
            prefix: 32,
        }
    }

    /// Same prefix, different address (e.g. an interface address inside a link)
    pub fn with_address(&self, address: Ipv4Addr) -> Self {
        Self {
            address: u32::from(address),
            prefix: self.prefix,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        prefix_mask(self.prefix)
    }

    fn base_u32(&self) -> u32 {
        self.address & self.mask()
    }

    fn broadcast_u32(&self) -> u32 {
        self.base_u32() | !self.mask()
    }

    pub fn network_base(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base_u32())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.broadcast_u32())
    }

    /// First usable host: network + 1, or the base itself for /31 and /32
    /// (point-to-point and host routes have no network/broadcast reservation).
    pub fn first_usable_host(&self) -> Ipv4Addr {
        if self.prefix >= 31 {
            self.network_base()
        } else {
            Ipv4Addr::from(self.base_u32() + 1)
        }
    }

    /// Last usable host: broadcast - 1, or the broadcast itself for /31 and /32
    pub fn last_usable_host(&self) -> Ipv4Addr {
        if self.prefix >= 31 {
            self.broadcast()
        } else {
            Ipv4Addr::from(self.broadcast_u32() - 1)
        }
    }

    pub fn usable_hosts(&self) -> u64 {
        u64::from(u32::from(self.last_usable_host())) - u64::from(u32::from(self.first_usable_host())) + 1
    }

    pub fn netmask(&self) -> Ipv4Addr {
        netmask_dotted(self.prefix)
    }

    /// Network form: base address with the same prefix
    pub fn canonical(&self) -> Cidr {
        Cidr {
            address: self.base_u32(),
            prefix: self.prefix,
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.address == self.base_u32()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        a >= self.base_u32() && a <= self.broadcast_u32()
    }

    pub fn is_usable_host(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        a >= u32::from(self.first_usable_host()) && a <= u32::from(self.last_usable_host())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address(), self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cidr(s)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Inclusive address range, e.g. a DHCP pool `10.10.10.50-10.10.10.254`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    low: u32,
    high: u32,
}

impl AddressRange {
    pub fn low(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.low)
    }

    pub fn high(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.high)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        a >= self.low && a <= self.high
    }

    pub fn size(&self) -> u64 {
        u64::from(self.high - self.low) + 1
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low(), self.high())
    }
}

impl Serialize for AddressRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Parse `a.b.c.d/n`.
/// Fails on bad address syntax, a missing or non-numeric prefix, or a prefix outside [0,32].
pub fn parse_cidr(s: &str) -> SynthResult<Cidr> {
    let trimmed = s.trim();
    let malformed = |reason: &str| SynthError::malformed_cidr("cidr", s, reason);

    let (addr_str, prefix_str) = trimmed
        .split_once('/')
        .ok_or_else(|| malformed("missing /prefix"))?;

    let address = Ipv4Addr::from_str(addr_str).map_err(|_| malformed("invalid IPv4 address"))?;

    if prefix_str.is_empty() || !prefix_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("prefix is not numeric"));
    }
    let prefix: u32 = prefix_str
        .parse()
        .map_err(|_| malformed("prefix outside [0,32]"))?;
    if prefix > 32 {
        return Err(malformed("prefix outside [0,32]"));
    }

    Ok(Cidr {
        address: u32::from(address),
        prefix: prefix as u8,
    })
}

/// Parse a bare dotted-decimal IPv4 address
pub fn parse_ipv4(s: &str) -> SynthResult<Ipv4Addr> {
    Ipv4Addr::from_str(s.trim())
        .map_err(|_| SynthError::invalid("address", format!("{:?} is not an IPv4 address", s)))
}

pub fn network_base(cidr: &Cidr) -> Ipv4Addr {
    cidr.network_base()
}

pub fn broadcast(cidr: &Cidr) -> Ipv4Addr {
    cidr.broadcast()
}

pub fn first_usable_host(cidr: &Cidr) -> Ipv4Addr {
    cidr.first_usable_host()
}

/// Dotted-decimal netmask for a prefix length (values above 32 clamp to /32)
pub fn netmask_dotted(prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(prefix_mask(prefix.min(32)))
}

pub fn is_within(address: Ipv4Addr, cidr: &Cidr) -> bool {
    cidr.contains(address)
}

/// Build a range from two bounds; fails if `start > end`
pub fn parse_range(start: &str, end: &str) -> SynthResult<AddressRange> {
    let low = u32::from(parse_ipv4(start)?);
    let high = u32::from(parse_ipv4(end)?);
    if low > high {
        return Err(SynthError::invalid(
            "pool_range",
            format!("range start {} is above range end {}", start.trim(), end.trim()),
        ));
    }
    Ok(AddressRange { low, high })
}

/// Parse the `start-end` pool form used by RouterOS `ranges=`
pub fn parse_pool_range(s: &str) -> SynthResult<AddressRange> {
    let (start, end) = s.trim().split_once('-').ok_or_else(|| {
        SynthError::invalid("pool_range", format!("{:?} is not a start-end pair", s))
    })?;
    parse_range(start, end)
}

/// True when both range bounds fall inside the CIDR
pub fn range_within(range: &AddressRange, cidr: &Cidr) -> bool {
    cidr.contains(range.low()) && cidr.contains(range.high())
}
