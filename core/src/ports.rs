use crate::NamedPortEndpoints;
use ahash::AHashMap as HashMap;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;

/// A `HashMap` specialized for numeric-port keys.
///
/// Because ports are `NonZeroU16` values, this type avoids the overhead of
/// actually hashing ports.
pub type PortMap<V> =
    std::collections::HashMap<NonZeroU16, V, std::hash::BuildHasherDefault<PortHasher>>;

/// A hasher for ports.
///
/// Because ports are single `NonZeroU16` values, we don't have to hash them;
/// we can just use the integer values as hashes directly.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

/// An IP protocol a rule can match on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

/// The named-port expansion table for a set of pods: name → protocol →
/// numeric port → the pods exposing that combination.
///
/// For ingress rules the table is built once per policy from its target
/// pods; for egress rules it is built from each rule's resolved destination
/// pods.
#[derive(Clone, Debug, Default)]
pub struct NamedPortTable {
    by_name: HashMap<String, HashMap<Protocol, PortMap<NamedPortEndpoints>>>,
}

// === impl PortHasher ===

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

// === impl Protocol ===

impl Protocol {
    /// The lowercase name `iptables -p` expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("sctp") {
            Ok(Self::Sctp)
        } else {
            Err(UnknownProtocol(s.to_string()))
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownProtocol(String);

impl std::fmt::Display for UnknownProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown protocol: {}", self.0)
    }
}

impl std::error::Error for UnknownProtocol {}

// === impl NamedPortTable ===

impl NamedPortTable {
    /// Records that `ip` exposes `name` on (`protocol`, `port`).
    pub fn record(&mut self, name: &str, protocol: Protocol, port: NonZeroU16, ip: Ipv4Addr) {
        self.by_name
            .entry(name.to_string())
            .or_default()
            .entry(protocol)
            .or_default()
            .entry(port)
            .or_insert_with(|| NamedPortEndpoints {
                protocol,
                port,
                ips: Vec::new(),
            })
            .ips
            .push(ip);
    }

    /// All expansions of (`name`, `protocol`), one per distinct numeric
    /// port, ordered by port.
    pub fn lookup(&self, name: &str, protocol: Protocol) -> Vec<NamedPortEndpoints> {
        let mut endpoints: Vec<NamedPortEndpoints> = self
            .by_name
            .get(name)
            .and_then(|protocols| protocols.get(&protocol))
            .map(|ports| ports.values().cloned().collect())
            .unwrap_or_default();
        endpoints.sort_by_key(|ep| ep.port);
        endpoints
    }
}
