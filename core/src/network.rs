use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// A CIDR member of a `hash:net` address set. Entries flagged `nomatch`
/// carve exclusions out of the containing block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetworkBlock {
    pub net: Ipv4Net,
    pub nomatch: bool,
}

// === impl NetworkBlock ===

impl NetworkBlock {
    fn included(net: Ipv4Net) -> Self {
        Self {
            net,
            nomatch: false,
        }
    }

    fn excluded(net: Ipv4Net) -> Self {
        Self { net, nomatch: true }
    }
}

impl From<Ipv4Net> for NetworkBlock {
    fn from(net: Ipv4Net) -> Self {
        Self::included(net)
    }
}

/// Expands an ipBlock peer into address-set entries.
///
/// The kernel refuses the fully-open /0 network as a `hash:net` member, so
/// it is rewritten as the two half-space /1 blocks; excluded blocks get the
/// same rewrite with the `nomatch` flag on each half.
pub fn block_entries(
    cidr: &str,
    except: &[String],
) -> Result<Vec<NetworkBlock>, ipnet::AddrParseError> {
    let mut entries = Vec::with_capacity(1 + except.len());

    let net = cidr.parse::<Ipv4Net>()?;
    if net.prefix_len() == 0 {
        entries.extend(half_open().map(NetworkBlock::included));
    } else {
        entries.push(NetworkBlock::included(net));
    }

    for except in except {
        let net = except.parse::<Ipv4Net>()?;
        if net.prefix_len() == 0 {
            entries.extend(half_open().map(NetworkBlock::excluded));
        } else {
            entries.push(NetworkBlock::excluded(net));
        }
    }

    Ok(entries)
}

fn half_open() -> [Ipv4Net; 2] {
    [
        Ipv4Net::new(Ipv4Addr::new(0, 0, 0, 0), 1),
        Ipv4Net::new(Ipv4Addr::new(128, 0, 0, 0), 1),
    ]
    .map(|net| net.expect("/1 is a valid IPv4 prefix length"))
}
