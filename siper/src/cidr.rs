use std::net::{IpAddr, Ipv4Addr};

use siper_common::Ipv4LpmKey;

use crate::error::{Error, Result};

const IPV4_BITS: u32 = 32;

/// Rewrite `addr/prefix` with every host bit below the prefix cleared.
///
/// Idempotent: a canonical CIDR comes back unchanged.
pub fn canonicalize(cidr: &str) -> Result<String> {
    let (addr_part, prefix_part) = cidr
        .split_once('/')
        .ok_or_else(|| Error::invalid_cidr(cidr, "missing prefix length"))?;
    let prefix = parse_prefix(cidr, prefix_part)?;

    let groups: Vec<&str> = addr_part.split('.').collect();
    if groups.len() != 4 {
        return Err(Error::invalid_cidr(
            cidr,
            format!("expected 4 octets, found {}", groups.len()),
        ));
    }
    let mut octets = [0u8; 4];
    for (slot, group) in octets.iter_mut().zip(groups) {
        let value: u32 = group
            .parse()
            .map_err(|_| Error::invalid_cidr(cidr, format!("octet '{group}' is not numeric")))?;
        *slot = u8::try_from(value)
            .map_err(|_| Error::invalid_cidr(cidr, format!("octet {value} exceeds 255")))?;
    }

    let network = u32::from_be_bytes(octets) & ipv4_mask(prefix);
    Ok(format!("{}/{}", Ipv4Addr::from(network), prefix))
}

/// Build the trie key for a CIDR. A bare address is treated as a `/32` host route.
pub fn derive_key(cidr: &str) -> Result<Ipv4LpmKey> {
    let (addr_part, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, parse_prefix(cidr, prefix)?),
        None => (cidr, IPV4_BITS),
    };

    let addr: IpAddr = addr_part
        .trim()
        .parse()
        .map_err(|_| Error::invalid_cidr(cidr, format!("invalid IP address '{addr_part}'")))?;
    let IpAddr::V4(addr) = addr else {
        return Err(Error::invalid_cidr(cidr, "not an IPv4 address"));
    };

    let network = u32::from_be_bytes(addr.octets()) & ipv4_mask(prefix);
    Ok(Ipv4LpmKey {
        prefix_len: prefix,
        data: network,
    })
}

/// Render a trie key back into `A.B.C.D/N`.
pub fn render_key(key: &Ipv4LpmKey) -> String {
    format!("{}/{}", Ipv4Addr::from(key.octets()), key.prefix_len)
}

fn parse_prefix(cidr: &str, prefix_part: &str) -> Result<u32> {
    let prefix: u32 = prefix_part.trim().parse().map_err(|_| {
        Error::invalid_cidr(cidr, format!("prefix length '{prefix_part}' is not numeric"))
    })?;
    if prefix > IPV4_BITS {
        return Err(Error::invalid_cidr(
            cidr,
            format!("prefix {prefix} exceeds IPv4 width"),
        ));
    }
    Ok(prefix)
}

fn ipv4_mask(prefix: u32) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (IPV4_BITS - prefix)
    }
}
