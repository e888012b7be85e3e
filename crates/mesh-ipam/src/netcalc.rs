//! Subnet arithmetic for the buddy tree
//!
//! Small helpers over `ipnet` covering the pieces the tree operations need:
//! bisecting a block into its two buddy halves, alignment checks for
//! reservation targets, address offsets, and block sizes. Containment and
//! netmask queries go straight through `IpNet`.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};
use crate::models::AddressFamily;

/// Split a network into its two buddy halves, lower half first.
///
/// The lower half keeps the parent's network address; the upper half starts
/// at the midpoint. Fails only when the prefix cannot be deepened, which the
/// tree operations never ask for.
pub fn bisect(net: IpNet) -> Result<(IpNet, IpNet)> {
    let mut halves = net.subnets(net.prefix_len() + 1)?;
    match (halves.next(), halves.next()) {
        (Some(lower), Some(upper)) => Ok((lower, upper)),
        _ => Err(Error::InvalidPrefix(format!("cannot bisect {}", net))),
    }
}

/// Whether `addr` is the true network address for the given prefix length.
///
/// Reservation targets that carry host bits can never be produced by
/// repeated bisection, so they are unreachable in any tree.
pub fn is_aligned(addr: IpAddr, prefix_length: u8) -> bool {
    match IpNet::new(addr, prefix_length) {
        Ok(net) => net.network() == addr,
        Err(_) => false,
    }
}

/// The `n`-th address of a block, counted from its network address.
///
/// Returns None when `n` falls outside the block.
pub fn nth_address(net: IpNet, n: u128) -> Option<IpAddr> {
    if n >= address_count(family_of(net), net.prefix_len()) {
        return None;
    }
    match net.network() {
        IpAddr::V4(base) => {
            let raw = u32::from(base).checked_add(n as u32)?;
            Some(IpAddr::V4(Ipv4Addr::from(raw)))
        }
        IpAddr::V6(base) => {
            let raw = u128::from(base).checked_add(n)?;
            Some(IpAddr::V6(Ipv6Addr::from(raw)))
        }
    }
}

/// Number of addresses in a block of the given prefix length.
///
/// Saturates at `u128::MAX` for an IPv6 /0, which has one more address than
/// u128 can count.
pub fn address_count(family: AddressFamily, prefix_length: u8) -> u128 {
    let host_bits = u32::from(family.width().saturating_sub(prefix_length));
    if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    }
}

/// Address family of a network
pub fn family_of(net: IpNet) -> AddressFamily {
    match net {
        IpNet::V4(_) => AddressFamily::Ipv4,
        IpNet::V6(_) => AddressFamily::Ipv6,
    }
}

/// Orderable integer form of an address, used to sort sibling blocks
pub fn address_key(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u128::from(u32::from(a)),
        IpAddr::V6(a) => u128::from(a),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    #[test]
    fn test_bisect_halves() {
        let (lower, upper) = bisect(net("10.0.0.0/16")).unwrap();
        assert_eq!(lower, net("10.0.0.0/17"));
        assert_eq!(upper, net("10.0.128.0/17"));

        let (lower, upper) = bisect(net("10.0.128.0/17")).unwrap();
        assert_eq!(lower, net("10.0.128.0/18"));
        assert_eq!(upper, net("10.0.192.0/18"));
    }

    #[test]
    fn test_bisect_v6() {
        let (lower, upper) = bisect(net("fd00::/64")).unwrap();
        assert_eq!(lower, net("fd00::/65"));
        assert_eq!(upper, net("fd00:0:0:0:8000::/65"));
    }

    #[test]
    fn test_bisect_host_route_fails() {
        assert!(bisect(net("10.0.0.1/32")).is_err());
        assert!(bisect(net("fd00::1/128")).is_err());
    }

    #[test]
    fn test_alignment() {
        assert!(is_aligned(IpAddr::from_str("10.0.16.0").unwrap(), 28));
        assert!(is_aligned(IpAddr::from_str("10.0.0.0").unwrap(), 8));
        assert!(!is_aligned(IpAddr::from_str("10.0.16.8").unwrap(), 28));
        assert!(!is_aligned(IpAddr::from_str("10.0.16.0").unwrap(), 200));
    }

    #[test]
    fn test_nth_address() {
        let block = net("10.0.4.0/27");
        assert_eq!(
            nth_address(block, 0),
            Some(IpAddr::from_str("10.0.4.0").unwrap())
        );
        assert_eq!(
            nth_address(block, 1),
            Some(IpAddr::from_str("10.0.4.1").unwrap())
        );
        assert_eq!(
            nth_address(block, 31),
            Some(IpAddr::from_str("10.0.4.31").unwrap())
        );
        assert_eq!(nth_address(block, 32), None);
    }

    #[test]
    fn test_address_count() {
        assert_eq!(address_count(AddressFamily::Ipv4, 27), 32);
        assert_eq!(address_count(AddressFamily::Ipv4, 32), 1);
        assert_eq!(address_count(AddressFamily::Ipv4, 0), 1 << 32);
        assert_eq!(address_count(AddressFamily::Ipv6, 64), 1 << 64);
        assert_eq!(address_count(AddressFamily::Ipv6, 0), u128::MAX);
    }

    #[test]
    fn test_address_key_orders_siblings() {
        let (lower, upper) = bisect(net("10.0.0.0/24")).unwrap();
        assert!(address_key(lower.network()) < address_key(upper.network()));
    }
}
