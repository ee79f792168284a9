// Subnet arithmetic over ipnet types.
//
// Boundary math wraps on overflow, mirroring the modular arithmetic the
// address space itself uses (the "next network" above 255.255.255.255/0
// is 0.0.0.0).

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

/// Number of addresses in one subnet of the given prefix length.
pub fn v4_subnet_size(subnet_len: u8) -> u32 {
    1u32 << (32 - u32::from(subnet_len))
}

pub fn v6_subnet_size(subnet_len: u8) -> u128 {
    1u128 << (128 - u32::from(subnet_len))
}

/// Whether `addr` sits exactly on a `subnet_len`-bit boundary.
pub fn v4_aligned(addr: Ipv4Addr, subnet_len: u8) -> bool {
    let mask = u32::MAX << (32 - u32::from(subnet_len));
    u32::from(addr) & mask == u32::from(addr)
}

pub fn v6_aligned(addr: Ipv6Addr, subnet_len: u8) -> bool {
    let mask = u128::MAX << (128 - u32::from(subnet_len));
    u128::from(addr) & mask == u128::from(addr)
}

/// First allocatable subnet base inside `net`: one subnet above the network
/// address, since the all-zero subnet aliases the network base itself.
pub fn v4_first_subnet(net: &Ipv4Net, subnet_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()).wrapping_add(v4_subnet_size(subnet_len)))
}

/// Last allocatable subnet base inside `net`: one subnet size below the
/// start of the next network.
pub fn v4_last_subnet(net: &Ipv4Net, subnet_len: u8) -> Ipv4Addr {
    let next = u32::from(net.broadcast()).wrapping_add(1);
    Ipv4Addr::from(next.wrapping_sub(v4_subnet_size(subnet_len)))
}

pub fn v6_first_subnet(net: &Ipv6Net, subnet_len: u8) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(net.network()).wrapping_add(v6_subnet_size(subnet_len)))
}

pub fn v6_last_subnet(net: &Ipv6Net, subnet_len: u8) -> Ipv6Addr {
    let next = u128::from(net.broadcast()).wrapping_add(1);
    Ipv6Addr::from(next.wrapping_sub(v6_subnet_size(subnet_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_size() {
        assert_eq!(v4_subnet_size(24), 256);
        assert_eq!(v4_subnet_size(30), 4);
        assert_eq!(v6_subnet_size(64), 1u128 << 64);
    }

    #[test]
    fn alignment() {
        assert!(v4_aligned("10.42.1.0".parse().unwrap(), 24));
        assert!(!v4_aligned("10.42.1.128".parse().unwrap(), 24));
        assert!(v4_aligned("10.42.1.128".parse().unwrap(), 25));
        assert!(v6_aligned("fc00:0:0:1::".parse().unwrap(), 64));
        assert!(!v6_aligned("fc00:0:0:1::1".parse().unwrap(), 64));
    }

    #[test]
    fn first_and_last_subnet() {
        let net: Ipv4Net = "10.42.0.0/16".parse().unwrap();
        assert_eq!(v4_first_subnet(&net, 24), "10.42.1.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(v4_last_subnet(&net, 24), "10.42.255.0".parse::<Ipv4Addr>().unwrap());

        let net: Ipv6Net = "fc00::/48".parse().unwrap();
        assert_eq!(
            v6_first_subnet(&net, 64),
            "fc00:0:0:1::".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            v6_last_subnet(&net, 64),
            "fc00:0:0:ffff::".parse::<Ipv6Addr>().unwrap()
        );
    }
}
