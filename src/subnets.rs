use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::Error;

/// One local prefix. Addresses and masks live in the same 16-byte slot
/// the records use, IPv4 left-justified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    family: u8,
    addr: [u8; 16],
    mask: [u8; 16],
}

fn v4_slot(addr: Ipv4Addr) -> [u8; 16] {
    let mut slot = [0u8; 16];
    slot[..4].copy_from_slice(&addr.octets());
    slot
}

fn prefix_mask(bits: u32, len: usize) -> [u8; 16] {
    let mut mask = [0u8; 16];
    let mut n = bits;
    for byte in mask.iter_mut().take(len) {
        let b = n.min(8);
        *byte = if b == 0 { 0 } else { 0xffu8 << (8 - b) };
        n -= b;
    }
    mask
}

impl Subnet {
    /// Whether `addr` (a 16-byte record address slot) falls inside this
    /// prefix.
    pub fn contains(&self, family: u8, addr: &[u8; 16]) -> bool {
        self.family == family
            && self
                .addr
                .iter()
                .zip(addr.iter())
                .zip(self.mask.iter())
                .all(|((a, b), m)| a & m == b & m)
    }
}

/// Whether `addr` is local, i.e. inside any configured prefix. An empty
/// prefix list classifies everything as remote.
pub fn is_local(subnets: &[Subnet], family: u8, addr: &[u8; 16]) -> bool {
    subnets.iter().any(|net| net.contains(family, addr))
}

impl FromStr for Subnet {
    type Err = Error;

    /// Parses `addr`, `addr/prefixlen` or `addr/mask`, IPv4 or IPv6.
    fn from_str(spec: &str) -> Result<Subnet, Error> {
        let (addr, mask) = match spec.split_once('/') {
            Some((a, m)) => (a, Some(m)),
            None => (spec, None),
        };

        if let Ok(v6) = Ipv6Addr::from_str(addr) {
            let mask = match mask {
                None => [0xff; 16],
                Some(m) => {
                    if let Ok(mask) = Ipv6Addr::from_str(m) {
                        mask.octets()
                    } else {
                        let n: u32 = m.parse().map_err(|_| Error::Invalid("subnet mask"))?;
                        if n > 128 {
                            return Err(Error::Invalid("prefix length out of range"));
                        }
                        prefix_mask(n, 16)
                    }
                }
            };
            return Ok(Subnet {
                family: libc::AF_INET6 as u8,
                addr: v6.octets(),
                mask,
            });
        }

        if let Ok(v4) = Ipv4Addr::from_str(addr) {
            let mask = match mask {
                None => prefix_mask(32, 4),
                Some(m) => {
                    if let Ok(mask) = Ipv4Addr::from_str(m) {
                        v4_slot(mask)
                    } else {
                        let n: u32 = m.parse().map_err(|_| Error::Invalid("subnet mask"))?;
                        if n > 32 {
                            return Err(Error::Invalid("prefix length out of range"));
                        }
                        prefix_mask(n, 4)
                    }
                }
            };
            return Ok(Subnet {
                family: libc::AF_INET as u8,
                addr: v4_slot(v4),
                mask,
            });
        }

        Err(Error::Invalid("subnet address"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> [u8; 16] {
        v4_slot(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn cidr_v4() {
        let net: Subnet = "192.168.1.0/24".parse().unwrap();
        let inet = libc::AF_INET as u8;
        assert!(net.contains(inet, &v4(192, 168, 1, 10)));
        assert!(!net.contains(inet, &v4(192, 168, 2, 10)));
        assert!(!net.contains(libc::AF_INET6 as u8, &v4(192, 168, 1, 10)));
    }

    #[test]
    fn dotted_netmask() {
        let cidr: Subnet = "10.0.0.0/20".parse().unwrap();
        let dotted: Subnet = "10.0.0.0/255.255.240.0".parse().unwrap();
        assert_eq!(cidr, dotted);
    }

    #[test]
    fn cidr_v6() {
        let net: Subnet = "fd00:aa::/32".parse().unwrap();
        let inet6 = libc::AF_INET6 as u8;
        let mut inside = [0u8; 16];
        inside[0] = 0xfd;
        inside[2] = 0xaa;
        inside[15] = 1;
        assert!(net.contains(inet6, &inside));
        inside[2] = 0xbb;
        assert!(!net.contains(inet6, &inside));
    }

    #[test]
    fn bare_host_address() {
        let net: Subnet = "192.168.1.10".parse().unwrap();
        let inet = libc::AF_INET as u8;
        assert!(net.contains(inet, &v4(192, 168, 1, 10)));
        assert!(!net.contains(inet, &v4(192, 168, 1, 11)));
    }

    #[test]
    fn empty_list_is_remote() {
        assert!(!is_local(&[], libc::AF_INET as u8, &v4(192, 168, 1, 1)));
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-an-addr".parse::<Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
        assert!("fd00::/129".parse::<Subnet>().is_err());
    }
}
