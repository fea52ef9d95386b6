//! Uniform, hashable representation of a peer address.
//!
//! Grounded on `mroute_addr` in `openvpn/mroute.h`: a tagged union wide
//! enough for an Ethernet MAC, an IPv4/IPv6 host or network, or a UNIX
//! socket path, compared and hashed only over the bytes that are
//! actually in use.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Large enough for an IPv6 address (16 bytes); also covers a MAC (6) and
/// a UNIX socket path hash. Matches `MR_MAX_ADDR_LEN` in `mroute.h`.
pub const MAX_ADDR_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    Mac,
    Ipv4,
    Ipv6,
    Unix,
}

/// A tagged-union address key.
///
/// Two keys are equal iff `kind`, `netbits`, `len`, and the first `len`
/// bytes of `bytes` all match. Hashing covers only `kind` and the first
/// `len` bytes of `bytes` — `netbits` deliberately does not participate
/// in the hash (see module docs on [`AddrKey::hash32`]), so two keys that
/// differ only in `netbits` may collide in a bucket without violating
/// the hash/equality contract.
#[derive(Clone, Copy)]
pub struct AddrKey {
    kind: AddrKind,
    with_port: bool,
    with_netbits: bool,
    netbits: u8,
    len: u8,
    bytes: [u8; MAX_ADDR_LEN],
}

impl AddrKey {
    pub fn kind(&self) -> AddrKind {
        self.kind
    }

    pub fn netbits(&self) -> u8 {
        self.netbits
    }

    pub fn has_port(&self) -> bool {
        self.with_port
    }

    pub fn has_netbits(&self) -> bool {
        self.with_netbits
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; MAX_ADDR_LEN];
        bytes[..6].copy_from_slice(&mac);
        Self {
            kind: AddrKind::Mac,
            with_port: false,
            with_netbits: false,
            netbits: 0,
            len: 6,
            bytes,
        }
    }

    /// A host (`/32`) IPv4 key, optionally carrying the port (used for UDP
    /// client identity, where `real` addresses are distinguished by port).
    pub fn from_ipv4(ip: Ipv4Addr, port: Option<u16>) -> Self {
        let mut bytes = [0u8; MAX_ADDR_LEN];
        bytes[..4].copy_from_slice(&ip.octets());
        let mut len = 4;
        if let Some(p) = port {
            bytes[4..6].copy_from_slice(&p.to_be_bytes());
            len = 6;
        }
        Self {
            kind: AddrKind::Ipv4,
            with_port: port.is_some(),
            with_netbits: true,
            netbits: 32,
            len,
            bytes,
        }
    }

    /// An IPv4 CIDR key (no port) at the given prefix length, used by the
    /// CIDR longest-prefix search in [`crate::mroute`].
    pub fn from_ipv4_cidr(ip: Ipv4Addr, netbits: u8) -> Self {
        let mut key = Self::from_ipv4(ip, None);
        key.with_netbits = true;
        key.netbits = netbits;
        key.mask_host_bits();
        key
    }

    pub fn from_ipv6(ip: Ipv6Addr, port: Option<u16>) -> Self {
        let mut bytes = [0u8; MAX_ADDR_LEN];
        bytes[..16].copy_from_slice(&ip.octets());
        let mut len = 16;
        if let Some(p) = port {
            bytes[16..18].copy_from_slice(&p.to_be_bytes());
            len = 18;
        }
        Self {
            kind: AddrKind::Ipv6,
            with_port: port.is_some(),
            with_netbits: true,
            netbits: 128,
            len,
            bytes,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, with_port: bool) -> Self {
        let port = with_port.then_some(addr.port());
        match addr {
            SocketAddr::V4(a) => Self::from_ipv4(*a.ip(), port),
            SocketAddr::V6(a) => Self::from_ipv6(*a.ip(), port),
        }
    }

    /// Zeroes the bytes/bits beyond `netbits`. A no-op for `Mac`/`Unix`
    /// keys, which never carry netbits.
    pub fn mask_host_bits(&mut self) {
        let addr_bits: u32 = match self.kind {
            AddrKind::Ipv4 => 32,
            AddrKind::Ipv6 => 128,
            AddrKind::Mac | AddrKind::Unix => return,
        };
        let netbits = self.netbits.min(addr_bits as u8) as u32;
        let addr_len_bytes = (addr_bits / 8) as usize;

        for (i, byte) in self.bytes[..addr_len_bytes].iter_mut().enumerate() {
            let bit_offset = i as u32 * 8;
            if bit_offset >= netbits {
                *byte = 0;
            } else if bit_offset + 8 > netbits {
                let keep_bits = netbits - bit_offset;
                let mask = !0u8 << (8 - keep_bits);
                *byte &= mask;
            }
        }
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        match self.kind {
            AddrKind::Ipv4 => Some(Ipv4Addr::new(
                self.bytes[0],
                self.bytes[1],
                self.bytes[2],
                self.bytes[3],
            )),
            _ => None,
        }
    }

    pub fn as_mac(&self) -> Option<[u8; 6]> {
        match self.kind {
            AddrKind::Mac => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&self.bytes[..6]);
                Some(mac)
            }
            _ => None,
        }
    }

    pub fn is_broadcast_mac(&self) -> bool {
        self.as_mac() == Some([0xff; 6])
    }

    pub fn is_multicast_mac(&self) -> bool {
        self.as_mac().is_some_and(|mac| mac[0] & 0x01 != 0)
    }

    pub fn is_broadcast_ipv4(&self, broadcast: Ipv4Addr) -> bool {
        self.as_ipv4() == Some(broadcast)
    }

    pub fn is_multicast_ipv4(&self) -> bool {
        self.as_ipv4().is_some_and(|ip| (ip.octets()[0] & 0xf0) == 224)
    }

    /// Structural equality per the invariant in the module docs.
    pub fn equal(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.netbits == other.netbits
            && self.len == other.len
            && self.as_bytes() == other.as_bytes()
    }

    /// A Jenkins one-at-a-time mix over `[kind, bytes[0..len]]`, matching
    /// the `hash_func` used for `mroute_addr` hashing in the original
    /// OpenVPN source. `seed` lets callers rehash on bucket-array resize
    /// without allocating a new hasher.
    pub fn hash32(&self, seed: u32) -> u32 {
        let mut hash = seed;

        let mut mix = |byte: u8| {
            hash = hash.wrapping_add(byte as u32);
            hash = hash.wrapping_add(hash << 10);
            hash ^= hash >> 6;
        };

        mix(self.kind as u8);
        for &b in self.as_bytes() {
            mix(b);
        }

        hash = hash.wrapping_add(hash << 3);
        hash ^= hash >> 11;
        hash = hash.wrapping_add(hash << 15);
        hash
    }
}

impl fmt::Debug for AddrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddrKey")
            .field("kind", &self.kind)
            .field("netbits", &self.netbits)
            .field("bytes", &self.as_bytes())
            .finish()
    }
}

impl fmt::Display for AddrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddrKind::Mac => {
                let mac = self.as_mac().unwrap_or_default();
                write!(
                    f,
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                )
            }
            AddrKind::Ipv4 => {
                let ip = self.as_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
                if self.with_netbits && self.netbits != 32 {
                    write!(f, "{ip}/{}", self.netbits)
                } else {
                    write!(f, "{ip}")
                }
            }
            AddrKind::Ipv6 => write!(f, "<ipv6>/{}", self.netbits),
            AddrKind::Unix => write!(f, "<unix>"),
        }
    }
}

impl PartialEq for AddrKey {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Eq for AddrKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_require_same_netbits() {
        let a = AddrKey::from_ipv4_cidr(Ipv4Addr::new(10, 0, 0, 0), 8);
        let b = AddrKey::from_ipv4_cidr(Ipv4Addr::new(10, 0, 0, 0), 16);

        assert_ne!(a, b);
    }

    #[test]
    fn mask_host_bits_zeroes_suffix() {
        let mut key = AddrKey::from_ipv4(Ipv4Addr::new(10, 1, 2, 3), None);
        key.netbits = 8;
        key.mask_host_bits();

        assert_eq!(key.as_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 0)));
    }

    #[test]
    fn mask_host_bits_handles_non_byte_boundary() {
        let key = AddrKey::from_ipv4_cidr(Ipv4Addr::new(10, 1, 2, 3), 12);
        // 12 bits: 10.0/12's network byte for the second octet keeps its
        // top 4 bits (1) and zeroes the bottom 4.
        assert_eq!(key.as_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 0)));

        let key = AddrKey::from_ipv4_cidr(Ipv4Addr::new(172, 31, 2, 3), 12);
        assert_eq!(key.as_ipv4(), Some(Ipv4Addr::new(172, 16, 0, 0)));
    }

    #[test]
    fn hash_ignores_netbits_difference() {
        let a = AddrKey::from_ipv4_cidr(Ipv4Addr::new(10, 0, 0, 0), 8);
        let b = AddrKey::from_ipv4_cidr(Ipv4Addr::new(10, 0, 0, 0), 16);

        assert_eq!(a.hash32(0), b.hash32(0));
    }

    #[test]
    fn broadcast_and_multicast_mac_detection() {
        assert!(AddrKey::from_mac([0xff; 6]).is_broadcast_mac());
        assert!(AddrKey::from_mac([0x01, 0, 0, 0, 0, 0]).is_multicast_mac());
        assert!(!AddrKey::from_mac([0x02, 0, 0, 0, 0, 0]).is_multicast_mac());
    }

    #[test]
    fn multicast_ipv4_range() {
        assert!(AddrKey::from_ipv4(Ipv4Addr::new(224, 0, 0, 1), None).is_multicast_ipv4());
        assert!(!AddrKey::from_ipv4(Ipv4Addr::new(10, 0, 0, 1), None).is_multicast_ipv4());
    }
}
